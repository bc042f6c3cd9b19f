//! Poll scheduler.
//!
//! A dedicated thread ticks at a nominal 100 Hz and drives either the
//! RTT engine or the variable sampler over the shared Link. In shared
//! mode only every 5th tick touches the probe, leaving the bus to the
//! primary IDE. Transport failures are absorbed up to a budget before
//! the session is declared disconnected; in shared mode they are
//! swallowed entirely because the IDE routinely holds the probe for long
//! stretches.

use crate::interruptor::Interruptor;
use crate::link::{Link, LinkError};
use crate::rtt::Rtt;
use crate::sampler::Sampler;
use crate::session::Event;
use bytes::Bytes;
use ratelimit::Ratelimiter;
use std::sync::mpsc::SyncSender;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Nominal tick period.
pub const TICK: Duration = Duration::from_millis(10);

const SHARED_TICK_DIVISOR: u64 = 5;
const OWNED_FAILURE_BUDGET: u32 = 10;
const SHARED_FAILURE_LOG_PERIOD: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Idle,
    Rtt,
    Vars,
}

pub struct PollScheduler {
    link: Link,
    rtt: Option<Rtt>,
    sampler: Sampler,
    events: SyncSender<Event>,
    intr: Interruptor,
    tick: Duration,
    mode: PollMode,
    tick_count: u64,
    consecutive_failures: u32,
}

impl PollScheduler {
    pub fn new(
        link: Link,
        rtt: Option<Rtt>,
        sampler: Sampler,
        events: SyncSender<Event>,
        intr: Interruptor,
    ) -> Self {
        Self::with_tick(link, rtt, sampler, events, intr, TICK)
    }

    pub fn with_tick(
        link: Link,
        rtt: Option<Rtt>,
        sampler: Sampler,
        events: SyncSender<Event>,
        intr: Interruptor,
        tick: Duration,
    ) -> Self {
        let mode = if rtt.is_some() {
            PollMode::Rtt
        } else if !sampler.is_empty() {
            PollMode::Vars
        } else {
            PollMode::Idle
        };
        Self {
            link,
            rtt,
            sampler,
            events,
            intr,
            tick,
            mode,
            tick_count: 0,
            consecutive_failures: 0,
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// Blocks until shutdown or disconnect; meant for a dedicated thread.
    pub fn run(mut self) {
        let ratelimiter = match Ratelimiter::builder(1, self.tick)
            .initial_available(1)
            .build()
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Could not build the poll ratelimiter");
                return;
            }
        };
        debug!(mode = ?self.mode, shared = self.link.is_shared(), "Poll scheduler running");
        while !self.intr.is_set() && self.mode != PollMode::Idle {
            if let Err(delay) = ratelimiter.try_wait() {
                std::thread::sleep(delay);
                continue;
            }
            self.tick();
        }
        debug!("Poll scheduler shutdown");
    }

    fn tick(&mut self) {
        self.tick_count += 1;
        if self.link.is_shared() && self.tick_count % SHARED_TICK_DIVISOR != 0 {
            return;
        }
        let result = match (self.mode, self.rtt.as_ref()) {
            (PollMode::Rtt, Some(rtt)) => rtt.read_up(&self.link),
            (PollMode::Vars, _) => self.sampler.sample(&self.link),
            _ => return,
        };
        match result {
            Ok(bytes) => {
                self.consecutive_failures = 0;
                if !bytes.is_empty() && self.events.send(Event::UpData(Bytes::from(bytes))).is_err()
                {
                    debug!("Event channel closed, stopping the poller");
                    self.mode = PollMode::Idle;
                }
            }
            Err(e) => self.on_failure(e),
        }
    }

    fn on_failure(&mut self, e: LinkError) {
        if matches!(e, LinkError::Closed) {
            self.disconnect(e.to_string());
            return;
        }
        if !e.is_transport() {
            // Bus faults are not retryable for that transaction, but the
            // next tick starts a fresh one.
            warn!(error = %e, "Probe access failed");
            return;
        }
        self.consecutive_failures += 1;
        if self.link.is_shared() {
            // The primary IDE is busy with the probe; never give up.
            if self.consecutive_failures % SHARED_FAILURE_LOG_PERIOD == 0 {
                debug!(
                    failures = self.consecutive_failures,
                    "Probe is busy in shared mode"
                );
            }
        } else if self.consecutive_failures >= OWNED_FAILURE_BUDGET {
            self.disconnect(e.to_string());
        } else {
            debug!(error = %e, failures = self.consecutive_failures, "Transport failure");
        }
    }

    fn disconnect(&mut self, reason: String) {
        warn!(reason = reason.as_str(), "Disconnecting after probe failures");
        self.mode = PollMode::Idle;
        self.link.close();
        let _ = self.events.send(Event::Disconnected(reason));
    }
}
