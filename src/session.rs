//! Session wiring.
//!
//! Opens the selected probe back-end, wraps it in a [`Link`] with the
//! arbitration policy the back-end calls for, locates the RTT control
//! block (or falls back to the variable sampler), and runs the poll
//! scheduler and GDB bridge on their own threads. The consumer sees
//! exactly three event kinds: `Connected`, `Disconnected`, `UpData`.

use crate::agdi::AgdiReceiver;
use crate::arbitrator::Arbitrator;
use crate::config::{Backend, BridgeConfig};
use crate::error::Error;
use crate::gdb::GdbServer;
use crate::interruptor::Interruptor;
use crate::link::{DapLink, JlinkLink, KeilLink, Link, LinkDriver, LinkError, OpenOcdLink};
use crate::rtt::Rtt;
use crate::sampler::{SampledVariable, Sampler};
use crate::scheduler::PollScheduler;
use crate::symbols::SymbolMap;
use bytes::Bytes;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the core reports to its consumer.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Disconnected(String),
    UpData(Bytes),
}

pub struct Session {
    link: Link,
    rtt: Option<Rtt>,
    gdb: Option<GdbServer>,
    agdi: Option<AgdiReceiver>,
    poller: Option<JoinHandle<()>>,
    intr: Interruptor,
}

impl Session {
    /// Attaches to the target and starts the worker threads. Events
    /// arrive on the returned channel, starting with `Connected`.
    pub fn connect(
        config: &BridgeConfig,
        symbols: Option<&SymbolMap>,
        intr: Interruptor,
    ) -> Result<(Self, Receiver<Event>), Error> {
        let agdi = match config.agdi_port {
            Some(port) => Some(AgdiReceiver::spawn(port, intr.clone())?),
            None => None,
        };

        let driver = open_backend(config)?;
        let link = Link::with_agdi_cache(
            driver,
            Arbitrator::new(config.backend.is_shared()),
            agdi.as_ref().map(|a| a.cache()),
        );

        let gdb = match config.gdb_port {
            Some(port) => Some(GdbServer::spawn(link.clone(), port, intr.clone())?),
            None => None,
        };

        let variables = resolve_variables(&config.variables, symbols);
        let sampler = Sampler::new(&variables);

        let cb_addr = config
            .control_block_addr
            .or_else(|| symbols.and_then(|s| s.rtt_control_block()));
        let rtt = match cb_addr {
            Some(addr) => {
                debug!(
                    cb_addr = format_args!("{addr:#010X}"),
                    "Using the known control-block address"
                );
                Some(Rtt::attach_at(
                    &link,
                    addr,
                    config.up_channel,
                    config.down_channel,
                )?)
            }
            None => {
                match Rtt::attach_channel(
                    &link,
                    config.rtt_search_base,
                    config.up_channel,
                    config.down_channel,
                ) {
                    Ok(rtt) => Some(rtt),
                    Err(Error::RttNotFound(base)) if !sampler.is_empty() => {
                        info!(
                            search_base = format_args!("{base:#010X}"),
                            "No RTT control block, sampling variables instead"
                        );
                        None
                    }
                    Err(Error::RttNotFound(base)) => {
                        link.close();
                        return Err(Error::RttNotFound(base));
                    }
                    Err(e) => {
                        link.close();
                        return Err(e);
                    }
                }
            }
        };

        if rtt.is_none() && sampler.is_empty() {
            link.close();
            return Err(Error::NothingToPoll);
        }

        let (events_tx, events_rx) = mpsc::sync_channel(32);
        let _ = events_tx.send(Event::Connected);

        let scheduler = PollScheduler::with_tick(
            link.clone(),
            rtt,
            sampler,
            events_tx,
            intr.clone(),
            config.poll_interval.unwrap_or(crate::scheduler::TICK),
        );
        let poller = std::thread::Builder::new()
            .name("rtt-poller".to_owned())
            .spawn(move || scheduler.run())?;

        info!(backend = %config.backend, "Session connected");
        Ok((
            Self {
                link,
                rtt,
                gdb,
                agdi,
                poller: Some(poller),
                intr,
            },
            events_rx,
        ))
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Queues console input for the target's down channel. Returns how
    /// many bytes the ring accepted.
    pub fn write_down(&self, payload: &[u8]) -> Result<usize, LinkError> {
        match self.rtt {
            Some(rtt) => rtt.write_down(&self.link, payload),
            None => Err(LinkError::Unsupported(
                "no RTT down channel in variable-sampling mode",
            )),
        }
    }

    /// A detached writer onto the down channel for the console-input
    /// thread; `None` in variable-sampling mode.
    pub fn down_channel(&self) -> Option<DownChannel> {
        self.rtt.map(|rtt| DownChannel {
            link: self.link.clone(),
            rtt,
        })
    }

    /// Stops the worker threads and closes the probe.
    pub fn shutdown(mut self) {
        self.intr.set();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        if let Some(gdb) = self.gdb.take() {
            gdb.join();
        }
        if let Some(agdi) = self.agdi.take() {
            agdi.join();
        }
        self.link.close();
        debug!("Session shut down");
    }
}

/// Clonable writer onto the RTT down channel.
#[derive(Clone)]
pub struct DownChannel {
    link: Link,
    rtt: Rtt,
}

impl DownChannel {
    pub fn write(&self, payload: &[u8]) -> Result<usize, LinkError> {
        self.rtt.write_down(&self.link, payload)
    }
}

fn open_backend(config: &BridgeConfig) -> Result<Box<dyn LinkDriver>, Error> {
    Ok(match &config.backend {
        Backend::Jlink => {
            let library = config
                .jlink_library
                .as_ref()
                .ok_or(Error::MissingJlinkLibrary)?;
            Box::new(JlinkLink::open(
                library,
                config.interface_mode,
                &config.core,
                config.speed_khz,
            )?)
        }
        Backend::OpenOcd => Box::new(OpenOcdLink::open()?),
        Backend::Keil => Box::new(KeilLink::open()?),
        Backend::Dap {
            selector,
            shared: false,
        } => Box::new(DapLink::open_owned(selector, config.speed_khz)?),
        Backend::Dap {
            selector,
            shared: true,
        } => Box::new(DapLink::open_shared(selector, config.speed_khz)?),
    })
}

/// Fills in missing variable addresses from the symbol map; variables
/// that stay unresolved are dropped with a warning.
fn resolve_variables(
    variables: &[SampledVariable],
    symbols: Option<&SymbolMap>,
) -> Vec<SampledVariable> {
    variables
        .iter()
        .filter_map(|var| {
            let mut var = var.clone();
            if var.addr.is_none() {
                var.addr = symbols.and_then(|s| s.address_of(&var.name));
            }
            if var.addr.is_none() {
                warn!(name = var.name.as_str(), "Dropping a variable with no address");
                return None;
            }
            Some(var)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sampler::VarFormat;
    use pretty_assertions::assert_eq;

    fn var(name: &str, addr: Option<u32>) -> SampledVariable {
        SampledVariable {
            name: name.to_owned(),
            addr,
            format: VarFormat::U32,
            enabled: true,
        }
    }

    #[test]
    fn unresolved_variables_are_dropped() {
        let vars = vec![var("known", Some(0x2000_0000)), var("mystery", None)];
        let resolved = resolve_variables(&vars, None);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "known");
    }

    #[test]
    fn explicit_addresses_win_over_the_symbol_map() {
        let vars = vec![var("pinned", Some(0x2000_0040))];
        let resolved = resolve_variables(&vars, Some(&SymbolMap::default()));
        assert_eq!(resolved[0].addr, Some(0x2000_0040));
    }
}
