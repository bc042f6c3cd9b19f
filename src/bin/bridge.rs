#![deny(warnings, clippy::all)]

use clap::Parser;
use human_bytes::human_bytes;
use rtt_bridge::{
    tracing::try_init_tracing_subscriber, BridgeOpts, Event, Interruptor, ProbeOpts, RttOpts,
    Session, SymbolMap,
};
use simple_moving_average::{NoSumSMA, SMA};
use std::fs;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bidirectional SEGGER RTT console, variable sampler, and GDB
/// remote-serial bridge over a debug probe
#[derive(Parser, Debug, Clone)]
#[clap(version)]
struct Opts {
    #[clap(flatten)]
    pub probe_opts: ProbeOpts,

    #[clap(flatten)]
    pub rtt_opts: RttOpts,

    #[clap(flatten)]
    pub bridge_opts: BridgeOpts,
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(()) => (),
        Err(e) => {
            eprintln!("{e}");
            let mut cause = e.source();
            while let Some(err) = cause {
                eprintln!("Caused by: {err}");
                cause = err.source();
            }
            std::process::exit(exitcode::SOFTWARE);
        }
    }
}

async fn do_main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    try_init_tracing_subscriber()?;

    let intr = Interruptor::new();
    let intr_clone = intr.clone();
    ctrlc::set_handler(move || {
        if intr_clone.is_set() {
            let exit_code = if cfg!(target_family = "unix") {
                // 128 (fatal error signal "n") + 2 (control-c is fatal error signal 2)
                130
            } else {
                // Windows code 3221225786
                // -1073741510 == C000013A
                -1073741510
            };
            std::process::exit(exit_code);
        }

        debug!("Shutdown signal received");
        intr_clone.set();
    })?;

    let symbols = opts
        .rtt_opts
        .elf_file
        .as_ref()
        .map(|path| SymbolMap::load(path))
        .transpose()?;

    let config = opts.probe_opts.to_config(&opts.rtt_opts, &opts.bridge_opts)?;

    let (session, events) = Session::connect(&config, symbols.as_ref(), intr.clone())?;

    // Console input: stdin lines go to the down channel with the
    // configured line ending.
    if let Some(down) = session.down_channel() {
        let line_ending: &'static [u8] = if opts.bridge_opts.lf_only {
            b"\n"
        } else {
            b"\r\n"
        };
        let stdin_intr = intr.clone();
        std::thread::Builder::new()
            .name("console-input".to_owned())
            .spawn(move || {
                let stdin = io::stdin();
                let mut line = String::new();
                loop {
                    line.clear();
                    match stdin.lock().read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if stdin_intr.is_set() {
                                break;
                            }
                            let mut payload =
                                line.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
                            payload.extend_from_slice(line_ending);
                            match down.write(&payload) {
                                Ok(n) if n < payload.len() => {
                                    warn!(sent = n, len = payload.len(), "Down channel is full")
                                }
                                Ok(_) => (),
                                Err(e) => debug!(error = %e, "Console write failed"),
                            }
                        }
                    }
                }
            })?;
    }

    let output = opts
        .bridge_opts
        .output
        .as_ref()
        .map(fs::File::create)
        .transpose()?;
    let metrics = opts.bridge_opts.metrics.then(Metrics::new);

    let intr_clone = intr.clone();
    let mut event_join = tokio::task::spawn_blocking(move || {
        event_loop(events, output, metrics, intr_clone)
    });

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("User signaled shutdown");
            Ok(())
        }
        res = &mut event_join => {
            match res {
                Ok(inner) => inner.map_err(Into::into),
                Err(e) => Err(e.into()),
            }
        }
    };

    intr.set();
    session.shutdown();

    if let Err(e) = &result {
        error!(error = %e, "Encountered an error in the event loop");
    }
    result
}

fn event_loop(
    events: Receiver<Event>,
    mut output: Option<fs::File>,
    mut metrics: Option<Metrics>,
    intr: Interruptor,
) -> Result<(), io::Error> {
    let stdout = io::stdout();
    loop {
        if intr.is_set() {
            return Ok(());
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(Event::Connected) => info!("Connected"),
            Ok(Event::Disconnected(reason)) => {
                warn!(reason = reason.as_str(), "Disconnected");
                return Ok(());
            }
            Ok(Event::UpData(bytes)) => {
                let mut out = stdout.lock();
                out.write_all(&bytes)?;
                out.flush()?;
                if let Some(file) = output.as_mut() {
                    file.write_all(&bytes)?;
                }
                if let Some(metrics) = metrics.as_mut() {
                    metrics.update(bytes.len());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(metrics) = metrics.as_mut() {
                    metrics.update(0);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Event channel closed");
                return Ok(());
            }
        }
    }
}

struct Metrics {
    window_start: Instant,
    event_cnt: u64,
    bytes: u64,
    sma: NoSumSMA<f64, f64, 8>,
}

impl Metrics {
    const WINDOW_DURATION: Duration = Duration::from_secs(2);

    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            event_cnt: 0,
            bytes: 0,
            sma: NoSumSMA::new(),
        }
    }

    fn reset(&mut self) {
        self.event_cnt = 0;
        self.bytes = 0;
        self.window_start = Instant::now();
    }

    fn update(&mut self, bytes: usize) {
        let dur = Instant::now().duration_since(self.window_start);

        if bytes != 0 {
            self.event_cnt += 1;
            self.bytes += bytes as u64;
            self.sma.add_sample(bytes as f64);
        }

        if dur >= Self::WINDOW_DURATION {
            let secs = dur.as_secs_f64();
            info!(
                transfer_rate = format!("{}/s", human_bytes(self.bytes as f64 / secs)),
                cnt = self.event_cnt,
                avg = self.sma.get_average(),
            );
            self.reset();
        }
    }
}
