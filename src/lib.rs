#![deny(warnings, clippy::all)]

pub use agdi::{AgdiCache, AgdiReceiver, DEFAULT_AGDI_PORT};
pub use arbitrator::Arbitrator;
pub use config::{Backend, BridgeConfig, InterfaceMode};
pub use error::Error;
pub use gdb::{GdbServer, DEFAULT_GDB_PORT};
pub use interruptor::Interruptor;
pub use link::{Link, LinkDriver, LinkError, CORTEX_M_REGS};
pub use opts::{BridgeOpts, ProbeOpts, RttOpts};
pub use rtt::{RingDesc, Rtt, SENTINEL};
pub use sampler::{SampledVariable, Sampler, VarFormat};
pub use scheduler::{PollMode, PollScheduler};
pub use session::{DownChannel, Event, Session};
pub use symbols::SymbolMap;

pub mod agdi;
pub mod arbitrator;
pub mod config;
pub mod error;
pub mod gdb;
pub mod interruptor;
pub mod link;
pub mod opts;
pub mod rtt;
pub mod sampler;
pub mod scheduler;
pub mod session;
pub mod symbols;
pub mod tracing;
