use crate::link::LinkError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not find the SEGGER RTT control block within the 64 KiB search window at {0:#010X}")]
    RttNotFound(u32),

    #[error("The RTT up channel ({0}) is invalid")]
    UpChannelInvalid(usize),

    #[error("The RTT down channel ({0}) is invalid")]
    DownChannelInvalid(usize),

    #[error("Unknown probe back-end selector '{0}'. Expected jlink, openocd, keil, dap:<id>, or dap-shared:<id>")]
    UnknownBackend(String),

    #[error("The jlink back-end requires the path to the vendor shared library")]
    MissingJlinkLibrary,

    #[error("No RTT control block was found and no sampled variables are configured")]
    NothingToPoll,

    #[error("Failed to parse the ELF file. {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("Failed to parse the sampled-variables file. {0}")]
    VariablesFile(#[from] serde_json::Error),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Encountered an IO error ({})", .0.kind())]
    Io(#[from] io::Error),
}
