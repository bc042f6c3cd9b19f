use crate::error::Error;
use crate::gdb::DEFAULT_GDB_PORT;
use crate::sampler::SampledVariable;
use derive_more::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Probe back-end selector: `jlink`, `openocd`, `keil`, `dap:<id>`, or
/// `dap-shared:<id>` where `<id>` is an enumeration index or a serial
/// substring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Jlink,
    OpenOcd,
    Keil,
    Dap { selector: String, shared: bool },
}

impl Backend {
    pub fn is_shared(&self) -> bool {
        matches!(self, Backend::Dap { shared: true, .. })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jlink" => Ok(Backend::Jlink),
            "openocd" => Ok(Backend::OpenOcd),
            "keil" => Ok(Backend::Keil),
            _ => {
                if let Some(selector) = s.strip_prefix("dap-shared:") {
                    Ok(Backend::Dap {
                        selector: selector.to_owned(),
                        shared: true,
                    })
                } else if let Some(selector) = s.strip_prefix("dap:") {
                    Ok(Backend::Dap {
                        selector: selector.to_owned(),
                        shared: false,
                    })
                } else {
                    Err(Error::UnknownBackend(s.to_owned()).to_string())
                }
            }
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Jlink => f.write_str("jlink"),
            Backend::OpenOcd => f.write_str("openocd"),
            Backend::Keil => f.write_str("keil"),
            Backend::Dap {
                selector,
                shared: false,
            } => write!(f, "dap:{selector}"),
            Backend::Dap {
                selector,
                shared: true,
            } => write!(f, "dap-shared:{selector}"),
        }
    }
}

/// Wire protocol between probe and target.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub enum InterfaceMode {
    #[default]
    #[display(fmt = "swd")]
    Swd,
    #[display(fmt = "jtag")]
    Jtag,
    #[display(fmt = "cjtag")]
    CJtag,
}

impl FromStr for InterfaceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "swd" => Ok(InterfaceMode::Swd),
            "jtag" => Ok(InterfaceMode::Jtag),
            "cjtag" => Ok(InterfaceMode::CJtag),
            _ => Err(format!("'{s}' is not an interface mode (swd, jtag, cjtag)")),
        }
    }
}

/// Everything the session needs to attach and start polling.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    pub backend: Backend,
    pub interface_mode: InterfaceMode,
    /// Target device/core name handed to the probe (e.g. `Cortex-M0`).
    pub core: String,
    pub speed_khz: u32,
    /// Base RAM address of the control-block scan.
    pub rtt_search_base: u32,
    /// Known control-block address; skips the scan when set.
    pub control_block_addr: Option<u32>,
    pub up_channel: usize,
    pub down_channel: usize,
    /// RSP server port; `None` disables the bridge.
    pub gdb_port: Option<u16>,
    /// AGDI receiver port; `None` disables the passive cache.
    pub agdi_port: Option<u16>,
    /// Path to the JLink shared library (jlink back-end only).
    pub jlink_library: Option<PathBuf>,
    pub variables: Vec<SampledVariable>,
    /// Poll tick override; the scheduler defaults to 100 Hz.
    pub poll_interval: Option<Duration>,
}

impl BridgeConfig {
    pub const DEFAULT_SPEED_KHZ: u32 = 4000;
    pub const DEFAULT_SEARCH_BASE: u32 = 0x2000_0000;
    pub const DEFAULT_CORE: &'static str = "Cortex-M0";
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Dap {
                selector: "0".to_owned(),
                shared: false,
            },
            interface_mode: InterfaceMode::default(),
            core: Self::DEFAULT_CORE.to_owned(),
            speed_khz: Self::DEFAULT_SPEED_KHZ,
            rtt_search_base: Self::DEFAULT_SEARCH_BASE,
            control_block_addr: None,
            up_channel: 0,
            down_channel: 0,
            gdb_port: Some(DEFAULT_GDB_PORT),
            agdi_port: None,
            jlink_library: None,
            variables: Vec::new(),
            poll_interval: None,
        }
    }
}

/// Loads the sampled-variables list from a JSON file.
pub fn load_variables(path: &Path) -> Result<Vec<SampledVariable>, Error> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
