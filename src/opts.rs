use crate::config::{Backend, BridgeConfig, InterfaceMode};
use crate::error::Error;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct ProbeOpts {
    /// Probe back-end to attach through.
    ///
    /// One of `jlink`, `openocd`, `keil`, `dap:<id>`, `dap-shared:<id>`;
    /// `<id>` is an enumeration index or a serial-number substring.
    #[clap(
        long,
        name = "backend",
        default_value = "dap:0",
        help_heading = "PROBE CONFIGURATION"
    )]
    pub backend: Backend,

    /// Path to the JLink shared library (JLink_x64.dll / libjlinkarm.so).
    /// Only used by the jlink back-end.
    #[clap(long, name = "jlink-library", help_heading = "PROBE CONFIGURATION")]
    pub jlink_library: Option<PathBuf>,

    /// Wire protocol between probe and target.
    /// Possible options: [swd, jtag, cjtag].
    #[clap(
        long,
        name = "interface",
        default_value = "swd",
        help_heading = "PROBE CONFIGURATION"
    )]
    pub interface: InterfaceMode,

    /// The target core to connect to (e.g. Cortex-M0, RISC-V).
    #[clap(
        long,
        name = "core",
        default_value = BridgeConfig::DEFAULT_CORE,
        help_heading = "PROBE CONFIGURATION"
    )]
    pub core: String,

    /// The protocol speed in kHz.
    #[clap(
        long,
        name = "speed",
        default_value_t = BridgeConfig::DEFAULT_SPEED_KHZ,
        help_heading = "PROBE CONFIGURATION"
    )]
    pub speed: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct RttOpts {
    /// Base RAM address of the control-block scan.
    #[clap(
        long,
        value_parser = clap_num::maybe_hex::<u32>,
        name = "rtt-search-base",
        default_value = "0x20000000",
        help_heading = "RTT CONFIGURATION"
    )]
    pub rtt_search_base: u32,

    /// Use the provided RTT control block address instead of scanning
    /// the target memory for it.
    #[clap(
        long,
        value_parser = clap_num::maybe_hex::<u32>,
        name = "control-block-address",
        help_heading = "RTT CONFIGURATION"
    )]
    pub control_block_address: Option<u32>,

    /// Extract the control-block location and variable addresses from an
    /// ELF file.
    #[clap(long, name = "elf-file", help_heading = "RTT CONFIGURATION")]
    pub elf_file: Option<PathBuf>,

    /// The RTT up (target to host) channel number to poll.
    #[clap(
        long,
        name = "up-channel",
        default_value_t = 0,
        help_heading = "RTT CONFIGURATION"
    )]
    pub up_channel: usize,

    /// The RTT down (host to target) channel number console input goes to.
    #[clap(
        long,
        name = "down-channel",
        default_value_t = 0,
        help_heading = "RTT CONFIGURATION"
    )]
    pub down_channel: usize,

    /// JSON file with the sampled-variables list, used when no RTT
    /// control block is present.
    #[clap(long, name = "vars-file", help_heading = "RTT CONFIGURATION")]
    pub vars_file: Option<PathBuf>,

    /// The host-side polling interval (nominally 10ms).
    ///
    /// Accepts durations like "10ms" or "1minute 2seconds 22ms".
    #[clap(long, name = "poll-interval", help_heading = "RTT CONFIGURATION")]
    pub poll_interval: Option<humantime::Duration>,
}

#[derive(Parser, Debug, Clone)]
pub struct BridgeOpts {
    /// The GDB remote-serial-protocol server port.
    #[clap(
        long,
        name = "gdb-port",
        default_value_t = crate::gdb::DEFAULT_GDB_PORT,
        help_heading = "BRIDGE CONFIGURATION"
    )]
    pub gdb_port: u16,

    /// Disable the GDB server.
    #[clap(long, name = "no-gdb", help_heading = "BRIDGE CONFIGURATION")]
    pub no_gdb: bool,

    /// Enable the passive AGDI memory-image receiver on the given port.
    #[clap(long, name = "agdi-port", help_heading = "BRIDGE CONFIGURATION")]
    pub agdi_port: Option<u16>,

    /// Append drained up-channel data to a file.
    #[clap(long, name = "output", help_heading = "BRIDGE CONFIGURATION")]
    pub output: Option<PathBuf>,

    /// Send console lines with a bare LF instead of CRLF.
    #[clap(long, name = "lf-only", help_heading = "BRIDGE CONFIGURATION")]
    pub lf_only: bool,

    /// Periodically log transfer metrics.
    #[clap(long, name = "metrics", help_heading = "BRIDGE CONFIGURATION")]
    pub metrics: bool,
}

impl ProbeOpts {
    /// Folds the CLI surface into a [`BridgeConfig`].
    pub fn to_config(&self, rtt: &RttOpts, bridge: &BridgeOpts) -> Result<BridgeConfig, Error> {
        let variables = match &rtt.vars_file {
            Some(path) => crate::config::load_variables(path)?,
            None => Vec::new(),
        };
        Ok(BridgeConfig {
            backend: self.backend.clone(),
            interface_mode: self.interface,
            core: self.core.clone(),
            speed_khz: self.speed,
            rtt_search_base: rtt.rtt_search_base,
            control_block_addr: rtt.control_block_address,
            up_channel: rtt.up_channel,
            down_channel: rtt.down_channel,
            gdb_port: (!bridge.no_gdb).then_some(bridge.gdb_port),
            agdi_port: bridge.agdi_port,
            jlink_library: self.jlink_library.clone(),
            variables,
            poll_interval: rtt.poll_interval.map(Into::into),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[clap(flatten)]
        probe: ProbeOpts,
        #[clap(flatten)]
        rtt: RttOpts,
        #[clap(flatten)]
        bridge: BridgeOpts,
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let cli = TestCli::parse_from(["rtt-bridge"]);
        let cfg = cli.probe.to_config(&cli.rtt, &cli.bridge).unwrap();
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn flags_reach_the_config() {
        let cli = TestCli::parse_from([
            "rtt-bridge",
            "--backend",
            "dap-shared:E660",
            "--speed",
            "8000",
            "--interface",
            "jtag",
            "--rtt-search-base",
            "0x20010000",
            "--control-block-address",
            "0x20010400",
            "--up-channel",
            "1",
            "--no-gdb",
            "--agdi-port",
            "9999",
        ]);
        let cfg = cli.probe.to_config(&cli.rtt, &cli.bridge).unwrap();
        assert!(cfg.backend.is_shared());
        assert_eq!(cfg.speed_khz, 8000);
        assert_eq!(cfg.interface_mode, InterfaceMode::Jtag);
        assert_eq!(cfg.rtt_search_base, 0x2001_0000);
        assert_eq!(cfg.control_block_addr, Some(0x2001_0400));
        assert_eq!(cfg.up_channel, 1);
        assert_eq!(cfg.gdb_port, None);
        assert_eq!(cfg.agdi_port, Some(9999));
    }

    #[test]
    fn hex_and_decimal_addresses_both_parse() {
        let cli = TestCli::parse_from(["rtt-bridge", "--rtt-search-base", "536870912"]);
        assert_eq!(cli.rtt.rtt_search_base, 0x2000_0000);
    }
}
