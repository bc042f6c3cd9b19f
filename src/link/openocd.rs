//! OpenOCD Tcl RPC back-end.
//!
//! Plain TCP client to the Tcl RPC service (`127.0.0.1:6666` by default).
//! Commands and responses are both terminated by the byte `0x1A`. Memory
//! is mapped onto `mdb`/`mwb`/`mdw`/`mww`, registers onto `reg`, run
//! control onto `halt`/`resume`/`step`/`reset`.

use crate::link::{LinkDriver, LinkError};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

const TCL_RPC_PORT: u16 = 6666;
const TERMINATOR: u8 = 0x1A;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct OpenOcdLink {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl OpenOcdLink {
    pub fn open() -> Result<Self, LinkError> {
        Self::open_addr(SocketAddr::from(([127, 0, 0, 1], TCL_RPC_PORT)))
    }

    pub fn open_addr(addr: SocketAddr) -> Result<Self, LinkError> {
        let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)
            .map_err(|e| LinkError::Transport(format!("Tcl RPC connect to {addr} failed. {e}")))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Connected to OpenOCD Tcl RPC");
        Ok(Self {
            stream,
            pending: Vec::new(),
        })
    }

    fn command(&mut self, cmd: &str) -> Result<String, LinkError> {
        self.stream.write_all(cmd.as_bytes())?;
        self.stream.write_all(&[TERMINATOR])?;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == TERMINATOR) {
                let frame: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&frame[..frame.len() - 1]).into_owned());
            }
            let mut chunk = [0u8; 512];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(LinkError::Transport(
                    "Tcl RPC connection closed by OpenOCD".to_owned(),
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Pulls byte values out of `mdb` output lines of the form
/// `0x20000000: 53 45 47 47 45 52 ...`.
fn parse_byte_dump(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((_, rest)) = line.split_once(':') else {
            continue;
        };
        for tok in rest.split_whitespace() {
            if tok.len() == 2 {
                if let Ok(b) = u8::from_str_radix(tok, 16) {
                    out.push(b);
                }
            }
        }
    }
    out
}

/// Pulls the first 32-bit value out of `mdw` output.
fn parse_word_dump(text: &str) -> Option<u32> {
    let (_, rest) = text.lines().next()?.split_once(':')?;
    let tok = rest.split_whitespace().next()?;
    u32::from_str_radix(tok.trim_start_matches("0x"), 16).ok()
}

/// Pulls the value out of `reg` output of the form `pc (/32): 0x08000123`.
fn parse_reg_value(text: &str) -> Option<u32> {
    let hex = text.split("0x").nth(1)?;
    let hex: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    u32::from_str_radix(&hex, 16).ok()
}

/// The `targets` table carries the current state in its last column.
fn parse_targets_halted(text: &str) -> bool {
    text.lines()
        .any(|line| line.split_whitespace().last() == Some("halted"))
}

impl LinkDriver for OpenOcdLink {
    fn read_mem(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let resp = self.command(&format!("mdb 0x{addr:08x} {len}"))?;
        let data = parse_byte_dump(&resp);
        if data.len() != len {
            return Err(LinkError::BusFault { addr });
        }
        Ok(data)
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        for (i, b) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            let resp = self.command(&format!("mwb 0x{a:08x} 0x{b:02x}"))?;
            if resp.contains("Failed") || resp.contains("error") {
                return Err(LinkError::BusFault { addr: a });
            }
        }
        Ok(())
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, LinkError> {
        let resp = self.command(&format!("mdw 0x{addr:08x}"))?;
        parse_word_dump(&resp).ok_or(LinkError::BusFault { addr })
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), LinkError> {
        let resp = self.command(&format!("mww 0x{addr:08x} 0x{value:08x}"))?;
        if resp.contains("Failed") || resp.contains("error") {
            return Err(LinkError::BusFault { addr });
        }
        Ok(())
    }

    fn read_reg(&mut self, reg: &str) -> Result<u32, LinkError> {
        let resp = self.command(&format!("reg {reg}"))?;
        parse_reg_value(&resp).ok_or_else(|| LinkError::UnsupportedRegister(reg.to_owned()))
    }

    fn write_reg(&mut self, reg: &str, value: u32) -> Result<(), LinkError> {
        let resp = self.command(&format!("reg {reg} 0x{value:08x}"))?;
        if parse_reg_value(&resp).is_none() {
            return Err(LinkError::UnsupportedRegister(reg.to_owned()));
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<(), LinkError> {
        self.command("halt").map(|_| ())
    }

    fn go(&mut self) -> Result<(), LinkError> {
        self.command("resume").map(|_| ())
    }

    fn step(&mut self) -> Result<(), LinkError> {
        if !self.halted()? {
            return Err(LinkError::NotHalted);
        }
        self.command("step").map(|_| ())
    }

    fn reset(&mut self) -> Result<(), LinkError> {
        self.command("reset run").map(|_| ())
    }

    fn halted(&mut self) -> Result<bool, LinkError> {
        let resp = self.command("targets")?;
        Ok(parse_targets_halted(&resp))
    }

    fn close(&mut self) {
        let _ = self.command("exit");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
