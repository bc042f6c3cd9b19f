//! Uniform probe abstraction.
//!
//! A [`LinkDriver`] is one concrete probe back-end (JLink DLL, OpenOCD Tcl
//! RPC, Keil uVision COM, CMSIS-DAP owned/shared). A [`Link`] wraps the
//! active driver behind a mutex so the poll scheduler and the GDB bridge
//! can share it; the mutex is held for exactly one probe transaction.

use crate::agdi::AgdiCache;
use crate::arbitrator::Arbitrator;
use std::sync::{Arc, Mutex};

pub mod dap;
pub mod jlink;
pub mod keil;
pub mod openocd;

pub use dap::DapLink;
pub use jlink::JlinkLink;
pub use keil::KeilLink;
pub use openocd::OpenOcdLink;

/// The fixed register profile exported to GDB clients and used for
/// register-by-name access on Cortex-M drivers.
pub const CORTEX_M_REGS: [&str; 17] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "xpsr",
];

/// Maps a register name onto the Cortex-M debug register selector index
/// (`r0..r15` are 0..15, `xpsr` is 16).
pub fn cortex_m_reg_index(name: &str) -> Option<u16> {
    match name {
        "sp" | "r13" => Some(13),
        "lr" | "r14" => Some(14),
        "pc" | "r15" => Some(15),
        "xpsr" => Some(16),
        _ => {
            let idx: u16 = name.strip_prefix('r')?.parse().ok()?;
            (idx < 13).then_some(idx)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Probe transport failure. {0}")]
    Transport(String),

    #[error("The target refused the access-port transaction at {addr:#010X}")]
    BusFault { addr: u32 },

    #[error("Register '{0}' is not known to this probe driver")]
    UnsupportedRegister(String),

    #[error("The target must be halted first")]
    NotHalted,

    #[error("Not supported by this probe driver. {0}")]
    Unsupported(&'static str),

    #[error("The link was closed while a transaction was pending")]
    Closed,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

impl LinkError {
    /// Transport failures are the only retryable class; the scheduler
    /// budgets them before declaring the session disconnected.
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}

/// Capability set every probe back-end provides.
///
/// Memory is always byte-addressed with little-endian word helpers on top;
/// drivers override `read_u32`/`write_u32` when the probe has a native
/// word cycle.
pub trait LinkDriver: Send {
    fn read_mem(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError>;

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError>;

    fn read_u32(&mut self, addr: u32) -> Result<u32, LinkError> {
        let b = self.read_mem(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), LinkError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    fn read_reg(&mut self, reg: &str) -> Result<u32, LinkError>;

    fn write_reg(&mut self, reg: &str, value: u32) -> Result<(), LinkError>;

    fn halt(&mut self) -> Result<(), LinkError>;

    fn go(&mut self) -> Result<(), LinkError>;

    fn step(&mut self) -> Result<(), LinkError>;

    fn reset(&mut self) -> Result<(), LinkError>;

    fn halted(&mut self) -> Result<bool, LinkError>;

    /// Drop any cached DP/AP routing state (SELECT, CSW). A second bus
    /// master may have rewritten them between our transactions.
    fn invalidate_cache(&mut self) {}

    fn close(&mut self) {}
}

struct LinkInner {
    driver: Option<Box<dyn LinkDriver>>,
    agdi: Option<AgdiCache>,
}

/// Shared handle over the active probe driver.
///
/// Cloning is cheap; all clones serialize through one mutex held per
/// atomic probe transaction. After [`Link::close`] every transaction
/// fails with [`LinkError::Closed`].
#[derive(Clone)]
pub struct Link {
    inner: Arc<Mutex<LinkInner>>,
    arbitrator: Arbitrator,
}

impl Link {
    pub fn new(driver: Box<dyn LinkDriver>, arbitrator: Arbitrator) -> Self {
        Self::with_agdi_cache(driver, arbitrator, None)
    }

    pub fn with_agdi_cache(
        driver: Box<dyn LinkDriver>,
        arbitrator: Arbitrator,
        agdi: Option<AgdiCache>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkInner {
                driver: Some(driver),
                agdi,
            })),
            arbitrator,
        }
    }

    /// True when the probe is co-owned by a primary IDE.
    pub fn is_shared(&self) -> bool {
        self.arbitrator.is_shared()
    }

    /// The arbitration policy this link runs under. Burst call sites
    /// (ring drain, variable rounds) pass their politeness hint to
    /// [`Arbitrator::after_xact`] through this.
    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut dyn LinkDriver) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let driver = inner.driver.as_deref_mut().ok_or(LinkError::Closed)?;
        self.arbitrator.before_xact(driver);
        let out = f(driver);
        self.arbitrator.after_xact(None);
        out
    }

    pub fn read_mem(&self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = inner.agdi.as_ref().and_then(|c| c.lookup(addr, len)) {
                return Ok(cached);
            }
        }
        self.transact(|d| d.read_mem(addr, len))
    }

    pub fn write_mem(&self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        self.transact(|d| d.write_mem(addr, data))
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, LinkError> {
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = inner.agdi.as_ref().and_then(|c| c.lookup(addr, 4)) {
                return Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            }
        }
        self.transact(|d| d.read_u32(addr))
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> Result<(), LinkError> {
        self.transact(|d| d.write_u32(addr, value))
    }

    pub fn read_reg(&self, reg: &str) -> Result<u32, LinkError> {
        self.transact(|d| d.read_reg(reg))
    }

    pub fn write_reg(&self, reg: &str, value: u32) -> Result<(), LinkError> {
        self.transact(|d| d.write_reg(reg, value))
    }

    pub fn halt(&self) -> Result<(), LinkError> {
        self.transact(|d| d.halt())
    }

    pub fn go(&self) -> Result<(), LinkError> {
        self.transact(|d| d.go())
    }

    pub fn step(&self) -> Result<(), LinkError> {
        self.transact(|d| d.step())
    }

    pub fn reset(&self) -> Result<(), LinkError> {
        self.transact(|d| d.reset())
    }

    pub fn halted(&self) -> Result<bool, LinkError> {
        self.transact(|d| d.halted())
    }

    /// Closes the underlying driver. Transactions issued by other clones
    /// after this point fail with [`LinkError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut driver) = inner.driver.take() {
            driver.close();
        }
    }
}


#[cfg(test)]
mod test {
    use super::testing::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reg_index_table() {
        assert_eq!(cortex_m_reg_index("r0"), Some(0));
        assert_eq!(cortex_m_reg_index("r12"), Some(12));
        assert_eq!(cortex_m_reg_index("sp"), Some(13));
        assert_eq!(cortex_m_reg_index("lr"), Some(14));
        assert_eq!(cortex_m_reg_index("pc"), Some(15));
        assert_eq!(cortex_m_reg_index("xpsr"), Some(16));
        assert_eq!(cortex_m_reg_index("r13"), Some(13));
        assert_eq!(cortex_m_reg_index("cpsr"), None);
        assert_eq!(cortex_m_reg_index("r99"), None);
    }

    #[test]
    fn closed_link_rejects_transactions() {
        let link = mem_link(MemLink::new(0x2000_0000, 64));
        assert!(link.read_u32(0x2000_0000).is_ok());
        link.close();
        assert!(matches!(
            link.read_u32(0x2000_0000),
            Err(LinkError::Closed)
        ));
        assert!(matches!(link.halt(), Err(LinkError::Closed)));
    }

    #[test]
    fn word_helpers_are_little_endian() {
        let link = mem_link(MemLink::new(0x2000_0000, 64));
        link.write_u32(0x2000_0010, 0x1122_3344).unwrap();
        assert_eq!(
            link.read_mem(0x2000_0010, 4).unwrap(),
            vec![0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(link.read_u32(0x2000_0010).unwrap(), 0x1122_3344);
    }
}
