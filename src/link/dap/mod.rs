//! CMSIS-DAP back-end.
//!
//! Implements the DAP wire protocol over a [`DapTransport`] packet
//! channel: SWJ connect sequence, DP/AP register transfers, MEM-AP
//! word/byte memory cycles, and Cortex-M core control through the debug
//! registers.
//!
//! Two attach flavors exist. *Owned* performs the standard init (clear
//! sticky errors, power up the debug domain, init AHB-AP 0). *Shared*
//! skips all of that because a primary IDE already owns the target; it
//! only forces SWD and probes the AP IDR with a retry back-off. In shared
//! mode the DP SELECT and AP CSW values cached by this driver are dropped
//! before every transaction (see [`crate::arbitrator`]), since the IDE
//! may rewrite them between any two of our bus cycles.

use crate::link::{cortex_m_reg_index, LinkDriver, LinkError};
use std::time::Duration;
use tracing::{debug, warn};

pub mod transport;

pub use transport::{enumerate, DapTransport, HidTransport, ProbeInfo};

// Command bytes
const CMD_CONNECT: u8 = 0x02;
const CMD_DISCONNECT: u8 = 0x03;
const CMD_TRANSFER_CONFIGURE: u8 = 0x04;
const CMD_TRANSFER: u8 = 0x05;
const CMD_TRANSFER_BLOCK: u8 = 0x06;
const CMD_WRITE_ABORT: u8 = 0x08;
const CMD_SWJ_CLOCK: u8 = 0x11;
const CMD_SWJ_SEQUENCE: u8 = 0x12;
const CMD_SWD_CONFIGURE: u8 = 0x13;

const CONNECT_PORT_SWD: u8 = 0x01;
const DAP_OK: u8 = 0x00;

// Transfer request bits
const REQ_APNDP: u8 = 1 << 0;
const REQ_RNW: u8 = 1 << 1;

// Transfer acks
const ACK_OK: u8 = 0x01;
const ACK_WAIT: u8 = 0x02;
const ACK_FAULT: u8 = 0x04;

// DP registers
const DP_DPIDR: u8 = 0x0;
const DP_CTRL_STAT: u8 = 0x4;
const DP_SELECT: u8 = 0x8;

// CTRL/STAT bits
const CSYSPWRUPACK: u32 = 1 << 31;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CDBGPWRUPACK: u32 = 1 << 29;
const CDBGPWRUPREQ: u32 = 1 << 28;

// ABORT bits: ORUNERRCLR | WDERRCLR | STKERRCLR | STKCMPCLR
const ABORT_CLEAR_ALL: u32 = 0x1E;

// MEM-AP registers
const AP_CSW: u8 = 0x00;
const AP_TAR: u8 = 0x04;
const AP_DRW: u8 = 0x0C;
const AP_IDR: u8 = 0xFC;

// CSW: DbgSwEnable | HPROT1 | MasterDbg | DeviceEn, plus size/increment
const CSW_BASE: u32 = 0x2300_0040;
const CSW_WORD: u32 = CSW_BASE | 0x12; // 32-bit, auto-increment single
const CSW_BYTE: u32 = CSW_BASE; // 8-bit, no increment

// TAR auto-increment is only guaranteed within a 1 KiB page.
const AUTO_INC_PAGE: u32 = 1024;
// Bounded by the 64-byte HID packet on both directions.
const WORDS_PER_BLOCK: usize = 14;

// Cortex-M debug registers, accessed through the MEM-AP
const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const AIRCR: u32 = 0xE000_ED0C;

const DHCSR_DBGKEY: u32 = 0xA05F << 16;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_C_HALT: u32 = 1 << 1;
const DHCSR_C_STEP: u32 = 1 << 2;
const DHCSR_S_REGRDY: u32 = 1 << 16;
const DHCSR_S_HALT: u32 = 1 << 17;

const DCRSR_WRITE: u32 = 1 << 16;

const AIRCR_SYSRESETREQ: u32 = 0x05FA_0004;

const IDR_RETRIES: usize = 3;
const IDR_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct Xfer {
    req: u8,
    data: u32,
}

impl Xfer {
    fn read_dp(reg: u8) -> Self {
        Self {
            req: REQ_RNW | (reg & 0x0C),
            data: 0,
        }
    }

    fn write_dp(reg: u8, data: u32) -> Self {
        Self {
            req: reg & 0x0C,
            data,
        }
    }

    fn read_ap(reg: u8) -> Self {
        Self {
            req: REQ_APNDP | REQ_RNW | (reg & 0x0C),
            data: 0,
        }
    }

    fn write_ap(reg: u8, data: u32) -> Self {
        Self {
            req: REQ_APNDP | (reg & 0x0C),
            data,
        }
    }

    fn is_read(&self) -> bool {
        self.req & REQ_RNW != 0
    }
}

pub struct DapLink {
    transport: Box<dyn DapTransport>,
    shared: bool,
    ap_index: u8,
    cached_select: Option<u32>,
    cached_csw: Option<u32>,
}

impl DapLink {
    /// Full-init attach for a probe this process exclusively owns.
    pub fn open_owned(selector: &str, speed_khz: u32) -> Result<Self, LinkError> {
        Self::attach_owned(Box::new(HidTransport::open(selector)?), speed_khz)
    }

    /// Init-free attach for a probe co-owned by a primary IDE.
    pub fn open_shared(selector: &str, speed_khz: u32) -> Result<Self, LinkError> {
        Self::attach_shared(Box::new(HidTransport::open(selector)?), speed_khz)
    }

    pub fn attach_owned(
        transport: Box<dyn DapTransport>,
        speed_khz: u32,
    ) -> Result<Self, LinkError> {
        let mut link = Self::new(transport, false);
        link.configure(speed_khz)?;
        link.connect_swd()?;
        link.power_up_debug()?;
        link.init_ahb_ap()?;
        Ok(link)
    }

    pub fn attach_shared(
        transport: Box<dyn DapTransport>,
        speed_khz: u32,
    ) -> Result<Self, LinkError> {
        let mut link = Self::new(transport, true);
        link.configure(speed_khz)?;
        link.connect_swd()?;

        // The IDE has already powered up debug; just confirm the AP is
        // reachable. The IDE may be mid-burst, so retry with a back-off.
        let mut idr = 0;
        for attempt in 0..IDR_RETRIES {
            link.invalidate_cache();
            match link.read_ap(AP_IDR) {
                Ok(v) if v != 0 => {
                    idr = v;
                    break;
                }
                Ok(_) | Err(_) => {
                    debug!(attempt, "AP IDR probe missed, backing off");
                    std::thread::sleep(IDR_RETRY_BACKOFF);
                }
            }
        }
        if idr == 0 {
            warn!("Could not confirm the AHB-AP IDR in shared mode, continuing anyway");
        } else {
            debug!(idr = format_args!("{idr:#010X}"), "Shared attach confirmed");
        }
        Ok(link)
    }

    fn new(transport: Box<dyn DapTransport>, shared: bool) -> Self {
        Self {
            transport,
            shared,
            ap_index: 0,
            cached_select: None,
            cached_csw: None,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    fn command(&mut self, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let resp = self.transport.transfer(payload)?;
        if resp.first() != payload.first() {
            return Err(LinkError::Transport(format!(
                "CMSIS-DAP response does not echo command {:#04x}",
                payload[0]
            )));
        }
        Ok(resp)
    }

    fn check_status(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let resp = self.command(payload)?;
        if resp.get(1) != Some(&DAP_OK) {
            return Err(LinkError::Transport(format!(
                "CMSIS-DAP command {:#04x} failed on the probe",
                payload[0]
            )));
        }
        Ok(())
    }

    fn configure(&mut self, speed_khz: u32) -> Result<(), LinkError> {
        // idle cycles 0, WAIT retry 100, match retry 0
        self.check_status(&[CMD_TRANSFER_CONFIGURE, 0x00, 100, 0, 0, 0])?;
        self.check_status(&[CMD_SWD_CONFIGURE, 0x00])?;
        let hz = speed_khz.saturating_mul(1000).to_le_bytes();
        self.check_status(&[CMD_SWJ_CLOCK, hz[0], hz[1], hz[2], hz[3]])?;
        Ok(())
    }

    fn swj_sequence(&mut self, bits: u8, data: &[u8]) -> Result<(), LinkError> {
        let mut payload = vec![CMD_SWJ_SEQUENCE, bits];
        payload.extend_from_slice(data);
        self.check_status(&payload)
    }

    fn connect_swd(&mut self) -> Result<(), LinkError> {
        let resp = self.command(&[CMD_CONNECT, CONNECT_PORT_SWD])?;
        if resp.get(1) != Some(&CONNECT_PORT_SWD) {
            return Err(LinkError::Transport(
                "The probe refused to connect in SWD mode".to_owned(),
            ));
        }

        // Line reset, JTAG-to-SWD switch, line reset, idle cycles, then
        // the mandatory DPIDR read.
        self.swj_sequence(56, &[0xFF; 7])?;
        self.swj_sequence(16, &[0x9E, 0xE7])?;
        self.swj_sequence(56, &[0xFF; 7])?;
        self.swj_sequence(8, &[0x00])?;
        let dpidr = self.read_dp(DP_DPIDR)?;
        debug!(dpidr = format_args!("{dpidr:#010X}"), "SWD connected");
        Ok(())
    }

    fn clear_sticky_errors(&mut self) {
        let v = ABORT_CLEAR_ALL.to_le_bytes();
        let _ = self.command(&[CMD_WRITE_ABORT, 0x00, v[0], v[1], v[2], v[3]]);
    }

    fn power_up_debug(&mut self) -> Result<(), LinkError> {
        self.clear_sticky_errors();
        self.write_select(0)?;
        self.write_dp(DP_CTRL_STAT, CDBGPWRUPREQ | CSYSPWRUPREQ)?;
        let acks = CDBGPWRUPACK | CSYSPWRUPACK;
        for _ in 0..100 {
            let stat = self.read_dp(DP_CTRL_STAT)?;
            if stat & acks == acks {
                debug!("Debug domain powered up");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(LinkError::Transport(
            "The debug power-up request was never acknowledged".to_owned(),
        ))
    }

    fn init_ahb_ap(&mut self) -> Result<(), LinkError> {
        let idr = self.read_ap(AP_IDR)?;
        if idr == 0 {
            return Err(LinkError::Transport(
                "No AHB-AP answered at AP index 0".to_owned(),
            ));
        }
        debug!(idr = format_args!("{idr:#010X}"), "AHB-AP initialized");
        self.write_csw(CSW_WORD)
    }

    fn raw_transfer(&mut self, ops: &[Xfer]) -> Result<Vec<u32>, LinkError> {
        let mut packet = vec![CMD_TRANSFER, 0x00, ops.len() as u8];
        for op in ops {
            packet.push(op.req);
            if !op.is_read() {
                packet.extend_from_slice(&op.data.to_le_bytes());
            }
        }
        let resp = self.command(&packet)?;
        let executed = *resp.get(1).unwrap_or(&0) as usize;
        let ack = *resp.get(2).unwrap_or(&0);
        if ack != ACK_OK || executed != ops.len() {
            // Routing state is suspect after any failed transfer.
            self.invalidate_cache();
            if ack == ACK_FAULT {
                self.clear_sticky_errors();
                return Err(LinkError::BusFault { addr: 0 });
            }
            let kind = if ack == ACK_WAIT { "WAIT" } else { "protocol" };
            return Err(LinkError::Transport(format!(
                "CMSIS-DAP transfer failed ({kind}, ack {ack:#04x}, {executed}/{} executed)",
                ops.len()
            )));
        }
        let reads = ops.iter().filter(|o| o.is_read()).count();
        let mut values = Vec::with_capacity(reads);
        for i in 0..reads {
            let off = 3 + i * 4;
            let bytes: [u8; 4] = resp
                .get(off..off + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| {
                    LinkError::Transport("CMSIS-DAP transfer response is truncated".to_owned())
                })?;
            values.push(u32::from_le_bytes(bytes));
        }
        Ok(values)
    }

    fn write_select(&mut self, value: u32) -> Result<(), LinkError> {
        self.raw_transfer(&[Xfer::write_dp(DP_SELECT, value)])?;
        self.cached_select = Some(value);
        Ok(())
    }

    /// Ensure DP SELECT routes to our AP and the bank of `ap_reg`,
    /// rewriting it only when the cached value does not already match.
    fn select_for(&mut self, ap_reg: u8) -> Result<(), LinkError> {
        let want = (u32::from(self.ap_index) << 24) | (u32::from(ap_reg) & 0xF0);
        if self.cached_select != Some(want) {
            self.write_select(want)?;
        }
        Ok(())
    }

    fn read_dp(&mut self, reg: u8) -> Result<u32, LinkError> {
        Ok(self.raw_transfer(&[Xfer::read_dp(reg)])?[0])
    }

    fn write_dp(&mut self, reg: u8, value: u32) -> Result<(), LinkError> {
        self.raw_transfer(&[Xfer::write_dp(reg, value)]).map(|_| ())
    }

    fn read_ap(&mut self, reg: u8) -> Result<u32, LinkError> {
        self.select_for(reg)?;
        Ok(self.raw_transfer(&[Xfer::read_ap(reg)])?[0])
    }

    fn write_ap(&mut self, reg: u8, value: u32) -> Result<(), LinkError> {
        self.select_for(reg)?;
        self.raw_transfer(&[Xfer::write_ap(reg, value)]).map(|_| ())
    }

    fn write_csw(&mut self, value: u32) -> Result<(), LinkError> {
        if self.cached_csw != Some(value) {
            self.write_ap(AP_CSW, value)?;
            self.cached_csw = Some(value);
        }
        Ok(())
    }

    fn block_read_drw(&mut self, count: usize) -> Result<Vec<u32>, LinkError> {
        self.select_for(AP_DRW)?;
        let cnt = (count as u16).to_le_bytes();
        let req = REQ_APNDP | REQ_RNW | (AP_DRW & 0x0C);
        let resp = self.command(&[CMD_TRANSFER_BLOCK, 0x00, cnt[0], cnt[1], req])?;
        let executed = u16::from_le_bytes([
            *resp.get(1).unwrap_or(&0),
            *resp.get(2).unwrap_or(&0),
        ]) as usize;
        let ack = *resp.get(3).unwrap_or(&0);
        if ack != ACK_OK || executed != count {
            self.invalidate_cache();
            if ack == ACK_FAULT {
                self.clear_sticky_errors();
                return Err(LinkError::BusFault { addr: 0 });
            }
            return Err(LinkError::Transport(format!(
                "CMSIS-DAP block read failed (ack {ack:#04x}, {executed}/{count} executed)"
            )));
        }
        let mut words = Vec::with_capacity(count);
        for i in 0..count {
            let off = 4 + i * 4;
            let bytes: [u8; 4] = resp
                .get(off..off + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| {
                    LinkError::Transport("CMSIS-DAP block response is truncated".to_owned())
                })?;
            words.push(u32::from_le_bytes(bytes));
        }
        Ok(words)
    }

    fn block_write_drw(&mut self, words: &[u32]) -> Result<(), LinkError> {
        self.select_for(AP_DRW)?;
        let cnt = (words.len() as u16).to_le_bytes();
        let req = REQ_APNDP | (AP_DRW & 0x0C);
        let mut packet = vec![CMD_TRANSFER_BLOCK, 0x00, cnt[0], cnt[1], req];
        for w in words {
            packet.extend_from_slice(&w.to_le_bytes());
        }
        let resp = self.command(&packet)?;
        let executed = u16::from_le_bytes([
            *resp.get(1).unwrap_or(&0),
            *resp.get(2).unwrap_or(&0),
        ]) as usize;
        let ack = *resp.get(3).unwrap_or(&0);
        if ack != ACK_OK || executed != words.len() {
            self.invalidate_cache();
            if ack == ACK_FAULT {
                self.clear_sticky_errors();
                return Err(LinkError::BusFault { addr: 0 });
            }
            return Err(LinkError::Transport(format!(
                "CMSIS-DAP block write failed (ack {ack:#04x}, {executed}/{} executed)",
                words.len()
            )));
        }
        Ok(())
    }

    fn read_words(&mut self, mut addr: u32, count: usize) -> Result<Vec<u32>, LinkError> {
        let mut out = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            self.write_csw(CSW_WORD)?;
            self.write_ap(AP_TAR, addr)?;
            let page_room = ((AUTO_INC_PAGE - (addr % AUTO_INC_PAGE)) / 4).max(1) as usize;
            let n = remaining.min(page_room).min(WORDS_PER_BLOCK);
            out.extend_from_slice(&self.block_read_drw(n)?);
            addr = addr.wrapping_add((n * 4) as u32);
            remaining -= n;
        }
        Ok(out)
    }

    fn write_words(&mut self, mut addr: u32, words: &[u32]) -> Result<(), LinkError> {
        let mut words = words;
        while !words.is_empty() {
            self.write_csw(CSW_WORD)?;
            self.write_ap(AP_TAR, addr)?;
            let page_room = ((AUTO_INC_PAGE - (addr % AUTO_INC_PAGE)) / 4).max(1) as usize;
            let n = words.len().min(page_room).min(WORDS_PER_BLOCK);
            self.block_write_drw(&words[..n])?;
            addr = addr.wrapping_add((n * 4) as u32);
            words = &words[n..];
        }
        Ok(())
    }

    fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), LinkError> {
        self.write_csw(CSW_BYTE)?;
        self.write_ap(AP_TAR, addr)?;
        let lane = u32::from(value) << ((addr % 4) * 8);
        self.select_for(AP_DRW)?;
        self.raw_transfer(&[Xfer::write_ap(AP_DRW, lane)])?;
        Ok(())
    }

    fn tag_fault(e: LinkError, addr: u32) -> LinkError {
        match e {
            LinkError::BusFault { .. } => LinkError::BusFault { addr },
            e => e,
        }
    }

    fn wait_regrdy(&mut self) -> Result<(), LinkError> {
        for _ in 0..100 {
            let dhcsr = LinkDriver::read_u32(self, DHCSR)?;
            if dhcsr & DHCSR_S_REGRDY != 0 {
                return Ok(());
            }
        }
        Err(LinkError::Transport(
            "The core register transfer never completed".to_owned(),
        ))
    }
}

impl LinkDriver for DapLink {
    fn read_mem(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let start = addr & !3;
        let end = addr
            .checked_add(len as u32)
            .map(|e| (e + 3) & !3)
            .ok_or(LinkError::BusFault { addr })?;
        let words = self
            .read_words(start, ((end - start) / 4) as usize)
            .map_err(|e| Self::tag_fault(e, addr))?;
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let lead = (addr - start) as usize;
        Ok(bytes[lead..lead + len].to_vec())
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        let mut addr = addr;
        let mut data = data;
        while addr % 4 != 0 && !data.is_empty() {
            self.write_byte(addr, data[0])
                .map_err(|e| Self::tag_fault(e, addr))?;
            addr = addr.wrapping_add(1);
            data = &data[1..];
        }
        let word_count = data.len() / 4;
        if word_count > 0 {
            let words: Vec<u32> = data[..word_count * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            self.write_words(addr, &words)
                .map_err(|e| Self::tag_fault(e, addr))?;
            addr = addr.wrapping_add((word_count * 4) as u32);
            data = &data[word_count * 4..];
        }
        for &b in data {
            self.write_byte(addr, b)
                .map_err(|e| Self::tag_fault(e, addr))?;
            addr = addr.wrapping_add(1);
        }
        Ok(())
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, LinkError> {
        if addr % 4 == 0 {
            let words = self
                .read_words(addr, 1)
                .map_err(|e| Self::tag_fault(e, addr))?;
            Ok(words[0])
        } else {
            let b = self.read_mem(addr, 4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), LinkError> {
        if addr % 4 == 0 {
            self.write_words(addr, &[value])
                .map_err(|e| Self::tag_fault(e, addr))
        } else {
            self.write_mem(addr, &value.to_le_bytes())
        }
    }

    fn read_reg(&mut self, reg: &str) -> Result<u32, LinkError> {
        let index = cortex_m_reg_index(reg)
            .ok_or_else(|| LinkError::UnsupportedRegister(reg.to_owned()))?;
        if !LinkDriver::halted(self)? {
            return Err(LinkError::NotHalted);
        }
        LinkDriver::write_u32(self, DCRSR, u32::from(index))?;
        self.wait_regrdy()?;
        LinkDriver::read_u32(self, DCRDR)
    }

    fn write_reg(&mut self, reg: &str, value: u32) -> Result<(), LinkError> {
        let index = cortex_m_reg_index(reg)
            .ok_or_else(|| LinkError::UnsupportedRegister(reg.to_owned()))?;
        if !LinkDriver::halted(self)? {
            return Err(LinkError::NotHalted);
        }
        LinkDriver::write_u32(self, DCRDR, value)?;
        LinkDriver::write_u32(self, DCRSR, u32::from(index) | DCRSR_WRITE)?;
        self.wait_regrdy()
    }

    fn halt(&mut self) -> Result<(), LinkError> {
        LinkDriver::write_u32(self, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_HALT)
    }

    fn go(&mut self) -> Result<(), LinkError> {
        LinkDriver::write_u32(self, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN)
    }

    fn step(&mut self) -> Result<(), LinkError> {
        if !LinkDriver::halted(self)? {
            return Err(LinkError::NotHalted);
        }
        LinkDriver::write_u32(self, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_STEP)
    }

    fn reset(&mut self) -> Result<(), LinkError> {
        LinkDriver::write_u32(self, AIRCR, AIRCR_SYSRESETREQ)
    }

    fn halted(&mut self) -> Result<bool, LinkError> {
        Ok(LinkDriver::read_u32(self, DHCSR)? & DHCSR_S_HALT != 0)
    }

    fn invalidate_cache(&mut self) {
        self.cached_select = None;
        self.cached_csw = None;
    }

    fn close(&mut self) {
        let _ = self.command(&[CMD_DISCONNECT]);
    }
}
