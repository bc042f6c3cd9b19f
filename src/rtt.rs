//! SEGGER RTT engine.
//!
//! Finds the RTT control block in target RAM by scanning for its ASCII
//! sentinel, then runs the host side of the single-producer
//! single-consumer ring protocol: drain the up ring (target to host) and
//! fill the down ring (host to target). Only offsets owned by the host
//! (`RdOff` of an up ring, `WrOff` of a down ring) are ever written, and
//! only after the corresponding data transfer has completed.

use crate::arbitrator::Arbitrator;
use crate::error::Error;
use crate::link::{Link, LinkError};
use byteordered::ByteOrdered;
use std::io;
use tracing::{debug, trace, warn};

/// The control block announces itself with this ASCII id.
pub const SENTINEL: &[u8] = b"SEGGER RTT";

/// Scan geometry: 64 slices of 1 KiB, each read with enough overlap that
/// the 16-byte id field cannot straddle a slice boundary unseen.
const SCAN_SLICE: usize = 1024;
const SCAN_SLICES: usize = 64;
const SCAN_OVERLAP: usize = 32;

/// `acID[16]` plus the two buffer-count words.
const CB_HEADER_SIZE: usize = 24;

/// A descriptor whose pending count exceeds this was torn by a
/// concurrent writer; skip the drain and retry next tick.
const MAX_DRAIN: u32 = 1024 * 1024;

/// On-target ring descriptor: six little-endian 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDesc {
    pub name: u32,
    pub buffer: u32,
    pub size: u32,
    pub wr_off: u32,
    pub rd_off: u32,
    pub flags: u32,
}

impl RingDesc {
    pub const WIRE_SIZE: usize = 24;
    const WROFF_OFFSET: u32 = 12;
    const RDOFF_OFFSET: u32 = 16;

    pub fn parse(bytes: &[u8]) -> io::Result<Self> {
        let mut r = ByteOrdered::le(bytes);
        Ok(Self {
            name: r.read_u32()?,
            buffer: r.read_u32()?,
            size: r.read_u32()?,
            wr_off: r.read_u32()?,
            rd_off: r.read_u32()?,
            flags: r.read_u32()?,
        })
    }

    /// Both offsets must sit strictly inside the ring; anything else is
    /// a half-written descriptor.
    fn plausible(&self) -> bool {
        self.size > 0 && self.wr_off < self.size && self.rd_off < self.size
    }
}

/// Host handle onto one up ring and one down ring of a located control
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtt {
    pub cb_addr: u32,
    up_addr: u32,
    down_addr: u32,
}

impl Rtt {
    /// Scans for the control block and opens channel 0 in each direction.
    pub fn attach(link: &Link, search_base: u32) -> Result<Self, Error> {
        Self::attach_channel(link, search_base, 0, 0)
    }

    pub fn attach_channel(
        link: &Link,
        search_base: u32,
        up_channel: usize,
        down_channel: usize,
    ) -> Result<Self, Error> {
        let cb_addr = scan(link, search_base)?.ok_or(Error::RttNotFound(search_base))?;
        Self::attach_at(link, cb_addr, up_channel, down_channel)
    }

    /// Opens a control block at a known address (from an ELF symbol or
    /// user configuration) without scanning.
    pub fn attach_at(
        link: &Link,
        cb_addr: u32,
        up_channel: usize,
        down_channel: usize,
    ) -> Result<Self, Error> {
        let header = link.read_mem(cb_addr, CB_HEADER_SIZE)?;
        let mut r = ByteOrdered::le(&header[16..]);
        let max_up: u32 = r.read_u32().map_err(LinkError::from)?;
        let max_down: u32 = r.read_u32().map_err(LinkError::from)?;
        debug!(
            cb_addr = format_args!("{cb_addr:#010X}"),
            max_up, max_down, "Found RTT control block"
        );

        if up_channel as u32 >= max_up {
            return Err(Error::UpChannelInvalid(up_channel));
        }
        if down_channel as u32 >= max_down {
            return Err(Error::DownChannelInvalid(down_channel));
        }

        let up0 = cb_addr + CB_HEADER_SIZE as u32;
        let up_addr = up0 + (RingDesc::WIRE_SIZE * up_channel) as u32;
        let down0 = up0 + RingDesc::WIRE_SIZE as u32 * max_up;
        let down_addr = down0 + (RingDesc::WIRE_SIZE * down_channel) as u32;
        Ok(Self {
            cb_addr,
            up_addr,
            down_addr,
        })
    }

    /// Drains whatever the target has produced since the last call.
    ///
    /// A wrapped ring yields only the linear tail here; the next call
    /// picks up the head. `RdOff` is published only after the data read
    /// completed, so a transport error leaves the ring untouched for a
    /// clean retry.
    pub fn read_up(&self, link: &Link) -> Result<Vec<u8>, LinkError> {
        let desc = RingDesc::parse(&link.read_mem(self.up_addr, RingDesc::WIRE_SIZE)?)?;
        if !desc.plausible() {
            trace!(?desc, "Skipping drain of an implausible descriptor");
            return Ok(Vec::new());
        }

        let cnt = if desc.rd_off <= desc.wr_off {
            desc.wr_off - desc.rd_off
        } else {
            desc.size - desc.rd_off
        };
        if cnt == 0 || cnt >= MAX_DRAIN {
            if cnt != 0 {
                warn!(cnt, "Ignoring a torn up-ring descriptor");
            }
            return Ok(Vec::new());
        }

        let data = link.read_mem(desc.buffer + desc.rd_off, cnt as usize)?;
        let new_rd = (desc.rd_off + cnt) % desc.size;
        link.write_u32(self.up_addr + RingDesc::RDOFF_OFFSET, new_rd)?;
        link.arbitrator().after_xact(Some(Arbitrator::RING_YIELD));
        Ok(data)
    }

    /// Appends as much of `payload` as fits without ever making the ring
    /// look empty: `WrOff` must never land on `RdOff`, so one slot always
    /// stays free. Returns the number of bytes accepted.
    pub fn write_down(&self, link: &Link, payload: &[u8]) -> Result<usize, LinkError> {
        let desc = RingDesc::parse(&link.read_mem(self.down_addr, RingDesc::WIRE_SIZE)?)?;
        if !desc.plausible() {
            trace!(?desc, "Skipping fill of an implausible descriptor");
            return Ok(0);
        }

        let mut wr = desc.wr_off;
        let rd = desc.rd_off;
        let mut rest = payload;
        let mut written = 0usize;

        // Linear segment up to the end of the ring storage; when the
        // reader sits at 0 the last slot must stay free.
        if wr >= rd {
            let limit = if rd != 0 { desc.size } else { desc.size - 1 };
            let n = (limit - wr).min(rest.len() as u32) as usize;
            if n > 0 {
                link.write_mem(desc.buffer + wr, &rest[..n])?;
                wr = (wr + n as u32) % desc.size;
                rest = &rest[n..];
                written += n;
            }
        }

        // Wrapped segment from 0 up to one slot short of the reader.
        // `rd == 1` leaves no room; `rd == 0` was handled by the limit
        // above and must not wrap.
        if !rest.is_empty() && rd != 0 && rd != 1 {
            let n = ((rd - 1).saturating_sub(wr)).min(rest.len() as u32) as usize;
            if n > 0 {
                link.write_mem(desc.buffer + wr, &rest[..n])?;
                wr += n as u32;
                written += n;
            }
        }

        link.write_u32(self.down_addr + RingDesc::WROFF_OFFSET, wr)?;
        Ok(written)
    }
}

/// Scans up to 64 KiB above `base` for the control-block sentinel and
/// returns its address. Hits inside the overlap belong to the next
/// slice, which keeps the search window exactly 64 KiB wide.
fn scan(link: &Link, base: u32) -> Result<Option<u32>, LinkError> {
    for slice in 0..SCAN_SLICES {
        let slice_base = base + (slice * SCAN_SLICE) as u32;
        let data = link.read_mem(slice_base, SCAN_SLICE + SCAN_OVERLAP)?;
        if let Some(index) = find_sentinel(&data) {
            let cb_addr = slice_base + index as u32;
            debug!(
                cb_addr = format_args!("{cb_addr:#010X}"),
                slice, "Sentinel hit"
            );
            return Ok(Some(cb_addr));
        }
    }
    Ok(None)
}

fn find_sentinel(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(SENTINEL.len())
        .position(|w| w == SENTINEL)
        .filter(|&i| i < SCAN_SLICE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::testing::{mem_link, MemLink};
    use pretty_assertions::assert_eq;

    const BASE: u32 = 0x2000_0000;

    /// Builds a target RAM image holding a control block at `cb_off` with
    /// one up ring and one down ring, ring storage placed right after.
    struct Target {
        mem: MemLink,
        cb: u32,
    }

    impl Target {
        const RING_STORAGE: u32 = 0x8000;

        fn new(cb_off: u32, up_size: u32, down_size: u32) -> Self {
            let mut mem = MemLink::new(BASE, 0x2_0000);
            let cb = BASE + cb_off;
            let mut mem_write = |addr: u32, data: &[u8]| {
                let off = (addr - BASE) as usize;
                mem.ram[off..off + data.len()].copy_from_slice(data);
            };
            mem_write(cb, b"SEGGER RTT\0\0\0\0\0\0");
            mem_write(cb + 16, &1u32.to_le_bytes());
            mem_write(cb + 20, &1u32.to_le_bytes());
            // up ring descriptor
            let up_buf = BASE + Self::RING_STORAGE;
            mem_write(cb + 24 + 4, &up_buf.to_le_bytes());
            mem_write(cb + 24 + 8, &up_size.to_le_bytes());
            // down ring descriptor
            let down_buf = up_buf + 0x1000;
            mem_write(cb + 48 + 4, &down_buf.to_le_bytes());
            mem_write(cb + 48 + 8, &down_size.to_le_bytes());
            Self { mem, cb }
        }

        fn up_buf(&self) -> u32 {
            BASE + Self::RING_STORAGE
        }

        fn down_buf(&self) -> u32 {
            BASE + Self::RING_STORAGE + 0x1000
        }

        fn set_up(&mut self, wr: u32, rd: u32) {
            self.mem.put_u32(self.cb + 24 + 12, wr);
            self.mem.put_u32(self.cb + 24 + 16, rd);
        }

        fn set_down(&mut self, wr: u32, rd: u32) {
            self.mem.put_u32(self.cb + 48 + 12, wr);
            self.mem.put_u32(self.cb + 48 + 16, rd);
        }

        fn fill_up(&mut self, at: u32, bytes: &[u8]) {
            let off = (self.up_buf() + at - BASE) as usize;
            self.mem.ram[off..off + bytes.len()].copy_from_slice(bytes);
        }

        fn attach(self) -> (Link, Rtt) {
            let link = mem_link(self.mem);
            let rtt = Rtt::attach(&link, BASE).unwrap();
            (link, rtt)
        }
    }

    fn down_slot(link: &Link, down_buf: u32, at: u32) -> u8 {
        link.read_mem(down_buf + at, 1).unwrap()[0]
    }

    #[test]
    fn ring_descriptor_decodes_little_endian() {
        let mut bytes = Vec::new();
        for w in [0x11u32, 0x2000_8000, 1024, 10, 3, 2] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let desc = RingDesc::parse(&bytes).unwrap();
        assert_eq!(
            desc,
            RingDesc {
                name: 0x11,
                buffer: 0x2000_8000,
                size: 1024,
                wr_off: 10,
                rd_off: 3,
                flags: 2,
            }
        );
    }

    // Scenario S1: linear drain, no wrap.
    #[test]
    fn drain_without_wrap() {
        let mut target = Target::new(0, 16, 16);
        target.set_up(10, 3);
        target.fill_up(3, b"HELLO!!");
        let cb = target.cb;
        let (link, rtt) = target.attach();

        assert_eq!(rtt.read_up(&link).unwrap(), b"HELLO!!".to_vec());
        assert_eq!(link.read_u32(cb + 24 + 16).unwrap(), 10);
        // Ring is now empty.
        assert_eq!(rtt.read_up(&link).unwrap(), Vec::<u8>::new());
    }

    // Scenario S2: a wrapped ring drains tail first, then head.
    #[test]
    fn drain_with_wrap_returns_tail_then_head() {
        let mut target = Target::new(0, 16, 16);
        target.set_up(2, 12);
        target.fill_up(12, b"WXYZ");
        target.fill_up(0, b"AB");
        let cb = target.cb;
        let (link, rtt) = target.attach();

        assert_eq!(rtt.read_up(&link).unwrap(), b"WXYZ".to_vec());
        assert_eq!(link.read_u32(cb + 24 + 16).unwrap(), 0);
        assert_eq!(rtt.read_up(&link).unwrap(), b"AB".to_vec());
        assert_eq!(link.read_u32(cb + 24 + 16).unwrap(), 2);
    }

    // Property P1: bytes drained always equal bytes produced, tracked
    // through arbitrary wrap points, including non-power-of-two rings.
    #[test]
    fn drain_conserves_bytes_across_wraps() {
        for size in [3u32, 5, 16, 1024] {
            let mut produced = Vec::new();
            let mut delivered = Vec::new();
            let mut target = Target::new(0, size, 16);
            target.set_up(0, 0);
            let cb = target.cb;
            let (link, rtt) = target.attach();

            let mut wr = 0u32;
            for round in 0..50u32 {
                // Produce like the target would: fill to one short of full.
                let rd = link.read_u32(cb + 24 + 16).unwrap();
                while (wr + 1) % size != rd {
                    let b = (round & 0xFF) as u8;
                    link.write_mem(BASE + Target::RING_STORAGE + wr, &[b]).unwrap();
                    produced.push(b);
                    wr = (wr + 1) % size;
                }
                link.write_u32(cb + 24 + 12, wr).unwrap();
                // Drain twice to cover a potential wrap split.
                delivered.extend(rtt.read_up(&link).unwrap());
                delivered.extend(rtt.read_up(&link).unwrap());
            }
            assert_eq!(delivered, produced, "size {size}");
        }
    }

    // Scenario S3: a full down ring accepts nothing, because publishing
    // WrOff == RdOff would make it read as empty.
    #[test]
    fn full_down_ring_accepts_zero_bytes() {
        let mut target = Target::new(0, 16, 8);
        target.set_down(6, 7);
        let cb = target.cb;
        let (link, rtt) = target.attach();

        assert_eq!(rtt.write_down(&link, b"XY").unwrap(), 0);
        assert_eq!(link.read_u32(cb + 48 + 12).unwrap(), 6);
    }

    // Property P2: writes against a never-reading target stop exactly at
    // full, and stay there.
    #[test]
    fn down_ring_never_overruns() {
        for size in [3u32, 5, 16, 1024, 4096] {
            let mut target = Target::new(0, 16, size);
            target.set_down(0, 0);
            let cb = target.cb;
            let (link, rtt) = target.attach();

            let payload = vec![0x55u8; size as usize * 2];
            let mut total = 0;
            for _ in 0..3 {
                total += rtt.write_down(&link, &payload).unwrap();
            }
            assert_eq!(total as u32, size - 1, "size {size}");
            let wr = link.read_u32(cb + 48 + 12).unwrap();
            let rd = link.read_u32(cb + 48 + 16).unwrap();
            assert_eq!((wr + 1) % size, rd % size, "size {size} must end full");
        }
    }

    // Property P3: with the reader at 0 the tail may only fill to one
    // short of the end, and wrapping is forbidden.
    #[test]
    fn reader_at_zero_blocks_wrap() {
        for size in [3u32, 5, 16, 1024, 4096] {
            let mut target = Target::new(0, 16, size);
            target.set_down(size - 2, 0);
            let cb = target.cb;
            let down_buf = target.down_buf();
            let (link, rtt) = target.attach();

            let written = rtt.write_down(&link, b"ABCDE").unwrap();
            assert_eq!(written, 1, "size {size}: one tail byte fits");
            assert_eq!(link.read_u32(cb + 48 + 12).unwrap(), size - 1);
            assert_eq!(down_slot(&link, down_buf, size - 2), b'A');
            // Slot 0 must be untouched: no head bytes were written.
            assert_eq!(down_slot(&link, down_buf, 0), 0);
        }
    }

    #[test]
    fn down_ring_wraps_when_reader_left_room() {
        let mut target = Target::new(0, 16, 8);
        // Reader consumed up to 4; writer at 6: room for 6,7 then 0..=2.
        target.set_down(6, 4);
        let cb = target.cb;
        let down_buf = target.down_buf();
        let (link, rtt) = target.attach();

        assert_eq!(rtt.write_down(&link, b"abcdefgh").unwrap(), 5);
        assert_eq!(link.read_u32(cb + 48 + 12).unwrap(), 3);
        assert_eq!(down_slot(&link, down_buf, 6), b'a');
        assert_eq!(down_slot(&link, down_buf, 7), b'b');
        assert_eq!(down_slot(&link, down_buf, 0), b'c');
        assert_eq!(down_slot(&link, down_buf, 2), b'e');
        // Slot 3 == RdOff - 1 stays free.
        assert_eq!(down_slot(&link, down_buf, 3), 0);
    }

    #[test]
    fn transport_failure_leaves_ring_state_alone() {
        let mut target = Target::new(0, 16, 16);
        target.set_up(10, 3);
        target.fill_up(3, b"HELLO!!");
        let cb = target.cb;
        // Resolve the ring addresses against a pristine twin; the flaky
        // link only serves the drain itself.
        let (clean_link, rtt) = Target::new(0, 16, 16).attach();
        clean_link.close();
        target.mem.fail_next = 1;
        let link = mem_link(target.mem);

        assert!(rtt.read_up(&link).is_err());
        assert_eq!(link.read_u32(cb + 24 + 16).unwrap(), 3);
        // The retry drains from the same RdOff.
        assert_eq!(rtt.read_up(&link).unwrap(), b"HELLO!!".to_vec());
    }

    // Property P4 and scenario S4: sentinel discovery across slice
    // boundaries, and the hard 64 KiB window edge.
    #[test]
    fn discovery_window_and_overlap() {
        for off in [0u32, 1023, 1024, 1025, 2047, 65504] {
            let target = Target::new(off, 16, 16);
            let link = mem_link(target.mem);
            let rtt = Rtt::attach(&link, BASE)
                .unwrap_or_else(|e| panic!("offset {off}: {e}"));
            assert_eq!(rtt.cb_addr, BASE + off, "offset {off}");
        }

        // One byte past the window: present in RAM, but out of scope.
        let target = Target::new(65536, 16, 16);
        let link = mem_link(target.mem);
        assert!(matches!(
            Rtt::attach(&link, BASE),
            Err(Error::RttNotFound(_))
        ));
    }

    #[test]
    fn explicit_control_block_address_skips_the_scan() {
        let target = Target::new(2047, 16, 16);
        let cb = target.cb;
        let link = mem_link(target.mem);
        let rtt = Rtt::attach_at(&link, cb, 0, 0).unwrap();
        assert_eq!(rtt.cb_addr, BASE + 2047);
        assert!(matches!(
            Rtt::attach_at(&link, cb, 3, 0),
            Err(Error::UpChannelInvalid(3))
        ));
        assert!(matches!(
            Rtt::attach_at(&link, cb, 0, 9),
            Err(Error::DownChannelInvalid(9))
        ));
    }
}
