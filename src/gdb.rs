//! GDB Remote Serial Protocol bridge.
//!
//! Re-exports the probe as a minimal RSP server on loopback TCP so a
//! secondary debugger (Ozone, gdb) can inspect the target through the
//! same Link the RTT poller uses. One client at a time; packets are
//! `$<payload>#<hh>` frames with a modulo-256 checksum, acknowledged
//! with `+` (or `-` on a checksum mismatch, which leaves the session
//! untouched).
//!
//! `c`/`vCont;c` sends no immediate reply; while the target runs the
//! bridge polls `halted()` at 100 ms granularity and reports `S05` on
//! stop, and an out-of-band 0x03 byte halts the target and reports the
//! same way.

use crate::interruptor::Interruptor;
use crate::link::{Link, CORTEX_M_REGS};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_GDB_PORT: u16 = 2331;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const RUN_POLL: Duration = Duration::from_millis(100);

const STOP_REPLY: &[u8] = b"S05";

const TARGET_XML: &str = "<?xml version=\"1.0\"?>\
    <!DOCTYPE target SYSTEM \"gdb-target.dtd\">\
    <target><architecture>arm</architecture></target>";

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload);
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
    out
}

/// Splits one complete `$<payload>#<hh>` frame off the front of `buf`.
/// Returns `(payload, checksum_ok, bytes_consumed)`, or `None` while the
/// frame is still incomplete. The caller guarantees `buf[0] == b'$'`.
fn take_frame(buf: &[u8]) -> Option<(Vec<u8>, bool, usize)> {
    let hash = buf.iter().position(|&b| b == b'#')?;
    if buf.len() < hash + 3 {
        return None;
    }
    let payload = buf[1..hash].to_vec();
    let sum_hex = std::str::from_utf8(&buf[hash + 1..hash + 3]).ok();
    let ok = sum_hex
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .is_some_and(|sum| sum == checksum(&payload));
    Some((payload, ok, hash + 3))
}

struct GdbSession {
    link: Link,
    target_running: bool,
}

impl GdbSession {
    fn new(link: Link) -> Self {
        Self {
            link,
            target_running: false,
        }
    }

    fn reg_hex(&self, reg: &str) -> String {
        // Harmlessly inaccessible registers render as zero so clients do
        // not drop the connection.
        match self.link.read_reg(reg) {
            Ok(v) => hex::encode(v.to_le_bytes()),
            Err(_) => "00000000".to_owned(),
        }
    }

    /// Dispatches one packet; `None` means no reply (the `c` path).
    fn handle_packet(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(payload);
        if text.starts_with("qSupported") {
            return Some(b"PacketSize=1000;qXfer:features:read+".to_vec());
        }
        match text.as_ref() {
            "qXfer:features:read:target.xml:0,ffb" => {
                let mut reply = b"l".to_vec();
                reply.extend_from_slice(TARGET_XML.as_bytes());
                return Some(reply);
            }
            "?" => return Some(STOP_REPLY.to_vec()),
            "g" => {
                let mut reply = String::with_capacity(CORTEX_M_REGS.len() * 8);
                for reg in CORTEX_M_REGS {
                    reply.push_str(&self.reg_hex(reg));
                }
                return Some(reply.into_bytes());
            }
            "vCont?" => return Some(b"vCont;c;s;t".to_vec()),
            "D" => return Some(b"OK".to_vec()),
            _ => {}
        }

        if let Some(index) = text.strip_prefix('p') {
            return Some(match usize::from_str_radix(index, 16) {
                Ok(i) if i < CORTEX_M_REGS.len() => {
                    self.reg_hex(CORTEX_M_REGS[i]).into_bytes()
                }
                Ok(_) => b"00000000".to_vec(),
                Err(_) => b"E01".to_vec(),
            });
        }

        if let Some(args) = text.strip_prefix('m') {
            let reply = args
                .split_once(',')
                .and_then(|(a, l)| {
                    let addr = u32::from_str_radix(a, 16).ok()?;
                    let len = usize::from_str_radix(l, 16).ok()?;
                    self.link.read_mem(addr, len).ok()
                })
                .map(|data| hex::encode(data).into_bytes());
            return Some(reply.unwrap_or_else(|| b"E01".to_vec()));
        }

        if let Some(args) = text.strip_prefix('M') {
            let written = args.split_once(':').and_then(|(spec, data)| {
                let (a, l) = spec.split_once(',')?;
                let addr = u32::from_str_radix(a, 16).ok()?;
                let len = usize::from_str_radix(l, 16).ok()?;
                let bytes = hex::decode(data).ok()?;
                if bytes.len() != len {
                    return None;
                }
                self.link.write_mem(addr, &bytes).ok()
            });
            return Some(match written {
                Some(()) => b"OK".to_vec(),
                None => b"E01".to_vec(),
            });
        }

        if text.as_ref() == "c" || text.starts_with("vCont;c") {
            return match self.link.go() {
                Ok(()) => {
                    self.target_running = true;
                    None
                }
                Err(_) => Some(b"E01".to_vec()),
            };
        }

        if text.as_ref() == "s" || text.starts_with("vCont;s") {
            return Some(match self.link.step() {
                Ok(()) => STOP_REPLY.to_vec(),
                Err(_) => b"E01".to_vec(),
            });
        }

        // Anything else: a graceful empty "unknown".
        Some(Vec::new())
    }

    fn interrupt(&mut self) -> Vec<u8> {
        if let Err(e) = self.link.halt() {
            warn!(error = %e, "Halt on interrupt failed");
        }
        self.target_running = false;
        STOP_REPLY.to_vec()
    }

    /// While the target runs, watch for it stopping on its own.
    fn poll_stop(&mut self) -> Option<Vec<u8>> {
        if !self.target_running {
            return None;
        }
        match self.link.halted() {
            Ok(true) => {
                self.target_running = false;
                Some(STOP_REPLY.to_vec())
            }
            Ok(false) => None,
            Err(e) => {
                debug!(error = %e, "Halt poll failed while the target runs");
                None
            }
        }
    }
}

pub struct GdbServer {
    port: u16,
    join: Option<JoinHandle<()>>,
}

impl GdbServer {
    /// Binds on loopback and spawns the server thread.
    pub fn spawn(link: Link, port: u16, intr: Interruptor) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        debug!(port, "GDB server listening");

        let join = std::thread::Builder::new()
            .name("gdb-server".to_owned())
            .spawn(move || accept_loop(listener, link, intr))?;

        Ok(Self {
            port,
            join: Some(join),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for the server thread; callers set the interruptor first.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn accept_loop(listener: TcpListener, link: Link, intr: Interruptor) {
    while !intr.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "GDB client connected");
                if let Err(e) = serve_client(stream, link.clone(), &intr) {
                    debug!(error = %e, "GDB client connection ended");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "GDB accept failed");
                break;
            }
        }
    }
}

fn serve_client(mut stream: TcpStream, link: Link, intr: &Interruptor) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(RECV_TIMEOUT))?;

    let mut session = GdbSession::new(link);
    let mut polling = false;
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        // Drain out-of-band bytes and complete frames already buffered.
        let mut made_progress = true;
        while made_progress && !buf.is_empty() {
            made_progress = false;
            match buf[0] {
                0x03 => {
                    buf.remove(0);
                    let reply = session.interrupt();
                    stream.write_all(&encode_packet(&reply))?;
                    made_progress = true;
                }
                b'$' => {
                    if let Some((payload, ok, consumed)) = take_frame(&buf) {
                        buf.drain(..consumed);
                        if ok {
                            stream.write_all(b"+")?;
                            if let Some(reply) = session.handle_packet(&payload) {
                                stream.write_all(&encode_packet(&reply))?;
                            }
                        } else {
                            debug!("Rejecting a packet with a bad checksum");
                            stream.write_all(b"-")?;
                        }
                        made_progress = true;
                    }
                }
                _ => {
                    // Client acks and line noise.
                    buf.remove(0);
                    made_progress = true;
                }
            }
        }

        if intr.is_set() {
            return Ok(());
        }

        if let Some(reply) = session.poll_stop() {
            stream.write_all(&encode_packet(&reply))?;
        }

        // Short receive timeout while the target runs so stop events are
        // reported promptly.
        if session.target_running != polling {
            polling = session.target_running;
            let timeout = if polling { RUN_POLL } else { RECV_TIMEOUT };
            stream.set_read_timeout(Some(timeout))?;
        }

        match stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::testing::{mem_link, MemLink};
    use pretty_assertions::assert_eq;

    fn session_with_regs() -> GdbSession {
        let mut mem = MemLink::new(0x2000_0000, 256);
        for (i, reg) in CORTEX_M_REGS.iter().take(13).enumerate() {
            mem.regs.insert((*reg).to_owned(), i as u32 + 1);
        }
        mem.regs.insert("sp".to_owned(), 0x2000_1000);
        mem.regs.insert("lr".to_owned(), 0xFFFF_FFF9);
        mem.regs.insert("pc".to_owned(), 0x0800_0123);
        mem.regs.insert("xpsr".to_owned(), 0x0100_0000);
        GdbSession::new(mem_link(mem))
    }

    fn reply(session: &mut GdbSession, packet: &[u8]) -> Vec<u8> {
        session.handle_packet(packet).expect("a reply")
    }

    #[test]
    fn frame_checksum_round_trip() {
        for payload in [
            b"qSupported:xmlRegisters=i386".to_vec(),
            b"".to_vec(),
            vec![0x00, 0x01, 0xFE, 0xFF, b'A'],
        ] {
            let wire = encode_packet(&payload);
            let (decoded, ok, consumed) = take_frame(&wire).expect("complete frame");
            assert!(ok, "checksum must verify");
            assert_eq!(decoded, payload);
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn malformed_checksum_is_rejected() {
        let mut wire = encode_packet(b"g");
        let last = wire.len() - 1;
        wire[last] = wire[last].wrapping_add(1);
        let (_, ok, consumed) = take_frame(&wire).expect("complete frame");
        assert!(!ok);
        assert_eq!(consumed, wire.len());
        // Incomplete frames wait for more bytes.
        assert!(take_frame(b"$g#6").is_none());
        assert!(take_frame(b"$g").is_none());
    }

    #[test]
    fn supported_and_features_queries() {
        let mut session = session_with_regs();
        assert_eq!(
            reply(&mut session, b"qSupported:multiprocess+"),
            b"PacketSize=1000;qXfer:features:read+".to_vec()
        );
        let features = reply(&mut session, b"qXfer:features:read:target.xml:0,ffb");
        assert!(features.starts_with(b"l<?xml"));
        assert!(String::from_utf8(features)
            .unwrap()
            .contains("<architecture>arm</architecture>"));
        assert_eq!(reply(&mut session, b"?"), b"S05".to_vec());
        assert_eq!(reply(&mut session, b"vCont?"), b"vCont;c;s;t".to_vec());
        assert_eq!(reply(&mut session, b"D"), b"OK".to_vec());
    }

    // Scenario S5: the g packet concatenates all 17 registers as
    // little-endian hex words.
    #[test]
    fn g_packet_renders_all_registers() {
        let mut session = session_with_regs();
        let mut expected = String::new();
        for v in 1..=13u32 {
            expected.push_str(&hex::encode(v.to_le_bytes()));
        }
        expected.push_str("00100020"); // sp
        expected.push_str("f9ffffff"); // lr
        expected.push_str("23010008"); // pc
        expected.push_str("00000001"); // xpsr
        assert_eq!(reply(&mut session, b"g"), expected.into_bytes());
    }

    #[test]
    fn single_register_reads() {
        let mut session = session_with_regs();
        assert_eq!(reply(&mut session, b"p0"), b"01000000".to_vec());
        assert_eq!(reply(&mut session, b"pf"), b"23010008".to_vec());
        assert_eq!(reply(&mut session, b"p10"), b"00000001".to_vec());
        // Out of profile: zeros, not an error.
        assert_eq!(reply(&mut session, b"p7f"), b"00000000".to_vec());
        assert_eq!(reply(&mut session, b"pzz"), b"E01".to_vec());
    }

    #[test]
    fn memory_read_write_round_trip() {
        let mut session = session_with_regs();
        assert_eq!(
            reply(&mut session, b"M20000010,4:deadbeef"),
            b"OK".to_vec()
        );
        assert_eq!(reply(&mut session, b"m20000010,4"), b"deadbeef".to_vec());
        // Length/data mismatch and bad hex are protocol errors.
        assert_eq!(reply(&mut session, b"M20000010,4:dead"), b"E01".to_vec());
        assert_eq!(reply(&mut session, b"M20000010,zz:00"), b"E01".to_vec());
        // A faulting write (outside the RAM window) is E01 too.
        assert_eq!(reply(&mut session, b"M00000000,1:00"), b"E01".to_vec());
    }

    #[test]
    fn unknown_packets_get_an_empty_reply() {
        let mut session = session_with_regs();
        assert_eq!(reply(&mut session, b"Zmagic"), Vec::<u8>::new());
        assert_eq!(reply(&mut session, b"qAttached"), Vec::<u8>::new());
    }

    #[test]
    fn continue_defers_the_stop_reply() {
        let mut session = session_with_regs();
        assert_eq!(session.handle_packet(b"c"), None);
        assert!(session.target_running);
        // Still running: nothing to report yet.
        assert_eq!(session.poll_stop(), None);
        // The target halts on its own; the poll reports it once.
        session.link.halt().unwrap();
        assert_eq!(session.poll_stop(), Some(b"S05".to_vec()));
        assert!(!session.target_running);
        assert_eq!(session.poll_stop(), None);
    }

    #[test]
    fn step_and_interrupt_report_sigtrap() {
        let mut session = session_with_regs();
        assert_eq!(reply(&mut session, b"s"), b"S05".to_vec());
        assert_eq!(session.handle_packet(b"vCont;c"), None);
        assert_eq!(session.interrupt(), b"S05".to_vec());
        assert!(!session.target_running);
    }
}
