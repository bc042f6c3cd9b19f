//! Passive AGDI memory-image receiver.
//!
//! An external proxy (typically an AGDI driver loaded into the primary
//! IDE) pushes memory images to us over loopback TCP. Each frame is an
//! 8-byte little-endian header `(u32 addr, u32 size)` followed by `size`
//! payload bytes. Received images land in a cache that `Link::read_mem`
//! consults before touching the probe. The channel is read-only.

use crate::interruptor::Interruptor;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_AGDI_PORT: u16 = 9999;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const FRAME_TIMEOUT: Duration = Duration::from_secs(1);
/// Reject absurd frame sizes before allocating for them.
const MAX_IMAGE_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct AgdiCache {
    images: Arc<Mutex<BTreeMap<u32, Vec<u8>>>>,
}

impl AgdiCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached bytes when one received image fully covers
    /// `[addr, addr + len)`.
    pub fn lookup(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        for (&start, data) in images.range(..=addr).rev() {
            let end = start as u64 + data.len() as u64;
            if addr as u64 + len as u64 <= end {
                let off = (addr - start) as usize;
                return Some(data[off..off + len].to_vec());
            }
        }
        None
    }

    fn insert(&self, addr: u32, data: Vec<u8>) {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.insert(addr, data);
    }
}

pub struct AgdiReceiver {
    cache: AgdiCache,
    join: Option<JoinHandle<()>>,
}

impl AgdiReceiver {
    /// Binds the receiver on loopback and spawns its accept thread.
    pub fn spawn(port: u16, intr: Interruptor) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let cache = AgdiCache::new();
        debug!(port, "AGDI receiver listening");

        let thread_cache = cache.clone();
        let join = std::thread::Builder::new()
            .name("agdi-receiver".to_owned())
            .spawn(move || accept_loop(listener, thread_cache, intr))?;

        Ok(Self {
            cache,
            join: Some(join),
        })
    }

    pub fn cache(&self) -> AgdiCache {
        self.cache.clone()
    }

    /// Waits for the accept thread; callers set the interruptor first.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn accept_loop(listener: TcpListener, cache: AgdiCache, intr: Interruptor) {
    while !intr.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "AGDI proxy connected");
                if let Err(e) = serve_proxy(stream, &cache, &intr) {
                    debug!(error = %e, "AGDI proxy connection ended");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "AGDI accept failed");
                break;
            }
        }
    }
}

fn serve_proxy(stream: TcpStream, cache: &AgdiCache, intr: &Interruptor) -> io::Result<()> {
    let mut stream = stream;
    stream.set_read_timeout(Some(FRAME_TIMEOUT))?;
    loop {
        if intr.is_set() {
            return Ok(());
        }
        let mut header = [0u8; 8];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let addr = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if size == 0 || size > MAX_IMAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("AGDI frame size {size} is out of range"),
            ));
        }
        let mut data = vec![0u8; size as usize];
        stream.read_exact(&mut data)?;
        debug!(
            addr = format_args!("{addr:#010X}"),
            size, "Cached AGDI memory image"
        );
        cache.insert(addr, data);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn lookup_requires_full_coverage() {
        let cache = AgdiCache::new();
        cache.insert(0x2000_0000, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(cache.lookup(0x2000_0000, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(cache.lookup(0x2000_0004, 4), Some(vec![5, 6, 7, 8]));
        assert_eq!(cache.lookup(0x2000_0006, 4), None);
        assert_eq!(cache.lookup(0x1FFF_FFFF, 2), None);
        assert_eq!(cache.lookup(0x3000_0000, 1), None);
    }

    #[test]
    fn later_images_shadow_earlier_ones() {
        let cache = AgdiCache::new();
        cache.insert(0x2000_0000, vec![0xAA; 16]);
        cache.insert(0x2000_0000, vec![0xBB; 8]);
        assert_eq!(cache.lookup(0x2000_0002, 2), Some(vec![0xBB, 0xBB]));
    }

    #[test]
    fn receives_framed_images_over_tcp() {
        let intr = Interruptor::new();
        // Port 0 lets the OS pick; recover it from the receiver's socket.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let receiver = AgdiReceiver::spawn(port, intr.clone()).unwrap();
        let cache = receiver.cache();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x2000_1000u32.to_le_bytes());
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        stream.write_all(&frame).unwrap();
        stream.flush().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(data) = cache.lookup(0x2000_1000, 4) {
                assert_eq!(data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "image never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }

        drop(stream);
        intr.set();
        receiver.join();
    }
}
