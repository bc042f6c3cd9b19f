//! Shared-probe arbitration.
//!
//! When a primary IDE co-owns the physical probe it may rewrite the DP
//! SELECT register between any two of our transactions, silently routing
//! our MEM-AP cycles to the wrong AP or bank. The arbitrator drops the
//! driver's cached routing state before every transaction in shared mode
//! and inserts politeness yields so the IDE keeps most of the bus.

use crate::link::LinkDriver;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitrator {
    shared: bool,
}

impl Arbitrator {
    /// Yield after draining a ring.
    pub const RING_YIELD: Duration = Duration::from_millis(5);
    /// Yield between per-variable reads.
    pub const VAR_YIELD: Duration = Duration::from_millis(2);

    pub fn new(shared: bool) -> Self {
        Self { shared }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Invalidate the probe's cached DP SELECT/CSW so the next bus cycle
    /// re-asserts them from scratch.
    pub fn before_xact(&self, driver: &mut dyn LinkDriver) {
        if self.shared {
            driver.invalidate_cache();
        }
    }

    /// Optionally yield the bus after a transaction. Single transactions
    /// pass no hint; burst call sites (a ring drain, a variable round)
    /// pass their politeness pause, which is slept only in shared mode.
    pub fn after_xact(&self, yield_hint: Option<Duration>) {
        match yield_hint {
            Some(pause) if self.shared => std::thread::sleep(pause),
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::testing::MemLink;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    #[test]
    fn cache_invalidation_only_in_shared_mode() {
        let mut mem = MemLink::new(0x2000_0000, 16);

        let owned = Arbitrator::new(false);
        assert!(!owned.is_shared());
        owned.before_xact(&mut mem);
        owned.before_xact(&mut mem);
        assert_eq!(mem.invalidations, 0);

        let shared = Arbitrator::new(true);
        assert!(shared.is_shared());
        shared.before_xact(&mut mem);
        shared.before_xact(&mut mem);
        assert_eq!(mem.invalidations, 2);
    }

    #[test]
    fn yields_require_shared_mode_and_a_hint() {
        let pause = Duration::from_millis(50);

        let start = Instant::now();
        Arbitrator::new(false).after_xact(Some(pause));
        Arbitrator::new(true).after_xact(None);
        Arbitrator::new(false).after_xact(None);
        assert!(
            start.elapsed() < pause,
            "owned-mode and hintless calls must not sleep"
        );

        let start = Instant::now();
        Arbitrator::new(true).after_xact(Some(pause));
        assert!(start.elapsed() >= pause);
    }
}
