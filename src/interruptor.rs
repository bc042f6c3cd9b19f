use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

/// Cooperative shutdown flag shared between the poll scheduler,
/// the bridge threads, and the signal handler.
#[derive(Clone, Debug, Default)]
pub struct Interruptor(Arc<AtomicBool>);

impl Interruptor {
    pub fn new() -> Self {
        Interruptor(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(SeqCst)
    }
}
