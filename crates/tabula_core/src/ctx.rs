use crate::errors::{Result, TabulaError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation handle threaded through every traversal that may touch the
/// chunk store. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct Ctx {
    cancelled: Arc<AtomicBool>,
}

impl Ctx {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.cancelled.store(true, Ordering::Release); }

    pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(TabulaError::Cancelled) } else { Ok(()) }
    }
}
