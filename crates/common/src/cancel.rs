use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, RillError};

/// Cooperative cancellation handle propagated from the root query context
/// to every operator and source.
///
/// Cloning shares the underlying flag. Operators poll [`CancelToken::check`]
/// at every suspension point: channel reads, backpressured writes, source
/// I/O between rows or batches, and watermark waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. All clones observe the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(RillError::Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RillError::Cancelled)
        } else {
            Ok(())
        }
    }
}
