//! Close-once guard shared between a listener and the handles it gives out

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Owns a socket that several handles may close.
///
/// The first `close` signals shutdown, waits for in-flight users to let go and
/// drops the socket. Every later `close`, from any handle, is a no-op.
/// In-flight operations must race their I/O against [`closed`](Self::closed).
pub(crate) struct CloseOnce<T> {
    resource: RwLock<Option<T>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<T> CloseOnce<T> {
    pub(crate) fn new(resource: T) -> Self {
        Self {
            resource: RwLock::new(Some(resource)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow the socket, or `Error::Closed` once shutdown has begun
    pub(crate) async fn acquire(&self) -> Result<RwLockReadGuard<'_, T>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let slot = self.resource.read().await;
        RwLockReadGuard::try_map(slot, |slot| slot.as_ref()).map_err(|_| Error::Closed)
    }

    /// Resolves once shutdown has been signalled
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the socket. Returns `true` only for the call that actually closed it.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shutdown.cancel();
        let released = self.resource.write().await.take();
        drop(released);
        true
    }
}

impl<T> std::fmt::Debug for CloseOnce<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseOnce")
            .field("closed", &self.is_closed())
            .finish()
    }
}
