use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Cooperative cancellation signal shared between a caller and a running read.
///
/// Cloning yields a handle to the same signal. Child tokens are cancelled with
/// their parent but can also be cancelled on their own.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    /// Creates an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers cancellation and wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once [`cancel`](Self::cancel) has been called on this token or a parent.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes when the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }

    /// Token cancelled together with `self`; cancelling it leaves `self` untouched.
    pub fn child_token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.child_token(),
        }
    }
}

impl From<CancellationToken> for CancelToken {
    fn from(inner: CancellationToken) -> Self {
        Self { inner }
    }
}
