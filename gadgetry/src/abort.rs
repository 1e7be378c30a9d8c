//! Hierarchical cooperative cancellation.
//!
//! The agent loop owns a root [`AbortSignal`]; every gadget execution gets a
//! linked child via [`AbortSignal::child`]. Cancelling the parent cancels
//! every child (the reason propagates), while a child can be aborted on its
//! own — the per-gadget timeout aborts only that gadget's signal.
//!
//! Abort is cooperative: a gadget observing its signal is expected to clean
//! up and return promptly. Nothing is forcibly torn down.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Default reason reported when an abort carries no explicit reason.
pub const REASON_ABORTED: &str = "aborted";

/// Reason used when a gadget's deadline expires.
pub const REASON_TIMEOUT: &str = "timeout";

/// A cancellation signal that can be linked into a hierarchy.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
    parent: Option<Arc<AbortSignal>>,
}

impl AbortSignal {
    /// Create a new root signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child signal: it is cancelled when `self` is cancelled
    /// (inheriting the reason), and can also be aborted independently.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Abort the signal with a reason. The first reason wins; later calls
    /// are no-ops.
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    /// Returns `true` once this signal (or an ancestor) has been aborted.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The abort reason, walking up to the nearest ancestor that set one.
    /// Returns [`REASON_ABORTED`] when aborted without an explicit reason,
    /// `None` when not aborted at all.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        if !self.aborted() {
            return None;
        }
        let mut current = Some(self);
        while let Some(signal) = current {
            if let Some(reason) = signal.reason.get() {
                return Some(reason.clone());
            }
            current = signal.parent.as_deref();
        }
        Some(REASON_ABORTED.to_string())
    }

    /// Completes when the signal is aborted. Safe to await from multiple
    /// places; completes immediately if already aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_abort_and_reason() {
        let root = AbortSignal::new();
        let child = root.child();
        assert!(!child.aborted());

        root.abort("user interrupt");
        assert!(child.aborted());
        assert_eq!(child.reason().as_deref(), Some("user interrupt"));
    }

    #[test]
    fn child_abort_does_not_touch_parent() {
        let root = AbortSignal::new();
        let child = root.child();

        child.abort(REASON_TIMEOUT);
        assert!(child.aborted());
        assert!(!root.aborted());
        assert_eq!(child.reason().as_deref(), Some(REASON_TIMEOUT));
        assert_eq!(root.reason(), None);
    }

    #[test]
    fn own_reason_shadows_parent_reason() {
        let root = AbortSignal::new();
        let child = root.child();
        child.abort("local");
        root.abort("global");
        assert_eq!(child.reason().as_deref(), Some("local"));
    }

    #[test]
    fn first_reason_wins() {
        let signal = AbortSignal::new();
        signal.abort("first");
        signal.abort("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn cancelled_completes_on_abort() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        signal.abort(REASON_ABORTED);
        handle.await.unwrap();
    }
}
