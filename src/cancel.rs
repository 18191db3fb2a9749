//! Run-wide cancellation.
//!
//! A single token is created by the CLI entry point (wired to SIGINT/
//! SIGTERM) and cloned into every supervisor and worker. Workers check it
//! between tasks and race in-flight database I/O against it; there is no
//! global signal disposition anywhere else in the tree.

use tokio::sync::watch;

/// Cloneable cancellation token.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

/// The sending half, held by the entry point.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Create a token pair.
pub fn cancel_pair() -> (CancelSource, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, Cancel { rx })
}

impl CancelSource {
    /// Request cancellation. All clones of the token observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Cancel {
    /// Non-blocking check, used between tasks.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Used to race in-flight I/O:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     res = copy_one_table(..) => res,
    ///     _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling: park forever, the
                // racing future wins.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that never fires, for phase commands that manage their own
    /// lifetime (tests use this too).
    pub fn never() -> Cancel {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        Cancel { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_observed_by_clones() {
        let (src, token) = cancel_pair();
        let other = token.clone();
        assert!(!token.is_cancelled());
        src.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
        // cancelled() resolves immediately once set
        other.cancelled().await;
    }

    #[tokio::test]
    async fn test_never_token_does_not_fire() {
        let token = Cancel::never();
        assert!(!token.is_cancelled());
        let raced = tokio::select! {
            _ = token.cancelled() => "cancelled",
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => "timeout",
        };
        assert_eq!(raced, "timeout");
    }
}
