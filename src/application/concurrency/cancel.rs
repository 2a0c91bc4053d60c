use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cooperative cancellation signal shared by every stage of a request.
///
/// A token is cancelled when `cancel()` is called on it, when its deadline
/// passes, or when its parent is cancelled. Cancelling a child never affects
/// the parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), None)
    }

    /// Token cancelled together with `self`, but cancellable on its own
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), Some(self.clone()))
    }

    fn build(deadline: Option<Instant>, parent: Option<CancelToken>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                deadline,
                parent,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.inner.tx.borrow() {
            return true;
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }

    /// Resolves once the token is cancelled. Resolves immediately if it already is.
    pub fn cancelled(&self) -> BoxFuture<'static, ()> {
        let token = self.clone();
        Box::pin(async move {
            let mut rx = token.inner.tx.subscribe();
            let own = async move {
                // the sender lives as long as `token`, so this only returns on cancel
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            };
            let deadline = async {
                match token.inner.deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let parent = async {
                match &token.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = own => {}
                _ = deadline => {}
                _ = parent => {}
            }
        })
    }

    /// Drives `fut` unless the token fires first, in which case `None` is returned
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Cancels the token when the returned guard is dropped
    pub fn drop_guard(&self) -> CancelGuard {
        CancelGuard {
            token: Some(self.clone()),
        }
    }
}

/// Cancels its token on drop unless disarmed
pub struct CancelGuard {
    token: Option<CancelToken>,
}

impl CancelGuard {
    pub fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_follows_parent_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), sibling.cancelled())
            .await
            .expect("child should observe parent cancellation");
    }

    #[tokio::test]
    async fn test_deadline_cancels() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("deadline should fire");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = CancelToken::new();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Some(7));

        let slow = token.run_until_cancelled(tokio::time::sleep(Duration::from_secs(10)));
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        };
        let (result, _) = tokio::join!(slow, canceller);
        assert!(result.is_none());
    }

    #[test]
    fn test_drop_guard() {
        let token = CancelToken::new();
        drop(token.drop_guard());
        assert!(token.is_cancelled());

        let token = CancelToken::new();
        token.drop_guard().disarm();
        assert!(!token.is_cancelled());
    }
}
