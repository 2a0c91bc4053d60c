use super::cancel::CancelToken;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide cap on concurrent outstanding requests to one provider.
///
/// Cloning shares the same permit pool. A permit is released when it is dropped.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(name: impl Into<String>, permits: usize) -> Self {
        let capacity = permits.max(1);
        Self {
            name: Arc::from(name.into()),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for a permit. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancelToken) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore.clone();
        // the semaphore is never closed, so acquire_owned only fails on cancellation
        cancel
            .run_until_cancelled(semaphore.acquire_owned())
            .await
            .and_then(Result::ok)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_bounded_and_released() {
        let limiter = ConcurrencyLimiter::new("test", 2);
        let cancel = CancelToken::new();

        let a = limiter.acquire(&cancel).await.unwrap();
        let _b = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.in_use(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), limiter.acquire(&cancel)).await;
        assert!(blocked.is_err(), "third acquire should wait");

        drop(a);
        assert_eq!(limiter.available(), 1);
        assert!(limiter.acquire(&cancel).await.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_none() {
        let limiter = ConcurrencyLimiter::new("test", 1);
        let _held = limiter.acquire(&CancelToken::new()).await.unwrap();

        let cancel = CancelToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let permit = waiter.await.unwrap();
        assert!(permit.is_none());
        assert_eq!(limiter.available(), 0);
    }

    #[test]
    fn test_zero_permits_clamped() {
        let limiter = ConcurrencyLimiter::new("test", 0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.name(), "test");
    }
}
