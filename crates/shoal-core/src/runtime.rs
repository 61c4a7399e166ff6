//! Async runtime abstraction.
//!
//! The controller spawns member start/stop effectors and periodic feeds
//! through this trait rather than calling tokio directly, so a deterministic
//! executor can be swapped in without touching business logic.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Handle to a spawned task
pub type JoinHandle<T> = Pin<Box<dyn Future<Output = std::result::Result<T, JoinError>> + Send + Sync>>;

/// Error from joining a spawned task
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("task panicked")]
    Panicked,
    #[error("task cancelled")]
    Cancelled,
}

/// Instant in time, real or virtual
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant {
    /// Milliseconds since the (possibly virtual) epoch
    pub millis: u64,
}

impl Instant {
    pub fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Duration elapsed between this instant and `now`
    pub fn elapsed(&self, now: Instant) -> Duration {
        assert!(now.millis >= self.millis, "now must be >= self for elapsed");
        Duration::from_millis(now.millis - self.millis)
    }
}

/// Runtime abstraction trait.
///
/// Not dyn-safe (spawn is generic); components that need it are generic over
/// a `RT: Runtime` parameter instead.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync + Clone {
    /// Current instant
    fn now(&self) -> Instant;

    /// Sleep for a duration (capped at one hour as a safety limit)
    async fn sleep(&self, duration: Duration);

    /// Yield control to the scheduler
    async fn yield_now(&self);

    /// Spawn a task that runs concurrently with the caller
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

/// Production runtime backed by tokio
#[derive(Debug, Clone, Default)]
pub struct TokioRuntime;

#[async_trait::async_trait]
impl Runtime for TokioRuntime {
    fn now(&self) -> Instant {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        Instant::from_millis(since_epoch.as_millis() as u64)
    }

    async fn sleep(&self, duration: Duration) {
        assert!(
            duration < Duration::from_secs(3600),
            "sleep duration too long (>1 hour)"
        );
        tokio::time::sleep(duration).await;
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        Box::pin(async move {
            handle.await.map_err(|e| {
                if e.is_panic() {
                    JoinError::Panicked
                } else {
                    JoinError::Cancelled
                }
            })
        })
    }
}
