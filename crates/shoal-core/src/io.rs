//! I/O abstraction layer.
//!
//! All non-deterministic inputs (wall clock, randomness) go through these
//! traits so that business logic can run unchanged against injected
//! deterministic implementations in tests. Code that needs the current time
//! must never call `SystemTime::now()` directly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Time Provider
// ============================================================================

/// Clock abstraction.
///
/// Implementations:
/// - [`WallClockTime`]: production, system clock
/// - `MockClock` (in shoal-cluster, next to the in-memory entity manager):
///   manually advanced, for tests
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;

    /// Sleep for the given number of milliseconds.
    ///
    /// Production implementations actually sleep; test clocks may advance
    /// virtual time and return immediately.
    async fn sleep_ms(&self, ms: u64);
}

/// Production time provider backed by the system clock
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

// ============================================================================
// RNG Provider
// ============================================================================

/// Random number source abstraction.
///
/// Not cryptographically secure; used for identifier suffixes and jitter only.
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random u64 in `[min, max)`
    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        min + (self.next_u64() % (max - min))
    }
}

/// Production RNG using a lock-free xorshift64* generator
#[derive(Debug)]
pub struct StdRngProvider {
    state: AtomicU64,
}

impl Default for StdRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRngProvider {
    /// Create a provider seeded from the system clock
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        Self {
            state: AtomicU64::new(seed | 1),
        }
    }

    /// Create a provider with a fixed seed (for tests)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed | 1),
        }
    }
}

impl RngProvider for StdRngProvider {
    fn next_u64(&self) -> u64 {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;

            match self
                .state
                .compare_exchange_weak(state, x, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return x.wrapping_mul(0x2545F4914F6CDD1D),
                Err(s) => state = s,
            }
        }
    }
}

// ============================================================================
// I/O Context
// ============================================================================

/// Bundle of I/O providers, passed through the application instead of
/// individual providers.
#[derive(Clone, Debug)]
pub struct IoContext {
    /// Time provider
    pub time: Arc<dyn TimeProvider>,
    /// RNG provider
    pub rng: Arc<dyn RngProvider>,
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Production context: wall clock and system-seeded RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClockTime::new()),
            rng: Arc::new(StdRngProvider::new()),
        }
    }

    /// Context with custom providers
    pub fn new(time: Arc<dyn TimeProvider>, rng: Arc<dyn RngProvider>) -> Self {
        Self { time, rng }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }
}
