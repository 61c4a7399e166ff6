//! Shoal Core
//!
//! Core abstractions for the shoal application-management platform:
//! explicit limits, cross-cutting error types, and the I/O and runtime
//! seams that keep the control-loop crates deterministic under test.

pub mod constants;
pub mod error;
pub mod io;
pub mod runtime;
pub mod telemetry;

pub use constants::*;
pub use error::{Error, Result};
pub use io::{IoContext, RngProvider, StdRngProvider, TimeProvider, WallClockTime};
pub use runtime::{Instant, JoinError, JoinHandle, Runtime, TokioRuntime};
pub use telemetry::{init_telemetry, try_init_telemetry, TelemetryConfig};
