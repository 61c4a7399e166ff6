//! Zone failure detection.

use crate::entity::MemberId;
use crate::error::ClusterError;
use crate::location::{Location, LocationId};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Number of consecutive start failures before a zone is classified failed
pub const ZONE_FAILURE_THRESHOLD_DEFAULT: u32 = 2;

/// Tracks per-zone start outcomes and classifies zones as failed.
///
/// The controller records every member-start outcome here and filters zones
/// through [`ZoneFailureDetector::has_failed`] before each placement pass.
pub trait ZoneFailureDetector: Send + Sync {
    /// Record a successful member start in the zone
    fn on_startup_success(&self, location: &Location, member_id: &MemberId);

    /// Record a failed member start in the zone
    fn on_startup_failure(&self, location: &Location, member_id: &MemberId, error: &ClusterError);

    /// Whether the zone is currently classified failed
    fn has_failed(&self, location: &Location) -> bool;
}

/// Per-zone outcome counters
#[derive(Debug, Clone, Copy, Default)]
struct ZoneRecord {
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
}

/// Default detector: a zone fails after a run of consecutive start failures
/// and recovers on the next success.
#[derive(Debug)]
pub struct ConsecutiveFailuresDetector {
    threshold: u32,
    records: Mutex<HashMap<LocationId, ZoneRecord>>,
}

impl Default for ConsecutiveFailuresDetector {
    fn default() -> Self {
        Self::new(ZONE_FAILURE_THRESHOLD_DEFAULT)
    }
}

impl ConsecutiveFailuresDetector {
    /// Create a detector with the given consecutive-failure threshold
    pub fn new(threshold: u32) -> Self {
        assert!(threshold > 0, "threshold must be positive");
        Self {
            threshold,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn with_record<R>(&self, location: &Location, f: impl FnOnce(&mut ZoneRecord) -> R) -> R {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(records.entry(location.id().clone()).or_default())
    }
}

impl ZoneFailureDetector for ConsecutiveFailuresDetector {
    fn on_startup_success(&self, location: &Location, member_id: &MemberId) {
        self.with_record(location, |record| {
            record.consecutive_failures = 0;
            record.total_successes += 1;
        });
        debug!(zone = %location.id(), member = %member_id, "member start succeeded");
    }

    fn on_startup_failure(&self, location: &Location, member_id: &MemberId, error: &ClusterError) {
        let streak = self.with_record(location, |record| {
            record.consecutive_failures += 1;
            record.total_failures += 1;
            record.consecutive_failures
        });
        debug!(
            zone = %location.id(),
            member = %member_id,
            streak,
            error = %error,
            "member start failed"
        );
    }

    fn has_failed(&self, location: &Location) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(location.id())
            .map(|record| record.consecutive_failures >= self.threshold)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str) -> Location {
        Location::new(LocationId::new(id).unwrap())
    }

    fn member_id(n: u32) -> MemberId {
        MemberId::new(format!("m-{}", n)).unwrap()
    }

    fn failure() -> ClusterError {
        ClusterError::entity("m", "start failed")
    }

    #[test]
    fn test_unknown_zone_is_healthy() {
        let detector = ConsecutiveFailuresDetector::default();
        assert!(!detector.has_failed(&zone("zone-a")));
    }

    #[test]
    fn test_fails_after_consecutive_failures() {
        let detector = ConsecutiveFailuresDetector::new(2);
        let za = zone("zone-a");

        detector.on_startup_failure(&za, &member_id(1), &failure());
        assert!(!detector.has_failed(&za));

        detector.on_startup_failure(&za, &member_id(2), &failure());
        assert!(detector.has_failed(&za));
    }

    #[test]
    fn test_success_resets_the_streak() {
        let detector = ConsecutiveFailuresDetector::new(2);
        let za = zone("zone-a");

        detector.on_startup_failure(&za, &member_id(1), &failure());
        detector.on_startup_success(&za, &member_id(2));
        detector.on_startup_failure(&za, &member_id(3), &failure());
        assert!(!detector.has_failed(&za));
    }

    #[test]
    fn test_zones_are_tracked_independently() {
        let detector = ConsecutiveFailuresDetector::new(1);
        let za = zone("zone-a");
        let zb = zone("zone-b");

        detector.on_startup_failure(&za, &member_id(1), &failure());
        assert!(detector.has_failed(&za));
        assert!(!detector.has_failed(&zb));
    }
}
