//! Platform-wide limits and defaults.
//!
//! All limits are explicit, named most-significant-part first, and carry
//! their unit in the name.

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum length of a member identifier in bytes
pub const MEMBER_ID_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a location identifier in bytes
pub const LOCATION_ID_LENGTH_BYTES_MAX: usize = 128;

// =============================================================================
// Cluster Limits
// =============================================================================

/// Maximum number of members a single cluster will manage
pub const CLUSTER_MEMBERS_COUNT_MAX: usize = 10_000;

/// Maximum number of availability zones per cluster location
pub const CLUSTER_ZONES_COUNT_MAX: usize = 64;

// =============================================================================
// Timing Defaults
// =============================================================================

/// Default period between health-aggregation polls (5 sec)
pub const HEALTH_POLL_INTERVAL_MS_DEFAULT: u64 = 5 * 1000;

/// Minimum health-aggregation poll period
pub const HEALTH_POLL_INTERVAL_MS_MIN: u64 = 10;

/// Default timeout for stopping a single member (30 sec)
pub const MEMBER_STOP_TIMEOUT_MS_DEFAULT: u64 = 30 * 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(CLUSTER_MEMBERS_COUNT_MAX >= 1);
    assert!(CLUSTER_ZONES_COUNT_MAX >= 1);
    assert!(HEALTH_POLL_INTERVAL_MS_DEFAULT >= HEALTH_POLL_INTERVAL_MS_MIN);
    assert!(MEMBER_ID_LENGTH_BYTES_MAX >= 32);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_within_bounds() {
        assert!(HEALTH_POLL_INTERVAL_MS_DEFAULT >= HEALTH_POLL_INTERVAL_MS_MIN);
        assert!(MEMBER_STOP_TIMEOUT_MS_DEFAULT > 0);
    }
}
