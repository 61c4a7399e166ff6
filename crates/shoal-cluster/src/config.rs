//! Cluster configuration.

use crate::entity::{CreateFlags, MemberFactory, MemberSpec};
use crate::health::QuorumCheck;
use crate::registry;
use shoal_core::constants::{HEALTH_POLL_INTERVAL_MS_DEFAULT, HEALTH_POLL_INTERVAL_MS_MIN};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one dynamic cluster.
#[derive(Clone)]
pub struct ClusterConfig {
    /// Number of members to create when the cluster starts
    pub initial_size: usize,
    /// Minimum members required for start to succeed; negative means
    /// "same as initial_size"
    pub initial_quorum_size: i64,
    /// Quorum predicate for the cluster's `service_up` sensor; `None` picks
    /// a default based on `initial_size`
    pub up_quorum_check: Option<QuorumCheck>,
    /// Spec members are minted from
    pub member_spec: Option<MemberSpec>,
    /// Spec used for the very first member only
    pub first_member_spec: Option<MemberSpec>,
    /// Legacy construction hook, consulted when no spec is configured
    pub member_factory: Option<Arc<dyn MemberFactory>>,
    /// Registered name of the removal strategy
    pub removal_strategy: String,
    /// Registered name of the zone placement strategy
    pub zone_placement_strategy: String,
    /// Registered name of the zone failure detector
    pub zone_failure_detector: String,
    /// Whether to spread members across availability zones
    pub enable_availability_zones: bool,
    /// Restrict zone mode to these zone names (empty = no restriction)
    pub availability_zone_names: Vec<String>,
    /// Restrict zone mode to this many zones
    pub num_availability_zones: Option<usize>,
    /// Whether members that fail to start are quarantined (or discarded)
    pub quarantine_failed_entities: bool,
    /// Flags applied to every minted member, overridable per call
    pub custom_child_flags: CreateFlags,
    /// Period of the health-aggregation poll
    pub health_poll_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            initial_size: 1,
            initial_quorum_size: -1,
            up_quorum_check: None,
            member_spec: None,
            first_member_spec: None,
            member_factory: None,
            removal_strategy: registry::REMOVAL_NEWEST_FIRST.to_string(),
            zone_placement_strategy: registry::PLACEMENT_BALANCED.to_string(),
            zone_failure_detector: registry::DETECTOR_CONSECUTIVE_FAILURES.to_string(),
            enable_availability_zones: false,
            availability_zone_names: Vec::new(),
            num_availability_zones: None,
            quarantine_failed_entities: true,
            custom_child_flags: CreateFlags::new(),
            health_poll_interval_ms: HEALTH_POLL_INTERVAL_MS_DEFAULT,
        }
    }
}

impl ClusterConfig {
    pub fn new(initial_size: usize) -> Self {
        Self {
            initial_size,
            ..Default::default()
        }
    }

    pub fn with_member_spec(mut self, spec: MemberSpec) -> Self {
        self.member_spec = Some(spec);
        self
    }

    pub fn with_first_member_spec(mut self, spec: MemberSpec) -> Self {
        self.first_member_spec = Some(spec);
        self
    }

    pub fn with_initial_quorum_size(mut self, quorum: i64) -> Self {
        self.initial_quorum_size = quorum;
        self
    }

    pub fn with_up_quorum_check(mut self, check: QuorumCheck) -> Self {
        self.up_quorum_check = Some(check);
        self
    }

    pub fn with_availability_zones(mut self) -> Self {
        self.enable_availability_zones = true;
        self
    }

    pub fn with_zone_names(mut self, names: Vec<String>) -> Self {
        self.availability_zone_names = names;
        self.enable_availability_zones = true;
        self
    }

    pub fn with_num_zones(mut self, count: usize) -> Self {
        self.num_availability_zones = Some(count);
        self.enable_availability_zones = true;
        self
    }

    pub fn without_quarantine(mut self) -> Self {
        self.quarantine_failed_entities = false;
        self
    }

    pub fn with_removal_strategy(mut self, name: impl Into<String>) -> Self {
        self.removal_strategy = name.into();
        self
    }

    pub fn with_child_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_child_flags.insert(key.into(), value.into());
        self
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.health_poll_interval_ms < HEALTH_POLL_INTERVAL_MS_MIN {
            return Err(format!(
                "health poll interval must be at least {}ms",
                HEALTH_POLL_INTERVAL_MS_MIN
            ));
        }
        if self.num_availability_zones == Some(0) {
            return Err("num_availability_zones must be greater than zero".into());
        }
        Ok(())
    }

    /// Configuration for tests: tiny cluster, fast health polls
    pub fn for_testing(initial_size: usize) -> Self {
        Self {
            initial_size,
            member_spec: Some(MemberSpec::new("member")),
            health_poll_interval_ms: 20,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("initial_size", &self.initial_size)
            .field("initial_quorum_size", &self.initial_quorum_size)
            .field("up_quorum_check", &self.up_quorum_check)
            .field("removal_strategy", &self.removal_strategy)
            .field("zone_placement_strategy", &self.zone_placement_strategy)
            .field("zone_failure_detector", &self.zone_failure_detector)
            .field("enable_availability_zones", &self.enable_availability_zones)
            .field("availability_zone_names", &self.availability_zone_names)
            .field("num_availability_zones", &self.num_availability_zones)
            .field("quarantine_failed_entities", &self.quarantine_failed_entities)
            .field("health_poll_interval_ms", &self.health_poll_interval_ms)
            .finish_non_exhaustive()
    }
}
