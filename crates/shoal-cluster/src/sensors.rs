//! Cluster lifecycle state and published sensors.

use crate::allocator::MemberIdAllocator;
use crate::entity::MemberId;
use crate::location::{Location, LocationId};
use crate::quarantine::QuarantineGroup;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Problem-indicator key for start failures
pub const PROBLEM_START: &str = "start";

/// Capacity of the quarantine event stream
const QUARANTINE_EVENTS_CAPACITY: usize = 64;

/// Expected lifecycle state of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created but never started
    Created,
    /// Start in progress
    Starting,
    /// Expected to be running
    Running,
    /// Stop in progress
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Stop failed; state unknown
    OnFire,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::OnFire => "on_fire",
        };
        write!(f, "{}", s)
    }
}

/// Observable attributes published by the controller.
///
/// Reads never take the resize mutex; writers are the controller (under the
/// mutex) and the health poll.
pub struct ClusterSensors {
    expected_state: RwLock<Lifecycle>,
    service_up: RwLock<bool>,
    one_and_all_members_up: RwLock<bool>,
    sub_locations: RwLock<Vec<Location>>,
    failed_sub_locations: RwLock<BTreeSet<LocationId>>,
    problems: RwLock<BTreeMap<String, String>>,
    quarantine_group: RwLock<Option<Arc<QuarantineGroup>>>,
    quarantine_events: broadcast::Sender<MemberId>,
    /// Persisted ordinal counter; survives rehydration via
    /// [`MemberIdAllocator::persisted_value`]
    next_member_id: MemberIdAllocator,
}

impl Default for ClusterSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterSensors {
    pub fn new() -> Self {
        Self::with_initial_service_up(false)
    }

    /// Create with a specific initial `service_up` value; an empty-by-design
    /// cluster publishes `true` before its first health poll.
    pub fn with_initial_service_up(service_up: bool) -> Self {
        let (quarantine_events, _) = broadcast::channel(QUARANTINE_EVENTS_CAPACITY);
        Self {
            expected_state: RwLock::new(Lifecycle::Created),
            service_up: RwLock::new(service_up),
            one_and_all_members_up: RwLock::new(false),
            sub_locations: RwLock::new(Vec::new()),
            failed_sub_locations: RwLock::new(BTreeSet::new()),
            problems: RwLock::new(BTreeMap::new()),
            quarantine_group: RwLock::new(None),
            quarantine_events,
            next_member_id: MemberIdAllocator::new(),
        }
    }

    // -- expected state -------------------------------------------------------

    pub async fn expected_state(&self) -> Lifecycle {
        *self.expected_state.read().await
    }

    pub async fn set_expected_state(&self, state: Lifecycle) {
        *self.expected_state.write().await = state;
    }

    // -- service up -----------------------------------------------------------

    pub async fn service_up(&self) -> bool {
        *self.service_up.read().await
    }

    pub async fn set_service_up(&self, up: bool) {
        *self.service_up.write().await = up;
    }

    pub async fn one_and_all_members_up(&self) -> bool {
        *self.one_and_all_members_up.read().await
    }

    pub async fn set_one_and_all_members_up(&self, up: bool) {
        *self.one_and_all_members_up.write().await = up;
    }

    // -- zones ----------------------------------------------------------------

    pub async fn sub_locations(&self) -> Vec<Location> {
        self.sub_locations.read().await.clone()
    }

    pub async fn set_sub_locations(&self, locations: Vec<Location>) {
        *self.sub_locations.write().await = locations;
    }

    pub async fn failed_sub_locations(&self) -> BTreeSet<LocationId> {
        self.failed_sub_locations.read().await.clone()
    }

    pub async fn set_failed_sub_locations(&self, failed: BTreeSet<LocationId>) {
        *self.failed_sub_locations.write().await = failed;
    }

    // -- problem indicators ---------------------------------------------------

    pub async fn problem(&self, key: &str) -> Option<String> {
        self.problems.read().await.get(key).cloned()
    }

    pub async fn update_problem(&self, key: impl Into<String>, message: impl Into<String>) {
        self.problems.write().await.insert(key.into(), message.into());
    }

    pub async fn clear_problem(&self, key: &str) {
        self.problems.write().await.remove(key);
    }

    // -- quarantine -----------------------------------------------------------

    pub async fn quarantine_group(&self) -> Option<Arc<QuarantineGroup>> {
        self.quarantine_group.read().await.clone()
    }

    pub async fn set_quarantine_group(&self, group: Arc<QuarantineGroup>) {
        *self.quarantine_group.write().await = Some(group);
    }

    /// Subscribe to per-member quarantine events
    pub fn subscribe_quarantined(&self) -> broadcast::Receiver<MemberId> {
        self.quarantine_events.subscribe()
    }

    /// Emit a quarantine event; dropped when nobody listens
    pub fn emit_quarantined(&self, member_id: MemberId) {
        let _ = self.quarantine_events.send(member_id);
    }

    // -- member ordinals ------------------------------------------------------

    pub fn next_member_id(&self) -> &MemberIdAllocator {
        &self.next_member_id
    }
}

impl fmt::Debug for ClusterSensors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSensors").finish_non_exhaustive()
    }
}
