//! Member entities and the management-layer contract.
//!
//! The controller does not own an entity model; it consumes a narrow
//! contract: create a child from a spec, wire its parent link, register and
//! unregister it with the management layer, invoke its start/stop effectors
//! and read its sensors. [`EntityManager`] is that contract, and
//! [`InMemoryEntityManager`] is the in-process implementation used by tests
//! and single-process deployments.

use crate::error::{ClusterError, ClusterResult};
use crate::location::{Location, LocationId};
use async_trait::async_trait;
use shoal_core::constants::MEMBER_ID_LENGTH_BYTES_MAX;
use shoal_core::io::{IoContext, RngProvider, TimeProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Flag map handed to the management layer when minting a member
pub type CreateFlags = BTreeMap<String, String>;

/// Flag key carrying the member's cluster ordinal
pub const FLAG_CLUSTER_MEMBER_ID: &str = "cluster.member.id";

// =============================================================================
// MemberId
// =============================================================================

/// Stable identifier of a member entity
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MemberId(String);

impl MemberId {
    /// Create a new MemberId with validation
    pub fn new(id: impl Into<String>) -> ClusterResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(ClusterError::InvalidId {
                id,
                reason: "member ID cannot be empty".into(),
            });
        }
        if id.len() > MEMBER_ID_LENGTH_BYTES_MAX {
            return Err(ClusterError::InvalidId {
                reason: format!(
                    "member ID length {} exceeds limit {}",
                    id.len(),
                    MEMBER_ID_LENGTH_BYTES_MAX
                ),
                id,
            });
        }
        let valid = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(ClusterError::InvalidId {
                id,
                reason: "member ID contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    /// Generate a unique id from a prefix and an injected RNG.
    ///
    /// Falls back to the hostname when the prefix is empty, so ids remain
    /// recognisable in multi-host logs.
    pub fn generate_with_rng(prefix: &str, rng: &dyn RngProvider) -> Self {
        let prefix = if prefix.is_empty() {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "member".to_string())
        } else {
            prefix.to_string()
        };

        let suffix = rng.next_u64() as u32;
        let mut id = format!("{}-{:08x}", prefix, suffix);
        id.truncate(MEMBER_ID_LENGTH_BYTES_MAX);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ClusterMember
// =============================================================================

/// A member entity as seen by the controller.
///
/// Implementations wrap whatever the embedding platform considers an entity;
/// the controller only needs identity, a few sensors, the parent link and the
/// start/stop effectors. The cluster back-reference set by
/// [`ClusterMember::tag_as_member`] is for lookup only and never implies
/// ownership; the cluster owns the member's lifetime.
#[async_trait]
pub trait ClusterMember: Send + Sync + fmt::Debug {
    /// Stable entity id
    fn id(&self) -> &MemberId;

    /// Wall-clock creation time in milliseconds
    fn creation_time_ms(&self) -> u64;

    /// Cluster ordinal assigned at creation; absent on members that predate
    /// ordinal assignment
    fn cluster_member_id(&self) -> Option<u64>;

    /// Locations this member occupies, start location first
    fn locations(&self) -> Vec<Location>;

    /// Whether the member responds to start/stop effectors
    fn is_startable(&self) -> bool;

    /// The `service_up` sensor: true, false, or not yet published
    fn service_up(&self) -> Option<bool>;

    /// Current parent entity id, if linked
    fn parent(&self) -> Option<String>;

    /// Link this member under a parent entity
    fn set_parent(&self, parent_id: &str);

    /// Publish the membership marker and cluster back-reference sensors
    fn tag_as_member(&self, cluster_id: &str);

    /// Start effector
    async fn start(&self, location: &Location) -> ClusterResult<()>;

    /// Stop effector
    async fn stop(&self) -> ClusterResult<()>;
}

// =============================================================================
// MemberSpec
// =============================================================================

/// Blueprint for minting one member
#[derive(Debug, Clone, Default)]
pub struct MemberSpec {
    /// Prefix for generated member ids (hostname when empty)
    pub name_prefix: String,
    /// Explicit locations; overrides zone placement when non-empty
    pub locations: Vec<Location>,
    /// Whether minted members respond to start/stop
    pub startable: bool,
    /// Extra flags applied to every member minted from this spec
    pub flags: CreateFlags,
}

impl MemberSpec {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            locations: Vec::new(),
            startable: true,
            flags: CreateFlags::new(),
        }
    }

    pub fn with_locations(mut self, locations: Vec<Location>) -> Self {
        self.locations = locations;
        self
    }

    pub fn non_startable(mut self) -> Self {
        self.startable = false;
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }
}

/// Legacy member construction hook, consulted when no member spec is
/// configured.
pub trait MemberFactory: Send + Sync {
    fn new_member(
        &self,
        location: &Location,
        flags: &CreateFlags,
    ) -> ClusterResult<Arc<dyn ClusterMember>>;
}

// =============================================================================
// EntityManager
// =============================================================================

/// The management-layer contract the controller consumes.
#[async_trait]
pub trait EntityManager: Send + Sync {
    /// Mint a member entity from a spec. The entity is created but not yet
    /// registered; callers follow up with [`EntityManager::manage`].
    async fn create_member(
        &self,
        spec: &MemberSpec,
        location: &Location,
        flags: &CreateFlags,
    ) -> ClusterResult<Arc<dyn ClusterMember>>;

    /// Register an entity with the management layer
    async fn manage(&self, member: &Arc<dyn ClusterMember>) -> ClusterResult<()>;

    /// Unregister an entity. Unknown ids are tolerated.
    async fn unmanage(&self, member_id: &MemberId) -> ClusterResult<()>;

    /// Resolve a registered entity by id
    async fn resolve(&self, member_id: &MemberId) -> Option<Arc<dyn ClusterMember>>;

    /// Whether the entity is currently registered
    async fn is_managed(&self, member_id: &MemberId) -> bool;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Scripted effector outcomes for [`LocalMember`], keyed by ordinal or zone.
///
/// Tests (and chaos tooling) use this to make specific members or whole
/// zones fail their start/stop effectors.
#[derive(Debug, Default)]
pub struct FailurePlan {
    fail_start_ordinals: Mutex<HashSet<u64>>,
    fail_start_zones: Mutex<HashSet<LocationId>>,
    fail_stop_ordinals: Mutex<HashSet<u64>>,
    start_delay_ms: AtomicU64,
}

impl FailurePlan {
    /// Fail the start effector of the member with the given ordinal
    pub fn fail_start_of(&self, ordinal: u64) {
        self.lock_set(&self.fail_start_ordinals).insert(ordinal);
    }

    /// Fail every start issued in (or under) the given zone
    pub fn fail_starts_in(&self, zone: LocationId) {
        self.lock_set_loc(&self.fail_start_zones).insert(zone);
    }

    /// Stop failing starts in the given zone
    pub fn recover_zone(&self, zone: &LocationId) {
        self.lock_set_loc(&self.fail_start_zones).remove(zone);
    }

    /// Fail the stop effector of the member with the given ordinal
    pub fn fail_stop_of(&self, ordinal: u64) {
        self.lock_set(&self.fail_stop_ordinals).insert(ordinal);
    }

    /// Delay every start effector by the given duration
    pub fn set_start_delay_ms(&self, ms: u64) {
        self.start_delay_ms.store(ms, Ordering::Relaxed);
    }

    fn should_fail_start(&self, ordinal: Option<u64>, location: &Location) -> bool {
        if let Some(ord) = ordinal {
            if self.lock_set(&self.fail_start_ordinals).contains(&ord) {
                return true;
            }
        }
        self.lock_set_loc(&self.fail_start_zones)
            .iter()
            .any(|zone| location.is_or_descends_from(zone))
    }

    fn should_fail_stop(&self, ordinal: Option<u64>) -> bool {
        ordinal
            .map(|ord| self.lock_set(&self.fail_stop_ordinals).contains(&ord))
            .unwrap_or(false)
    }

    fn start_delay(&self) -> u64 {
        self.start_delay_ms.load(Ordering::Relaxed)
    }

    fn lock_set<'a>(&self, set: &'a Mutex<HashSet<u64>>) -> std::sync::MutexGuard<'a, HashSet<u64>> {
        set.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_set_loc<'a>(
        &self,
        set: &'a Mutex<HashSet<LocationId>>,
    ) -> std::sync::MutexGuard<'a, HashSet<LocationId>> {
        set.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process member entity backed by plain state.
#[derive(Debug)]
pub struct LocalMember {
    id: MemberId,
    creation_time_ms: u64,
    ordinal: Option<u64>,
    startable: bool,
    locations: std::sync::RwLock<Vec<Location>>,
    service_up: std::sync::RwLock<Option<bool>>,
    parent: std::sync::RwLock<Option<String>>,
    member_of: std::sync::RwLock<Option<String>>,
    plan: Arc<FailurePlan>,
    time: Arc<dyn TimeProvider>,
}

impl LocalMember {
    fn new(
        id: MemberId,
        creation_time_ms: u64,
        ordinal: Option<u64>,
        startable: bool,
        location: Location,
        plan: Arc<FailurePlan>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            id,
            creation_time_ms,
            ordinal,
            startable,
            locations: std::sync::RwLock::new(vec![location]),
            service_up: std::sync::RwLock::new(None),
            parent: std::sync::RwLock::new(None),
            member_of: std::sync::RwLock::new(None),
            plan,
            time,
        }
    }

    /// The cluster this member was tagged into, if any
    pub fn member_of(&self) -> Option<String> {
        self.member_of
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_service_up(&self, up: Option<bool>) {
        *self.service_up.write().unwrap_or_else(|e| e.into_inner()) = up;
    }
}

#[async_trait]
impl ClusterMember for LocalMember {
    fn id(&self) -> &MemberId {
        &self.id
    }

    fn creation_time_ms(&self) -> u64 {
        self.creation_time_ms
    }

    fn cluster_member_id(&self) -> Option<u64> {
        self.ordinal
    }

    fn locations(&self) -> Vec<Location> {
        self.locations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_startable(&self) -> bool {
        self.startable
    }

    fn service_up(&self) -> Option<bool> {
        *self.service_up.read().unwrap_or_else(|e| e.into_inner())
    }

    fn parent(&self) -> Option<String> {
        self.parent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_parent(&self, parent_id: &str) {
        *self.parent.write().unwrap_or_else(|e| e.into_inner()) = Some(parent_id.to_string());
    }

    fn tag_as_member(&self, cluster_id: &str) {
        *self.member_of.write().unwrap_or_else(|e| e.into_inner()) = Some(cluster_id.to_string());
    }

    async fn start(&self, location: &Location) -> ClusterResult<()> {
        let delay = self.plan.start_delay();
        if delay > 0 {
            self.time.sleep_ms(delay).await;
        }

        if self.plan.should_fail_start(self.ordinal, location) {
            self.set_service_up(Some(false));
            return Err(ClusterError::entity(
                self.id.as_str(),
                format!("start failed in {}", location.id()),
            ));
        }

        self.set_service_up(Some(true));
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        if self.plan.should_fail_stop(self.ordinal) {
            return Err(ClusterError::entity(self.id.as_str(), "stop failed"));
        }
        self.set_service_up(Some(false));
        Ok(())
    }
}

/// In-memory entity manager.
///
/// Suitable for tests and single-process deployment; all registrations are
/// lost on restart.
pub struct InMemoryEntityManager {
    io: IoContext,
    plan: Arc<FailurePlan>,
    managed: tokio::sync::RwLock<HashMap<MemberId, Arc<dyn ClusterMember>>>,
    created_count: AtomicU64,
}

impl Default for InMemoryEntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEntityManager {
    /// Create a manager with production I/O providers
    pub fn new() -> Self {
        Self::with_io(IoContext::production())
    }

    /// Create a manager with injected I/O providers (deterministic tests)
    pub fn with_io(io: IoContext) -> Self {
        Self {
            io,
            plan: Arc::new(FailurePlan::default()),
            managed: tokio::sync::RwLock::new(HashMap::new()),
            created_count: AtomicU64::new(0),
        }
    }

    /// The effector failure script shared by every minted member
    pub fn failure_plan(&self) -> &Arc<FailurePlan> {
        &self.plan
    }

    /// Number of members minted over this manager's lifetime
    pub fn created_count(&self) -> u64 {
        self.created_count.load(Ordering::Relaxed)
    }

    /// Number of currently registered entities
    pub async fn managed_count(&self) -> usize {
        self.managed.read().await.len()
    }
}

#[async_trait]
impl EntityManager for InMemoryEntityManager {
    async fn create_member(
        &self,
        spec: &MemberSpec,
        location: &Location,
        flags: &CreateFlags,
    ) -> ClusterResult<Arc<dyn ClusterMember>> {
        let id = MemberId::generate_with_rng(&spec.name_prefix, self.io.rng.as_ref());
        let ordinal = flags
            .get(FLAG_CLUSTER_MEMBER_ID)
            .and_then(|v| v.parse::<u64>().ok());

        self.created_count.fetch_add(1, Ordering::Relaxed);

        let member = LocalMember::new(
            id,
            self.io.now_ms(),
            ordinal,
            spec.startable,
            location.clone(),
            Arc::clone(&self.plan),
            Arc::clone(&self.io.time),
        );
        Ok(Arc::new(member))
    }

    async fn manage(&self, member: &Arc<dyn ClusterMember>) -> ClusterResult<()> {
        let mut managed = self.managed.write().await;
        managed.insert(member.id().clone(), Arc::clone(member));
        Ok(())
    }

    async fn unmanage(&self, member_id: &MemberId) -> ClusterResult<()> {
        let mut managed = self.managed.write().await;
        if managed.remove(member_id).is_none() {
            // Tolerated: entity is probably already unmanaged.
            debug!(member = %member_id, "unmanage of unknown entity");
        }
        Ok(())
    }

    async fn resolve(&self, member_id: &MemberId) -> Option<Arc<dyn ClusterMember>> {
        self.managed.read().await.get(member_id).cloned()
    }

    async fn is_managed(&self, member_id: &MemberId) -> bool {
        self.managed.read().await.contains_key(member_id)
    }
}

// =============================================================================
// Mock clock (for deterministic tests)
// =============================================================================

/// Manually advanced clock implementing [`TimeProvider`]
#[derive(Debug)]
pub struct MockClock {
    time_ms: std::sync::RwLock<u64>,
}

impl MockClock {
    pub fn new(initial_ms: u64) -> Self {
        Self {
            time_ms: std::sync::RwLock::new(initial_ms),
        }
    }

    /// Advance the clock by the given milliseconds
    pub fn advance(&self, ms: u64) {
        let mut time = self.time_ms.write().unwrap_or_else(|e| e.into_inner());
        *time = time.saturating_add(ms);
    }
}

#[async_trait]
impl TimeProvider for MockClock {
    fn now_ms(&self) -> u64 {
        *self.time_ms.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}
