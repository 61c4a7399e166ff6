//! The dynamic cluster controller.
//!
//! One controller owns one logical group of managed members and drives its
//! actual size toward the desired size: parallel start fan-out on grow,
//! victim selection and teardown on shrink, zone-aware placement with
//! failure detection, quarantine of members that fail to start, and
//! in-place replacement that preserves zone affinity.
//!
//! # Serialization
//!
//! A per-cluster mutex serializes `resize`, `resize_by_delta` and
//! `replace_member`, and is held across the whole operation including the
//! parallel start fan-out and its await. This prevents overlapping resizes
//! from double-counting; the cost is that one slow start stalls later
//! resizes of the same cluster. The one exception is `stop`, which first
//! shrinks to zero *without* the mutex so that it can preempt a start
//! currently holding it, then re-enters with the mutex to finish cleanly.

use crate::config::ClusterConfig;
use crate::entity::{ClusterMember, CreateFlags, EntityManager, MemberId};
use crate::error::{ClusterError, ClusterResult, MaskedResult};
use crate::factory::NodeFactory;
use crate::failure::ZoneFailureDetector;
use crate::health::{self, HealthFeed, QuorumCheck};
use crate::location::{find_sub_locations, Location};
use crate::placement::{MembersByLocation, ZonePlacementStrategy};
use crate::policy::Policy;
use crate::quarantine::QuarantineGroup;
use crate::registry::StrategyRegistry;
use crate::removal::RemovalStrategy;
use crate::sensors::{ClusterSensors, Lifecycle, PROBLEM_START};
use crate::starter::ParallelStarter;
use shoal_core::runtime::Runtime;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Dynamic cluster controller.
///
/// Generic over the management layer and the async runtime so both can be
/// swapped in tests.
pub struct ClusterController<M: EntityManager + 'static, RT: Runtime + 'static> {
    id: String,
    display_name: RwLock<String>,
    config: ClusterConfig,
    manager: Arc<M>,
    runtime: RT,
    removal: RwLock<Arc<dyn RemovalStrategy>>,
    placement: Arc<dyn ZonePlacementStrategy>,
    detector: Arc<dyn ZoneFailureDetector>,
    policies: RwLock<Vec<Arc<dyn Policy>>>,
    locations: RwLock<Vec<Location>>,
    members: Arc<RwLock<Vec<Arc<dyn ClusterMember>>>>,
    sensors: Arc<ClusterSensors>,
    factory: NodeFactory<M>,
    starter: ParallelStarter<RT>,
    health: HealthFeed,
    up_quorum: QuorumCheck,
    /// Serialization point for every size mutation
    resize_mutex: Mutex<()>,
}

impl<M: EntityManager + 'static, RT: Runtime + 'static> ClusterController<M, RT> {
    /// Create a controller for a fresh cluster.
    pub fn new(
        id: impl Into<String>,
        config: ClusterConfig,
        manager: Arc<M>,
        runtime: RT,
        strategies: &StrategyRegistry,
    ) -> ClusterResult<Self> {
        Self::build(id.into(), config, manager, runtime, strategies, 0)
    }

    /// Create a controller for a rehydrated cluster, resuming ordinal
    /// allocation past every ordinal the previous incarnation handed out.
    pub fn rehydrated(
        id: impl Into<String>,
        config: ClusterConfig,
        manager: Arc<M>,
        runtime: RT,
        strategies: &StrategyRegistry,
        next_member_ordinal: u64,
    ) -> ClusterResult<Self> {
        Self::build(
            id.into(),
            config,
            manager,
            runtime,
            strategies,
            next_member_ordinal,
        )
    }

    fn build(
        id: String,
        config: ClusterConfig,
        manager: Arc<M>,
        runtime: RT,
        strategies: &StrategyRegistry,
        next_member_ordinal: u64,
    ) -> ClusterResult<Self> {
        config
            .validate()
            .map_err(|reason| ClusterError::invalid_configuration("cluster", reason))?;

        let removal = strategies.removal(&config.removal_strategy)?;
        let placement = strategies.placement(&config.zone_placement_strategy)?;
        let detector = strategies.failure_detector(&config.zone_failure_detector)?;

        // An initial size of zero with no explicit quorum means "up even when
        // empty", published immediately.
        let up_quorum = match config.up_quorum_check {
            Some(q) => q,
            None if config.initial_size == 0 => QuorumCheck::AtLeastOneUnlessEmpty,
            None => QuorumCheck::AllAndAtLeastOne,
        };
        let initially_up = config.up_quorum_check.is_none() && config.initial_size == 0;

        let sensors = Arc::new(ClusterSensors::with_initial_service_up(initially_up));
        sensors.next_member_id().ensure_initialized(next_member_ordinal);

        let members: Arc<RwLock<Vec<Arc<dyn ClusterMember>>>> =
            Arc::new(RwLock::new(Vec::new()));
        let factory = NodeFactory::new(
            id.clone(),
            Arc::clone(&manager),
            Arc::clone(&sensors),
            Arc::clone(&members),
            config.member_spec.clone(),
            config.first_member_spec.clone(),
            config.member_factory.clone(),
            config.custom_child_flags.clone(),
        );
        let starter = ParallelStarter::new(runtime.clone());

        Ok(Self {
            display_name: RwLock::new(id.clone()),
            id,
            config,
            manager,
            runtime,
            removal: RwLock::new(removal),
            placement,
            detector,
            policies: RwLock::new(Vec::new()),
            locations: RwLock::new(Vec::new()),
            members,
            sensors,
            factory,
            starter,
            health: HealthFeed::new(),
            up_quorum,
            resize_mutex: Mutex::new(()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn display_name(&self) -> String {
        self.display_name.read().await.clone()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Published sensors (expected state, service-up, zones, events)
    pub fn sensors(&self) -> &ClusterSensors {
        &self.sensors
    }

    /// Number of active members
    pub async fn current_size(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the active members, in join order
    pub async fn members(&self) -> Vec<Arc<dyn ClusterMember>> {
        self.members.read().await.clone()
    }

    pub async fn is_member(&self, member_id: &MemberId) -> bool {
        self.members
            .read()
            .await
            .iter()
            .any(|m| m.id() == member_id)
    }

    /// Attach a policy; attached policies are suspended while stopping and
    /// resumed when a start completes.
    pub async fn add_policy(&self, policy: Arc<dyn Policy>) {
        self.policies.write().await.push(policy);
    }

    /// Replace the removal strategy used by shrink
    pub async fn set_removal_strategy(&self, strategy: Arc<dyn RemovalStrategy>) {
        *self.removal.write().await = strategy;
    }

    /// Whether the health poll is currently running
    pub async fn health_feed_running(&self) -> bool {
        self.health.is_running().await
    }

    fn zones_enabled(&self) -> bool {
        self.config.enable_availability_zones
    }

    fn quarantine_enabled(&self) -> bool {
        self.config.quarantine_failed_entities
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the cluster in the given location (zero or one; the cluster
    /// must end up with exactly one).
    ///
    /// Grows to the configured initial size. Fails with `QuorumNotReached`
    /// if fewer than the initial quorum came up; the expected state ends at
    /// `Running` either way, with the failure recorded in the start problem
    /// indicator.
    pub async fn start(&self, locations: Vec<Location>) -> ClusterResult<()> {
        if locations.len() > 1 {
            return Err(ClusterError::AmbiguousLocation {
                cluster: self.id.clone(),
                count: locations.len(),
            });
        }
        {
            let mut known = self.locations.write().await;
            for loc in locations {
                if !known.iter().any(|l| l.id() == loc.id()) {
                    known.push(loc);
                }
            }
        }
        let location = self.require_single_location().await?;

        if let Some(spec) = &self.config.member_spec {
            if !spec.name_prefix.is_empty() {
                let mut name = self.display_name.write().await;
                if *name == self.id {
                    *name = format!("Cluster of {} ({})", spec.name_prefix, location.id());
                }
            }
        }

        self.sensors.set_expected_state(Lifecycle::Starting).await;
        self.sensors.clear_problem(PROBLEM_START).await;
        self.start_health_feed().await;

        let result = self.do_start(&location).await;
        if let Err(e) = &result {
            self.sensors
                .update_problem(PROBLEM_START, format!("start failed with error: {e}"))
                .await;
        }
        // Running is published even on failure; the problem indicator carries
        // the error separately.
        self.sensors.set_expected_state(Lifecycle::Running).await;
        result
    }

    async fn do_start(&self, location: &Location) -> ClusterResult<()> {
        if self.zones_enabled() {
            let subs = self.find_sub_locations_checked(location)?;
            self.sensors.set_sub_locations(subs).await;
        }
        if self.quarantine_enabled() && self.sensors.quarantine_group().await.is_none() {
            self.sensors
                .set_quarantine_group(Arc::new(QuarantineGroup::new()))
                .await;
        }

        let initial_size = self.config.initial_size;
        let initial_quorum = self.initial_quorum_size();

        let mut masked_error: Option<ClusterError> = None;
        let mut internal_error: Option<ClusterError> = None;
        {
            let _guard = self.resize_mutex.lock().await;
            let delta = initial_size as i64 - self.current_size().await as i64;
            match self.resize_by_delta_locked(delta).await {
                Ok(MaskedResult::Ok(_)) => {}
                Ok(MaskedResult::MaskedError(_, e)) => masked_error = Some(e),
                Ok(MaskedResult::Thrown(_, e)) | Err(e) => {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    debug!(
                        cluster = %self.id,
                        size = initial_size,
                        error = %e,
                        "error resizing on start (collecting and handling)"
                    );
                    internal_error = Some(e);
                }
            }
        }

        let several_failed = matches!(
            &masked_error,
            Some(ClusterError::StartFailures { count, .. }) if *count > 1
        );
        let any_failed = masked_error.is_some();

        let current_size = self.current_size().await;
        if current_size < initial_quorum {
            let mut message = if current_size == 0 && any_failed {
                if several_failed {
                    format!("All nodes in cluster {} failed", self.id)
                } else {
                    format!("Node in cluster {} failed", self.id)
                }
            } else {
                format!(
                    "On start of cluster {}, failed to get to initial size of {}; size is {}{}",
                    self.id,
                    initial_size,
                    current_size,
                    if initial_quorum != initial_size {
                        format!(" (initial quorum size is {})", initial_quorum)
                    } else {
                        String::new()
                    }
                )
            };
            // Prefer the subtask failure; the internal error would only wrap it.
            let first_error = masked_error.or(internal_error);
            if let Some(e) = &first_error {
                message = format!("{}: {}", message, e);
            }
            return Err(ClusterError::QuorumNotReached {
                message,
                cause: first_error.map(Box::new),
            });
        } else if current_size < initial_size {
            warn!(
                cluster = %self.id,
                size = current_size,
                quorum = initial_quorum,
                initial = initial_size,
                "reached initial minimum quorum size but not desired initial size; continuing"
            );
        }

        for policy in self.policies.read().await.iter() {
            policy.resume();
        }
        Ok(())
    }

    /// Stop the cluster: shrink to zero, sweep stoppable children, publish
    /// `Stopped`.
    ///
    /// The first shrink runs outside the resize mutex, deliberately: a start
    /// holding the mutex sees its members disappear and the subsequent
    /// `resize(0)` re-enters with the mutex to finish cleanly. Any error
    /// moves the cluster to `OnFire` and propagates. The health feed is
    /// always stopped.
    pub async fn stop(&self) -> ClusterResult<()> {
        self.sensors.set_expected_state(Lifecycle::Stopping).await;

        let result = self.do_stop().await;
        match &result {
            Ok(()) => self.sensors.set_expected_state(Lifecycle::Stopped).await,
            Err(e) => {
                warn!(cluster = %self.id, error = %e, "stop failed");
                self.sensors.set_expected_state(Lifecycle::OnFire).await;
            }
        }
        self.health.stop().await;
        result
    }

    async fn do_stop(&self) -> ClusterResult<()> {
        for policy in self.policies.read().await.iter() {
            policy.suspend();
        }

        // without the mutex, so a concurrent start can be interrupted
        let size = self.current_size().await;
        if size > 0 {
            self.shrink_by(-(size as i64)).await?;
        }

        // with the mutex, to prevent others from starting members meanwhile
        self.resize(0).await?;

        self.stop_startable_children().await?;
        Ok(())
    }

    async fn stop_startable_children(&self) -> ClusterResult<()> {
        let mut first_error: Option<ClusterError> = None;

        // stray members (e.g. minted by a racing start after the shrink)
        let stray = self.members().await;
        for member in stray.iter().filter(|m| m.is_startable()) {
            if let Err(e) = member.stop().await {
                warn!(cluster = %self.id, member = %member.id(), error = %e, "failed to stop member");
                first_error.get_or_insert(e);
            }
        }

        // quarantined occupants are stopped too; the group itself has no
        // lifecycle
        if let Some(group) = self.sensors.quarantine_group().await {
            group.stop_startable_occupants().await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restart is intentionally unsupported for clusters.
    pub fn restart(&self) -> ClusterResult<()> {
        Err(ClusterError::NotSupported {
            operation: "restart",
        })
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Drive the cluster to the desired size; returns the size afterwards.
    ///
    /// Per-member start failures are masked: they are logged, recorded with
    /// the zone failure detector and routed to quarantine/cleanup, but do
    /// not fail the resize.
    pub async fn resize(&self, desired_size: usize) -> ClusterResult<usize> {
        let _guard = self.resize_mutex.lock().await;

        let original_size = self.current_size().await;
        let delta = desired_size as i64 - original_size as i64;
        if delta != 0 {
            info!(cluster = %self.id, from = original_size, to = desired_size, "resizing");
        } else {
            debug!(cluster = %self.id, size = original_size, "resize no-op");
        }

        let (_, masked) = self.resize_by_delta_locked(delta).await?.into_parts()?;
        if let Some(e) = masked {
            warn!(cluster = %self.id, error = %e, "resize completed with masked member failures");
        }
        Ok(self.current_size().await)
    }

    /// Grow (positive delta) or shrink (negative delta); returns the members
    /// added or removed.
    pub async fn resize_by_delta(&self, delta: i64) -> ClusterResult<Vec<Arc<dyn ClusterMember>>> {
        let _guard = self.resize_mutex.lock().await;
        self.resize_by_delta_locked(delta).await?.into_masked()
    }

    async fn resize_by_delta_locked(
        &self,
        delta: i64,
    ) -> ClusterResult<MaskedResult<Vec<Arc<dyn ClusterMember>>>> {
        if delta > 0 {
            self.grow(delta as usize).await
        } else if delta < 0 {
            self.shrink_by(delta).await.map(MaskedResult::Ok)
        } else {
            Ok(MaskedResult::Ok(Vec::new()))
        }
    }

    async fn grow(
        &self,
        delta: usize,
    ) -> ClusterResult<MaskedResult<Vec<Arc<dyn ClusterMember>>>> {
        debug_assert!(delta > 0, "grow requires a positive delta");

        let spec_locations = self
            .config
            .member_spec
            .as_ref()
            .map(|s| s.locations.clone())
            .unwrap_or_default();

        let chosen_locations: Vec<Location> = if let Some(first) = spec_locations.first() {
            // The member spec overrides the cluster location.
            if self.zones_enabled() {
                warn!(
                    cluster = %self.id,
                    location = %first.id(),
                    "member spec overrides location; availability-zone behaviour will not apply"
                );
            }
            vec![first.clone(); delta]
        } else if self.zones_enabled() {
            let sub_locations = self.non_failed_sub_locations().await?;
            let members_by_location = self.members_by_location().await;
            let chosen = self.placement.locations_for_additions(
                &members_by_location,
                &sub_locations,
                delta,
            )?;
            if chosen.len() != delta {
                return Err(ClusterError::PlacementInvariant {
                    chosen: chosen.len(),
                    expected: delta,
                });
            }
            chosen
        } else {
            let location = self.require_single_location().await?;
            vec![location; delta]
        };

        self.add_in_each_location(chosen_locations, &CreateFlags::new())
            .await
    }

    async fn shrink_by(&self, delta: i64) -> ClusterResult<Vec<Arc<dyn ClusterMember>>> {
        debug_assert!(delta < 0, "shrink requires a negative delta");

        let size = self.current_size().await as i64;
        let delta = if -delta > size {
            warn!(cluster = %self.id, delta, size, "shrink exceeds current size; clamping");
            -size
        } else {
            delta
        };
        if delta == 0 {
            return Ok(Vec::new());
        }

        let victims = self.pick_and_remove_members((-delta) as usize).await?;

        // stop startable victims in parallel
        let mut handles = Vec::new();
        for victim in victims.iter().filter(|m| m.is_startable()) {
            let member = Arc::clone(victim);
            handles.push((
                member.id().clone(),
                self.runtime.spawn(async move { member.stop().await }),
            ));
        }

        let mut errors = Vec::new();
        for (member_id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(cluster = %self.id, member = %member_id, error = %e, "failed to stop member during shrink");
                    errors.push(e);
                }
                Err(join_err) => errors.push(ClusterError::Interrupted {
                    reason: join_err.to_string(),
                }),
            }
        }

        // every victim is unmanaged regardless of its stop outcome
        for victim in &victims {
            self.discard_node(victim).await;
        }

        match ClusterError::compound(errors) {
            Some(e) => Err(e),
            None => Ok(victims),
        }
    }

    async fn pick_and_remove_members(
        &self,
        count: usize,
    ) -> ClusterResult<Vec<Arc<dyn ClusterMember>>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        if self.zones_enabled() {
            let members_by_location = self.members_by_location().await;
            let victims = self
                .placement
                .entities_to_remove(&members_by_location, count)?;
            if victims.len() != count {
                return Err(ClusterError::PlacementInvariant {
                    chosen: victims.len(),
                    expected: count,
                });
            }
            for victim in &victims {
                self.remove_member(victim.id()).await;
            }
            Ok(victims)
        } else {
            let mut victims = Vec::new();
            for _ in 0..count {
                // members may shrink concurrently; return what we could remove
                let candidates = self.members().await;
                if candidates.is_empty() {
                    break;
                }
                let chosen = self
                    .removal
                    .read()
                    .await
                    .select(&candidates)
                    .ok_or_else(|| {
                        ClusterError::internal(format!(
                            "no entity chosen for removal from {}",
                            self.id
                        ))
                    })?;
                self.remove_member(chosen.id()).await;
                victims.push(chosen);
            }
            Ok(victims)
        }
    }

    // =========================================================================
    // Member replacement
    // =========================================================================

    /// Replace a member in-place, preserving its zone.
    ///
    /// The replacement is started first; only once it is running is the old
    /// member stopped and unmanaged. `GrowFailed` leaves the old member in
    /// place; `StopFailed` is raised after the replacement is already live.
    pub async fn replace_member(&self, member_id: &MemberId) -> ClusterResult<MemberId> {
        let member = self.manager.resolve(member_id).await.ok_or_else(|| {
            ClusterError::NoSuchMember {
                cluster: self.id.clone(),
                member_id: member_id.to_string(),
            }
        })?;
        info!(cluster = %self.id, member = %member_id, "replacing member");

        let _guard = self.resize_mutex.lock().await;

        if !self.is_member(member_id).await {
            return Err(ClusterError::NoSuchMember {
                cluster: self.id.clone(),
                member_id: member_id.to_string(),
            });
        }

        let member_location = if self.zones_enabled() {
            self.infer_replacement_zone(&member).await?
        } else {
            // the new member belongs in the same location as the old one
            self.require_single_location().await?
        };

        let replacement = self.replace_member_in(&member, &member_location).await?;
        Ok(replacement.id().clone())
    }

    async fn replace_member_in(
        &self,
        member: &Arc<dyn ClusterMember>,
        location: &Location,
    ) -> ClusterResult<Arc<dyn ClusterMember>> {
        let added = self
            .add_in_single_location(location.clone(), &CreateFlags::new())
            .await?;

        let (replacement, masked) = match added {
            MaskedResult::Ok(v) => (v, None),
            MaskedResult::MaskedError(v, e) => (v, Some(e)),
            MaskedResult::Thrown(v, e) => (v.flatten(), Some(e)),
        };

        let Some(replacement) = replacement else {
            return Err(ClusterError::GrowFailed {
                cluster: self.id.clone(),
                detail: Some(format!("to replace {}; not removing", member.id())),
                cause: masked.map(Box::new),
            });
        };

        if let Err(e) = self.stop_and_remove_node(member).await {
            if e.is_fatal() {
                return Err(e);
            }
            return Err(ClusterError::StopFailed {
                member_id: member.id().to_string(),
                cause: Box::new(e),
            });
        }

        Ok(replacement)
    }

    /// Infer the zone a replacement should land in: the first current
    /// sub-location found on the old member's location chains, with explicit
    /// fallbacks for members that never recorded one.
    async fn infer_replacement_zone(
        &self,
        member: &Arc<dyn ClusterMember>,
    ) -> ClusterResult<Location> {
        let location = self.require_single_location().await?;
        let sub_locations = self.find_sub_locations_checked(&location)?;
        let member_locations = member.locations();

        for member_location in &member_locations {
            if let Some(zone) = sub_locations
                .iter()
                .find(|sub| member_location.is_or_descends_from(sub.id()))
            {
                debug!(
                    cluster = %self.id,
                    member = %member.id(),
                    zone = %zone.id(),
                    "inferred replacement sub-location"
                );
                return Ok(zone.clone());
            }
        }

        if member_locations.is_empty() {
            let fallback = sub_locations.first().cloned().ok_or_else(|| {
                ClusterError::ZoneCapacityExhausted {
                    location: location.id().to_string(),
                    required: 1,
                    available: 0,
                }
            })?;
            warn!(
                cluster = %self.id,
                member = %member.id(),
                zone = %fallback.id(),
                "member has no locations; falling back to first availability zone"
            );
            Ok(fallback)
        } else {
            // prefer a machine-provisioning location, else the first
            let fallback = member_locations
                .iter()
                .find(|l| l.provisions_machines())
                .or(member_locations.first())
                .cloned()
                .ok_or_else(|| ClusterError::internal("member locations vanished"))?;
            warn!(
                cluster = %self.id,
                member = %member.id(),
                location = %fallback.id(),
                "could not find matching sub-location; falling back to member's own location"
            );
            Ok(fallback)
        }
    }

    async fn stop_and_remove_node(&self, member: &Arc<dyn ClusterMember>) -> ClusterResult<()> {
        self.remove_member(member.id()).await;

        let result = if member.is_startable() {
            member.stop().await
        } else {
            Ok(())
        };

        // unmanaged whether or not the stop succeeded
        if let Err(e) = self.manager.unmanage(member.id()).await {
            debug!(member = %member.id(), error = %e, "unmanage failed; entity probably already unmanaged");
        }
        result
    }

    // =========================================================================
    // Adding members
    // =========================================================================

    async fn add_in_single_location(
        &self,
        location: Location,
        flags: &CreateFlags,
    ) -> ClusterResult<MaskedResult<Option<Arc<dyn ClusterMember>>>> {
        let outcome = self.add_in_each_location(vec![location], flags).await?;
        Ok(match outcome {
            MaskedResult::Ok(v) => MaskedResult::Ok(v.into_iter().next()),
            MaskedResult::MaskedError(v, e) => MaskedResult::MaskedError(v.into_iter().next(), e),
            MaskedResult::Thrown(v, e) => {
                MaskedResult::Thrown(v.map(|v| v.into_iter().next()), e)
            }
        })
    }

    async fn add_in_each_location(
        &self,
        locations: Vec<Location>,
        flags: &CreateFlags,
    ) -> ClusterResult<MaskedResult<Vec<Arc<dyn ClusterMember>>>> {
        // mint every node first, in location order
        let mut work: Vec<(Arc<dyn ClusterMember>, Location)> = Vec::with_capacity(locations.len());
        for location in locations {
            match self.factory.add_node(&location, flags).await {
                Ok(member) => work.push((member, location)),
                Err(e) => {
                    // creation failure aborts the batch; already-minted
                    // members stay and surface through the error
                    let partial = work.into_iter().map(|(m, _)| m).collect();
                    return Ok(MaskedResult::Thrown(Some(partial), e));
                }
            }
        }

        let outcomes = self.starter.start_all(work).await?;

        if self.zones_enabled() {
            for outcome in &outcomes {
                match &outcome.error {
                    None => self
                        .detector
                        .on_startup_success(&outcome.location, outcome.member.id()),
                    Some(e) => {
                        self.detector
                            .on_startup_failure(&outcome.location, outcome.member.id(), e)
                    }
                }
            }
        }

        let mut successes = Vec::new();
        let mut failed_members = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome.error {
                None => successes.push(outcome.member),
                Some(e) => {
                    failed_members.push(outcome.member);
                    errors.push(e);
                }
            }
        }

        if failed_members.is_empty() {
            return Ok(MaskedResult::Ok(successes));
        }

        if self.quarantine_enabled() {
            self.quarantine_failed_nodes(failed_members).await;
        } else {
            for member in &failed_members {
                self.discard_node(member).await;
            }
        }

        let error = ClusterError::compound(errors)
            .unwrap_or_else(|| ClusterError::internal("failure set without errors"));
        Ok(MaskedResult::MaskedError(successes, error))
    }

    async fn quarantine_failed_nodes(&self, failed: Vec<Arc<dyn ClusterMember>>) {
        let group = match self.sensors.quarantine_group().await {
            Some(group) => group,
            None => {
                let group = Arc::new(QuarantineGroup::new());
                self.sensors.set_quarantine_group(Arc::clone(&group)).await;
                group
            }
        };

        for member in failed {
            self.sensors.emit_quarantined(member.id().clone());
            // out of the active set before it joins the quarantine, so the
            // two never overlap
            self.remove_member(member.id()).await;
            group.add_member(member).await;
        }
    }

    async fn discard_node(&self, member: &Arc<dyn ClusterMember>) {
        self.remove_member(member.id()).await;
        if let Err(e) = self.manager.unmanage(member.id()).await {
            debug!(member = %member.id(), error = %e, "unmanage failed; entity probably already unmanaged");
        }
    }

    async fn remove_member(&self, member_id: &MemberId) -> Option<Arc<dyn ClusterMember>> {
        let mut members = self.members.write().await;
        members
            .iter()
            .position(|m| m.id() == member_id)
            .map(|index| members.remove(index))
    }

    // =========================================================================
    // Zones
    // =========================================================================

    fn find_sub_locations_checked(&self, location: &Location) -> ClusterResult<Vec<Location>> {
        find_sub_locations(
            location,
            &self.config.availability_zone_names,
            self.config.num_availability_zones,
        )
    }

    /// Current healthy zones. Publishes the failed set, diffs it against the
    /// previous pass and warns on newly failed / newly recovered zones.
    async fn non_failed_sub_locations(&self) -> ClusterResult<Vec<Location>> {
        let location = self.require_single_location().await?;
        let sub_locations = self.find_sub_locations_checked(&location)?;
        let previously_failed = self.sensors.failed_sub_locations().await;

        let mut healthy = Vec::new();
        let mut failed = BTreeSet::new();
        for sub in sub_locations {
            if self.detector.has_failed(&sub) {
                failed.insert(sub.id().clone());
            } else {
                healthy.push(sub);
            }
        }

        let newly_failed: Vec<_> = failed.difference(&previously_failed).cloned().collect();
        let newly_recovered: Vec<_> = previously_failed.difference(&failed).cloned().collect();
        if !newly_failed.is_empty() {
            warn!(cluster = %self.id, zones = ?newly_failed, "detected probable zone failures");
        }
        if !newly_recovered.is_empty() {
            warn!(cluster = %self.id, zones = ?newly_recovered, "detected probable zone recoveries");
        }

        self.sensors.set_failed_sub_locations(failed).await;
        self.sensors.set_sub_locations(healthy.clone()).await;
        Ok(healthy)
    }

    async fn members_by_location(&self) -> MembersByLocation {
        let mut by_location = MembersByLocation::new();
        for member in self.members.read().await.iter() {
            if let Some(location) = member.locations().into_iter().next() {
                by_location
                    .entry(location.id().clone())
                    .or_default()
                    .push(Arc::clone(member));
            }
        }
        by_location
    }

    async fn require_single_location(&self) -> ClusterResult<Location> {
        let locations = self.locations.read().await;
        match locations.len() {
            0 => Err(ClusterError::NoLocation {
                cluster: self.id.clone(),
            }),
            1 => Ok(locations[0].clone()),
            n => Err(ClusterError::AmbiguousLocation {
                cluster: self.id.clone(),
                count: n,
            }),
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    fn initial_quorum_size(&self) -> usize {
        let initial_size = self.config.initial_size;
        let configured = self.config.initial_quorum_size;
        if configured < 0 {
            return initial_size;
        }
        let configured = configured as usize;
        if configured > initial_size {
            warn!(
                cluster = %self.id,
                quorum = configured,
                initial = initial_size,
                "misconfigured initial quorum size greater than initial size; using initial size"
            );
            initial_size
        } else {
            configured
        }
    }

    async fn start_health_feed(&self) {
        let members = Arc::clone(&self.members);
        let sensors = Arc::clone(&self.sensors);
        let quorum = self.up_quorum;
        let interval = self.config.health_poll_interval();
        let shutdown = self.health.shutdown_signal();
        let runtime = self.runtime.clone();

        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = runtime.sleep(interval) => {
                        // reads without the resize mutex; a stale view
                        // self-corrects on the next poll
                        let snapshot = members.read().await.clone();
                        let expected = sensors.expected_state().await;
                        sensors
                            .set_one_and_all_members_up(health::one_and_all_members_up(&snapshot, expected))
                            .await;
                        sensors
                            .set_service_up(health::service_up_quorum(&snapshot, quorum))
                            .await;
                    }
                    _ = shutdown.notified() => {
                        debug!("health poll shutting down");
                        break;
                    }
                }
            }
        });

        self.health.attach(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::InMemoryEntityManager;
    use crate::location::LocationId;
    use shoal_core::runtime::TokioRuntime;

    fn location() -> Location {
        Location::new(LocationId::new("loc-1").unwrap())
    }

    fn controller(
        config: ClusterConfig,
    ) -> (
        Arc<InMemoryEntityManager>,
        ClusterController<InMemoryEntityManager, TokioRuntime>,
    ) {
        let manager = Arc::new(InMemoryEntityManager::new());
        let cluster = ClusterController::new(
            "cluster-1",
            config,
            Arc::clone(&manager),
            TokioRuntime,
            &StrategyRegistry::with_defaults(),
        )
        .unwrap();
        (manager, cluster)
    }

    #[tokio::test]
    async fn test_start_grows_to_initial_size() {
        let (_, cluster) = controller(ClusterConfig::for_testing(3));
        cluster.start(vec![location()]).await.unwrap();

        assert_eq!(cluster.current_size().await, 3);
        assert_eq!(cluster.sensors().expected_state().await, Lifecycle::Running);
        assert!(cluster.health_feed_running().await);
    }

    #[tokio::test]
    async fn test_start_without_location_fails() {
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        let err = cluster.start(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoLocation { .. }));
    }

    #[tokio::test]
    async fn test_start_with_several_locations_fails() {
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        let other = Location::new(LocationId::new("loc-2").unwrap());
        let err = cluster.start(vec![location(), other]).await.unwrap_err();
        assert!(matches!(err, ClusterError::AmbiguousLocation { .. }));
    }

    #[tokio::test]
    async fn test_resize_is_idempotent() {
        let (_, cluster) = controller(ClusterConfig::for_testing(2));
        cluster.start(vec![location()]).await.unwrap();

        assert_eq!(cluster.resize(4).await.unwrap(), 4);
        assert_eq!(cluster.resize(4).await.unwrap(), 4);
        assert_eq!(cluster.resize(1).await.unwrap(), 1);
        assert_eq!(cluster.resize(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resize_by_delta_zero_is_empty() {
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        cluster.start(vec![location()]).await.unwrap();
        assert!(cluster.resize_by_delta(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordinals_are_unique_across_resizes() {
        let (_, cluster) = controller(ClusterConfig::for_testing(2));
        cluster.start(vec![location()]).await.unwrap();
        cluster.resize(0).await.unwrap();
        cluster.resize(2).await.unwrap();

        let ordinals: Vec<_> = cluster
            .members()
            .await
            .iter()
            .map(|m| m.cluster_member_id().unwrap())
            .collect();
        assert_eq!(ordinals, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_shrink_clamps_to_current_size() {
        let (_, cluster) = controller(ClusterConfig::for_testing(2));
        cluster.start(vec![location()]).await.unwrap();

        let removed = cluster.resize_by_delta(-10).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(cluster.current_size().await, 0);
    }

    #[tokio::test]
    async fn test_shrink_unmanages_victims() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(2));
        cluster.start(vec![location()]).await.unwrap();

        let removed = cluster.resize_by_delta(-1).await.unwrap();
        assert!(!manager.is_managed(removed[0].id()).await);
        assert_eq!(cluster.current_size().await, 1);
    }

    #[tokio::test]
    async fn test_stop_empties_cluster() {
        let (_, cluster) = controller(ClusterConfig::for_testing(3));
        cluster.start(vec![location()]).await.unwrap();
        cluster.stop().await.unwrap();

        assert_eq!(cluster.current_size().await, 0);
        assert_eq!(cluster.sensors().expected_state().await, Lifecycle::Stopped);
        assert!(!cluster.health_feed_running().await);
    }

    #[tokio::test]
    async fn test_failed_member_is_quarantined() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(3));
        manager.failure_plan().fail_start_of(1);
        let mut events = cluster.sensors().subscribe_quarantined();

        cluster.start(vec![location()]).await.unwrap_err();

        assert_eq!(cluster.current_size().await, 2);
        let group = cluster.sensors().quarantine_group().await.unwrap();
        assert_eq!(group.len().await, 1);

        let quarantined_id = events.recv().await.unwrap();
        assert!(group.contains(&quarantined_id).await);
        assert!(!cluster.is_member(&quarantined_id).await);
    }

    #[tokio::test]
    async fn test_failed_member_is_discarded_without_quarantine() {
        let (manager, cluster) =
            controller(ClusterConfig::for_testing(3).without_quarantine().with_initial_quorum_size(2));
        manager.failure_plan().fail_start_of(1);

        cluster.start(vec![location()]).await.unwrap();

        assert_eq!(cluster.current_size().await, 2);
        assert_eq!(manager.managed_count().await, 2);
    }

    #[tokio::test]
    async fn test_quorum_not_reached_sets_problem_and_running() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(3));
        manager.failure_plan().fail_start_of(0);

        let err = cluster.start(vec![location()]).await.unwrap_err();
        assert!(matches!(err, ClusterError::QuorumNotReached { .. }));

        assert_eq!(cluster.sensors().expected_state().await, Lifecycle::Running);
        assert!(cluster.sensors().problem(PROBLEM_START).await.is_some());
    }

    #[tokio::test]
    async fn test_restart_is_unsupported() {
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        assert!(matches!(
            cluster.restart(),
            Err(ClusterError::NotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_member_keeps_size_and_mints_fresh_ordinal() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(2));
        cluster.start(vec![location()]).await.unwrap();

        let old = cluster.members().await[0].clone();
        let new_id = cluster.replace_member(old.id()).await.unwrap();

        assert_eq!(cluster.current_size().await, 2);
        assert!(!cluster.is_member(old.id()).await);
        assert!(!manager.is_managed(old.id()).await);

        let replacement = manager.resolve(&new_id).await.unwrap();
        assert!(replacement.cluster_member_id() > old.cluster_member_id());
    }

    #[tokio::test]
    async fn test_replace_member_unknown_id() {
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        cluster.start(vec![location()]).await.unwrap();

        let err = cluster
            .replace_member(&MemberId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoSuchMember { .. }));
    }

    #[tokio::test]
    async fn test_replace_member_grow_failure_keeps_old_member() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(1));
        cluster.start(vec![location()]).await.unwrap();
        let old = cluster.members().await[0].clone();

        // the next minted member (ordinal 1) will fail to start
        manager.failure_plan().fail_start_of(1);

        let err = cluster.replace_member(old.id()).await.unwrap_err();
        assert!(matches!(err, ClusterError::GrowFailed { .. }));
        assert!(cluster.is_member(old.id()).await);
    }

    #[tokio::test]
    async fn test_replace_member_stop_failure_after_replacement_live() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(1));
        cluster.start(vec![location()]).await.unwrap();
        let old = cluster.members().await[0].clone();
        manager
            .failure_plan()
            .fail_stop_of(old.cluster_member_id().unwrap());

        let err = cluster.replace_member(old.id()).await.unwrap_err();
        assert!(matches!(err, ClusterError::StopFailed { .. }));
        // the replacement is live despite the error
        assert_eq!(cluster.current_size().await, 1);
        assert!(!cluster.is_member(old.id()).await);
    }

    #[tokio::test]
    async fn test_policies_suspended_on_stop_resumed_on_start() {
        use crate::policy::CountingPolicy;
        let (_, cluster) = controller(ClusterConfig::for_testing(1));
        let policy = Arc::new(CountingPolicy::new());
        cluster.add_policy(policy.clone()).await;

        cluster.start(vec![location()]).await.unwrap();
        assert_eq!(policy.resume_count(), 1);
        assert!(!policy.is_suspended());

        cluster.stop().await.unwrap();
        assert!(policy.is_suspended());
    }

    #[tokio::test]
    async fn test_members_and_quarantine_stay_disjoint() {
        let (manager, cluster) = controller(ClusterConfig::for_testing(3));
        manager.failure_plan().fail_start_of(2);

        cluster.start(vec![location()]).await.unwrap_err();

        let group = cluster.sensors().quarantine_group().await.unwrap();
        for occupant in group.occupants().await {
            assert!(!cluster.is_member(occupant.id()).await);
        }
    }
}
