//! Service-health aggregation.
//!
//! The controller publishes two health sensors: `service_up`, a quorum check
//! over member `service_up` sensors, and `cluster_one_and_all_members_up`,
//! which is only true when every member is up and the cluster is expected to
//! be running. Both are recomputed on a periodic poll; the poll reads member
//! state without the resize mutex, so a momentarily stale value self-corrects
//! on the next tick.

use crate::entity::ClusterMember;
use crate::sensors::Lifecycle;
use serde::{Deserialize, Serialize};
use shoal_core::runtime::JoinHandle;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

// =============================================================================
// Quorum checks
// =============================================================================

/// Predicate deciding whether enough members are up for the cluster to count
/// as up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumCheck {
    /// Every member must be up (vacuously true when empty)
    All,
    /// Every member must be up, and there must be at least one
    AllAndAtLeastOne,
    /// At least one member must be up
    AtLeastOne,
    /// At least one member must be up, unless there are no members at all
    AtLeastOneUnlessEmpty,
    /// At least the given number of members must be up
    AtLeast(usize),
}

impl QuorumCheck {
    /// Evaluate the predicate for `up` healthy members out of `total`
    pub fn is_met(&self, up: usize, total: usize) -> bool {
        debug_assert!(up <= total, "up cannot exceed total");
        match self {
            Self::All => up == total,
            Self::AllAndAtLeastOne => up == total && up >= 1,
            Self::AtLeastOne => up >= 1,
            Self::AtLeastOneUnlessEmpty => total == 0 || up >= 1,
            Self::AtLeast(n) => up >= *n,
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Compute the `cluster_one_and_all_members_up` sensor value:
/// false when there are no members, false unless the expected state is
/// Running, false if any member's `service_up` is not affirmatively true.
pub fn one_and_all_members_up(members: &[Arc<dyn ClusterMember>], expected: Lifecycle) -> bool {
    if members.is_empty() {
        return false;
    }
    if expected != Lifecycle::Running {
        return false;
    }
    members.iter().all(|m| m.service_up() == Some(true))
}

/// Compute the quorum-checked `service_up` sensor over members only
pub fn service_up_quorum(members: &[Arc<dyn ClusterMember>], quorum: QuorumCheck) -> bool {
    let up = members
        .iter()
        .filter(|m| m.service_up() == Some(true))
        .count();
    quorum.is_met(up, members.len())
}

// =============================================================================
// Feed handle
// =============================================================================

/// Handle to the periodic health poll task.
///
/// The controller spawns the loop and parks its join handle here; stopping
/// the feed signals the loop and awaits its exit.
#[derive(Default)]
pub struct HealthFeed {
    shutdown: Arc<Notify>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl HealthFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shutdown signal to select against inside the poll loop
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Park the spawned poll task; a previous task is signalled away first.
    pub async fn attach(&self, task: JoinHandle<()>) {
        self.shutdown.notify_waiters();
        *self.task.write().await = Some(task);
    }

    /// Whether a poll task is currently attached
    pub async fn is_running(&self) -> bool {
        self.task.read().await.is_some()
    }

    /// Signal the poll loop and wait for it to finish
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.write().await.take() {
            if task.await.is_err() {
                debug!("health poll task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for HealthFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthFeed").finish_non_exhaustive()
    }
}
