//! Quarantine of failed members.

use crate::entity::{ClusterMember, MemberId};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Auxiliary group collecting members that failed to start.
///
/// Occupants are out of the active member set: shrink never touches them and
/// they do not count toward the cluster's size. They stay registered for
/// operator diagnosis until the cluster's stop sweep shuts their processes
/// down. The group itself has no start/stop lifecycle.
#[derive(Debug, Default)]
pub struct QuarantineGroup {
    occupants: RwLock<Vec<Arc<dyn ClusterMember>>>,
}

impl QuarantineGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a failed member to the quarantine
    pub async fn add_member(&self, member: Arc<dyn ClusterMember>) {
        debug!(member = %member.id(), "quarantining member");
        self.occupants.write().await.push(member);
    }

    /// Snapshot of the current occupants
    pub async fn occupants(&self) -> Vec<Arc<dyn ClusterMember>> {
        self.occupants.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.occupants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.occupants.read().await.is_empty()
    }

    pub async fn contains(&self, member_id: &MemberId) -> bool {
        self.occupants
            .read()
            .await
            .iter()
            .any(|m| m.id() == member_id)
    }

    /// Stop every startable occupant, logging failures without propagating.
    /// Used by the cluster's stoppable-children sweep during stop.
    pub async fn stop_startable_occupants(&self) {
        let occupants = self.occupants().await;
        for member in occupants.iter().filter(|m| m.is_startable()) {
            if let Err(e) = member.stop().await {
                warn!(member = %member.id(), error = %e, "failed to stop quarantined member");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CreateFlags, EntityManager, InMemoryEntityManager, MemberSpec};
    use crate::location::{Location, LocationId};

    async fn test_member(manager: &InMemoryEntityManager) -> Arc<dyn ClusterMember> {
        let location = Location::new(LocationId::new("loc-1").unwrap());
        manager
            .create_member(&MemberSpec::new("m"), &location, &CreateFlags::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_query() {
        let manager = InMemoryEntityManager::new();
        let group = QuarantineGroup::new();
        assert!(group.is_empty().await);

        let member = test_member(&manager).await;
        group.add_member(member.clone()).await;

        assert_eq!(group.len().await, 1);
        assert!(group.contains(member.id()).await);
    }

    #[tokio::test]
    async fn test_stop_sweep_stops_startable_occupants() {
        let manager = InMemoryEntityManager::new();
        let group = QuarantineGroup::new();
        let member = test_member(&manager).await;
        let location = Location::new(LocationId::new("loc-1").unwrap());
        member.start(&location).await.unwrap();
        group.add_member(member.clone()).await;

        group.stop_startable_occupants().await;
        assert_eq!(member.service_up(), Some(false));
    }
}
