//! Victim selection for shrink operations.

use crate::entity::ClusterMember;
use std::sync::Arc;

/// Picks which member to drop when the cluster shrinks by one.
///
/// Any function of the same shape can be registered; see
/// [`crate::registry::StrategyRegistry`].
pub trait RemovalStrategy: Send + Sync {
    /// Select one member out of a non-empty candidate set. Returns `None`
    /// only when `candidates` is empty.
    fn select(&self, candidates: &[Arc<dyn ClusterMember>]) -> Option<Arc<dyn ClusterMember>>;
}

impl<F> RemovalStrategy for F
where
    F: Fn(&[Arc<dyn ClusterMember>]) -> Option<Arc<dyn ClusterMember>> + Send + Sync,
{
    fn select(&self, candidates: &[Arc<dyn ClusterMember>]) -> Option<Arc<dyn ClusterMember>> {
        self(candidates)
    }
}

/// Default strategy: drop the newest stoppable member.
///
/// "Newest" is judged by a larger cluster ordinal OR a later creation time;
/// both are checked so that legacy members created before ordinal assignment
/// still compare. Startable candidates win over non-startable ones; a
/// non-startable member is only chosen when no startable candidate was seen.
/// Ties keep the earlier candidate (iteration order is stable).
#[derive(Debug, Clone, Copy, Default)]
pub struct NewestFirstRemoval;

impl RemovalStrategy for NewestFirstRemoval {
    fn select(&self, candidates: &[Arc<dyn ClusterMember>]) -> Option<Arc<dyn ClusterMember>> {
        let mut largest_ordinal: Option<u64> = None;
        let mut newest_time: u64 = 0;
        let mut newest: Option<&Arc<dyn ClusterMember>> = None;

        for contender in candidates {
            let ordinal = contender.cluster_member_id();
            let created = contender.creation_time_ms();

            let newer = ordinal
                .map(|o| largest_ordinal.map(|l| o > l).unwrap_or(true))
                .unwrap_or(false)
                || created > newest_time;

            let chosen_is_startable = newest.map(|m| m.is_startable()).unwrap_or(false);
            let take = (contender.is_startable() && newer)
                || (!chosen_is_startable && (contender.is_startable() || newer));

            if take {
                newest = Some(contender);
                if let Some(o) = ordinal {
                    largest_ordinal = Some(o);
                }
                newest_time = created;
            }
        }

        newest.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        CreateFlags, EntityManager, InMemoryEntityManager, MemberSpec, FLAG_CLUSTER_MEMBER_ID,
    };
    use crate::location::{Location, LocationId};
    use shoal_core::io::IoContext;
    use std::sync::Arc;

    async fn member(
        manager: &InMemoryEntityManager,
        ordinal: Option<u64>,
        startable: bool,
    ) -> Arc<dyn ClusterMember> {
        let mut spec = MemberSpec::new("m");
        if !startable {
            spec = spec.non_startable();
        }
        let mut flags = CreateFlags::new();
        if let Some(o) = ordinal {
            flags.insert(FLAG_CLUSTER_MEMBER_ID.into(), o.to_string());
        }
        let location = Location::new(LocationId::new("loc-1").unwrap());
        manager.create_member(&spec, &location, &flags).await.unwrap()
    }

    #[tokio::test]
    async fn test_picks_highest_ordinal_among_startables() {
        use crate::entity::MockClock;
        // freeze the clock so ordinals alone decide newness
        let clock = Arc::new(MockClock::new(1_000));
        let io = IoContext::new(clock, Arc::new(shoal_core::io::StdRngProvider::new()));
        let manager = InMemoryEntityManager::with_io(io);
        let m1 = member(&manager, Some(1), false).await;
        let m2 = member(&manager, Some(5), true).await;
        let m3 = member(&manager, Some(3), true).await;

        let chosen = NewestFirstRemoval
            .select(&[m1, m2.clone(), m3])
            .expect("candidate expected");
        assert_eq!(chosen.id(), m2.id());
    }

    #[tokio::test]
    async fn test_falls_back_to_non_startable_when_none_startable() {
        let manager = InMemoryEntityManager::new();
        let m1 = member(&manager, Some(1), false).await;
        let m2 = member(&manager, Some(2), false).await;

        let chosen = NewestFirstRemoval
            .select(&[m1, m2.clone()])
            .expect("candidate expected");
        assert_eq!(chosen.id(), m2.id());
    }

    #[tokio::test]
    async fn test_legacy_members_compare_by_creation_time() {
        use crate::entity::MockClock;
        let clock = Arc::new(MockClock::new(1_000));
        let io = IoContext::new(clock.clone(), Arc::new(shoal_core::io::StdRngProvider::new()));
        let manager = InMemoryEntityManager::with_io(io);

        // neither carries an ordinal; the later-created one is newer
        let old = member(&manager, None, true).await;
        clock.advance(10_000);
        let young = member(&manager, None, true).await;

        let chosen = NewestFirstRemoval
            .select(&[old, young.clone()])
            .expect("candidate expected");
        assert_eq!(chosen.id(), young.id());
    }

    #[tokio::test]
    async fn test_empty_candidates_yield_none() {
        assert!(NewestFirstRemoval.select(&[]).is_none());
    }

    #[tokio::test]
    async fn test_closures_are_strategies() {
        let manager = InMemoryEntityManager::new();
        let m1 = member(&manager, Some(1), true).await;

        let oldest_first = |candidates: &[Arc<dyn ClusterMember>]| candidates.first().cloned();
        let chosen = oldest_first.select(&[m1.clone()]).expect("candidate expected");
        assert_eq!(chosen.id(), m1.id());
    }
}
