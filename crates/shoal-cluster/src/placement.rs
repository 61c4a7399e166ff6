//! Zone placement strategies.

use crate::entity::ClusterMember;
use crate::error::{ClusterError, ClusterResult};
use crate::location::{Location, LocationId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Current members grouped by the location they occupy
pub type MembersByLocation = BTreeMap<LocationId, Vec<Arc<dyn ClusterMember>>>;

/// Distributes additions across zones and picks members to remove.
///
/// The controller treats implementations as black boxes but enforces the
/// count contract: exactly `n` locations / members must come back, drawn from
/// the supplied inputs.
pub trait ZonePlacementStrategy: Send + Sync {
    /// Choose `n` locations (repeats allowed) out of `available` for new
    /// members, given where the current members sit.
    fn locations_for_additions(
        &self,
        members_by_location: &MembersByLocation,
        available: &[Location],
        n: usize,
    ) -> ClusterResult<Vec<Location>>;

    /// Choose `n` members to remove out of the current members.
    fn entities_to_remove(
        &self,
        members_by_location: &MembersByLocation,
        n: usize,
    ) -> ClusterResult<Vec<Arc<dyn ClusterMember>>>;
}

/// Default strategy: keep zone populations level.
///
/// Additions fill the least-populated zone first; removals drain the
/// most-populated zone, newest occupant first. Ties resolve in zone id order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancedPlacement;

impl ZonePlacementStrategy for BalancedPlacement {
    fn locations_for_additions(
        &self,
        members_by_location: &MembersByLocation,
        available: &[Location],
        n: usize,
    ) -> ClusterResult<Vec<Location>> {
        if available.is_empty() {
            return Err(ClusterError::ZoneCapacityExhausted {
                location: "<none>".into(),
                required: n,
                available: 0,
            });
        }

        let mut counts: Vec<(usize, &Location)> = available
            .iter()
            .map(|loc| {
                let count = members_by_location
                    .get(loc.id())
                    .map(|members| members.len())
                    .unwrap_or(0);
                (count, loc)
            })
            .collect();

        let mut chosen = Vec::with_capacity(n);
        for _ in 0..n {
            // stable: min_by_key keeps the first (lowest zone id) on ties
            let slot = counts
                .iter_mut()
                .min_by_key(|(count, loc)| (*count, loc.id().clone()))
                .ok_or_else(|| ClusterError::internal("no candidate zones"))?;
            slot.0 += 1;
            chosen.push(slot.1.clone());
        }

        Ok(chosen)
    }

    fn entities_to_remove(
        &self,
        members_by_location: &MembersByLocation,
        n: usize,
    ) -> ClusterResult<Vec<Arc<dyn ClusterMember>>> {
        let mut pools: Vec<(LocationId, Vec<Arc<dyn ClusterMember>>)> = members_by_location
            .iter()
            .map(|(id, members)| (id.clone(), members.clone()))
            .collect();

        let mut victims = Vec::with_capacity(n);
        for _ in 0..n {
            let pool = pools
                .iter_mut()
                .max_by_key(|(id, members)| (members.len(), std::cmp::Reverse(id.clone())))
                .filter(|(_, members)| !members.is_empty())
                .ok_or_else(|| ClusterError::PlacementInvariant {
                    chosen: victims.len(),
                    expected: n,
                })?;
            // newest occupant of the fullest zone
            if let Some(victim) = pool.1.pop() {
                victims.push(victim);
            }
        }

        Ok(victims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        CreateFlags, EntityManager, InMemoryEntityManager, MemberSpec, FLAG_CLUSTER_MEMBER_ID,
    };

    fn zone(id: &str) -> Location {
        Location::new(LocationId::new(id).unwrap())
    }

    async fn member(manager: &InMemoryEntityManager, ordinal: u64, loc: &Location) -> Arc<dyn ClusterMember> {
        let mut flags = CreateFlags::new();
        flags.insert(FLAG_CLUSTER_MEMBER_ID.into(), ordinal.to_string());
        manager
            .create_member(&MemberSpec::new("m"), loc, &flags)
            .await
            .unwrap()
    }

    fn grouped(members: &[(&Location, Arc<dyn ClusterMember>)]) -> MembersByLocation {
        let mut map = MembersByLocation::new();
        for (loc, m) in members {
            map.entry(loc.id().clone()).or_default().push(m.clone());
        }
        map
    }

    #[test]
    fn test_additions_fill_empty_zones_evenly() {
        let zones = vec![zone("zone-a"), zone("zone-b")];
        let chosen = BalancedPlacement
            .locations_for_additions(&MembersByLocation::new(), &zones, 4)
            .unwrap();

        assert_eq!(chosen.len(), 4);
        let in_a = chosen.iter().filter(|l| l.id().as_str() == "zone-a").count();
        let in_b = chosen.iter().filter(|l| l.id().as_str() == "zone-b").count();
        assert_eq!((in_a, in_b), (2, 2));
    }

    #[tokio::test]
    async fn test_additions_prefer_less_populated_zone() {
        let za = zone("zone-a");
        let zb = zone("zone-b");
        let manager = InMemoryEntityManager::new();
        let m1 = member(&manager, 1, &za).await;
        let m2 = member(&manager, 2, &za).await;

        let members = grouped(&[(&za, m1), (&za, m2)]);
        let chosen = BalancedPlacement
            .locations_for_additions(&members, &[za.clone(), zb.clone()], 2)
            .unwrap();

        // both go to the empty zone
        assert!(chosen.iter().all(|l| l.id() == zb.id()));
    }

    #[test]
    fn test_additions_with_no_zones_fail() {
        let err = BalancedPlacement
            .locations_for_additions(&MembersByLocation::new(), &[], 1)
            .unwrap_err();
        assert!(matches!(err, ClusterError::ZoneCapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_removals_drain_fullest_zone() {
        let za = zone("zone-a");
        let zb = zone("zone-b");
        let manager = InMemoryEntityManager::new();
        let a1 = member(&manager, 1, &za).await;
        let a2 = member(&manager, 2, &za).await;
        let a3 = member(&manager, 3, &za).await;
        let b1 = member(&manager, 4, &zb).await;

        let members = grouped(&[(&za, a1), (&za, a2), (&za, a3.clone()), (&zb, b1)]);
        let victims = BalancedPlacement.entities_to_remove(&members, 2).unwrap();

        assert_eq!(victims.len(), 2);
        // newest occupant of the fullest zone goes first
        assert_eq!(victims[0].id(), a3.id());
    }

    #[tokio::test]
    async fn test_removals_beyond_population_fail() {
        let za = zone("zone-a");
        let manager = InMemoryEntityManager::new();
        let a1 = member(&manager, 1, &za).await;

        let members = grouped(&[(&za, a1)]);
        let err = BalancedPlacement.entities_to_remove(&members, 2).unwrap_err();
        assert!(matches!(err, ClusterError::PlacementInvariant { .. }));
    }
}
