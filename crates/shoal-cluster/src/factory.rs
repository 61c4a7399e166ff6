//! Minting of new cluster members.

use crate::entity::{
    ClusterMember, CreateFlags, EntityManager, MemberFactory, MemberSpec, FLAG_CLUSTER_MEMBER_ID,
};
use crate::error::{ClusterError, ClusterResult};
use crate::location::Location;
use crate::sensors::ClusterSensors;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Creates, parents and registers a single new member.
///
/// A member becomes part of the active set only after its parent link is
/// established and the management layer has accepted it; the append to the
/// member list is the last step.
pub struct NodeFactory<M: EntityManager> {
    cluster_id: String,
    manager: Arc<M>,
    sensors: Arc<ClusterSensors>,
    members: Arc<RwLock<Vec<Arc<dyn ClusterMember>>>>,
    member_spec: Option<MemberSpec>,
    first_member_spec: Option<MemberSpec>,
    member_factory: Option<Arc<dyn MemberFactory>>,
    custom_child_flags: CreateFlags,
}

impl<M: EntityManager> NodeFactory<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_id: String,
        manager: Arc<M>,
        sensors: Arc<ClusterSensors>,
        members: Arc<RwLock<Vec<Arc<dyn ClusterMember>>>>,
        member_spec: Option<MemberSpec>,
        first_member_spec: Option<MemberSpec>,
        member_factory: Option<Arc<dyn MemberFactory>>,
        custom_child_flags: CreateFlags,
    ) -> Self {
        Self {
            cluster_id,
            manager,
            sensors,
            members,
            member_spec,
            first_member_spec,
            member_factory,
            custom_child_flags,
        }
    }

    /// Mint one member in the given location and add it to the active set.
    pub async fn add_node(
        &self,
        location: &Location,
        extra_flags: &CreateFlags,
    ) -> ClusterResult<Arc<dyn ClusterMember>> {
        // Guard against callers that bypassed controller construction.
        self.sensors.next_member_id().ensure_initialized(0);

        let mut flags = self.custom_child_flags.clone();
        flags.extend(extra_flags.clone());
        let ordinal = self.sensors.next_member_id().get_and_increment();
        flags.insert(FLAG_CLUSTER_MEMBER_ID.to_string(), ordinal.to_string());

        debug!(
            cluster = %self.cluster_id,
            location = %location.id(),
            ordinal,
            "creating and adding a member"
        );

        let member = self.create_node(location, &flags).await?;

        if member.parent().is_none() {
            member.set_parent(&self.cluster_id);
        }
        member.tag_as_member(&self.cluster_id);

        self.manager.manage(&member).await?;

        self.members.write().await.push(Arc::clone(&member));
        Ok(member)
    }

    async fn create_node(
        &self,
        location: &Location,
        flags: &CreateFlags,
    ) -> ClusterResult<Arc<dyn ClusterMember>> {
        let first = self.members.read().await.is_empty();
        let spec = if first {
            self.first_member_spec.as_ref().or(self.member_spec.as_ref())
        } else {
            self.member_spec.as_ref()
        };

        if let Some(spec) = spec {
            return self.manager.create_member(spec, location, flags).await;
        }

        match &self.member_factory {
            Some(factory) => factory.new_member(location, flags),
            None => Err(ClusterError::NoMemberSpec {
                cluster: self.cluster_id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::InMemoryEntityManager;
    use crate::location::LocationId;

    fn location() -> Location {
        Location::new(LocationId::new("loc-1").unwrap())
    }

    fn factory_with_specs(
        manager: Arc<InMemoryEntityManager>,
        member_spec: Option<MemberSpec>,
        first_member_spec: Option<MemberSpec>,
    ) -> NodeFactory<InMemoryEntityManager> {
        let sensors = Arc::new(ClusterSensors::new());
        sensors.next_member_id().ensure_initialized(0);
        NodeFactory::new(
            "cluster-1".into(),
            manager,
            sensors,
            Arc::new(RwLock::new(Vec::new())),
            member_spec,
            first_member_spec,
            None,
            CreateFlags::new(),
        )
    }

    #[tokio::test]
    async fn test_add_node_assigns_increasing_ordinals() {
        let manager = Arc::new(InMemoryEntityManager::new());
        let factory =
            factory_with_specs(Arc::clone(&manager), Some(MemberSpec::new("web")), None);

        let a = factory.add_node(&location(), &CreateFlags::new()).await.unwrap();
        let b = factory.add_node(&location(), &CreateFlags::new()).await.unwrap();

        assert_eq!(a.cluster_member_id(), Some(0));
        assert_eq!(b.cluster_member_id(), Some(1));
        assert_eq!(factory.members.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_add_node_parents_tags_and_manages() {
        let manager = Arc::new(InMemoryEntityManager::new());
        let factory =
            factory_with_specs(Arc::clone(&manager), Some(MemberSpec::new("web")), None);

        let member = factory.add_node(&location(), &CreateFlags::new()).await.unwrap();

        assert_eq!(member.parent().as_deref(), Some("cluster-1"));
        assert!(manager.is_managed(member.id()).await);
    }

    #[tokio::test]
    async fn test_first_member_spec_used_once() {
        let manager = Arc::new(InMemoryEntityManager::new());
        let factory = factory_with_specs(
            Arc::clone(&manager),
            Some(MemberSpec::new("web")),
            Some(MemberSpec::new("seed")),
        );

        let first = factory.add_node(&location(), &CreateFlags::new()).await.unwrap();
        let second = factory.add_node(&location(), &CreateFlags::new()).await.unwrap();

        assert!(first.id().as_str().starts_with("seed-"));
        assert!(second.id().as_str().starts_with("web-"));
    }

    #[tokio::test]
    async fn test_no_spec_fails() {
        let manager = Arc::new(InMemoryEntityManager::new());
        let factory = factory_with_specs(Arc::clone(&manager), None, None);

        let err = factory
            .add_node(&location(), &CreateFlags::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoMemberSpec { .. }));
    }

    #[tokio::test]
    async fn test_extra_flags_override_custom_flags() {
        let manager = Arc::new(InMemoryEntityManager::new());
        let sensors = Arc::new(ClusterSensors::new());
        sensors.next_member_id().ensure_initialized(0);
        let mut custom = CreateFlags::new();
        custom.insert("tier".into(), "standard".into());
        let factory = NodeFactory::new(
            "cluster-1".into(),
            Arc::clone(&manager),
            sensors,
            Arc::new(RwLock::new(Vec::new())),
            Some(MemberSpec::new("web")),
            None,
            None,
            custom,
        );

        let mut extra = CreateFlags::new();
        extra.insert("tier".into(), "premium".into());
        // overlay order: custom flags, then extras, then the ordinal
        let member = factory.add_node(&location(), &extra).await.unwrap();
        assert_eq!(member.cluster_member_id(), Some(0));
    }
}
