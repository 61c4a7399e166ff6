//! Strategy registration by stable name.
//!
//! The three pluggable strategies are resolved from an explicit per-context
//! registry rather than constructed reflectively from class names; each
//! controller is handed the registry to resolve its configured names against.

use crate::error::{ClusterError, ClusterResult};
use crate::failure::{ConsecutiveFailuresDetector, ZoneFailureDetector};
use crate::placement::{BalancedPlacement, ZonePlacementStrategy};
use crate::removal::{NewestFirstRemoval, RemovalStrategy};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the default removal strategy
pub const REMOVAL_NEWEST_FIRST: &str = "newest-first";
/// Name of the default zone placement strategy
pub const PLACEMENT_BALANCED: &str = "balanced";
/// Name of the default zone failure detector
pub const DETECTOR_CONSECUTIVE_FAILURES: &str = "consecutive-failures";

type RemovalFactory = Arc<dyn Fn() -> Arc<dyn RemovalStrategy> + Send + Sync>;
type PlacementFactory = Arc<dyn Fn() -> Arc<dyn ZonePlacementStrategy> + Send + Sync>;
type DetectorFactory = Arc<dyn Fn() -> Arc<dyn ZoneFailureDetector> + Send + Sync>;

/// Name-keyed registries for the pluggable strategies.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    removal: HashMap<String, RemovalFactory>,
    placement: HashMap<String, PlacementFactory>,
    detectors: HashMap<String, DetectorFactory>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock strategies pre-registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_removal(REMOVAL_NEWEST_FIRST, || Arc::new(NewestFirstRemoval));
        registry.register_placement(PLACEMENT_BALANCED, || Arc::new(BalancedPlacement));
        registry.register_detector(DETECTOR_CONSECUTIVE_FAILURES, || {
            Arc::new(ConsecutiveFailuresDetector::default())
        });
        registry
    }

    pub fn register_removal(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn RemovalStrategy> + Send + Sync + 'static,
    ) {
        self.removal.insert(name.into(), Arc::new(factory));
    }

    pub fn register_placement(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn ZonePlacementStrategy> + Send + Sync + 'static,
    ) {
        self.placement.insert(name.into(), Arc::new(factory));
    }

    pub fn register_detector(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn ZoneFailureDetector> + Send + Sync + 'static,
    ) {
        self.detectors.insert(name.into(), Arc::new(factory));
    }

    /// Resolve a removal strategy by name
    pub fn removal(&self, name: &str) -> ClusterResult<Arc<dyn RemovalStrategy>> {
        self.removal
            .get(name)
            .map(|f| f())
            .ok_or_else(|| ClusterError::UnknownStrategy {
                kind: "removal",
                name: name.to_string(),
            })
    }

    /// Resolve a zone placement strategy by name
    pub fn placement(&self, name: &str) -> ClusterResult<Arc<dyn ZonePlacementStrategy>> {
        self.placement
            .get(name)
            .map(|f| f())
            .ok_or_else(|| ClusterError::UnknownStrategy {
                kind: "placement",
                name: name.to_string(),
            })
    }

    /// Resolve a zone failure detector by name
    pub fn failure_detector(&self, name: &str) -> ClusterResult<Arc<dyn ZoneFailureDetector>> {
        self.detectors
            .get(name)
            .map(|f| f())
            .ok_or_else(|| ClusterError::UnknownStrategy {
                kind: "failure detector",
                name: name.to_string(),
            })
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("removal", &self.removal.keys().collect::<Vec<_>>())
            .field("placement", &self.placement.keys().collect::<Vec<_>>())
            .field("detectors", &self.detectors.keys().collect::<Vec<_>>())
            .finish()
    }
}
