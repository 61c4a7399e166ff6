//! Locations and availability zones.
//!
//! A location is a node in a containment tree: a cloud region contains
//! availability zones, a zone contains provisioned machines. Members record
//! the location they were started in; zone-aware placement walks ancestor
//! chains to map a member back to its fault domain.

use crate::error::{ClusterError, ClusterResult};
use serde::{Deserialize, Serialize};
use shoal_core::constants::LOCATION_ID_LENGTH_BYTES_MAX;
use std::fmt;
use tracing::info;

/// Unique identifier for a location
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LocationId(String);

impl LocationId {
    /// Create a new LocationId with validation
    ///
    /// # Errors
    /// Returns error if the id is empty, too long, or contains characters
    /// outside alphanumerics, dashes, underscores and dots.
    pub fn new(id: impl Into<String>) -> ClusterResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(ClusterError::InvalidId {
                id,
                reason: "location ID cannot be empty".into(),
            });
        }
        if id.len() > LOCATION_ID_LENGTH_BYTES_MAX {
            return Err(ClusterError::InvalidId {
                reason: format!(
                    "location ID length {} exceeds limit {}",
                    id.len(),
                    LOCATION_ID_LENGTH_BYTES_MAX
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
                reason: "location ID contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for LocationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A location in the containment tree.
///
/// Carries its ancestor ids (nearest first) so containment checks never need
/// the tree itself; zone membership of a member's machine is decided by
/// walking this chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    id: LocationId,
    display_name: String,
    /// Ancestor location ids, nearest first
    ancestors: Vec<LocationId>,
    /// Whether this location can provision machines directly
    provisions_machines: bool,
    /// Availability-zone capability, absent for plain locations
    zones: Option<ZoneExtension>,
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Location {}

impl Location {
    /// Create a root location
    pub fn new(id: LocationId) -> Self {
        let display_name = id.as_str().to_string();
        Self {
            id,
            display_name,
            ancestors: Vec::new(),
            provisions_machines: false,
            zones: None,
        }
    }

    /// Create a child of this location (a zone's machine, a nested context)
    pub fn child(&self, id: LocationId) -> Self {
        let mut ancestors = Vec::with_capacity(self.ancestors.len() + 1);
        ancestors.push(self.id.clone());
        ancestors.extend(self.ancestors.iter().cloned());

        let display_name = id.as_str().to_string();
        Self {
            id,
            display_name,
            ancestors,
            provisions_machines: false,
            zones: None,
        }
    }

    /// Set a display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Mark this location as able to provision machines
    pub fn provisioning(mut self) -> Self {
        self.provisions_machines = true;
        self
    }

    /// Attach availability zones. Each zone becomes a child of this location.
    pub fn with_zones(mut self, zone_ids: Vec<LocationId>) -> Self {
        let zones = zone_ids
            .into_iter()
            .map(|zid| self.child(zid).provisioning())
            .collect();
        self.zones = Some(ZoneExtension { zones });
        self
    }

    pub fn id(&self) -> &LocationId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Ancestor ids, nearest first
    pub fn ancestors(&self) -> &[LocationId] {
        &self.ancestors
    }

    pub fn provisions_machines(&self) -> bool {
        self.provisions_machines
    }

    /// Whether this location carries the availability-zone capability
    pub fn supports_zones(&self) -> bool {
        self.zones.is_some()
    }

    pub fn zone_extension(&self) -> Option<&ZoneExtension> {
        self.zones.as_ref()
    }

    /// Whether this location is the given location or contained within it
    pub fn is_or_descends_from(&self, other: &LocationId) -> bool {
        &self.id == other || self.ancestors.contains(other)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Availability-zone capability: enumerates the independent fault domains
/// under a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneExtension {
    zones: Vec<Location>,
}

impl ZoneExtension {
    /// All zones, in declaration order
    pub fn all_zones(&self) -> Vec<Location> {
        self.zones.clone()
    }

    /// The first `count` zones
    pub fn zones_by_count(&self, count: usize) -> Vec<Location> {
        self.zones.iter().take(count).cloned().collect()
    }

    /// Zones whose id matches any of the given names, capped at `names.len()`
    pub fn zones_by_name(&self, names: &[String]) -> Vec<Location> {
        self.zones
            .iter()
            .filter(|z| names.iter().any(|n| n == z.id().as_str()))
            .take(names.len())
            .cloned()
            .collect()
    }
}

/// Enumerate the sub-locations (zones) to place members across.
///
/// Selection precedence: explicit zone names, then a requested zone count,
/// then every zone the location offers. Inputs are validated before any
/// enumeration happens.
pub fn find_sub_locations(
    location: &Location,
    zone_names: &[String],
    num_zones: Option<usize>,
) -> ClusterResult<Vec<Location>> {
    let ext = location
        .zone_extension()
        .ok_or_else(|| ClusterError::ZonesNotSupported {
            location: location.id().to_string(),
        })?;

    let sub_locations = if !zone_names.is_empty() {
        let found = ext.zones_by_name(zone_names);
        if zone_names.len() > found.len() {
            return Err(ClusterError::ZoneCapacityExhausted {
                location: location.id().to_string(),
                required: zone_names.len(),
                available: found.len(),
            });
        }
        found
    } else if let Some(n) = num_zones {
        if n == 0 {
            return Err(ClusterError::invalid_configuration(
                "num_availability_zones",
                "must be greater than zero",
            ));
        }
        let found = ext.zones_by_count(n);
        if n > found.len() {
            return Err(ClusterError::ZoneCapacityExhausted {
                location: location.id().to_string(),
                required: n,
                available: found.len(),
            });
        }
        found
    } else {
        ext.all_zones()
    };

    info!(
        location = %location.id(),
        count = sub_locations.len(),
        "enumerated sub-locations"
    );
    Ok(sub_locations)
}
