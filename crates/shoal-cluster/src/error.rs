//! Cluster error types and the masked-result outcome carrier.

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Cluster-specific errors
#[derive(Error, Debug)]
pub enum ClusterError {
    /// No location available to start the cluster in
    #[error("no location available for cluster {cluster}")]
    NoLocation { cluster: String },

    /// More than one location after merging supplied and existing locations
    #[error("ambiguous location for cluster {cluster}: expected one, found {count}")]
    AmbiguousLocation { cluster: String, count: usize },

    /// Neither a member spec nor a legacy member factory is configured
    #[error("no member spec nor member factory supplied for cluster {cluster}")]
    NoMemberSpec { cluster: String },

    /// Replacement target is unknown or not currently a member
    #[error("entity {member_id} is not a member of cluster {cluster}")]
    NoSuchMember { cluster: String, member_id: String },

    /// Start finished but fewer than the initial quorum of members are live
    #[error("{message}")]
    QuorumNotReached {
        message: String,
        #[source]
        cause: Option<Box<ClusterError>>,
    },

    /// A required grow step produced no member
    #[error("in cluster {cluster}, failed to grow{}", detail_suffix(.detail))]
    GrowFailed {
        cluster: String,
        detail: Option<String>,
        #[source]
        cause: Option<Box<ClusterError>>,
    },

    /// Replacement succeeded but the old member failed to stop
    #[error("replacement is running but failed to stop and remove old member {member_id}")]
    StopFailed {
        member_id: String,
        #[source]
        cause: Box<ClusterError>,
    },

    /// Requested zones exceed the zones available under the location
    #[error("number of required zones ({required}) not satisfied in {location}; only {available} available")]
    ZoneCapacityExhausted {
        location: String,
        required: usize,
        available: usize,
    },

    /// Location has no availability-zone capability
    #[error("availability zones not supported for location {location}")]
    ZonesNotSupported { location: String },

    /// A placement strategy returned the wrong number of locations or members
    #[error("placement strategy chose {chosen}, when expected {expected}")]
    PlacementInvariant { chosen: usize, expected: usize },

    /// No strategy registered under the given name
    #[error("no {kind} strategy registered under name {name:?}")]
    UnknownStrategy { kind: &'static str, name: String },

    /// Operation intentionally unsupported on clusters
    #[error("operation {operation} is not supported")]
    NotSupported { operation: &'static str },

    /// Composite over per-member start failures; carries the first cause
    #[error("{count} member start failure(s)")]
    StartFailures {
        count: usize,
        #[source]
        first: Box<ClusterError>,
    },

    /// The awaiting thread was interrupted; treated as fatal
    #[error("interrupted while awaiting member tasks: {reason}")]
    Interrupted { reason: String },

    /// A member effector or the entity manager failed
    #[error("entity {member_id} failed: {reason}")]
    Entity { member_id: String, reason: String },

    /// Invalid identifier
    #[error("invalid identifier {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    /// A configuration value failed validation
    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] shoal_core::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(", {}", d),
        None => String::new(),
    }
}

impl ClusterError {
    /// Create an entity failure error
    pub fn entity(member_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Entity {
            member_id: member_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a batch of per-member errors into a single reportable error.
    ///
    /// A single error is returned as-is; several are wrapped with the first
    /// one kept as the cause.
    pub fn compound(mut errors: Vec<ClusterError>) -> Option<ClusterError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            n => Some(ClusterError::StartFailures {
                count: n,
                first: Box::new(errors.remove(0)),
            }),
        }
    }

    /// Fatal errors abort the whole operation and are never collected
    /// per-member.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

// =============================================================================
// MaskedResult
// =============================================================================

/// Outcome of an operation that may partially succeed.
///
/// Collected per-member failures do not fail the whole operation; instead the
/// successes are returned together with a masked aggregate error, and the
/// caller decides whether to surface it.
#[derive(Debug)]
pub enum MaskedResult<T> {
    /// Full success
    Ok(T),
    /// Partial success: value is usable, error already handled downstream
    MaskedError(T, ClusterError),
    /// Failure that must be surfaced; a partial value may still exist
    Thrown(Option<T>, ClusterError),
}

impl<T> MaskedResult<T> {
    /// The carried value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(v) | Self::MaskedError(v, _) => Some(v),
            Self::Thrown(v, _) => v.as_ref(),
        }
    }

    /// The carried error, if any
    pub fn error(&self) -> Option<&ClusterError> {
        match self {
            Self::Ok(_) => None,
            Self::MaskedError(_, e) | Self::Thrown(_, e) => Some(e),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    /// Take the value, treating a masked error as success and a thrown error
    /// as failure.
    pub fn into_masked(self) -> ClusterResult<T> {
        match self {
            Self::Ok(v) | Self::MaskedError(v, _) => Ok(v),
            Self::Thrown(_, e) => Err(e),
        }
    }

    /// Take the value and the masked error separately; thrown errors fail.
    pub fn into_parts(self) -> ClusterResult<(T, Option<ClusterError>)> {
        match self {
            Self::Ok(v) => Ok((v, None)),
            Self::MaskedError(v, e) => Ok((v, Some(e))),
            Self::Thrown(_, e) => Err(e),
        }
    }
}
