//! Capability-based connector traits.
//!
//! Connectors implement only the capabilities their target system supports.
//! The reconciliation engine consumes `ProvisioningOps` (full CRUD) for
//! propagation and `ChangeLogOp` for inbound change detection.

use async_trait::async_trait;

use crate::error::ConnectorResult;
use crate::types::{AttributeSet, Filter, Uid};

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Get the display name for this connector instance.
    fn display_name(&self) -> &str;

    /// Test the connection to the target system.
    ///
    /// Returns `Ok(())` if the target is reachable and credentials are
    /// accepted, or an error describing what went wrong.
    async fn test_connection(&self) -> ConnectorResult<()>;
}

/// Capability for creating objects in the target system.
#[async_trait]
pub trait CreateOp: Connector {
    /// Create a new object and return its identifier in the target system.
    async fn create(&self, object_class: &str, attributes: &AttributeSet) -> ConnectorResult<Uid>;
}

/// Capability for updating objects in the target system.
#[async_trait]
pub trait UpdateOp: Connector {
    /// Update an existing object, returning its (possibly changed) identifier.
    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        attributes: &AttributeSet,
    ) -> ConnectorResult<Uid>;
}

/// Capability for deleting objects from the target system.
#[async_trait]
pub trait DeleteOp: Connector {
    /// Delete an object from the target system.
    async fn delete(&self, object_class: &str, uid: &Uid) -> ConnectorResult<()>;
}

/// Capability for searching objects in the target system.
#[async_trait]
pub trait SearchOp: Connector {
    /// Search for objects matching the filter.
    async fn search(
        &self,
        object_class: &str,
        filter: Option<Filter>,
    ) -> ConnectorResult<Vec<AttributeSet>>;

    /// Read a single object by its identifier.
    ///
    /// Returns `Ok(None)` when the object does not exist.
    async fn get(&self, object_class: &str, uid: &Uid) -> ConnectorResult<Option<AttributeSet>> {
        let filter = Filter::eq(uid.attribute_name(), uid.value());
        let mut results = self.search(object_class, Some(filter)).await?;
        if results.is_empty() {
            Ok(None)
        } else {
            Ok(Some(results.swap_remove(0)))
        }
    }
}

/// Marker trait for connectors supporting the full operation set needed
/// for propagation.
pub trait ProvisioningOps: CreateOp + UpdateOp + DeleteOp + SearchOp {}

impl<T> ProvisioningOps for T where T: CreateOp + UpdateOp + DeleteOp + SearchOp {}

/// Kind of a raw change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawChangeKind {
    /// A new object appeared on the resource.
    Create,
    /// An existing object was modified.
    Update,
    /// An object disappeared from the resource.
    Delete,
}

impl std::fmt::Display for RawChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawChangeKind::Create => write!(f, "create"),
            RawChangeKind::Update => write!(f, "update"),
            RawChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A raw change notification as reported by a target system, before
/// normalization.
#[derive(Debug, Clone)]
pub struct RawChange {
    /// Identifier of the changed object.
    pub uid: Uid,
    /// What happened to the object.
    pub kind: RawChangeKind,
    /// The object class (e.g. "user", "group").
    pub object_class: String,
    /// Current attributes, when the source system provides them.
    pub attributes: Option<AttributeSet>,
    /// Timestamp of the change, when the source system provides one.
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl RawChange {
    /// A change describing a created object.
    pub fn created(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            kind: RawChangeKind::Create,
            object_class: object_class.into(),
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// A change describing an updated object.
    pub fn updated(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            kind: RawChangeKind::Update,
            object_class: object_class.into(),
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// A change describing a deleted object.
    pub fn deleted(uid: Uid, object_class: impl Into<String>) -> Self {
        Self {
            uid,
            kind: RawChangeKind::Delete,
            object_class: object_class.into(),
            attributes: None,
            timestamp: None,
        }
    }

    /// Set the change timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Result of fetching a batch of changes from a change log.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// The detected changes, in the order the source reported them.
    pub changes: Vec<RawChange>,
    /// The token to persist for the next fetch; `None` when unchanged.
    pub new_token: Option<String>,
    /// Whether more changes are available.
    pub has_more: bool,
}

impl ChangeBatch {
    /// An empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            changes: Vec::new(),
            new_token: None,
            has_more: false,
        }
    }

    /// A batch with the given changes.
    #[must_use]
    pub fn with_changes(changes: Vec<RawChange>) -> Self {
        Self {
            changes,
            new_token: None,
            has_more: false,
        }
    }

    /// Set the new change-tracking token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.new_token = Some(token.into());
        self
    }

    /// Mark that more changes remain to be fetched.
    #[must_use]
    pub fn with_more(mut self) -> Self {
        self.has_more = true;
        self
    }
}

/// Capability for change-log based synchronization.
///
/// The token is an opaque cursor into the target system's change stream
/// (an LDAP sync cookie, a database sequence number, a REST page cursor).
/// `None` means no previous sync: the connector should report all current
/// objects as create changes.
#[async_trait]
pub trait ChangeLogOp: Connector {
    /// Fetch changes recorded after the given token.
    async fn fetch_changes(
        &self,
        object_class: &str,
        token: Option<&str>,
        batch_size: u32,
    ) -> ConnectorResult<ChangeBatch>;

    /// Read the last persisted change-tracking token.
    async fn get_token(&self, object_class: &str) -> ConnectorResult<Option<String>>;

    /// Persist the change-tracking token for the next fetch.
    async fn set_token(&self, object_class: &str, token: &str) -> ConnectorResult<()>;
}
