//! Internal identity objects and their resource associations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ravelin_connector::ids::IdentityId;
use ravelin_connector::retry::BackoffPolicy;
use ravelin_connector::types::{AttributeSet, ResourceRef};

/// Kind of identity object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnyTypeKind {
    /// A person.
    #[default]
    User,
    /// A group of identities.
    Group,
    /// Any other object kind under identity management.
    Any,
}

impl AnyTypeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AnyTypeKind::User => "user",
            AnyTypeKind::Group => "group",
            AnyTypeKind::Any => "any",
        }
    }
}

impl fmt::Display for AnyTypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnyTypeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(AnyTypeKind::User),
            "group" => Ok(AnyTypeKind::Group),
            "any" => Ok(AnyTypeKind::Any),
            _ => Err(format!("unknown any-type kind: {s}")),
        }
    }
}

/// Link between an identity and one external resource.
///
/// Association order is significant: priority resources propagate
/// strictly in this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAssociation {
    /// The linked resource.
    pub resource: ResourceRef,
    /// Priority resources must succeed before best-effort ones are
    /// attempted; non-priority resources are best-effort.
    pub priority: bool,
    /// Retry policy for propagation calls to this resource.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Deadline for each individual connector call, in milliseconds.
    /// `None` leaves the connector's own limits in charge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl ResourceAssociation {
    /// Create an association with default retry behavior.
    #[must_use]
    pub fn new(resource: ResourceRef, priority: bool) -> Self {
        Self {
            resource,
            priority,
            backoff: BackoffPolicy::default(),
            call_timeout_ms: None,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// The per-call deadline, if configured.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// An internal identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Identity key.
    pub id: IdentityId,
    /// Object kind.
    pub kind: AnyTypeKind,
    /// Name, also used as the object's native key on resources.
    pub name: String,
    /// Current attributes.
    pub attributes: AttributeSet,
    /// Linked resources, in configured association order.
    pub associations: Vec<ResourceAssociation>,
}

impl Identity {
    /// Create an identity with no associations.
    pub fn new(id: IdentityId, kind: AnyTypeKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            attributes: AttributeSet::new(),
            associations: Vec::new(),
        }
    }

    /// Set the attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }

    /// Append an association, preserving order.
    #[must_use]
    pub fn with_association(mut self, association: ResourceAssociation) -> Self {
        self.associations.push(association);
        self
    }

    /// Find the association for a resource, if linked.
    #[must_use]
    pub fn association_for(
        &self,
        resource: &ravelin_connector::ids::ResourceId,
    ) -> Option<&ResourceAssociation> {
        self.associations.iter().find(|a| a.resource.id == *resource)
    }
}
