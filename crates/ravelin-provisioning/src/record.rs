//! Normalized change records.
//!
//! A [`ChangeRecord`] is the immutable, engine-facing form of a raw change
//! notification. Hooks that rewrite a record's payload produce a new value
//! via [`ChangeRecord::with_attributes`]; records are never mutated in
//! place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use ravelin_connector::traits::{RawChange, RawChangeKind};
use ravelin_connector::types::{AttributeSet, Uid};

/// What happened to the object on the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new object appeared.
    Create,
    /// An existing object changed.
    Update,
    /// The object was removed.
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<RawChangeKind> for ChangeKind {
    fn from(kind: RawChangeKind) -> Self {
        match kind {
            RawChangeKind::Create => ChangeKind::Create,
            RawChangeKind::Update => ChangeKind::Update,
            RawChangeKind::Delete => ChangeKind::Delete,
        }
    }
}

/// One detected change on a resource, normalized for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Resource-native identifier of the changed object.
    pub object_uid: Uid,
    /// Change kind.
    pub kind: ChangeKind,
    /// Object class on the resource.
    pub object_class: String,
    /// Attribute payload; empty for delete records.
    pub attributes: AttributeSet,
    /// Opaque change-tracking cursor this record was read under.
    pub token: Option<String>,
    /// When the source system says the change happened.
    pub detected_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// Create a record directly (normally produced by [`RecordNormalizer`]).
    pub fn new(
        object_uid: Uid,
        kind: ChangeKind,
        object_class: impl Into<String>,
        attributes: AttributeSet,
    ) -> Self {
        Self {
            object_uid,
            kind,
            object_class: object_class.into(),
            attributes,
            token: None,
            detected_at: None,
        }
    }

    /// The resource-native key value of the changed object.
    #[must_use]
    pub fn key_value(&self) -> &str {
        self.object_uid.value()
    }

    /// Whether this record describes a deletion.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    /// A copy of this record with a rewritten attribute payload.
    #[must_use]
    pub fn with_attributes(&self, attributes: AttributeSet) -> Self {
        Self {
            attributes,
            ..self.clone()
        }
    }
}

/// Error produced while normalizing a raw change.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// Create/update notifications must carry the object's attributes.
    #[error("change for {uid} has no attribute payload")]
    MissingAttributes { uid: String },

    /// The notification's object identifier is empty.
    #[error("change has an empty object identifier")]
    EmptyUid,
}

/// Turns raw connector change notifications into [`ChangeRecord`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordNormalizer;

impl RecordNormalizer {
    /// Create a normalizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Normalize one raw change read under the given sync token.
    ///
    /// Create/update notifications without a payload are rejected. Delete
    /// notifications keep the last-known attributes when the source
    /// provides them (they feed correlation), else an empty set.
    pub fn normalize(
        &self,
        raw: RawChange,
        token: Option<&str>,
    ) -> Result<ChangeRecord, NormalizeError> {
        if raw.uid.value().is_empty() {
            return Err(NormalizeError::EmptyUid);
        }

        let kind = ChangeKind::from(raw.kind);
        let attributes = match (kind, raw.attributes) {
            (ChangeKind::Delete, attrs) => attrs.unwrap_or_default(),
            (_, Some(attrs)) => attrs,
            (_, None) => {
                return Err(NormalizeError::MissingAttributes {
                    uid: raw.uid.to_string(),
                })
            }
        };

        Ok(ChangeRecord {
            object_uid: raw.uid,
            kind,
            object_class: raw.object_class,
            attributes,
            token: token.map(ToString::to_string),
            detected_at: raw.timestamp,
        })
    }
}
