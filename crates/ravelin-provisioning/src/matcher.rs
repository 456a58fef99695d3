//! Match resolution: correlating a change record to internal identities.
//!
//! A [`CorrelationRule`] proposes candidate identities for a record; the
//! [`MatchResolver`] dedups the candidates (preserving discovery order) and
//! applies the configured [`ConflictResolution`] policy when more than one
//! identity matches. A failing rule is a record-level failure, never an
//! "unmatched" outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use ravelin_connector::ids::IdentityId;

use crate::error::{EngineError, EngineResult};
use crate::record::ChangeRecord;

/// Policy for resolving a record that matches more than one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Discard the record.
    Ignore,
    /// Keep the first identity in discovery order.
    #[default]
    FirstMatch,
    /// Keep the last identity in discovery order.
    LastMatch,
    /// Fan the record out to every matched identity independently.
    All,
}

impl ConflictResolution {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Ignore => "ignore",
            ConflictResolution::FirstMatch => "first_match",
            ConflictResolution::LastMatch => "last_match",
            ConflictResolution::All => "all",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of correlating one record, before conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// No internal identity corresponds to the record.
    Unmatched,
    /// One or more identities correspond to the record, in discovery order.
    Matched(Vec<IdentityId>),
}

impl MatchOutcome {
    /// Whether at least one identity matched.
    #[must_use]
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }

    /// The matched identities, empty when unmatched.
    #[must_use]
    pub fn candidates(&self) -> &[IdentityId] {
        match self {
            MatchOutcome::Unmatched => &[],
            MatchOutcome::Matched(ids) => ids,
        }
    }
}

/// Outcome of correlation after conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMatch {
    /// Conflict policy IGNORE discarded an ambiguous record.
    Ignored,
    /// No identity matched.
    Unmatched,
    /// The identities to process; more than one only under policy ALL.
    Matched(Vec<IdentityId>),
}

/// Pluggable correlation: proposes internal identities for a record.
#[async_trait]
pub trait CorrelationRule: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    /// Return candidate identity ids in discovery order.
    ///
    /// An error here is fatal for the record (not for the session) and is
    /// reported as a correlation failure.
    async fn correlate(&self, record: &ChangeRecord) -> EngineResult<Vec<IdentityId>>;
}

/// Lookup seam the attribute-equality rule uses to find identities.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Find identities whose attribute equals the given value, in
    /// discovery order.
    async fn find_by_attribute(&self, name: &str, value: &str) -> EngineResult<Vec<IdentityId>>;
}

/// Correlation by equality on a single attribute.
///
/// Compares the record attribute named `record_attribute` against the
/// identity attribute named `identity_attribute`. Records lacking the
/// attribute are unmatched.
pub struct AttributeEqualityRule {
    record_attribute: String,
    identity_attribute: String,
    lookup: Arc<dyn IdentityLookup>,
}

impl AttributeEqualityRule {
    /// Create a rule comparing the two named attributes.
    pub fn new(
        record_attribute: impl Into<String>,
        identity_attribute: impl Into<String>,
        lookup: Arc<dyn IdentityLookup>,
    ) -> Self {
        Self {
            record_attribute: record_attribute.into(),
            identity_attribute: identity_attribute.into(),
            lookup,
        }
    }
}

#[async_trait]
impl CorrelationRule for AttributeEqualityRule {
    fn name(&self) -> &str {
        "attribute-equality"
    }

    async fn correlate(&self, record: &ChangeRecord) -> EngineResult<Vec<IdentityId>> {
        let Some(value) = record.attributes.get_string(&self.record_attribute) else {
            debug!(
                attribute = %self.record_attribute,
                uid = %record.object_uid,
                "record has no correlation attribute"
            );
            return Ok(Vec::new());
        };

        self.lookup
            .find_by_attribute(&self.identity_attribute, value)
            .await
    }
}

/// Applies a [`CorrelationRule`] and the conflict-resolution policy.
#[derive(Clone)]
pub struct MatchResolver {
    policy: ConflictResolution,
}

impl MatchResolver {
    /// Create a resolver with the given policy.
    #[must_use]
    pub fn new(policy: ConflictResolution) -> Self {
        Self { policy }
    }

    /// The configured conflict-resolution policy.
    #[must_use]
    pub fn policy(&self) -> ConflictResolution {
        self.policy
    }

    /// Correlate the record without applying the conflict policy.
    pub async fn outcome(
        &self,
        record: &ChangeRecord,
        rule: &dyn CorrelationRule,
    ) -> EngineResult<MatchOutcome> {
        let candidates = rule
            .correlate(record)
            .await
            .map_err(|e| EngineError::correlation(format!("rule {}: {e}", rule.name())))?;

        // Dedup while preserving discovery order.
        let mut seen = HashSet::new();
        let mut matches: Vec<IdentityId> = Vec::with_capacity(candidates.len());
        for id in candidates {
            if seen.insert(id) {
                matches.push(id);
            }
        }

        debug!(
            uid = %record.object_uid,
            matches = matches.len(),
            policy = %self.policy,
            "correlation finished"
        );

        if matches.is_empty() {
            Ok(MatchOutcome::Unmatched)
        } else {
            Ok(MatchOutcome::Matched(matches))
        }
    }

    /// Correlate the record and resolve multiplicity.
    pub async fn resolve(
        &self,
        record: &ChangeRecord,
        rule: &dyn CorrelationRule,
    ) -> EngineResult<ResolvedMatch> {
        let outcome = self.outcome(record, rule).await?;
        let mut matches = match outcome {
            MatchOutcome::Unmatched => return Ok(ResolvedMatch::Unmatched),
            MatchOutcome::Matched(ids) => ids,
        };

        Ok(match matches.len() {
            1 => ResolvedMatch::Matched(matches),
            _ => match self.policy {
                ConflictResolution::Ignore => ResolvedMatch::Ignored,
                ConflictResolution::FirstMatch => {
                    matches.truncate(1);
                    ResolvedMatch::Matched(matches)
                }
                ConflictResolution::LastMatch => {
                    let last = matches.pop().map(|id| vec![id]).unwrap_or_default();
                    ResolvedMatch::Matched(last)
                }
                ConflictResolution::All => ResolvedMatch::Matched(matches),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravelin_connector::types::{AttributeSet, Uid};

    use crate::record::ChangeKind;

    struct FixedRule {
        ids: Vec<IdentityId>,
        fail: bool,
    }

    #[async_trait]
    impl CorrelationRule for FixedRule {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn correlate(&self, _record: &ChangeRecord) -> EngineResult<Vec<IdentityId>> {
            if self.fail {
                Err(EngineError::store("directory offline"))
            } else {
                Ok(self.ids.clone())
            }
        }
    }

    fn record() -> ChangeRecord {
        ChangeRecord::new(
            Uid::from_value("alice"),
            ChangeKind::Create,
            "user",
            AttributeSet::new().with("email", "alice@example.org"),
        )
    }

    #[tokio::test]
    async fn test_unmatched() {
        let resolver = MatchResolver::new(ConflictResolution::FirstMatch);
        let rule = FixedRule { ids: vec![], fail: false };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Unmatched);
    }

    #[tokio::test]
    async fn test_single_match() {
        let id = IdentityId::new();
        let resolver = MatchResolver::new(ConflictResolution::Ignore);
        let rule = FixedRule { ids: vec![id], fail: false };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Matched(vec![id]));
    }

    #[tokio::test]
    async fn test_first_match_keeps_discovery_order() {
        let first = IdentityId::new();
        let second = IdentityId::new();
        let third = IdentityId::new();

        let resolver = MatchResolver::new(ConflictResolution::FirstMatch);
        let rule = FixedRule { ids: vec![first, second, third], fail: false };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Matched(vec![first]));
    }

    #[tokio::test]
    async fn test_last_match() {
        let first = IdentityId::new();
        let last = IdentityId::new();

        let resolver = MatchResolver::new(ConflictResolution::LastMatch);
        let rule = FixedRule { ids: vec![first, last], fail: false };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Matched(vec![last]));
    }

    #[tokio::test]
    async fn test_all_fans_out() {
        let ids = vec![IdentityId::new(), IdentityId::new(), IdentityId::new()];
        let resolver = MatchResolver::new(ConflictResolution::All);
        let rule = FixedRule { ids: ids.clone(), fail: false };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Matched(ids));
    }

    #[tokio::test]
    async fn test_ignore_policy_discards_ambiguous() {
        let resolver = MatchResolver::new(ConflictResolution::Ignore);
        let rule = FixedRule {
            ids: vec![IdentityId::new(), IdentityId::new()],
            fail: false,
        };
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Ignored);
    }

    #[tokio::test]
    async fn test_duplicate_candidates_collapse() {
        let id = IdentityId::new();
        let resolver = MatchResolver::new(ConflictResolution::Ignore);
        let rule = FixedRule { ids: vec![id, id, id], fail: false };
        // Three reports of the same identity are one match, not a conflict.
        let resolved = resolver.resolve(&record(), &rule).await.unwrap();
        assert_eq!(resolved, ResolvedMatch::Matched(vec![id]));
    }

    #[tokio::test]
    async fn test_rule_failure_is_error_not_unmatched() {
        let resolver = MatchResolver::new(ConflictResolution::FirstMatch);
        let rule = FixedRule { ids: vec![], fail: true };
        let err = resolver.resolve(&record(), &rule).await.unwrap_err();
        assert!(matches!(err, EngineError::CorrelationFailed { .. }));
    }

    #[tokio::test]
    async fn test_attribute_equality_rule() {
        struct MapLookup {
            id: IdentityId,
        }

        #[async_trait]
        impl IdentityLookup for MapLookup {
            async fn find_by_attribute(
                &self,
                name: &str,
                value: &str,
            ) -> EngineResult<Vec<IdentityId>> {
                if name == "mail" && value == "alice@example.org" {
                    Ok(vec![self.id])
                } else {
                    Ok(vec![])
                }
            }
        }

        let id = IdentityId::new();
        let rule = AttributeEqualityRule::new("email", "mail", Arc::new(MapLookup { id }));

        let found = rule.correlate(&record()).await.unwrap();
        assert_eq!(found, vec![id]);

        // Record without the correlation attribute is unmatched, not an error.
        let bare = ChangeRecord::new(
            Uid::from_value("ghost"),
            ChangeKind::Create,
            "user",
            AttributeSet::new(),
        );
        assert!(rule.correlate(&bare).await.unwrap().is_empty());
    }
}
