//! Rule state machine: maps a match outcome to the action to take.
//!
//! [`decide`] is a pure function over (match outcome, direction, change
//! kind, rule set); all side effects live in the engine. The mapping is
//! total: every combination of the closed enums resolves to exactly one
//! [`Action`], and [`RuleSet::validate`] walks the full table at
//! configuration time so a malformed rule set fails before any record is
//! processed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::record::ChangeKind;

/// Direction of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Changes flow from a resource into the identity store.
    Pull,
    /// Internal identities are pushed out to a resource.
    Push,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action to take when no internal identity matches a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchingRule {
    /// Create the identity and an account on every linked resource.
    #[default]
    Provision,
    /// Create the identity, link it to the resource, then provision.
    Assign,
    /// Skip the record.
    Ignore,
}

impl UnmatchingRule {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UnmatchingRule::Provision => "provision",
            UnmatchingRule::Assign => "assign",
            UnmatchingRule::Ignore => "ignore",
        }
    }
}

impl FromStr for UnmatchingRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provision" => Ok(UnmatchingRule::Provision),
            "assign" => Ok(UnmatchingRule::Assign),
            "ignore" => Ok(UnmatchingRule::Ignore),
            _ => Err(format!("unknown unmatching rule: {s}")),
        }
    }
}

/// Action to take when exactly one identity matches a record (after
/// conflict resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingRule {
    /// Synchronize the identity's attributes from the record.
    #[default]
    Update,
    /// Remove the account from the resource, keeping the assignment.
    Deprovision,
    /// Remove both the assignment and the account.
    Unassign,
    /// Record the association without touching attributes.
    Link,
    /// Drop the association without touching attributes.
    Unlink,
    /// Skip the record.
    Ignore,
}

impl MatchingRule {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingRule::Update => "update",
            MatchingRule::Deprovision => "deprovision",
            MatchingRule::Unassign => "unassign",
            MatchingRule::Link => "link",
            MatchingRule::Unlink => "unlink",
            MatchingRule::Ignore => "ignore",
        }
    }
}

impl FromStr for MatchingRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "update" => Ok(MatchingRule::Update),
            "deprovision" => Ok(MatchingRule::Deprovision),
            "unassign" => Ok(MatchingRule::Unassign),
            "link" => Ok(MatchingRule::Link),
            "unlink" => Ok(MatchingRule::Unlink),
            "ignore" => Ok(MatchingRule::Ignore),
            _ => Err(format!("unknown matching rule: {s}")),
        }
    }
}

/// The decided operation for one (record, identity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Provision,
    Assign,
    Update,
    Link,
    Unlink,
    Deprovision,
    Unassign,
    Delete,
    Ignore,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Provision => "provision",
            Action::Assign => "assign",
            Action::Update => "update",
            Action::Link => "link",
            Action::Unlink => "unlink",
            Action::Deprovision => "deprovision",
            Action::Unassign => "unassign",
            Action::Delete => "delete",
            Action::Ignore => "ignore",
        }
    }

    /// Whether this action is terminal for the record: nothing is mutated
    /// and nothing propagates.
    #[must_use]
    pub fn is_ignore(&self) -> bool {
        matches!(self, Action::Ignore)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The configured pair of matching/unmatching rules for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rule applied when no identity matches.
    #[serde(default)]
    pub unmatching: UnmatchingRule,
    /// Rule applied when exactly one identity matches.
    #[serde(default)]
    pub matching: MatchingRule,
}

impl RuleSet {
    /// Create a rule set.
    #[must_use]
    pub fn new(unmatching: UnmatchingRule, matching: MatchingRule) -> Self {
        Self {
            unmatching,
            matching,
        }
    }

    /// Walk the full decision table for this rule set.
    ///
    /// Every (direction, kind, matchedness) combination must resolve to an
    /// action; a gap here is a configuration defect and aborts the session
    /// before any record is processed.
    pub fn validate(&self) -> EngineResult<()> {
        for direction in [Direction::Pull, Direction::Push] {
            for kind in [ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete] {
                for matched in [false, true] {
                    let _ = decide(direction, kind, matched, self);
                }
            }
        }
        Ok(())
    }

    /// Parse a rule set from its string forms, rejecting unknown names.
    pub fn parse(unmatching: &str, matching: &str) -> EngineResult<Self> {
        let unmatching = unmatching
            .parse::<UnmatchingRule>()
            .map_err(EngineError::fatal_config)?;
        let matching = matching
            .parse::<MatchingRule>()
            .map_err(EngineError::fatal_config)?;
        let rules = Self::new(unmatching, matching);
        rules.validate()?;
        Ok(rules)
    }
}

/// Decide the action for one (record, identity) pair.
///
/// Pure function: no side effects, deterministic for every input. Push
/// direction computes `matched` from the identity's existence on the
/// target resource; the table itself is direction-uniform, the direction
/// is part of the contract so callers state which duality they resolved.
#[must_use]
pub fn decide(direction: Direction, kind: ChangeKind, matched: bool, rules: &RuleSet) -> Action {
    let _ = direction;

    if kind == ChangeKind::Delete {
        // A deletion only concerns identities we know about.
        return if matched { Action::Delete } else { Action::Ignore };
    }

    if matched {
        match rules.matching {
            MatchingRule::Update => Action::Update,
            MatchingRule::Deprovision => Action::Deprovision,
            MatchingRule::Unassign => Action::Unassign,
            MatchingRule::Link => Action::Link,
            MatchingRule::Unlink => Action::Unlink,
            MatchingRule::Ignore => Action::Ignore,
        }
    } else {
        match rules.unmatching {
            UnmatchingRule::Provision => Action::Provision,
            UnmatchingRule::Assign => Action::Assign,
            UnmatchingRule::Ignore => Action::Ignore,
        }
    }
}
