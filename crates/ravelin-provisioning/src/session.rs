//! Per-run session context.
//!
//! A [`ReconciliationSession`] is created for one run, threaded explicitly
//! through every call, and discarded (or kept for inspection) when the run
//! completes. The reporter is the only state mutated concurrently; the
//! cancellation flag is cooperative: in-flight work finishes, nothing new
//! is scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ravelin_connector::types::ResourceRef;

use crate::identity::AnyTypeKind;
use crate::matcher::ConflictResolution;
use crate::report::{RenderedReport, ReportLevel, Reporter};
use crate::rules::{Direction, RuleSet};

/// Immutable per-run context for one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconciliationSession {
    /// The resource this run reads from (pull) or writes to (push).
    pub resource: ResourceRef,
    /// Run direction.
    pub direction: Direction,
    /// Kind of identity objects this run reconciles.
    pub any_type: AnyTypeKind,
    /// Policy for ambiguous matches.
    pub conflict_resolution: ConflictResolution,
    /// Matching/unmatching rules.
    pub rules: RuleSet,
    /// Who (or what) triggered the run; recorded for auditing.
    pub executor: String,
    /// When set, connector calls are replaced with no-ops that report
    /// success; used for previewing effects.
    pub dry_run: bool,
    reporter: Reporter,
    cancelled: Arc<AtomicBool>,
}

impl ReconciliationSession {
    /// Create a session with default policy and rules.
    #[must_use]
    pub fn new(resource: ResourceRef, direction: Direction) -> Self {
        Self {
            resource,
            direction,
            any_type: AnyTypeKind::default(),
            conflict_resolution: ConflictResolution::default(),
            rules: RuleSet::default(),
            executor: "system".to_string(),
            dry_run: false,
            reporter: Reporter::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the identity kind this run reconciles.
    #[must_use]
    pub fn with_any_type(mut self, any_type: AnyTypeKind) -> Self {
        self.any_type = any_type;
        self
    }

    /// Set the conflict-resolution policy.
    #[must_use]
    pub fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    /// Set the matching/unmatching rules.
    #[must_use]
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Record who triggered the run.
    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Enable or disable dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The session's result collection.
    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Request cancellation. In-flight tasks finish; nothing new is
    /// scheduled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Render the accumulated report at the given level.
    #[must_use]
    pub fn report(&self, level: ReportLevel) -> RenderedReport {
        self.reporter.render(level)
    }
}
