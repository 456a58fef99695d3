//! # Reconciliation & Propagation Engine
//!
//! Compares the state of identity records (users, groups, any-objects)
//! against their accounts on external resources, decides what to do, and
//! propagates the outcome to every linked resource with per-task retry and
//! partial-failure-tolerant reporting.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌────────────┐
//! │ Connector │──►│ Normalizer │──►│ Matcher  │──►│ Rule       │
//! │ (source)  │   │            │   │          │   │ Engine     │
//! └───────────┘   └────────────┘   └──────────┘   └─────┬──────┘
//!                                                       │
//!                       ┌───────────────┐   ┌───────────▼──────┐
//!                       │ Hook Pipeline │◄──│ Local mutation   │
//!                       └───────┬───────┘   │ (IdentityStore)  │
//!                               │           └───────────┬──────┘
//!                       ┌───────▼───────┐   ┌───────────▼──────┐
//!                       │ Report        │◄──│ Propagation      │
//!                       │ Aggregator    │   │ Executor         │
//!                       └───────────────┘   └──────────────────┘
//! ```
//!
//! Pull runs read changes from one resource and reconcile them into the
//! identity store before fanning out to the other linked resources; push
//! runs compare selected identities against one target resource. Priority
//! resources propagate strictly in order and must succeed before
//! best-effort resources are attempted; each task retries under its
//! resource's backoff policy and the session always completes with a full
//! report.

pub mod engine;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod matcher;
pub mod propagation;
pub mod record;
pub mod report;
pub mod rules;
pub mod session;

// Re-exports for convenience
pub use engine::{EngineConfig, IdentityStore, ReconciliationEngine};
pub use error::{EngineError, EngineResult};
pub use hooks::{ActionHook, Decision, ErrorDecision, HookError, HookPipeline, WebhookHook};
pub use identity::{AnyTypeKind, Identity, ResourceAssociation};
pub use matcher::{
    AttributeEqualityRule, ConflictResolution, CorrelationRule, IdentityLookup, MatchOutcome,
    MatchResolver, ResolvedMatch,
};
pub use propagation::{
    plan_tasks, ConnectorProvider, PropagationExecutor, PropagationTask, TaskContext,
};
pub use record::{ChangeKind, ChangeRecord, NormalizeError, RecordNormalizer};
pub use report::{
    RenderedReport, ReportCounts, ReportEntry, ReportLevel, ReportStatus, Reporter, TaskOperation,
};
pub use rules::{decide, Action, Direction, MatchingRule, RuleSet, UnmatchingRule};
pub use session::ReconciliationSession;
