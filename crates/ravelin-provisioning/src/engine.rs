//! The reconciliation engine.
//!
//! Orchestrates one session end to end: normalize → match → decide →
//! hooks → local mutation → propagation → report. Record processing is
//! self-contained once a match outcome is fixed, so records run through a
//! bounded worker pool; per-record errors are recovered into FAILURE
//! entries and only session-fatal configuration or primary-connector
//! problems abort a run.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use ravelin_connector::ids::{IdentityId, ResourceId};
use ravelin_connector::traits::{ChangeLogOp, RawChange};
use ravelin_connector::types::{AttributeSet, Uid};

use crate::error::{EngineError, EngineResult};
use crate::hooks::{Decision, ErrorDecision, HookPipeline};
use crate::identity::{AnyTypeKind, Identity, ResourceAssociation};
use crate::matcher::{CorrelationRule, MatchResolver, ResolvedMatch};
use crate::propagation::{
    plan_tasks, ConnectorProvider, PropagationExecutor, PropagationTask, TaskContext,
};
use crate::record::{ChangeKind, ChangeRecord, RecordNormalizer};
use crate::report::{RenderedReport, ReportEntry, ReportLevel, ReportStatus, TaskOperation};
use crate::rules::{decide, Action};
use crate::session::ReconciliationSession;

/// Local identity store seam: lookups and the mutations the engine applies
/// before propagation on pull.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read an identity by key.
    async fn get(&self, id: IdentityId) -> EngineResult<Option<Identity>>;

    /// Create an identity and return it with its resource associations.
    async fn create(
        &self,
        kind: AnyTypeKind,
        name: &str,
        attributes: &AttributeSet,
    ) -> EngineResult<Identity>;

    /// Replace an identity's attributes, returning the updated identity.
    async fn update(&self, id: IdentityId, attributes: &AttributeSet) -> EngineResult<Identity>;

    /// Delete an identity.
    async fn delete(&self, id: IdentityId) -> EngineResult<()>;

    /// Record an association between an identity and a resource.
    async fn link(&self, id: IdentityId, resource: &ResourceId) -> EngineResult<()>;

    /// Drop the association between an identity and a resource.
    async fn unlink(&self, id: IdentityId, resource: &ResourceId) -> EngineResult<()>;
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records processed concurrently within one run.
    pub record_workers: usize,
    /// Concurrent best-effort propagation tasks per record.
    pub task_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            record_workers: 4,
            task_workers: 4,
        }
    }
}

/// Outcome of the local-state mutation for one (record, identity) pair.
struct LocalOutcome {
    identity: Option<Identity>,
    entry: ReportEntry,
    /// Set when the identity already matched the payload; propagation is
    /// skipped for a converged no-op.
    converged: bool,
}

/// The identity reconciliation and propagation engine.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn IdentityStore>,
    provider: Arc<dyn ConnectorProvider>,
    correlation: Arc<dyn CorrelationRule>,
    hooks: Arc<HookPipeline>,
    normalizer: RecordNormalizer,
    executor: PropagationExecutor,
    config: EngineConfig,
}

impl ReconciliationEngine {
    /// Create an engine with default configuration.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        provider: Arc<dyn ConnectorProvider>,
        correlation: Arc<dyn CorrelationRule>,
        hooks: HookPipeline,
    ) -> Self {
        Self::with_config(store, provider, correlation, hooks, EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(
        store: Arc<dyn IdentityStore>,
        provider: Arc<dyn ConnectorProvider>,
        correlation: Arc<dyn CorrelationRule>,
        hooks: HookPipeline,
        config: EngineConfig,
    ) -> Self {
        let executor = PropagationExecutor::new(provider.clone(), config.task_workers);
        Self {
            store,
            provider,
            correlation,
            hooks: Arc::new(hooks),
            normalizer: RecordNormalizer::new(),
            executor,
            config,
        }
    }

    /// Validate the session before any record is processed.
    ///
    /// A malformed rule set or an unreachable primary-resource connector is
    /// fatal: the session aborts and no report is produced.
    pub async fn start_session(&self, session: &ReconciliationSession) -> EngineResult<()> {
        session.rules.validate()?;

        let connector = self
            .provider
            .connector_for(&session.resource.id)
            .await
            .ok_or_else(|| {
                EngineError::fatal_connector(format!(
                    "no connector registered for primary resource {}",
                    session.resource.name
                ))
            })?;

        connector.test_connection().await.map_err(|e| {
            EngineError::fatal_connector(format!(
                "primary resource {} unreachable: {e}",
                session.resource.name
            ))
        })?;

        info!(
            resource = %session.resource.name,
            direction = %session.direction,
            dry_run = session.dry_run,
            "session validated"
        );
        Ok(())
    }

    /// Run a pull reconciliation over an already-fetched set of raw
    /// changes.
    ///
    /// Always returns a complete report for every record it attempted;
    /// only session-fatal errors surface as `Err`.
    #[instrument(skip_all, fields(resource = %session.resource.name, records = raw.len()))]
    pub async fn run_pull(
        &self,
        session: &Arc<ReconciliationSession>,
        raw: Vec<RawChange>,
    ) -> EngineResult<RenderedReport> {
        self.start_session(session).await?;
        self.process_records(session, raw, None).await;
        Ok(session.report(ReportLevel::All))
    }

    /// Run a pull reconciliation driven by the resource's change log,
    /// fetching batches and persisting the sync token as it goes.
    #[instrument(skip_all, fields(resource = %session.resource.name))]
    pub async fn run_pull_sync(
        &self,
        session: &Arc<ReconciliationSession>,
        source: &dyn ChangeLogOp,
        batch_size: u32,
    ) -> EngineResult<RenderedReport> {
        self.start_session(session).await?;

        let object_class = session.resource.object_class.clone();
        let mut token = source
            .get_token(&object_class)
            .await
            .map_err(|e| EngineError::fatal_connector(format!("cannot read sync token: {e}")))?;

        loop {
            if session.is_cancelled() {
                break;
            }

            let batch = match source
                .fetch_changes(&object_class, token.as_deref(), batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "change fetch failed, ending run");
                    session.reporter().append(
                        ReportEntry::new(
                            ReportStatus::Failure,
                            TaskOperation::None,
                            session.resource.name.clone(),
                            session.resource.name.clone(),
                            session.any_type.as_str(),
                        )
                        .with_message(format!("change fetch failed: {e}")),
                    );
                    break;
                }
            };

            let has_more = batch.has_more;
            let new_token = batch.new_token;
            self.process_records(session, batch.changes, token.clone()).await;

            if let Some(new_token) = new_token {
                if !session.dry_run {
                    if let Err(e) = source.set_token(&object_class, &new_token).await {
                        warn!(error = %e, "failed to persist sync token");
                    }
                }
                token = Some(new_token);
            }

            if !has_more {
                break;
            }
        }

        Ok(session.report(ReportLevel::All))
    }

    /// Run a push reconciliation for the given identities against the
    /// session's resource.
    #[instrument(skip_all, fields(resource = %session.resource.name, identities = ids.len()))]
    pub async fn run_push(
        &self,
        session: &Arc<ReconciliationSession>,
        ids: Vec<IdentityId>,
    ) -> EngineResult<RenderedReport> {
        self.start_session(session).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.record_workers));
        let mut workers = JoinSet::new();
        for id in ids {
            if session.is_cancelled() {
                session.reporter().append(
                    ReportEntry::new(
                        ReportStatus::NotAttempted,
                        TaskOperation::None,
                        id.to_string(),
                        id.to_string(),
                        session.any_type.as_str(),
                    )
                    .with_message("not attempted: session cancelled"),
                );
                continue;
            }

            let engine = self.clone();
            let session = session.clone();
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                engine.process_push_identity(&session, id).await;
            });
        }
        while workers.join_next().await.is_some() {}

        Ok(session.report(ReportLevel::All))
    }

    /// Process a batch of raw changes through the bounded record pool.
    async fn process_records(
        &self,
        session: &Arc<ReconciliationSession>,
        raw: Vec<RawChange>,
        token: Option<String>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.record_workers));
        let mut workers = JoinSet::new();
        for raw_change in raw {
            if session.is_cancelled() {
                session.reporter().append(
                    ReportEntry::new(
                        ReportStatus::NotAttempted,
                        TaskOperation::None,
                        raw_change.uid.value().to_string(),
                        raw_change.uid.value().to_string(),
                        session.any_type.as_str(),
                    )
                    .with_message("not attempted: session cancelled"),
                );
                continue;
            }

            let engine = self.clone();
            let session = session.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                engine
                    .process_pull_record(&session, raw_change, token.as_deref())
                    .await;
            });
        }
        while workers.join_next().await.is_some() {}
    }

    /// Process one raw change: normalize, match, then apply per identity.
    #[instrument(skip_all, fields(uid = %raw.uid))]
    async fn process_pull_record(
        &self,
        session: &ReconciliationSession,
        raw: RawChange,
        token: Option<&str>,
    ) {
        let key = raw.uid.value().to_string();
        let record = match self.normalizer.normalize(raw, token) {
            Ok(record) => record,
            Err(e) => {
                session.reporter().append(
                    ReportEntry::new(
                        ReportStatus::Failure,
                        TaskOperation::None,
                        key.clone(),
                        key,
                        session.any_type.as_str(),
                    )
                    .with_message(e.to_string()),
                );
                return;
            }
        };

        let resolver = MatchResolver::new(session.conflict_resolution);
        let resolved = match resolver.resolve(&record, self.correlation.as_ref()).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.record_error(session, &record, None, err.to_string())
                    .await;
                return;
            }
        };

        match resolved {
            ResolvedMatch::Ignored => {
                session.reporter().append(
                    self.record_entry(session, &record, None, ReportStatus::Ignore)
                        .with_message("conflict policy ignore: multiple matches"),
                );
            }
            ResolvedMatch::Unmatched => {
                self.apply(session, &record, None).await;
            }
            ResolvedMatch::Matched(ids) => {
                // Policy ALL fans the record out to every matched identity
                // with fully independent outcomes.
                for id in ids {
                    self.apply(session, &record, Some(id)).await;
                }
            }
        }
    }

    /// Decide and execute the action for one (record, identity) pair.
    async fn apply(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        identity_id: Option<IdentityId>,
    ) {
        let action = decide(
            session.direction,
            record.kind,
            identity_id.is_some(),
            &session.rules,
        );
        debug!(action = %action, uid = %record.object_uid, "decided");

        if action.is_ignore() {
            session.reporter().append(
                self.record_entry(session, record, identity_id, ReportStatus::Ignore)
                    .with_message(format!("rule decided ignore for {} record", record.kind)),
            );
            return;
        }

        let payload = match self
            .hooks
            .before(action, session, record, record.attributes.clone())
            .await
        {
            Decision::Proceed(payload) => payload,
            Decision::Ignore => {
                session.reporter().append(
                    self.record_entry(session, record, identity_id, ReportStatus::Ignore)
                        .with_message("skipped by hook"),
                );
                return;
            }
            Decision::Fail(message) => {
                self.record_error(session, record, identity_id, message).await;
                return;
            }
        };

        match self
            .mutate_local(session, record, identity_id, action, &payload)
            .await
        {
            Ok(outcome) => {
                session.reporter().append(outcome.entry.clone());

                if let Some(ref identity) = outcome.identity {
                    if !outcome.converged {
                        let ctx = TaskContext::for_identity(identity);
                        let tasks = plan_tasks(action, identity, &session.resource.id, &payload);
                        self.executor.execute(session, &ctx, tasks).await;
                    }
                }

                self.hooks
                    .run_after(session, record, outcome.identity.as_ref(), &outcome.entry)
                    .await;
            }
            Err(err) => {
                self.record_error(session, record, identity_id, err.to_string())
                    .await;
            }
        }
    }

    /// Apply the action's local-state mutation for the pull direction.
    async fn mutate_local(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        identity_id: Option<IdentityId>,
        action: Action,
        payload: &AttributeSet,
    ) -> EngineResult<LocalOutcome> {
        let matched = |id: Option<IdentityId>| {
            id.ok_or_else(|| EngineError::record(format!("{action} requires a matched identity")))
        };

        match action {
            Action::Provision | Action::Assign => {
                let identity = self
                    .store
                    .create(session.any_type, record.key_value(), payload)
                    .await?;
                if action == Action::Assign {
                    self.store.link(identity.id, &session.resource.id).await?;
                }
                let refreshed = self.store.get(identity.id).await?.unwrap_or(identity);
                let entry = self
                    .identity_entry(&refreshed, ReportStatus::Success, TaskOperation::Create);
                Ok(LocalOutcome {
                    identity: Some(refreshed),
                    entry,
                    converged: false,
                })
            }
            Action::Update => {
                let id = matched(identity_id)?;
                let current = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| EngineError::record(format!("identity {id} not found")))?;

                if current.attributes == *payload {
                    // Already converged: success with a no-op payload, no
                    // propagation.
                    let entry = self
                        .identity_entry(&current, ReportStatus::Success, TaskOperation::None)
                        .with_message("already converged");
                    return Ok(LocalOutcome {
                        identity: Some(current),
                        entry,
                        converged: true,
                    });
                }

                let identity = self.store.update(id, payload).await?;
                let entry = self
                    .identity_entry(&identity, ReportStatus::Success, TaskOperation::Update);
                Ok(LocalOutcome {
                    identity: Some(identity),
                    entry,
                    converged: false,
                })
            }
            Action::Link => {
                let id = matched(identity_id)?;
                self.store.link(id, &session.resource.id).await?;
                let identity = self.store.get(id).await?;
                let entry = match &identity {
                    Some(identity) => self
                        .identity_entry(identity, ReportStatus::Success, TaskOperation::None),
                    None => self.record_entry(session, record, Some(id), ReportStatus::Success),
                }
                .with_message("linked");
                Ok(LocalOutcome {
                    identity,
                    entry,
                    converged: false,
                })
            }
            Action::Unlink => {
                let id = matched(identity_id)?;
                self.store.unlink(id, &session.resource.id).await?;
                let identity = self.store.get(id).await?;
                let entry = match &identity {
                    Some(identity) => self
                        .identity_entry(identity, ReportStatus::Success, TaskOperation::None),
                    None => self.record_entry(session, record, Some(id), ReportStatus::Success),
                }
                .with_message("unlinked");
                Ok(LocalOutcome {
                    identity,
                    entry,
                    converged: false,
                })
            }
            Action::Unassign => {
                let id = matched(identity_id)?;
                // Capture associations before the unlink so the removed
                // resource's account can still be planned for deletion.
                let identity = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| EngineError::record(format!("identity {id} not found")))?;
                self.store.unlink(id, &session.resource.id).await?;
                let entry = self
                    .identity_entry(&identity, ReportStatus::Success, TaskOperation::None)
                    .with_message("unassigned");
                Ok(LocalOutcome {
                    identity: Some(identity),
                    entry,
                    converged: false,
                })
            }
            Action::Deprovision => {
                let id = matched(identity_id)?;
                let identity = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| EngineError::record(format!("identity {id} not found")))?;
                let entry = self
                    .identity_entry(&identity, ReportStatus::Success, TaskOperation::None)
                    .with_message("deprovisioned");
                Ok(LocalOutcome {
                    identity: Some(identity),
                    entry,
                    converged: false,
                })
            }
            Action::Delete => {
                let id = matched(identity_id)?;
                let identity = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| EngineError::record(format!("identity {id} not found")))?;
                self.store.delete(id).await?;
                let entry = self
                    .identity_entry(&identity, ReportStatus::Success, TaskOperation::Delete);
                Ok(LocalOutcome {
                    identity: Some(identity),
                    entry,
                    converged: false,
                })
            }
            Action::Ignore => {
                let entry = self.record_entry(session, record, identity_id, ReportStatus::Ignore);
                Ok(LocalOutcome {
                    identity: None,
                    entry,
                    converged: true,
                })
            }
        }
    }

    /// Process one identity for the push direction.
    #[instrument(skip_all, fields(identity = %id))]
    async fn process_push_identity(&self, session: &ReconciliationSession, id: IdentityId) {
        let identity = match self.store.get(id).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                session.reporter().append(
                    ReportEntry::new(
                        ReportStatus::Failure,
                        TaskOperation::None,
                        id.to_string(),
                        id.to_string(),
                        session.any_type.as_str(),
                    )
                    .with_message("identity not found"),
                );
                return;
            }
            Err(e) => {
                session.reporter().append(
                    ReportEntry::new(
                        ReportStatus::Failure,
                        TaskOperation::None,
                        id.to_string(),
                        id.to_string(),
                        session.any_type.as_str(),
                    )
                    .with_message(e.to_string()),
                );
                return;
            }
        };

        let uid = Uid::from_value(&identity.name);
        let record = ChangeRecord::new(
            uid.clone(),
            ChangeKind::Update,
            session.resource.object_class.clone(),
            identity.attributes.clone(),
        );

        // Existence of the native key on the target decides the
        // matched/unmatched duality for push.
        let exists = match self.probe_target(session, &uid).await {
            Ok(exists) => exists,
            Err(err) => {
                self.record_error(session, &record, Some(id), err.to_string())
                    .await;
                return;
            }
        };

        let action = decide(session.direction, record.kind, exists, &session.rules);
        debug!(action = %action, exists, "push decided");

        if action.is_ignore() {
            session.reporter().append(
                self.identity_entry(&identity, ReportStatus::Ignore, TaskOperation::None)
                    .with_message("rule decided ignore"),
            );
            return;
        }

        let payload = match self
            .hooks
            .before(action, session, &record, record.attributes.clone())
            .await
        {
            Decision::Proceed(payload) => payload,
            Decision::Ignore => {
                session.reporter().append(
                    self.identity_entry(&identity, ReportStatus::Ignore, TaskOperation::None)
                        .with_message("skipped by hook"),
                );
                return;
            }
            Decision::Fail(message) => {
                self.record_error(session, &record, Some(id), message).await;
                return;
            }
        };

        // Link bookkeeping is the only local mutation on push.
        let local = match action {
            Action::Assign | Action::Link => self.store.link(id, &session.resource.id).await,
            Action::Unassign | Action::Unlink => self.store.unlink(id, &session.resource.id).await,
            _ => Ok(()),
        };
        if let Err(err) = local {
            self.record_error(session, &record, Some(id), err.to_string())
                .await;
            return;
        }

        let entry = self
            .identity_entry(&identity, ReportStatus::Success, TaskOperation::None)
            .with_message(format!("decided {action}"));
        session.reporter().append(entry.clone());

        let operation = match action {
            Action::Provision | Action::Assign => TaskOperation::Create,
            Action::Update => TaskOperation::Update,
            Action::Deprovision | Action::Unassign | Action::Delete => TaskOperation::Delete,
            Action::Link | Action::Unlink | Action::Ignore => TaskOperation::None,
        };

        if operation != TaskOperation::None {
            let association = identity
                .association_for(&session.resource.id)
                .cloned()
                .unwrap_or_else(|| ResourceAssociation::new(session.resource.clone(), true));
            let task = PropagationTask {
                association,
                operation,
                object_uid: uid,
                object_class: session.resource.object_class.clone(),
                payload,
            };
            let ctx = TaskContext::for_identity(&identity);
            self.executor.execute(session, &ctx, vec![task]).await;
        }

        self.hooks
            .run_after(session, &record, Some(&identity), &entry)
            .await;
    }

    /// Check whether the identity's native key exists on the session's
    /// resource.
    async fn probe_target(
        &self,
        session: &ReconciliationSession,
        uid: &Uid,
    ) -> EngineResult<bool> {
        let connector = self
            .provider
            .connector_for(&session.resource.id)
            .await
            .ok_or_else(|| {
                EngineError::record(format!(
                    "no connector registered for resource {}",
                    session.resource.name
                ))
            })?;

        let found = connector
            .get(&session.resource.object_class, uid)
            .await
            .map_err(|e| EngineError::record(format!("existence probe failed: {e}")))?;
        Ok(found.is_some())
    }

    /// Report entry for a (record, identity) pair keyed by the identity
    /// when known.
    fn record_entry(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        identity_id: Option<IdentityId>,
        status: ReportStatus,
    ) -> ReportEntry {
        let key = identity_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| record.key_value().to_string());
        ReportEntry::new(
            status,
            TaskOperation::None,
            key,
            record.key_value(),
            session.any_type.as_str(),
        )
    }

    /// Report entry for the local step on a known identity.
    fn identity_entry(
        &self,
        identity: &Identity,
        status: ReportStatus,
        operation: TaskOperation,
    ) -> ReportEntry {
        ReportEntry::new(
            status,
            operation,
            identity.id.to_string(),
            identity.name.clone(),
            identity.kind.as_str(),
        )
    }

    /// Surface a record-scoped error through the on_error hooks, which may
    /// downgrade it to an ignore or substitute the message.
    async fn record_error(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        identity_id: Option<IdentityId>,
        message: String,
    ) {
        let entry = match self.hooks.run_on_error(session, record, &message).await {
            ErrorDecision::Suppress => self
                .record_entry(session, record, identity_id, ReportStatus::Ignore)
                .with_message(format!("error suppressed by hook: {message}")),
            ErrorDecision::Replace(replacement) => self
                .record_entry(session, record, identity_id, ReportStatus::Failure)
                .with_message(replacement),
            ErrorDecision::Keep => self
                .record_entry(session, record, identity_id, ReportStatus::Failure)
                .with_message(message),
        };
        session.reporter().append(entry);
    }
}
