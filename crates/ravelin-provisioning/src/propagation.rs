//! Propagation scheduling and execution.
//!
//! A decided action expands into one [`PropagationTask`] per linked
//! resource, scoped by what the action touches. Priority tasks run
//! strictly sequentially in association order and short-circuit on the
//! first failure; best-effort tasks run concurrently in a bounded pool
//! with fully isolated outcomes. Every task yields exactly one report
//! entry, and the session always completes with a full report.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use ravelin_connector::error::{ConnectorError, ConnectorResult};
use ravelin_connector::ids::ResourceId;
use ravelin_connector::retry::RetryRunner;
use ravelin_connector::traits::ProvisioningOps;
use ravelin_connector::types::{AttributeSet, Uid};

use crate::identity::{Identity, ResourceAssociation};
use crate::report::{ReportEntry, ReportStatus, TaskOperation};
use crate::rules::Action;
use crate::session::ReconciliationSession;

/// Provider of connector handles, one per registered resource.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    /// Get the connector for a resource, if one is registered.
    async fn connector_for(&self, resource: &ResourceId) -> Option<Arc<dyn ProvisioningOps>>;
}

/// One unit of propagation work against one resource.
#[derive(Debug, Clone)]
pub struct PropagationTask {
    /// The association being acted on; carries priority, retry policy and
    /// call deadline.
    pub association: ResourceAssociation,
    /// Operation to perform on the resource.
    pub operation: TaskOperation,
    /// Native key of the object on the resource.
    pub object_uid: Uid,
    /// Object class on the resource.
    pub object_class: String,
    /// Attribute payload for create/update.
    pub payload: AttributeSet,
}

/// Identity context stamped onto every task's report entry.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Key of the identity being propagated.
    pub object_key: String,
    /// Identity name.
    pub object_name: String,
    /// Identity kind.
    pub any_type: String,
}

impl TaskContext {
    /// Build the context for an identity.
    #[must_use]
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            object_key: identity.id.to_string(),
            object_name: identity.name.clone(),
            any_type: identity.kind.as_str().to_string(),
        }
    }
}

/// Expand a decided action into propagation tasks.
///
/// Scoping follows the action's semantics: provision/assign/update touch
/// every linked resource, delete touches every linked resource,
/// deprovision/unassign touch only the resource being removed (the
/// session's resource), and link/unlink/ignore touch nothing remote.
#[must_use]
pub fn plan_tasks(
    action: Action,
    identity: &Identity,
    removed_resource: &ResourceId,
    payload: &AttributeSet,
) -> Vec<PropagationTask> {
    let task_for = |association: &ResourceAssociation, operation: TaskOperation| PropagationTask {
        association: association.clone(),
        operation,
        object_uid: Uid::from_value(&identity.name),
        object_class: association.resource.object_class.clone(),
        payload: payload.clone(),
    };

    match action {
        Action::Provision | Action::Assign => identity
            .associations
            .iter()
            .map(|a| task_for(a, TaskOperation::Create))
            .collect(),
        Action::Update => identity
            .associations
            .iter()
            .map(|a| task_for(a, TaskOperation::Update))
            .collect(),
        Action::Delete => identity
            .associations
            .iter()
            .map(|a| task_for(a, TaskOperation::Delete))
            .collect(),
        Action::Deprovision | Action::Unassign => identity
            .associations
            .iter()
            .filter(|a| a.resource.id == *removed_resource)
            .map(|a| task_for(a, TaskOperation::Delete))
            .collect(),
        Action::Link | Action::Unlink | Action::Ignore => Vec::new(),
    }
}

/// Executes propagation tasks honoring the priority/ordering contract.
#[derive(Clone)]
pub struct PropagationExecutor {
    provider: Arc<dyn ConnectorProvider>,
    task_workers: usize,
}

impl PropagationExecutor {
    /// Create an executor with the given bound on concurrent best-effort
    /// tasks.
    #[must_use]
    pub fn new(provider: Arc<dyn ConnectorProvider>, task_workers: usize) -> Self {
        Self {
            provider,
            task_workers: task_workers.max(1),
        }
    }

    /// Execute the tasks for one identity, appending one report entry per
    /// task to the session.
    ///
    /// Priority tasks run first, sequentially, in association order; the
    /// first priority failure marks the remaining priority tasks as not
    /// attempted but best-effort tasks still run. Cancellation stops new
    /// dispatches; in-flight tasks finish.
    #[instrument(skip_all, fields(object = %ctx.object_name, tasks = tasks.len()))]
    pub async fn execute(
        &self,
        session: &ReconciliationSession,
        ctx: &TaskContext,
        tasks: Vec<PropagationTask>,
    ) {
        let (priority, best_effort): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| t.association.priority);

        let mut skip_reason: Option<&'static str> = None;
        for task in priority {
            if skip_reason.is_none() && session.is_cancelled() {
                skip_reason = Some("not attempted: session cancelled");
            }
            if let Some(reason) = skip_reason {
                session
                    .reporter()
                    .append(not_attempted_entry(ctx, &task, reason));
                continue;
            }

            let entry = run_task(self.provider.clone(), ctx, &task, session.dry_run).await;
            let failed = entry.status == ReportStatus::Failure;
            session.reporter().append(entry);
            if failed {
                warn!(
                    resource = %task.association.resource.name,
                    "priority propagation failed, skipping remaining priority resources"
                );
                skip_reason = Some("not attempted due to prior resource failure");
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.task_workers));
        let mut workers = JoinSet::new();
        for task in best_effort {
            if session.is_cancelled() {
                session.reporter().append(not_attempted_entry(
                    ctx,
                    &task,
                    "not attempted: session cancelled",
                ));
                continue;
            }

            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let reporter = session.reporter().clone();
            let ctx = ctx.clone();
            let dry_run = session.dry_run;
            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        reporter.append(not_attempted_entry(
                            &ctx,
                            &task,
                            "not attempted: executor shut down",
                        ));
                        return;
                    }
                };
                let entry = run_task(provider, &ctx, &task, dry_run).await;
                reporter.append(entry);
            });
        }

        while workers.join_next().await.is_some() {}
    }
}

fn base_entry(
    ctx: &TaskContext,
    task: &PropagationTask,
    status: ReportStatus,
) -> ReportEntry {
    ReportEntry::new(
        status,
        task.operation,
        ctx.object_key.clone(),
        ctx.object_name.clone(),
        ctx.any_type.clone(),
    )
    .on_resource(task.association.resource.name.clone())
}

fn not_attempted_entry(ctx: &TaskContext, task: &PropagationTask, reason: &str) -> ReportEntry {
    base_entry(ctx, task, ReportStatus::NotAttempted).with_message(reason)
}

/// Run one task to completion, including retries, and produce its entry.
async fn run_task(
    provider: Arc<dyn ConnectorProvider>,
    ctx: &TaskContext,
    task: &PropagationTask,
    dry_run: bool,
) -> ReportEntry {
    if task.operation == TaskOperation::None {
        return base_entry(ctx, task, ReportStatus::Success).with_message("no remote operation");
    }

    if dry_run {
        debug!(
            resource = %task.association.resource.name,
            operation = %task.operation,
            "dry run: skipping connector call"
        );
        return base_entry(ctx, task, ReportStatus::Success).with_message("dry run");
    }

    let Some(connector) = provider.connector_for(&task.association.resource.id).await else {
        return base_entry(ctx, task, ReportStatus::Failure)
            .with_message("no connector registered for resource");
    };

    let runner = RetryRunner::new(task.association.backoff.clone());
    let deadline = task.association.call_timeout();
    let outcome = runner
        .run(|| {
            let connector = connector.clone();
            let task = task.clone();
            async move { invoke(connector, &task, deadline).await }
        })
        .await;

    match outcome.result {
        Ok(()) => base_entry(ctx, task, ReportStatus::Success).with_attempts(outcome.attempts),
        Err(err) => base_entry(ctx, task, ReportStatus::Failure)
            .with_message(err.to_string())
            .with_attempts(outcome.attempts),
    }
}

/// One connector call for a task, under the association's deadline.
async fn invoke(
    connector: Arc<dyn ProvisioningOps>,
    task: &PropagationTask,
    deadline: Option<Duration>,
) -> ConnectorResult<()> {
    let call = async {
        match task.operation {
            TaskOperation::Create => connector
                .create(&task.object_class, &task.payload)
                .await
                .map(|_| ()),
            TaskOperation::Update => connector
                .update(&task.object_class, &task.object_uid, &task.payload)
                .await
                .map(|_| ()),
            TaskOperation::Delete => connector.delete(&task.object_class, &task.object_uid).await,
            TaskOperation::None => Ok(()),
        }
    };

    match deadline {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::timeout(limit)),
        },
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use ravelin_connector::retry::BackoffPolicy;
    use ravelin_connector::traits::{Connector, CreateOp, DeleteOp, SearchOp, UpdateOp};
    use ravelin_connector::types::{Filter, ResourceRef};

    use crate::identity::AnyTypeKind;
    use crate::rules::Direction;
    use ravelin_connector::ids::IdentityId;

    enum FailMode {
        Never,
        Always,
        FirstN(u32),
    }

    struct ScriptedConnector {
        name: String,
        calls: AtomicU32,
        fail: FailMode,
    }

    impl ScriptedConnector {
        fn new(name: &str, fail: FailMode) -> Self {
            Self {
                name: name.to_string(),
                calls: AtomicU32::new(0),
                fail,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_result(&self) -> ConnectorResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                FailMode::Never => Ok(()),
                FailMode::Always => Err(ConnectorError::unavailable("scripted outage")),
                FailMode::FirstN(limit) => {
                    if n < limit {
                        Err(ConnectorError::timeout(Duration::from_millis(50)))
                    } else {
                        Ok(())
                    }
                }
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn display_name(&self) -> &str {
            &self.name
        }

        async fn test_connection(&self) -> ConnectorResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl CreateOp for ScriptedConnector {
        async fn create(&self, _oc: &str, _attrs: &AttributeSet) -> ConnectorResult<Uid> {
            self.next_result().map(|()| Uid::from_value("created"))
        }
    }

    #[async_trait]
    impl UpdateOp for ScriptedConnector {
        async fn update(&self, _oc: &str, uid: &Uid, _attrs: &AttributeSet) -> ConnectorResult<Uid> {
            self.next_result().map(|()| uid.clone())
        }
    }

    #[async_trait]
    impl DeleteOp for ScriptedConnector {
        async fn delete(&self, _oc: &str, _uid: &Uid) -> ConnectorResult<()> {
            self.next_result()
        }
    }

    #[async_trait]
    impl SearchOp for ScriptedConnector {
        async fn search(
            &self,
            _oc: &str,
            _filter: Option<Filter>,
        ) -> ConnectorResult<Vec<AttributeSet>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MapProvider {
        connectors: HashMap<ResourceId, Arc<ScriptedConnector>>,
    }

    impl MapProvider {
        fn register(&mut self, id: ResourceId, connector: Arc<ScriptedConnector>) {
            self.connectors.insert(id, connector);
        }
    }

    #[async_trait]
    impl ConnectorProvider for MapProvider {
        async fn connector_for(&self, resource: &ResourceId) -> Option<Arc<dyn ProvisioningOps>> {
            self.connectors
                .get(resource)
                .map(|c| c.clone() as Arc<dyn ProvisioningOps>)
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::fixed(1, 3)
    }

    fn association(name: &str, priority: bool) -> ResourceAssociation {
        ResourceAssociation::new(ResourceRef::new(ResourceId::new(), name, "user"), priority)
            .with_backoff(fast_backoff())
    }

    fn identity_with(associations: Vec<ResourceAssociation>) -> Identity {
        let mut identity = Identity::new(IdentityId::new(), AnyTypeKind::User, "alice");
        identity.associations = associations;
        identity
    }

    fn session() -> ReconciliationSession {
        ReconciliationSession::new(
            ResourceRef::new(ResourceId::new(), "source", "user"),
            Direction::Pull,
        )
    }

    fn setup(
        specs: Vec<(&str, bool, FailMode)>,
    ) -> (Identity, MapProvider, Vec<Arc<ScriptedConnector>>) {
        let mut provider = MapProvider::default();
        let mut connectors = Vec::new();
        let mut associations = Vec::new();
        for (name, priority, fail) in specs {
            let assoc = association(name, priority);
            let connector = Arc::new(ScriptedConnector::new(name, fail));
            provider.register(assoc.resource.id, connector.clone());
            connectors.push(connector);
            associations.push(assoc);
        }
        (identity_with(associations), provider, connectors)
    }

    fn entries_by_resource(
        session: &ReconciliationSession,
    ) -> HashMap<String, ReportEntry> {
        session
            .reporter()
            .snapshot()
            .into_iter()
            .map(|e| (e.resource.clone().unwrap_or_default(), e))
            .collect()
    }

    #[test]
    fn test_plan_tasks_scoping() {
        let primary = ResourceId::new();
        let mut identity = identity_with(vec![
            association("r1", true),
            association("r2", false),
        ]);
        identity.associations[0].resource.id = primary;
        let payload = AttributeSet::new().with("email", "a@example.org");

        let create = plan_tasks(Action::Provision, &identity, &primary, &payload);
        assert_eq!(create.len(), 2);
        assert!(create.iter().all(|t| t.operation == TaskOperation::Create));

        let update = plan_tasks(Action::Update, &identity, &primary, &payload);
        assert!(update.iter().all(|t| t.operation == TaskOperation::Update));

        let delete = plan_tasks(Action::Delete, &identity, &primary, &payload);
        assert_eq!(delete.len(), 2);
        assert!(delete.iter().all(|t| t.operation == TaskOperation::Delete));

        // Unassign touches only the resource being removed.
        let unassign = plan_tasks(Action::Unassign, &identity, &primary, &payload);
        assert_eq!(unassign.len(), 1);
        assert_eq!(unassign[0].association.resource.name, "r1");
        assert_eq!(unassign[0].operation, TaskOperation::Delete);

        for action in [Action::Link, Action::Unlink, Action::Ignore] {
            assert!(plan_tasks(action, &identity, &primary, &payload).is_empty());
        }
    }

    #[tokio::test]
    async fn test_priority_short_circuit_spares_best_effort() {
        // Priority A, B; best-effort C, D. A fails -> B not attempted,
        // C and D still run.
        let (identity, provider, connectors) = setup(vec![
            ("a", true, FailMode::Always),
            ("b", true, FailMode::Never),
            ("c", false, FailMode::Never),
            ("d", false, FailMode::Never),
        ]);

        let session = session();
        let executor = PropagationExecutor::new(Arc::new(provider), 4);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let entries = entries_by_resource(&session);
        assert_eq!(entries["a"].status, ReportStatus::Failure);
        assert_eq!(entries["b"].status, ReportStatus::NotAttempted);
        assert_eq!(
            entries["b"].message.as_deref(),
            Some("not attempted due to prior resource failure")
        );
        assert_eq!(entries["c"].status, ReportStatus::Success);
        assert_eq!(entries["d"].status, ReportStatus::Success);

        // B's connector was never called.
        assert_eq!(connectors[1].call_count(), 0);
        assert_eq!(connectors[2].call_count(), 1);
        assert_eq!(connectors[3].call_count(), 1);
    }

    #[tokio::test]
    async fn test_priority_entry_precedes_skipped_entries() {
        let (identity, provider, _connectors) = setup(vec![
            ("a", true, FailMode::Always),
            ("b", true, FailMode::Never),
        ]);

        let session = session();
        let executor = PropagationExecutor::new(Arc::new(provider), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let snapshot = session.reporter().snapshot();
        assert_eq!(snapshot[0].resource.as_deref(), Some("a"));
        assert_eq!(snapshot[1].resource.as_deref(), Some("b"));
        assert_eq!(snapshot[1].status, ReportStatus::NotAttempted);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let (identity, provider, connectors) =
            setup(vec![("flaky", false, FailMode::Always)]);

        let session = session();
        let executor = PropagationExecutor::new(Arc::new(provider), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let entries = entries_by_resource(&session);
        let entry = &entries["flaky"];
        assert_eq!(entry.status, ReportStatus::Failure);
        assert_eq!(entry.attempts, 3);
        assert!(entry.message.as_deref().unwrap().contains("scripted outage"));
        assert_eq!(connectors[0].call_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let (identity, provider, connectors) =
            setup(vec![("recovering", false, FailMode::FirstN(1))]);

        let session = session();
        let executor = PropagationExecutor::new(Arc::new(provider), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let entries = entries_by_resource(&session);
        let entry = &entries["recovering"];
        assert_eq!(entry.status, ReportStatus::Success);
        assert_eq!(entry.attempts, 2);
        assert_eq!(connectors[0].call_count(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_performs_no_connector_calls() {
        let (identity, provider, connectors) = setup(vec![
            ("r1", true, FailMode::Never),
            ("r2", false, FailMode::Never),
        ]);

        let session = session().with_dry_run(true);
        let executor = PropagationExecutor::new(Arc::new(provider), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Provision,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let counts = session.reporter().counts();
        assert_eq!(counts.success, 2);
        assert_eq!(counts.failed, 0);
        for connector in &connectors {
            assert_eq!(connector.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_cancellation_marks_tasks_not_attempted() {
        let (identity, provider, connectors) = setup(vec![
            ("r1", true, FailMode::Never),
            ("r2", false, FailMode::Never),
        ]);

        let session = session();
        session.cancel();

        let executor = PropagationExecutor::new(Arc::new(provider), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let counts = session.reporter().counts();
        assert_eq!(counts.not_attempted, 2);
        for connector in &connectors {
            assert_eq!(connector.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_missing_connector_is_isolated_failure() {
        let (identity, _unused, _connectors) = setup(vec![("orphan", false, FailMode::Never)]);

        let session = session();
        // Empty provider: no connector registered at all.
        let executor = PropagationExecutor::new(Arc::new(MapProvider::default()), 2);
        let ctx = TaskContext::for_identity(&identity);
        let tasks = plan_tasks(
            Action::Update,
            &identity,
            &session.resource.id,
            &AttributeSet::new(),
        );
        executor.execute(&session, &ctx, tasks).await;

        let entries = entries_by_resource(&session);
        assert_eq!(entries["orphan"].status, ReportStatus::Failure);
        assert!(entries["orphan"]
            .message
            .as_deref()
            .unwrap()
            .contains("no connector registered"));
    }
}
