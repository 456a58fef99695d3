//! Action hook pipeline.
//!
//! Hooks observe and steer each decided action. A hook implements only the
//! callbacks it needs; every `before_*` callback defaults to passing the
//! payload through unchanged. Skip-vs-fail is a checked outcome
//! ([`Decision`]), not an error path, and `on_error` may reclassify a
//! record failure as an ignore. Hooks never touch connectors or external
//! resources; propagation is the executor's job alone.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use ravelin_connector::types::AttributeSet;

use crate::identity::Identity;
use crate::record::ChangeRecord;
use crate::report::ReportEntry;
use crate::rules::Action;
use crate::session::ReconciliationSession;

/// Outcome of a `before` callback.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Continue with this (possibly rewritten) payload.
    Proceed(AttributeSet),
    /// Skip the record; reported as IGNORE, not as an error.
    Ignore,
    /// Abort processing of this record with an error message.
    Fail(String),
}

/// Outcome of an `on_error` callback.
#[derive(Debug, Clone)]
pub enum ErrorDecision {
    /// Keep the original error.
    Keep,
    /// Suppress the error; the record is reported as IGNORE.
    Suppress,
    /// Substitute a different error message.
    Replace(String),
}

/// Hook configuration error.
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook configuration is invalid.
    #[error("invalid hook configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// A pluggable action hook.
///
/// Callbacks run in registration order and are expected to be idempotent
/// if a session is retried.
#[async_trait]
pub trait ActionHook: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn before_provision(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_assign(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_update(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_link(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_unlink(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_deprovision(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_unassign(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    async fn before_delete(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        Decision::Proceed(payload)
    }

    /// Runs once the action and its local-state mutation and propagation
    /// have completed, with the record's reconciliation report entry.
    async fn after(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        _identity: Option<&Identity>,
        _entry: &ReportEntry,
    ) {
    }

    /// Runs whenever any step for the record raises an error; may suppress
    /// it or substitute another.
    async fn on_error(
        &self,
        _session: &ReconciliationSession,
        _record: &ChangeRecord,
        _error: &str,
    ) -> ErrorDecision {
        ErrorDecision::Keep
    }
}

/// Ordered chain of hooks.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn ActionHook>>,
}

impl HookPipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; hooks run in registration order.
    pub fn register(&mut self, hook: Arc<dyn ActionHook>) {
        self.hooks.push(hook);
    }

    /// Append a hook, builder style.
    #[must_use]
    pub fn with(mut self, hook: Arc<dyn ActionHook>) -> Self {
        self.register(hook);
        self
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the before-callbacks for the decided action, threading the
    /// payload through each hook. Stops at the first Ignore or Fail.
    pub async fn before(
        &self,
        action: Action,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        mut payload: AttributeSet,
    ) -> Decision {
        for hook in &self.hooks {
            let decision = match action {
                Action::Provision => hook.before_provision(session, record, payload).await,
                Action::Assign => hook.before_assign(session, record, payload).await,
                Action::Update => hook.before_update(session, record, payload).await,
                Action::Link => hook.before_link(session, record, payload).await,
                Action::Unlink => hook.before_unlink(session, record, payload).await,
                Action::Deprovision => hook.before_deprovision(session, record, payload).await,
                Action::Unassign => hook.before_unassign(session, record, payload).await,
                Action::Delete => hook.before_delete(session, record, payload).await,
                // Ignore is terminal before hooks run.
                Action::Ignore => return Decision::Proceed(payload),
            };

            match decision {
                Decision::Proceed(next) => payload = next,
                Decision::Ignore => {
                    debug!(hook = hook.name(), action = %action, "hook skipped record");
                    return Decision::Ignore;
                }
                Decision::Fail(message) => {
                    warn!(hook = hook.name(), action = %action, %message, "hook failed record");
                    return Decision::Fail(message);
                }
            }
        }
        Decision::Proceed(payload)
    }

    /// Run all after-callbacks in registration order.
    pub async fn run_after(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        identity: Option<&Identity>,
        entry: &ReportEntry,
    ) {
        for hook in &self.hooks {
            hook.after(session, record, identity, entry).await;
        }
    }

    /// Consult the on_error callbacks; the first hook that does not keep
    /// the original error wins.
    pub async fn run_on_error(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        error: &str,
    ) -> ErrorDecision {
        for hook in &self.hooks {
            match hook.on_error(session, record, error).await {
                ErrorDecision::Keep => {}
                decision => {
                    debug!(hook = hook.name(), "hook overrode record error");
                    return decision;
                }
            }
        }
        ErrorDecision::Keep
    }
}

/// Hook that forwards before/after events to an HTTP endpoint.
///
/// The endpoint may answer a before call with
/// `{"decision": "ignore"}` to skip the record or
/// `{"attributes": {...}}` to rewrite the payload; any non-success status
/// fails the record. After events are fire-and-forget.
pub struct WebhookHook {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookHook {
    /// Create a webhook hook with a 30 second call deadline.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, HookError> {
        Self::with_timeout(name, url, Duration::from_secs(30))
    }

    /// Create a webhook hook with a custom call deadline.
    pub fn with_timeout(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HookError::InvalidConfiguration {
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
            timeout,
        })
    }

    async fn post_before(
        &self,
        action: Action,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        let body = serde_json::json!({
            "phase": "before",
            "action": action.as_str(),
            "direction": session.direction.as_str(),
            "resource": session.resource.name,
            "object_uid": record.object_uid.to_string(),
            "object_class": record.object_class,
            "attributes": payload,
        });

        let sent = tokio::time::timeout(self.timeout, self.client.post(&self.url).json(&body).send())
            .await;

        let response = match sent {
            Err(_) => {
                return Decision::Fail(format!(
                    "webhook {} timed out after {}ms",
                    self.name,
                    self.timeout.as_millis()
                ))
            }
            Ok(Err(e)) => return Decision::Fail(format!("webhook {}: {e}", self.name)),
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return Decision::Fail(format!(
                "webhook {} returned status {}",
                self.name,
                response.status()
            ));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        if value.get("decision").and_then(|v| v.as_str()) == Some("ignore") {
            return Decision::Ignore;
        }

        let rewritten = value
            .get("attributes")
            .and_then(|v| serde_json::from_value::<AttributeSet>(v.clone()).ok());
        Decision::Proceed(rewritten.unwrap_or(payload))
    }
}

#[async_trait]
impl ActionHook for WebhookHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_provision(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Provision, session, record, payload).await
    }

    async fn before_assign(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Assign, session, record, payload).await
    }

    async fn before_update(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Update, session, record, payload).await
    }

    async fn before_deprovision(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Deprovision, session, record, payload).await
    }

    async fn before_unassign(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Unassign, session, record, payload).await
    }

    async fn before_delete(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        payload: AttributeSet,
    ) -> Decision {
        self.post_before(Action::Delete, session, record, payload).await
    }

    async fn after(
        &self,
        session: &ReconciliationSession,
        record: &ChangeRecord,
        _identity: Option<&Identity>,
        entry: &ReportEntry,
    ) {
        let body = serde_json::json!({
            "phase": "after",
            "direction": session.direction.as_str(),
            "resource": session.resource.name,
            "object_uid": record.object_uid.to_string(),
            "status": entry.status.as_str(),
            "operation": entry.operation.as_str(),
            "message": entry.message,
        });

        if let Err(e) = self.client.post(&self.url).json(&body).send().await {
            warn!(hook = %self.name, error = %e, "webhook after-callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravelin_connector::ids::ResourceId;
    use ravelin_connector::types::{ResourceRef, Uid};

    use crate::record::ChangeKind;
    use crate::report::{ReportStatus, TaskOperation};
    use crate::rules::Direction;

    fn session() -> ReconciliationSession {
        let resource = ResourceRef::new(ResourceId::new(), "ldap-primary", "user");
        ReconciliationSession::new(resource, Direction::Pull)
    }

    fn record() -> ChangeRecord {
        ChangeRecord::new(
            Uid::from_value("alice"),
            ChangeKind::Create,
            "user",
            AttributeSet::new().with("email", "alice@example.org"),
        )
    }

    struct TagHook {
        name: String,
        tag: String,
    }

    #[async_trait]
    impl ActionHook for TagHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before_provision(
            &self,
            _session: &ReconciliationSession,
            _record: &ChangeRecord,
            mut payload: AttributeSet,
        ) -> Decision {
            let tagged = match payload.get_string("tags") {
                Some(existing) => format!("{existing},{}", self.tag),
                None => self.tag.clone(),
            };
            payload.set("tags", tagged);
            Decision::Proceed(payload)
        }
    }

    struct SkipHook;

    #[async_trait]
    impl ActionHook for SkipHook {
        fn name(&self) -> &str {
            "skip"
        }

        async fn before_provision(
            &self,
            _session: &ReconciliationSession,
            _record: &ChangeRecord,
            _payload: AttributeSet,
        ) -> Decision {
            Decision::Ignore
        }

        async fn on_error(
            &self,
            _session: &ReconciliationSession,
            _record: &ChangeRecord,
            _error: &str,
        ) -> ErrorDecision {
            ErrorDecision::Suppress
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let pipeline = HookPipeline::new()
            .with(Arc::new(TagHook {
                name: "first".to_string(),
                tag: "a".to_string(),
            }))
            .with(Arc::new(TagHook {
                name: "second".to_string(),
                tag: "b".to_string(),
            }));

        let decision = pipeline
            .before(Action::Provision, &session(), &record(), AttributeSet::new())
            .await;

        match decision {
            Decision::Proceed(payload) => {
                assert_eq!(payload.get_string("tags"), Some("a,b"));
            }
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ignore_short_circuits_later_hooks() {
        let pipeline = HookPipeline::new()
            .with(Arc::new(SkipHook))
            .with(Arc::new(TagHook {
                name: "never".to_string(),
                tag: "x".to_string(),
            }));

        let decision = pipeline
            .before(Action::Provision, &session(), &record(), AttributeSet::new())
            .await;
        assert!(matches!(decision, Decision::Ignore));
    }

    #[tokio::test]
    async fn test_default_callbacks_pass_through() {
        struct Inert;

        #[async_trait]
        impl ActionHook for Inert {
            fn name(&self) -> &str {
                "inert"
            }
        }

        let pipeline = HookPipeline::new().with(Arc::new(Inert));
        let payload = AttributeSet::new().with("email", "alice@example.org");

        for action in [
            Action::Provision,
            Action::Assign,
            Action::Update,
            Action::Link,
            Action::Unlink,
            Action::Deprovision,
            Action::Unassign,
            Action::Delete,
        ] {
            let decision = pipeline
                .before(action, &session(), &record(), payload.clone())
                .await;
            match decision {
                Decision::Proceed(out) => assert_eq!(out, payload),
                other => panic!("expected Proceed for {action}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_on_error_suppression() {
        let pipeline = HookPipeline::new().with(Arc::new(SkipHook));
        let decision = pipeline
            .run_on_error(&session(), &record(), "boom")
            .await;
        assert!(matches!(decision, ErrorDecision::Suppress));
    }

    #[tokio::test]
    async fn test_on_error_defaults_to_keep() {
        let pipeline = HookPipeline::new();
        let decision = pipeline
            .run_on_error(&session(), &record(), "boom")
            .await;
        assert!(matches!(decision, ErrorDecision::Keep));
    }

    #[tokio::test]
    async fn test_after_receives_entry() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct SawAfter(Arc<AtomicBool>);

        #[async_trait]
        impl ActionHook for SawAfter {
            fn name(&self) -> &str {
                "saw-after"
            }

            async fn after(
                &self,
                _session: &ReconciliationSession,
                _record: &ChangeRecord,
                _identity: Option<&Identity>,
                entry: &ReportEntry,
            ) {
                assert_eq!(entry.status, ReportStatus::Success);
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicBool::new(false));
        let pipeline = HookPipeline::new().with(Arc::new(SawAfter(seen.clone())));

        let entry = ReportEntry::new(
            ReportStatus::Success,
            TaskOperation::Create,
            "k",
            "alice",
            "user",
        );
        pipeline.run_after(&session(), &record(), None, &entry).await;
        assert!(seen.load(Ordering::SeqCst));
    }
}
