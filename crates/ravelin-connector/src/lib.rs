//! # Connector Framework
//!
//! Core abstractions for reaching external identity resources.
//!
//! A *resource* is an external system (directory, database, SaaS API) that
//! holds accounts for internal identities. This crate defines the uniform
//! surface the reconciliation engine uses to talk to resources:
//!
//! - [`Connector`] - base trait all connectors implement
//! - [`CreateOp`], [`UpdateOp`], [`DeleteOp`], [`SearchOp`] - CRUD capabilities
//! - [`ChangeLogOp`] - change detection with an opaque sync token
//! - [`BackoffPolicy`] / [`RetryRunner`] - per-resource retry behavior
//!
//! ## Example
//!
//! ```ignore
//! use ravelin_connector::prelude::*;
//!
//! let attrs = AttributeSet::new()
//!     .with("email", "alice@example.org")
//!     .with("displayName", "Alice");
//! let uid = connector.create("user", &attrs).await?;
//!
//! let runner = RetryRunner::new(BackoffPolicy::fixed(500, 3));
//! let outcome = runner.run(|| connector.delete("user", &uid)).await;
//! ```

pub mod error;
pub mod ids;
pub mod retry;
pub mod traits;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::ids::{IdentityId, ResourceId};
    pub use crate::retry::{BackoffPolicy, BackoffStrategy, RetryOutcome, RetryRunner};
    pub use crate::traits::{
        ChangeBatch, ChangeLogOp, Connector, CreateOp, DeleteOp, ProvisioningOps, RawChange,
        RawChangeKind, SearchOp, UpdateOp,
    };
    pub use crate::types::{AttributeSet, AttributeValue, Filter, ResourceRef, Uid};
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;
