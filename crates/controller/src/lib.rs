//! xposer controller: turns Deployment notifications into Services and
//! Ingresses.
//!
//! Notifications enter through the [`EventBridge`], which enqueues workload
//! keys. Workers started by the [`Controller`] pull keys, re-read the cache,
//! derive the desired dependents and create them.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod reconcile;

pub use bridge::EventBridge;
pub use config::{ControllerConfig, SyncFailurePolicy};
pub use context::Context;
pub use lifecycle::{Controller, ControllerError};
pub use reconcile::{process_next, reconcile_key, ApplyOutcome, Finish, ItemOutcome, ReconcileReport};
