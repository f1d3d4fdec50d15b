//! Microvm operator.
//!
//! Reconciles declarative Microvm resources against a remote lifecycle
//! service that actually provisions the machines, and reflects progress back
//! into each resource's status.
//!
//! ## Architecture
//!
//! - **Store**: desired-state repository with merge patches, finalizers and
//!   change notifications (SQLite backed)
//! - **Remote**: lifecycle client (`get`, `create`, `delete`, `close`) over
//!   HTTP, plus an in-memory implementation
//! - **Scope**: per-pass accessor that buffers mutations and writes them back
//! - **State**: pure mapping from remote lifecycle state to local status
//! - **Controller**: the reconciliation engine
//! - **Runner**: work queue, workers, resync and retry policy

pub mod api;
pub mod config;
pub mod controller;
pub mod remote;
pub mod runner;
pub mod scope;
pub mod service;
pub mod state;
pub mod store;

pub use config::Config;
pub use controller::{MicrovmReconciler, ReconcileError};
pub use runner::{Controller, ControllerConfig};
pub use scope::{MicrovmScope, ScopeError};
