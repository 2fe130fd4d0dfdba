//! Lifecycle engine for disposable test environments.
//!
//! Creates a set of interdependent cloud resources in dependency order,
//! waits for each to become ready, retries transient failures, and tears
//! everything down again in reverse order:
//!
//! - **Registry** - validated descriptors and creation/deletion order
//! - **Provisioner** - forward walk with a bounded worker pool
//! - **Decommissioner** - reverse walk that continues past failures
//! - **Recovery** - rollback of whatever an aborted run created
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use testbed_lifecycle::{CommandController, Engine, Environment, RunReport, RunState};
//!
//! let environment = Environment::load(path)?;
//! let registry = environment.registry()?;
//! let engine = Engine::new(Arc::new(CommandController::new()), environment.settings());
//!
//! let state = engine.provision(&registry, RunState::new(&environment.name)).await?;
//! println!("{}", RunReport::from_state(&state).to_json()?);
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod controller;
pub mod decommission;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod poll;
mod pool;
pub mod provision;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod retry;
pub mod state;

pub use command::CommandController;
pub use config::{EngineSettings, Environment};
pub use controller::{Handle, ResourceController, ResourceStatus};
pub use decommission::Decommissioner;
pub use descriptor::{ResourceDescriptor, ResourceKind};
pub use engine::Engine;
pub use error::{Classify, ControllerError, ErrorClass, OrchestratorError};
pub use poll::{await_state, PollOutcome, PollSpec};
pub use provision::Provisioner;
pub use recovery::RecoveryController;
pub use registry::{reverse_order, topological_order, Registry};
pub use report::{ReportEntry, RunReport, RunVerdict};
pub use retry::{retry, Retried, RetryError, RetryPolicy};
pub use state::{FailureClass, Outcome, Phase, ResourceRecord, RunState, Stage};
