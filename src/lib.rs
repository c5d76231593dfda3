//! # DAQ Orchestrator
//!
//! Lifecycle manager and task scheduler for modular instrument-control setups.
//!
//! A setup is described by a wiring file of module and task descriptors. Modules are
//! hardware drivers, logic and GUI components connected to each other by named roles;
//! tasks are long-running measurements that borrow modules and may pause each other.
//! The orchestrator brings modules up in dependency order, keeps invalid parts of the
//! wiring out of the runnable set, and runs tasks with the start/pause/resume/stop
//! protocol laid out in [`tasks`].
//!
//! ## Crate Structure
//!
//! - **`config`**: descriptors, the snapshot-swapping descriptor store, and Figment-based
//!   settings loading.
//! - **`error`**: the [`OrchestratorError`](error::OrchestratorError) enum shared by every
//!   operation.
//! - **`graph`**: dependency graphs, module order resolution and task relation checks.
//! - **`lifecycle`**: [`ModuleManager`](lifecycle::ModuleManager), module hooks and the
//!   mock implementations used for dry runs.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`remote`**: directory of modules published for remote access.
//! - **`tasks`**: [`TaskScheduler`](tasks::TaskScheduler) and the task body contract.
//!
//! ## Example
//!
//! ```rust
//! use daq_orchestrator::config::ModuleCategory;
//! use daq_orchestrator::lifecycle::mock::{mock_module, MockFactory};
//! use daq_orchestrator::lifecycle::{ModuleManager, ModuleState};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = ModuleManager::from_descriptors(
//!     [
//!         mock_module("nicard", ModuleCategory::Hardware),
//!         mock_module("scanner_logic", ModuleCategory::Logic).connect("scanner", "nicard"),
//!     ],
//!     false,
//!     Arc::new(MockFactory::new()),
//! );
//!
//! manager.activate("scanner_logic").await.unwrap();
//! assert_eq!(manager.state("nicard").unwrap(), ModuleState::Active);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod logging;
pub mod remote;
pub mod tasks;

pub use config::{ModuleCategory, ModuleDescriptor, Settings, TaskDescriptor};
pub use error::{AppResult, OrchestratorError};
pub use lifecycle::{ModuleManager, ModuleState};
pub use tasks::{TaskOutcome, TaskScheduler, TaskState};
