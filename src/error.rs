//! Custom error types for the orchestrator.
//!
//! This module defines the primary error type, `OrchestratorError`, shared by the
//! resolver, the module lifecycle manager and the task scheduler. Using the
//! `thiserror` crate, it provides one consistent taxonomy for everything that can
//! go wrong between loading a wiring configuration and running a task.
//!
//! ## Error Hierarchy
//!
//! `OrchestratorError` falls into three broad groups:
//!
//! - **Validation** (`CyclicDependency`, `UnresolvedDependency`, `IncompatibleConnection`):
//!   surfaced when descriptors are loaded. They keep the affected module or task out of
//!   the graph while the rest of the graph still loads.
//! - **Runtime** (`ConstructionError`, `ActivationError`, `DeactivationError`,
//!   `ModuleUnavailable`, `PausePartnerUnresponsive`, `PauseTimeout`, `InterruptedWithError`,
//!   `TaskFailed`): recorded on the entity that failed and returned to the caller of the
//!   triggering operation. They are never retried automatically.
//! - **Advisory** (`ActiveDependents`, `PrerequisiteNotComplete`, `ModuleBusy`): the caller
//!   may retry once the blocking condition is resolved.
//!
//! Errors are `Clone` so the same value can be stored on a module or task status record
//! and handed back to the caller.

use thiserror::Error;

/// Convenience alias for results using the orchestrator error type.
pub type AppResult<T> = std::result::Result<T, OrchestratorError>;

/// Everything that can go wrong while resolving, activating or scheduling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Members are reported starting from the lexicographically smallest name.
    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A connection names a module that is not declared.
    #[error("'{module}' connects role '{role}' to undeclared '{target}'")]
    UnresolvedDependency {
        /// Declaring module
        module: String,
        /// Connection role
        role: String,
        /// Missing target
        target: String,
    },

    /// A connection fails the category or interface check.
    #[error("'{module}' cannot connect role '{role}' to '{target}': {reason}")]
    IncompatibleConnection {
        /// Declaring module
        module: String,
        /// Connection role
        role: String,
        /// Rejected target
        target: String,
        /// Which check failed
        reason: String,
    },

    /// The factory could not build the module or task body.
    #[error("Failed to construct module '{module}': {message}")]
    ConstructionError {
        /// Module or task name
        module: String,
        /// Rendered error chain
        message: String,
    },

    /// Binding or the activation hook failed.
    #[error("Failed to activate module '{module}': {message}")]
    ActivationError {
        /// Module name
        module: String,
        /// Rendered error chain
        message: String,
    },

    /// The deactivation hook failed; the instance was dropped anyway.
    #[error("Failed to deactivate module '{module}': {message}")]
    DeactivationError {
        /// Module name
        module: String,
        /// Rendered error chain
        message: String,
    },

    /// Loaded dependents keep the module up.
    #[error("Module '{module}' still has active dependents: {}", .dependents.join(", "))]
    ActiveDependents {
        /// Module asked to deactivate
        module: String,
        /// Loaded dependents, sorted
        dependents: Vec<String>,
    },

    /// The module is borrowed.
    #[error("Module '{module}' is busy: borrowed by {}", .borrowers.join(", "))]
    ModuleBusy {
        /// Borrowed module
        module: String,
        /// Current borrowers, sorted
        borrowers: Vec<String>,
    },

    /// A needed module could not be activated, borrowed or kept.
    #[error("Task '{task}' needs module '{module}' which is unavailable: {reason}")]
    ModuleUnavailable {
        /// Task name
        task: String,
        /// Needed module
        module: String,
        /// Underlying failure
        reason: String,
    },

    /// A `preposttasks` entry has not completed in this run.
    #[error("Task '{task}' requires '{prerequisite}' to complete first")]
    PrerequisiteNotComplete {
        /// Task being started
        task: String,
        /// Missing prerequisite
        prerequisite: String,
    },

    /// A `pausetasks` partner could not be paused.
    #[error("Task '{task}' could not pause '{partner}': {reason}")]
    PausePartnerUnresponsive {
        /// Task being started
        task: String,
        /// Partner that did not pause
        partner: String,
        /// Underlying failure
        reason: String,
    },

    /// The body did not reach a checkpoint in time.
    #[error("Task '{task}' did not acknowledge pause within {timeout_ms} ms")]
    PauseTimeout {
        /// Task asked to pause
        task: String,
        /// Configured pause timeout
        timeout_ms: u64,
    },

    /// Interrupted, but the cleanup hook failed.
    #[error("Task '{task}' was interrupted but cleanup failed: {message}")]
    InterruptedWithError {
        /// Task name
        task: String,
        /// Rendered error chain
        message: String,
    },

    /// The body or a hook failed, or the task was failed by a caller.
    #[error("Task '{task}' failed: {message}")]
    TaskFailed {
        /// Task name
        task: String,
        /// Failure description
        message: String,
    },

    /// No module with this name is declared.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    /// No task with this name is declared.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// The operation is not allowed in the current state.
    #[error("'{entity}' cannot {operation} while {state}")]
    InvalidTransition {
        /// Module or task name
        entity: String,
        /// Refused operation
        operation: String,
        /// State or condition that refused it
        state: String,
    },

    /// The wiring file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The wiring parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl OrchestratorError {
    /// Errors detected while validating descriptors, before anything runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::CyclicDependency(_)
                | OrchestratorError::UnresolvedDependency { .. }
                | OrchestratorError::IncompatibleConnection { .. }
        )
    }

    /// Errors the caller may retry after resolving the blocking condition.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ActiveDependents { .. }
                | OrchestratorError::PrerequisiteNotComplete { .. }
                | OrchestratorError::ModuleBusy { .. }
        )
    }
}

impl From<figment::Error> for OrchestratorError {
    fn from(value: figment::Error) -> Self {
        OrchestratorError::Config(value.to_string())
    }
}

/// Renders an `anyhow` chain on one line, outermost context first.
pub(crate) fn render_chain(error: &anyhow::Error) -> String {
    format!("{error:#}")
}
