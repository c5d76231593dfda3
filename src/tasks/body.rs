//! Task implementations and the control object handed to them.
//!
//! A task body runs in its own tokio task. The scheduler never interrupts it directly;
//! instead it publishes a [`TaskControl`] value the body observes through its
//! [`TaskContext`]:
//!
//! - `Pause`: the body reaches a safe point, acknowledges through the context and
//!   waits until it is told to continue or to stop.
//! - `Stop`: the body should return as soon as possible.
//!
//! [`TaskContext::checkpoint`] and [`TaskContext::sleep`] implement that protocol, so
//! a body only has to call one of them regularly.

use crate::config::descriptor::{OptionBag, TaskDescriptor};
use crate::lifecycle::ModuleHandle;
use anyhow::bail;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Control signal published to a running body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskControl {
    /// Keep working
    Run,
    /// Acknowledge at the next checkpoint and wait
    Pause,
    /// Return as soon as possible
    Stop,
}

/// The implementation of a task.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    /// Does the work. Returning `Ok` completes the task, `Err` fails it.
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;

    /// Called once the body acknowledged a pause request.
    async fn on_pause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before a paused body is told to continue.
    async fn on_resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cleanup after an interrupt, once the body has stopped.
    async fn on_interrupt(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates a fresh body for every start of a task.
pub trait TaskFactory: Send + Sync + 'static {
    /// Builds the body for one start of `descriptor`.
    fn create(&self, descriptor: &TaskDescriptor) -> anyhow::Result<Arc<dyn TaskBody>>;
}

type Constructor = Arc<dyn Fn(&TaskDescriptor) -> anyhow::Result<Arc<dyn TaskBody>> + Send + Sync>;

/// Task factory dispatching on the descriptor's implementation identifier.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `module_class`.
    pub fn register<F>(&mut self, module_class: impl Into<String>, constructor: F)
    where
        F: Fn(&TaskDescriptor) -> anyhow::Result<Arc<dyn TaskBody>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(module_class.into(), Arc::new(constructor));
    }

    /// Registered identifiers
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl TaskFactory for TaskRegistry {
    fn create(&self, descriptor: &TaskDescriptor) -> anyhow::Result<Arc<dyn TaskBody>> {
        match self.constructors.get(&descriptor.module_class) {
            Some(constructor) => constructor(descriptor),
            None => bail!(
                "no task implementation registered for '{}'",
                descriptor.module_class
            ),
        }
    }
}

/// Everything a body gets to work with.
pub struct TaskContext {
    task: String,
    modules: BTreeMap<String, Arc<dyn ModuleHandle>>,
    options: OptionBag,
    control: watch::Receiver<TaskControl>,
    acks: mpsc::Sender<()>,
}

impl TaskContext {
    pub(crate) fn new(
        task: &str,
        modules: BTreeMap<String, Arc<dyn ModuleHandle>>,
        options: OptionBag,
        control: watch::Receiver<TaskControl>,
        acks: mpsc::Sender<()>,
    ) -> Self {
        Self {
            task: task.to_string(),
            modules,
            options,
            control,
            acks,
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.task
    }

    /// Module borrowed under `role`
    pub fn module(&self, role: &str) -> Option<&Arc<dyn ModuleHandle>> {
        self.modules.get(role)
    }

    /// Module borrowed under `role`, downcast to its concrete type
    pub fn module_as<T: 'static>(&self, role: &str) -> Option<&T> {
        self.module(role)
            .and_then(|m| m.as_any().downcast_ref::<T>())
    }

    /// Borrowed modules by role
    pub fn modules(&self) -> impl Iterator<Item = (&str, &Arc<dyn ModuleHandle>)> {
        self.modules.iter().map(|(role, m)| (role.as_str(), m))
    }

    /// Options from the task descriptor
    pub fn options(&self) -> &OptionBag {
        &self.options
    }

    /// Latest control signal
    pub fn control(&self) -> TaskControl {
        *self.control.borrow()
    }

    /// Whether the task was told to stop
    pub fn stop_requested(&self) -> bool {
        self.control() == TaskControl::Stop
    }

    /// Safe suspension point.
    ///
    /// Returns immediately while running. On a pause request it acknowledges and waits
    /// for the next signal. Returns an error once the task is told to stop; bodies
    /// should propagate it.
    pub async fn checkpoint(&mut self) -> anyhow::Result<()> {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                TaskControl::Run => return Ok(()),
                TaskControl::Stop => bail!("task '{}' was stopped", self.task),
                TaskControl::Pause => {
                    // A full buffer already holds an acknowledgement
                    let _ = self.acks.try_send(());
                    debug!(task = %self.task, "Pause acknowledged");
                    if self.control.changed().await.is_err() {
                        bail!("task '{}' lost its scheduler", self.task);
                    }
                }
            }
        }
    }

    /// Sleeps for `duration`, honouring pause and stop requests meanwhile.
    pub async fn sleep(&mut self, duration: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            self.checkpoint().await?;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                changed = self.control.changed() => {
                    if changed.is_err() {
                        bail!("task '{}' lost its scheduler", self.task);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("control", &self.control())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (TaskContext, watch::Sender<TaskControl>, mpsc::Receiver<()>) {
        let (control_tx, control_rx) = watch::channel(TaskControl::Run);
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let ctx = TaskContext::new("scan", BTreeMap::new(), OptionBag::new(), control_rx, ack_tx);
        (ctx, control_tx, ack_rx)
    }

    #[tokio::test]
    async fn checkpoint_passes_while_running() {
        let (mut ctx, _control, _acks) = context();
        assert!(ctx.checkpoint().await.is_ok());
        assert!(!ctx.stop_requested());
    }

    #[tokio::test]
    async fn pause_is_acknowledged_and_held_until_resume() {
        let (mut ctx, control, mut acks) = context();
        control.send_replace(TaskControl::Pause);

        let body = tokio::spawn(async move { ctx.checkpoint().await });
        acks.recv().await.unwrap();
        assert!(!body.is_finished());

        control.send_replace(TaskControl::Run);
        assert!(body.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn stop_while_paused_ends_the_body() {
        let (mut ctx, control, mut acks) = context();
        control.send_replace(TaskControl::Pause);

        let body = tokio::spawn(async move { ctx.sleep(Duration::from_secs(60)).await });
        acks.recv().await.unwrap();
        control.send_replace(TaskControl::Stop);

        let result = body.await.unwrap();
        assert!(result.unwrap_err().to_string().contains("stopped"));
    }

    #[test]
    fn registry_rejects_unknown_class() {
        let registry = TaskRegistry::new();
        let err = registry
            .create(&TaskDescriptor::new("scan", "confocal.Scan"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("confocal.Scan"));
    }
}
