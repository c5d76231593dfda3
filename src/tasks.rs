//! Task scheduling.
//!
//! [`TaskScheduler`] drives every declared task through
//!
//! ```text
//! Stopped -> Starting -> Running -> Finishing | Stopping -> Stopped
//!                        Running -> Pausing -> Paused -> Resuming -> Running
//! ```
//!
//! Starting a task checks that its `preposttasks` completed in the current run,
//! activates and borrows its `needsmodules` through the [`ModuleManager`], and pauses
//! every running task listed in its `pausetasks` before the body is spawned. Tasks
//! paused that way are resumed once the task stops, unless another running task
//! still holds them.
//!
//! A task and any task in its `pausetasks` are never `Running` at the same time: a
//! task cannot start or resume while a live task lists it in `pausetasks`.
//!
//! Borrows are scoped to `Running`; a paused task gives its modules back and borrows
//! them again on resume.

pub mod body;

pub use body::{TaskBody, TaskContext, TaskControl, TaskFactory, TaskRegistry};

use crate::config::descriptor::TaskDescriptor;
use crate::config::settings::SchedulerConfig;
use crate::error::{render_chain, AppResult, OrchestratorError};
use crate::graph::TaskGraph;
use crate::lifecycle::{ModuleHandle, ModuleLease, ModuleManager};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Task state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Not running; the initial and terminal state
    #[default]
    Stopped,
    /// Checking prerequisites, activating modules and pausing partners
    Starting,
    /// Body spawned and holding its modules
    Running,
    /// Waiting for the body to acknowledge a pause
    Pausing,
    /// Body parked at a checkpoint, modules given back
    Paused,
    /// Borrowing modules again before the body continues
    Resuming,
    /// Completing normally
    Finishing,
    /// Stopping after a failure or interrupt
    Stopping,
}

impl TaskState {
    /// States in which a task keeps its `pausetasks` from running
    fn holds_partners(self) -> bool {
        matches!(
            self,
            TaskState::Running | TaskState::Pausing | TaskState::Paused | TaskState::Resuming
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Stopped => "stopped",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Pausing => "pausing",
            TaskState::Paused => "paused",
            TaskState::Resuming => "resuming",
            TaskState::Finishing => "finishing",
            TaskState::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// Terminal status of the last run of a task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Body returned `Ok` or the task was finished
    Completed,
    /// Start, body or hook failed
    Failed(OrchestratorError),
    /// Interrupted with a clean cleanup hook
    Interrupted,
    /// Interrupted, and the cleanup hook failed
    InterruptedWithError(OrchestratorError),
}

impl TaskOutcome {
    /// Whether the run counts as a completed prerequisite
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed => write!(f, "completed"),
            TaskOutcome::Failed(error) => write!(f, "failed: {error}"),
            TaskOutcome::Interrupted => write!(f, "interrupted"),
            TaskOutcome::InterruptedWithError(error) => write!(f, "interrupted: {error}"),
        }
    }
}

/// Serialisable status record for one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    /// Task name
    pub name: String,
    /// Current state
    pub state: TaskState,
    /// Validation error keeping the task from ever starting
    pub invalid: Option<String>,
    /// Outcome of the last run in this session
    pub last_outcome: Option<String>,
    /// Completed starts, successful or not
    pub runs: u64,
    /// Modules borrowed right now
    pub borrowed: Vec<String>,
    /// Tasks held paused by this one
    pub holding: Vec<String>,
}

/// Out-of-band cancellation for a blocked transition.
#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            // Registered before the check so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct ActiveRun {
    id: u64,
    body: Arc<dyn TaskBody>,
    control: Arc<watch::Sender<TaskControl>>,
    acks: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    exited: watch::Receiver<bool>,
    join: Option<JoinHandle<()>>,
    leases: Vec<ModuleLease>,
    partners: Vec<String>,
}

#[derive(Default)]
struct SlotState {
    claiming: bool,
    auto_paused: bool,
    outcome: Option<TaskOutcome>,
    runs: u64,
    cancel: Arc<CancelSignal>,
    run: Option<ActiveRun>,
}

struct TaskSlot {
    transition: tokio::sync::Mutex<()>,
    state: watch::Sender<TaskState>,
    inner: Mutex<SlotState>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            transition: tokio::sync::Mutex::new(()),
            state: watch::channel(TaskState::Stopped).0,
            inner: Mutex::new(SlotState::default()),
        }
    }

    fn current(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Fresh cancellation signal for the transition about to block
    fn renew_cancel(&self) -> Arc<CancelSignal> {
        let signal = Arc::new(CancelSignal::default());
        self.inner.lock().cancel = signal.clone();
        signal
    }
}

enum Teardown {
    Complete,
    Fail(OrchestratorError),
    Interrupt,
}

enum PauseAck {
    Received,
    TimedOut,
    BodyExited,
    Cancelled,
}

struct SchedulerInner {
    manager: ModuleManager,
    factory: Arc<dyn TaskFactory>,
    config: SchedulerConfig,
    graph: TaskGraph,
    descriptors: BTreeMap<String, TaskDescriptor>,
    slots: BTreeMap<String, Arc<TaskSlot>>,
    relations: Mutex<()>,
    session: AtomicU64,
}

/// Runs the tasks declared in the manager's descriptor store.
///
/// Cheap to clone; clones drive the same tasks.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Creates a scheduler for every task in the manager's current snapshot.
    pub fn new(manager: ModuleManager, factory: Arc<dyn TaskFactory>, config: SchedulerConfig) -> Self {
        let snapshot = manager.descriptors();
        let graph = TaskGraph::build(&snapshot);
        let slots = snapshot
            .tasks
            .keys()
            .map(|name| (name.clone(), Arc::new(TaskSlot::new())))
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                factory,
                config,
                graph,
                descriptors: snapshot.tasks.clone(),
                slots,
                relations: Mutex::new(()),
                session: AtomicU64::new(0),
            }),
        }
    }

    /// Manager the scheduler borrows modules from
    pub fn manager(&self) -> &ModuleManager {
        &self.inner.manager
    }

    /// Validated task relations
    pub fn graph(&self) -> &TaskGraph {
        &self.inner.graph
    }

    /// Declared task names
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.inner.descriptors.keys().map(String::as_str)
    }

    /// Current state of `name`
    pub fn state(&self, name: &str) -> AppResult<TaskState> {
        Ok(self.slot(name)?.current())
    }

    /// Receiver observing every state change of `name`.
    pub fn watch(&self, name: &str) -> AppResult<watch::Receiver<TaskState>> {
        Ok(self.slot(name)?.state.subscribe())
    }

    /// Waits until `name` is in `state`, for at most `within`.
    pub async fn wait_for_state(&self, name: &str, state: TaskState, within: Duration) -> AppResult<()> {
        let mut receiver = self.watch(name)?;
        let reached = tokio::time::timeout(within, receiver.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if reached {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                entity: name.to_string(),
                operation: format!("reach {state} within {} ms", within.as_millis()),
                state: receiver.borrow().to_string(),
            })
        }
    }

    /// Outcome of the last run of `name` in the current session
    pub fn outcome(&self, name: &str) -> AppResult<Option<TaskOutcome>> {
        Ok(self.slot(name)?.inner.lock().outcome.clone())
    }

    /// Starts a new session, forgetting every recorded outcome.
    ///
    /// `preposttasks` only count completions within the current session.
    pub fn begin_run(&self) -> u64 {
        for slot in self.inner.slots.values() {
            slot.inner.lock().outcome = None;
        }
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session, "New task session");
        session
    }

    /// Status record for `name`
    pub fn status(&self, name: &str) -> AppResult<TaskStatus> {
        let slot = self.slot(name)?;
        let state = slot.current();
        let inner = slot.inner.lock();
        let (borrowed, holding) = match &inner.run {
            Some(run) => (
                run.leases.iter().map(|l| l.module().to_string()).collect(),
                run.partners.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Ok(TaskStatus {
            name: name.to_string(),
            state,
            invalid: self.inner.graph.error_for(name).map(|e| e.to_string()),
            last_outcome: inner.outcome.as_ref().map(|o| o.to_string()),
            runs: inner.runs,
            borrowed,
            holding,
        })
    }

    /// Status of every declared task, by name
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.tasks().filter_map(|n| self.status(n).ok()).collect()
    }

    /// Starts `name`.
    ///
    /// Returns once the task is `Running` and its body is spawned. Blocks on module
    /// activation and on every pause partner acknowledging; [`interrupt`](Self::interrupt)
    /// cancels a blocked start.
    pub async fn start(&self, name: &str) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        let descriptor = self.descriptor(name)?.clone();
        if let Some(error) = self.inner.graph.error_for(name) {
            return Err(error.clone());
        }

        let _transition = slot.transition.lock().await;
        let state = slot.current();
        if state != TaskState::Stopped {
            return Err(invalid_transition(name, "start", state));
        }

        for prerequisite in &descriptor.preposttasks {
            let completed = self
                .inner
                .slots
                .get(prerequisite)
                .map(|s| matches!(s.inner.lock().outcome, Some(TaskOutcome::Completed)))
                .unwrap_or(false);
            if !completed {
                return Err(OrchestratorError::PrerequisiteNotComplete {
                    task: name.to_string(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }

        let body = match self.inner.factory.create(&descriptor) {
            Ok(body) => body,
            Err(e) => {
                let error = OrchestratorError::ConstructionError {
                    module: name.to_string(),
                    message: render_chain(&e),
                };
                slot.inner.lock().outcome = Some(TaskOutcome::Failed(error.clone()));
                warn!(task = %name, error = %error, "Task body could not be created");
                return Err(error);
            }
        };

        let cancel = slot.renew_cancel();
        self.set_state(name, &slot, TaskState::Starting);

        let (leases, partners) = match self.prepare_start(name, &descriptor, &slot, &cancel).await {
            Ok(prepared) => prepared,
            Err((error, partners)) => {
                self.release_partners(name, partners).await;
                let outcome = if cancel.is_cancelled() {
                    TaskOutcome::Interrupted
                } else {
                    TaskOutcome::Failed(error.clone())
                };
                {
                    let mut inner = slot.inner.lock();
                    inner.claiming = false;
                    inner.outcome = Some(outcome);
                }
                self.set_state(name, &slot, TaskState::Stopped);
                warn!(task = %name, error = %error, "Task did not start");
                return Err(error);
            }
        };

        self.launch(name, &descriptor, &slot, body, leases, partners);
        Ok(())
    }

    /// Pauses a running task and waits for its acknowledgement.
    ///
    /// A task that does not acknowledge within the pause timeout is failed with
    /// `PauseTimeout`.
    pub async fn pause(&self, name: &str) -> AppResult<()> {
        self.pause_as(name, None).await
    }

    /// Resumes a paused task. Fails while a live task holds it paused.
    pub async fn resume(&self, name: &str) -> AppResult<()> {
        self.resume_as(name, None).await
    }

    /// Completes a running or paused task.
    pub async fn finish(&self, name: &str) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        let _transition = slot.transition.lock().await;
        let state = slot.current();
        if !matches!(state, TaskState::Running | TaskState::Paused) {
            return Err(invalid_transition(name, "finish", state));
        }
        self.teardown(name, &slot, TaskState::Finishing, Teardown::Complete)
            .await;
        Ok(())
    }

    /// Fails a running or paused task with `message`.
    pub async fn fail(&self, name: &str, message: &str) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        let _transition = slot.transition.lock().await;
        let state = slot.current();
        if !matches!(state, TaskState::Running | TaskState::Paused) {
            return Err(invalid_transition(name, "fail", state));
        }
        let error = OrchestratorError::TaskFailed {
            task: name.to_string(),
            message: message.to_string(),
        };
        self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error))
            .await;
        Ok(())
    }

    /// Stops a task whatever it is doing.
    ///
    /// A blocked start or pause is cancelled first. The body is asked to stop, aborted
    /// after the interrupt grace period, and the cleanup hook runs. A failing cleanup
    /// is recorded as `InterruptedWithError`; the call itself still succeeds.
    pub async fn interrupt(&self, name: &str) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        if matches!(slot.current(), TaskState::Starting | TaskState::Pausing) {
            let cancel = slot.inner.lock().cancel.clone();
            cancel.cancel();
        }

        let _transition = slot.transition.lock().await;
        let state = slot.current();
        match state {
            TaskState::Running | TaskState::Paused | TaskState::Pausing | TaskState::Resuming => {
                info!(task = %name, state = %state, "Interrupting task");
                self.teardown(name, &slot, TaskState::Stopping, Teardown::Interrupt)
                    .await;
            }
            _ => debug!(task = %name, state = %state, "Nothing to interrupt"),
        }
        Ok(())
    }

    /// Interrupts every task that is not stopped.
    pub async fn shutdown(&self) {
        let mut names: Vec<String> = self.inner.graph.order().to_vec();
        names.reverse();
        for name in self.inner.descriptors.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        for name in names {
            if self.state(&name).map(|s| s != TaskState::Stopped).unwrap_or(false) {
                let _ = self.interrupt(&name).await;
            }
        }
    }

    async fn prepare_start(
        &self,
        name: &str,
        descriptor: &TaskDescriptor,
        slot: &TaskSlot,
        cancel: &CancelSignal,
    ) -> Result<(Vec<(String, ModuleLease)>, Vec<String>), (OrchestratorError, Vec<String>)> {
        // Module activation keeps going if the start is cancelled
        let activation: JoinHandle<AppResult<()>> = {
            let manager = self.inner.manager.clone();
            let task = name.to_string();
            let needed: Vec<String> = descriptor.needsmodules.values().cloned().collect();
            tokio::spawn(async move {
                for module in needed {
                    manager.activate(&module).await.map_err(|error| {
                        OrchestratorError::ModuleUnavailable {
                            task: task.clone(),
                            module: module.clone(),
                            reason: error.to_string(),
                        }
                    })?;
                }
                Ok(())
            })
        };

        tokio::select! {
            joined = activation => match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err((error, Vec::new())),
                Err(join) => return Err((task_failed(name, &join.to_string()), Vec::new())),
            },
            _ = cancel.cancelled() => return Err((start_interrupted(name), Vec::new())),
        }

        let (to_pause, mut partners) = {
            let _relations = self.inner.relations.lock();
            if let Some(holder) = self.holder_of(name, None) {
                return Err((
                    OrchestratorError::InvalidTransition {
                        entity: name.to_string(),
                        operation: "start".to_string(),
                        state: format!("held paused by '{holder}'"),
                    },
                    Vec::new(),
                ));
            }

            let mut to_pause = Vec::new();
            let mut held = Vec::new();
            for partner in &descriptor.pausetasks {
                let Some(partner_slot) = self.inner.slots.get(partner) else {
                    continue;
                };
                let state = partner_slot.current();
                // A partner on its way up would reach Running behind our back
                if state == TaskState::Starting || partner_slot.inner.lock().claiming {
                    return Err((
                        OrchestratorError::InvalidTransition {
                            entity: name.to_string(),
                            operation: "start".to_string(),
                            state: format!("partner '{partner}' is starting"),
                        },
                        Vec::new(),
                    ));
                }
                match state {
                    TaskState::Running | TaskState::Pausing | TaskState::Resuming => {
                        to_pause.push(partner.clone())
                    }
                    TaskState::Paused if partner_slot.inner.lock().auto_paused => {
                        held.push(partner.clone())
                    }
                    _ => {}
                }
            }
            slot.inner.lock().claiming = true;
            (to_pause, held)
        };

        if !to_pause.is_empty() {
            debug!(task = %name, partners = ?to_pause, "Pausing partner tasks");
        }
        let pauses = futures::future::join_all(to_pause.into_iter().map(|partner| {
            let scheduler = self.clone();
            let holder = name.to_string();
            let target = partner.clone();
            let handle = tokio::spawn(async move { scheduler.pause_as(&target, Some(&holder)).await });
            async move { (partner, handle.await) }
        }));
        tokio::pin!(pauses);

        let mut failure = None;
        let results = tokio::select! {
            results = &mut pauses => results,
            _ = cancel.cancelled() => {
                failure = Some(start_interrupted(name));
                pauses.await
            }
        };

        for (partner, result) in results {
            match result {
                Ok(Ok(())) => partners.push(partner),
                // Partner left Running on its own meanwhile
                Ok(Err(OrchestratorError::InvalidTransition { .. })) => {}
                Ok(Err(error)) => {
                    failure.get_or_insert(OrchestratorError::PausePartnerUnresponsive {
                        task: name.to_string(),
                        partner,
                        reason: error.to_string(),
                    });
                }
                Err(join) => {
                    failure.get_or_insert(OrchestratorError::PausePartnerUnresponsive {
                        task: name.to_string(),
                        partner,
                        reason: join.to_string(),
                    });
                }
            }
        }
        if let Some(error) = failure {
            return Err((error, partners));
        }

        match self.borrow_modules(name, descriptor) {
            Ok(leases) => Ok((leases, partners)),
            Err(error) => Err((error, partners)),
        }
    }

    fn launch(
        &self,
        name: &str,
        descriptor: &TaskDescriptor,
        slot: &Arc<TaskSlot>,
        body: Arc<dyn TaskBody>,
        leases: Vec<(String, ModuleLease)>,
        partners: Vec<String>,
    ) {
        let (control_tx, control_rx) = watch::channel(TaskControl::Run);
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let (exited_tx, exited_rx) = watch::channel(false);

        let modules: BTreeMap<String, Arc<dyn ModuleHandle>> = leases
            .iter()
            .map(|(role, lease)| (role.clone(), lease.handle().clone()))
            .collect();
        let context = TaskContext::new(name, modules, descriptor.options.clone(), control_rx, ack_tx);
        let revocations = revocations(&leases);

        let run_id = {
            let _relations = self.inner.relations.lock();
            let mut inner = slot.inner.lock();
            inner.runs += 1;
            let id = inner.runs;
            inner.claiming = false;
            inner.run = Some(ActiveRun {
                id,
                body: body.clone(),
                control: Arc::new(control_tx),
                acks: Arc::new(tokio::sync::Mutex::new(ack_rx)),
                exited: exited_rx,
                join: None,
                leases: leases.into_iter().map(|(_, lease)| lease).collect(),
                partners,
            });
            drop(inner);
            self.set_state(name, slot, TaskState::Running);
            id
        };
        info!(task = %name, run = run_id, "Task running");
        self.watch_leases(name, run_id, revocations);

        let scheduler = self.clone();
        let task = name.to_string();
        let join = tokio::spawn(async move {
            let result = body.run(context).await;
            let _ = exited_tx.send(true);
            scheduler.on_body_exit(&task, run_id, result).await;
        });

        if let Some(run) = slot.inner.lock().run.as_mut() {
            run.join = Some(join);
        }
    }

    async fn on_body_exit(&self, name: &str, run_id: u64, result: anyhow::Result<()>) {
        let Ok(slot) = self.slot(name).cloned() else {
            return;
        };
        let _transition = slot.transition.lock().await;

        let current = slot.inner.lock().run.as_ref().map(|r| r.id);
        let state = slot.current();
        if current != Some(run_id) || !matches!(state, TaskState::Running | TaskState::Paused) {
            // Already being torn down elsewhere
            return;
        }

        match result {
            Ok(()) => {
                self.teardown(name, &slot, TaskState::Finishing, Teardown::Complete)
                    .await
            }
            Err(e) => {
                let error = task_failed(name, &render_chain(&e));
                self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error))
                    .await
            }
        }
    }

    /// Fails run `run_id` of `name` once any of the given borrows is revoked.
    ///
    /// The watcher ends quietly when the borrows are given back.
    fn watch_leases(&self, name: &str, run_id: u64, revocations: Vec<(String, watch::Receiver<bool>)>) {
        if revocations.is_empty() {
            return;
        }
        let watches: Vec<BoxFuture<'static, Result<String, ()>>> = revocations
            .into_iter()
            .map(|(module, mut revocation)| {
                async move {
                    let revoked = revocation.wait_for(|revoked| *revoked).await.is_ok();
                    if revoked {
                        Ok(module)
                    } else {
                        Err(())
                    }
                }
                .boxed()
            })
            .collect();

        let scheduler = self.clone();
        let task = name.to_string();
        tokio::spawn(async move {
            if let Ok((module, _)) = futures::future::select_ok(watches).await {
                scheduler.on_lease_revoked(&task, run_id, &module).await;
            }
        });
    }

    async fn on_lease_revoked(&self, name: &str, run_id: u64, module: &str) {
        let Ok(slot) = self.slot(name).cloned() else {
            return;
        };
        let _transition = slot.transition.lock().await;

        let current = slot.inner.lock().run.as_ref().map(|r| r.id);
        if current != Some(run_id) || slot.current() != TaskState::Running {
            // Paused meanwhile; resuming borrows again
            return;
        }

        let error = OrchestratorError::ModuleUnavailable {
            task: name.to_string(),
            module: module.to_string(),
            reason: "module was deactivated while borrowed".to_string(),
        };
        warn!(task = %name, module = %module, "Borrowed module went away");
        self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error))
            .await;
    }

    async fn pause_as(&self, name: &str, holder: Option<&str>) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        let _transition = slot.transition.lock().await;
        let state = slot.current();
        if state != TaskState::Running {
            return Err(invalid_transition(name, "pause", state));
        }

        let cancel = slot.renew_cancel();
        let (control, acks, body) = {
            let inner = slot.inner.lock();
            let Some(run) = inner.run.as_ref() else {
                return Err(invalid_transition(name, "pause", state));
            };
            (run.control.clone(), run.acks.clone(), run.body.clone())
        };

        self.set_state(name, &slot, TaskState::Pausing);
        let timeout = self.inner.config.pause_timeout();
        let ack = {
            let mut acks = acks.lock().await;
            while acks.try_recv().is_ok() {}
            control.send_replace(TaskControl::Pause);
            tokio::select! {
                received = tokio::time::timeout(timeout, acks.recv()) => match received {
                    Ok(Some(())) => PauseAck::Received,
                    Ok(None) => PauseAck::BodyExited,
                    Err(_) => PauseAck::TimedOut,
                },
                _ = cancel.cancelled() => PauseAck::Cancelled,
            }
        };

        match ack {
            PauseAck::Received => {
                if let Err(e) = body.on_pause().await {
                    let error = task_failed(name, &format!("pause hook failed: {}", render_chain(&e)));
                    self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error.clone()))
                        .await;
                    return Err(error);
                }
                {
                    let mut inner = slot.inner.lock();
                    inner.auto_paused = holder.is_some();
                    if let Some(run) = inner.run.as_mut() {
                        run.leases.clear();
                    }
                }
                self.set_state(name, &slot, TaskState::Paused);
                info!(task = %name, by = holder.unwrap_or("caller"), "Task paused");
                Ok(())
            }
            PauseAck::TimedOut => {
                let error = OrchestratorError::PauseTimeout {
                    task: name.to_string(),
                    timeout_ms: self.inner.config.pause_timeout_ms,
                };
                warn!(task = %name, error = %error, "Pause not acknowledged");
                self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error.clone()))
                    .await;
                Err(error)
            }
            PauseAck::BodyExited => {
                // Let the exit handler finish it
                control.send_replace(TaskControl::Run);
                self.set_state(name, &slot, TaskState::Running);
                Err(invalid_transition(name, "pause", TaskState::Finishing))
            }
            PauseAck::Cancelled => Err(task_failed(name, "pause interrupted")),
        }
    }

    async fn resume_as(&self, name: &str, holder: Option<&str>) -> AppResult<()> {
        let slot = self.slot(name)?.clone();
        let _transition = slot.transition.lock().await;
        let state = slot.current();
        if state != TaskState::Paused {
            return Err(invalid_transition(name, "resume", state));
        }

        {
            let _relations = self.inner.relations.lock();
            if holder.is_some() && !slot.inner.lock().auto_paused {
                // Paused by a caller, not by the releasing task
                return Ok(());
            }
            if let Some(other) = self.holder_of(name, holder) {
                if holder.is_some() {
                    debug!(task = %name, holder = %other, "Still held paused");
                    return Ok(());
                }
                return Err(OrchestratorError::InvalidTransition {
                    entity: name.to_string(),
                    operation: "resume".to_string(),
                    state: format!("held paused by '{other}'"),
                });
            }
            self.set_state(name, &slot, TaskState::Resuming);
        }

        let descriptor = self.descriptor(name)?.clone();
        let leases = match self.borrow_modules(name, &descriptor) {
            Ok(leases) => leases,
            Err(error) => {
                self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error.clone()))
                    .await;
                return Err(error);
            }
        };

        let body = slot.inner.lock().run.as_ref().map(|r| r.body.clone());
        if let Some(body) = body {
            if let Err(e) = body.on_resume().await {
                drop(leases);
                let error = task_failed(name, &format!("resume hook failed: {}", render_chain(&e)));
                self.teardown(name, &slot, TaskState::Stopping, Teardown::Fail(error.clone()))
                    .await;
                return Err(error);
            }
        }

        let revocations = revocations(&leases);
        let run_id = {
            let mut inner = slot.inner.lock();
            inner.auto_paused = false;
            inner.run.as_mut().map(|run| {
                run.leases = leases.into_iter().map(|(_, lease)| lease).collect();
                run.control.send_replace(TaskControl::Run);
                run.id
            })
        };
        self.set_state(name, &slot, TaskState::Running);
        info!(task = %name, by = holder.unwrap_or("caller"), "Task resumed");
        if let Some(run_id) = run_id {
            self.watch_leases(name, run_id, revocations);
        }
        Ok(())
    }

    async fn teardown(&self, name: &str, slot: &TaskSlot, via: TaskState, reason: Teardown) {
        self.set_state(name, slot, via);
        let run = slot.inner.lock().run.take();

        let outcome = match run {
            Some(mut run) => {
                self.stop_body(name, &mut run).await;
                let outcome = match reason {
                    Teardown::Complete => TaskOutcome::Completed,
                    Teardown::Fail(error) => TaskOutcome::Failed(error),
                    Teardown::Interrupt => match run.body.on_interrupt().await {
                        Ok(()) => TaskOutcome::Interrupted,
                        Err(e) => TaskOutcome::InterruptedWithError(
                            OrchestratorError::InterruptedWithError {
                                task: name.to_string(),
                                message: render_chain(&e),
                            },
                        ),
                    },
                };
                run.leases.clear();
                self.release_partners(name, std::mem::take(&mut run.partners))
                    .await;
                outcome
            }
            None => match reason {
                Teardown::Complete => TaskOutcome::Completed,
                Teardown::Fail(error) => TaskOutcome::Failed(error),
                Teardown::Interrupt => TaskOutcome::Interrupted,
            },
        };

        match &outcome {
            TaskOutcome::Completed | TaskOutcome::Interrupted => {
                info!(task = %name, outcome = %outcome, "Task stopped")
            }
            _ => warn!(task = %name, outcome = %outcome, "Task stopped"),
        }

        {
            let mut inner = slot.inner.lock();
            inner.outcome = Some(outcome);
            inner.claiming = false;
            inner.auto_paused = false;
        }
        self.set_state(name, slot, TaskState::Stopped);
    }

    /// Signals stop and aborts the body if it outlives the grace period.
    async fn stop_body(&self, name: &str, run: &mut ActiveRun) {
        run.control.send_replace(TaskControl::Stop);
        let mut exited = run.exited.clone();
        let grace = self.inner.config.interrupt_grace();
        let stopped = tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !stopped {
            if let Some(join) = run.join.take() {
                join.abort();
            }
            warn!(task = %name, grace_ms = grace.as_millis() as u64, "Body did not stop in time; aborted");
        }
    }

    /// Resumes the partners `holder` paused, unless another live task still holds them.
    fn release_partners(&self, holder: &str, partners: Vec<String>) -> BoxFuture<'static, ()> {
        let scheduler = self.clone();
        let holder = holder.to_string();
        async move {
            for partner in partners {
                if let Err(error) = scheduler.resume_as(&partner, Some(&holder)).await {
                    warn!(task = %holder, partner = %partner, error = %error, "Partner not resumed");
                }
            }
        }
        .boxed()
    }

    fn borrow_modules(
        &self,
        name: &str,
        descriptor: &TaskDescriptor,
    ) -> AppResult<Vec<(String, ModuleLease)>> {
        descriptor
            .needsmodules
            .iter()
            .map(|(role, module)| {
                self.inner
                    .manager
                    .borrow(module, name)
                    .map(|lease| (role.clone(), lease))
                    .map_err(|error| OrchestratorError::ModuleUnavailable {
                        task: name.to_string(),
                        module: module.clone(),
                        reason: error.to_string(),
                    })
            })
            .collect()
    }

    /// First live task, other than `exclude`, listing `name` in its `pausetasks`.
    ///
    /// Callers hold the relations lock.
    fn holder_of(&self, name: &str, exclude: Option<&str>) -> Option<String> {
        self.inner
            .descriptors
            .values()
            .filter(|d| d.name != name && Some(d.name.as_str()) != exclude)
            .filter(|d| d.pausetasks.iter().any(|p| p == name))
            .find(|d| {
                self.inner.slots.get(&d.name).map_or(false, |slot| {
                    slot.current().holds_partners() || slot.inner.lock().claiming
                })
            })
            .map(|d| d.name.clone())
    }

    fn set_state(&self, name: &str, slot: &TaskSlot, state: TaskState) {
        let previous = slot.state.send_replace(state);
        if previous != state {
            debug!(task = %name, from = %previous, to = %state, "Task state transition");
        }
    }

    fn slot(&self, name: &str) -> AppResult<&Arc<TaskSlot>> {
        self.inner
            .slots
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))
    }

    fn descriptor(&self, name: &str) -> AppResult<&TaskDescriptor> {
        self.inner
            .descriptors
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.inner.descriptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn invalid_transition(name: &str, operation: &str, state: TaskState) -> OrchestratorError {
    OrchestratorError::InvalidTransition {
        entity: name.to_string(),
        operation: operation.to_string(),
        state: state.to_string(),
    }
}

fn task_failed(name: &str, message: &str) -> OrchestratorError {
    OrchestratorError::TaskFailed {
        task: name.to_string(),
        message: message.to_string(),
    }
}

fn start_interrupted(name: &str) -> OrchestratorError {
    task_failed(name, "interrupted while starting")
}

fn revocations(leases: &[(String, ModuleLease)]) -> Vec<(String, watch::Receiver<bool>)> {
    leases
        .iter()
        .map(|(_, lease)| (lease.module().to_string(), lease.revocation()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::descriptor::ModuleCategory::Hardware;
    use crate::config::store::{DescriptorStore, WiringSnapshot};
    use crate::lifecycle::mock::{mock_module, mock_task, MockEvent, MockFactory};
    use serde_json::json;
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_secs(2);

    fn scheduler(tasks: Vec<TaskDescriptor>) -> (TaskScheduler, MockFactory) {
        let factory = MockFactory::new();
        let store = Arc::new(DescriptorStore::new(WiringSnapshot::new(
            [mock_module("stage", Hardware)],
            tasks,
        )));
        let manager = ModuleManager::new(store, false, Arc::new(factory.clone()));
        let config = SchedulerConfig {
            pause_timeout_ms: 200,
            interrupt_grace_ms: 100,
        };
        (
            TaskScheduler::new(manager, Arc::new(factory.clone()), config),
            factory,
        )
    }

    #[tokio::test]
    async fn body_returning_ok_completes_the_task() {
        let (scheduler, factory) =
            scheduler(vec![mock_task("focus").option("duration_ms", json!(20))]);

        scheduler.start("focus").await.unwrap();
        scheduler
            .wait_for_state("focus", TaskState::Stopped, WAIT)
            .await
            .unwrap();

        assert_eq!(scheduler.outcome("focus").unwrap(), Some(TaskOutcome::Completed));
        assert_eq!(factory.journal().count(&MockEvent::TaskCompleted("focus".into())), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (scheduler, _factory) = scheduler(vec![mock_task("scan")]);
        scheduler.start("scan").await.unwrap();

        let err = scheduler.start("scan").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { ref state, .. } if state == "running"));

        scheduler.interrupt("scan").await.unwrap();
        assert_eq!(scheduler.state("scan").unwrap(), TaskState::Stopped);
        assert_eq!(scheduler.outcome("scan").unwrap(), Some(TaskOutcome::Interrupted));
    }

    #[tokio::test]
    async fn failing_body_records_its_error() {
        let (scheduler, _factory) = scheduler(vec![mock_task("scan")
            .option("duration_ms", json!(10))
            .option("fail", json!(true))]);

        scheduler.start("scan").await.unwrap();
        scheduler
            .wait_for_state("scan", TaskState::Stopped, WAIT)
            .await
            .unwrap();

        match scheduler.outcome("scan").unwrap() {
            Some(TaskOutcome::Failed(OrchestratorError::TaskFailed { task, message })) => {
                assert_eq!(task, "scan");
                assert!(message.contains("on purpose"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn borrows_are_released_while_paused() {
        let (scheduler, _factory) = scheduler(vec![mock_task("scan").needs("axis", "stage")]);
        scheduler.start("scan").await.unwrap();
        assert_eq!(scheduler.status("scan").unwrap().borrowed, vec!["stage"]);

        scheduler.pause("scan").await.unwrap();
        assert_eq!(scheduler.state("scan").unwrap(), TaskState::Paused);
        assert!(scheduler.status("scan").unwrap().borrowed.is_empty());

        scheduler.resume("scan").await.unwrap();
        assert_eq!(scheduler.status("scan").unwrap().borrowed, vec!["stage"]);

        scheduler.finish("scan").await.unwrap();
        assert_eq!(scheduler.outcome("scan").unwrap(), Some(TaskOutcome::Completed));
        assert!(scheduler.manager().status("stage").unwrap().borrowers.is_empty());
    }

    #[tokio::test]
    async fn begin_run_forgets_outcomes() {
        let (scheduler, _factory) =
            scheduler(vec![mock_task("focus").option("duration_ms", json!(1))]);
        scheduler.start("focus").await.unwrap();
        scheduler
            .wait_for_state("focus", TaskState::Stopped, WAIT)
            .await
            .unwrap();
        assert!(scheduler.outcome("focus").unwrap().is_some());

        assert_eq!(scheduler.begin_run(), 1);
        assert_eq!(scheduler.outcome("focus").unwrap(), None);
        assert_eq!(scheduler.status("focus").unwrap().runs, 1);
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let (scheduler, _factory) = scheduler(vec![]);
        assert_eq!(
            scheduler.start("ghost").await.unwrap_err(),
            OrchestratorError::UnknownTask("ghost".into())
        );
        assert!(scheduler.interrupt("ghost").await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn unacknowledged_pause_is_logged_and_fails_the_task() {
        let (scheduler, _factory) =
            scheduler(vec![mock_task("stubborn").option("ignore_pause", json!(true))]);
        scheduler.start("stubborn").await.unwrap();

        let err = scheduler.pause("stubborn").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PauseTimeout { timeout_ms: 200, .. }));
        assert!(logs_contain("Pause not acknowledged"));
        assert!(logs_contain("aborted"));
    }
}
