//! In-process mock modules and task bodies.
//!
//! Used by the `run` command for dry runs of a wiring file and by the test suite.
//! Behaviour is driven by the descriptor's option bag:
//!
//! | Option | Applies to | Effect |
//! |---|---|---|
//! | `label` | module | name recorded in the journal (defaults to the class) |
//! | `fail_construct` | module | factory refuses to build the handle |
//! | `fail_activate` / `fail_deactivate` | module | hook returns an error |
//! | `construct_delay_ms` | module | factory sleeps before building the handle |
//! | `activate_delay_ms` | module | activation hook sleeps first |
//! | `duration_ms` | task | body completes after this long (runs until stopped otherwise) |
//! | `tick_ms` | task | checkpoint interval, default 10 |
//! | `checkpoint_ms` | task | body works blind this long between checkpoints, so pauses are acknowledged late |
//! | `fail` | task | body returns an error when done |
//! | `ignore_pause` | task | body never reaches a checkpoint |
//! | `fail_interrupt` | task | cleanup hook returns an error |

use super::hooks::{BoundConnections, ModuleFactory, ModuleHandle};
use crate::config::descriptor::{ModuleCategory, ModuleDescriptor, OptionBag, TaskDescriptor};
use crate::tasks::body::{TaskBody, TaskContext, TaskFactory};
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something a mock did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    /// Factory built the module handle
    Constructed(String),
    /// Module activation hook succeeded
    Activated(String),
    /// Module deactivation hook succeeded
    Deactivated(String),
    /// Task body began running
    TaskStarted(String),
    /// Task pause hook ran
    TaskPaused(String),
    /// Task resume hook ran
    TaskResumed(String),
    /// Task body returned `Ok`
    TaskCompleted(String),
    /// Task cleanup hook ran
    TaskInterrupted(String),
}

/// Ordered record of mock events, shared by every mock built from one factory.
#[derive(Debug, Default)]
pub struct MockJournal {
    events: Mutex<Vec<MockEvent>>,
}

impl MockJournal {
    /// Appends `event`.
    pub fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    /// Every event so far, oldest first
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    /// Occurrences of `event`
    pub fn count(&self, event: &MockEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence of `event`
    pub fn position(&self, event: &MockEvent) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

/// Descriptor for a mock module whose journal label is its name.
pub fn mock_module(name: &str, category: ModuleCategory) -> ModuleDescriptor {
    ModuleDescriptor::new(name, category, "mock.Module").option("label", serde_json::json!(name))
}

/// Descriptor for a mock task.
pub fn mock_task(name: &str) -> TaskDescriptor {
    TaskDescriptor::new(name, "mock.Task")
}

/// Builds mock modules for any implementation identifier, and mock task bodies.
#[derive(Clone, Debug, Default)]
pub struct MockFactory {
    journal: Arc<MockJournal>,
}

impl MockFactory {
    /// Creates a factory with an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal shared by everything this factory built
    pub fn journal(&self) -> &Arc<MockJournal> {
        &self.journal
    }
}

#[async_trait]
impl ModuleFactory for MockFactory {
    async fn construct(
        &self,
        module_class: &str,
        options: &OptionBag,
    ) -> anyhow::Result<Arc<dyn ModuleHandle>> {
        let label = options.get_str("label").unwrap_or(module_class).to_string();
        if let Some(delay) = options.get_u64("construct_delay_ms") {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if options.get_bool("fail_construct").unwrap_or(false) {
            bail!("mock '{label}' cannot be constructed");
        }
        self.journal.record(MockEvent::Constructed(label.clone()));
        Ok(Arc::new(MockModule {
            label,
            fail_activate: options.get_bool("fail_activate").unwrap_or(false),
            fail_deactivate: options.get_bool("fail_deactivate").unwrap_or(false),
            activate_delay: options.get_u64("activate_delay_ms").map(Duration::from_millis),
            journal: self.journal.clone(),
            active: AtomicBool::new(false),
            commands: AtomicU64::new(0),
            bound_roles: Mutex::new(Vec::new()),
        }))
    }
}

impl TaskFactory for MockFactory {
    fn create(&self, descriptor: &TaskDescriptor) -> anyhow::Result<Arc<dyn TaskBody>> {
        let options = &descriptor.options;
        Ok(Arc::new(MockTask {
            label: descriptor.name.clone(),
            duration: options.get_u64("duration_ms").map(Duration::from_millis),
            tick: Duration::from_millis(options.get_u64("tick_ms").unwrap_or(10)),
            blind: options.get_u64("checkpoint_ms").map(Duration::from_millis),
            fail: options.get_bool("fail").unwrap_or(false),
            ignore_pause: options.get_bool("ignore_pause").unwrap_or(false),
            fail_interrupt: options.get_bool("fail_interrupt").unwrap_or(false),
            journal: self.journal.clone(),
        }))
    }
}

/// Mock module handle.
#[derive(Debug)]
pub struct MockModule {
    label: String,
    fail_activate: bool,
    fail_deactivate: bool,
    activate_delay: Option<Duration>,
    journal: Arc<MockJournal>,
    active: AtomicBool,
    commands: AtomicU64,
    bound_roles: Mutex<Vec<String>>,
}

impl MockModule {
    /// Journal label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the activation hook ran and no deactivation followed
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Simulates a command from a consumer.
    pub fn command(&self) -> u64 {
        self.commands.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Commands received so far
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Roles bound by the last activation
    pub fn bound_roles(&self) -> Vec<String> {
        self.bound_roles.lock().clone()
    }
}

#[async_trait]
impl ModuleHandle for MockModule {
    async fn activate(&self, connections: &BoundConnections) -> anyhow::Result<()> {
        if let Some(delay) = self.activate_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_activate {
            bail!("mock '{}' refused to activate", self.label);
        }
        *self.bound_roles.lock() = connections.roles().map(String::from).collect();
        self.active.store(true, Ordering::SeqCst);
        self.journal.record(MockEvent::Activated(self.label.clone()));
        Ok(())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if self.fail_deactivate {
            bail!("mock '{}' failed to release its resources", self.label);
        }
        self.journal.record(MockEvent::Deactivated(self.label.clone()));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mock task body.
#[derive(Debug)]
pub struct MockTask {
    label: String,
    duration: Option<Duration>,
    tick: Duration,
    blind: Option<Duration>,
    fail: bool,
    ignore_pause: bool,
    fail_interrupt: bool,
    journal: Arc<MockJournal>,
}

#[async_trait]
impl TaskBody for MockTask {
    async fn run(&self, mut ctx: TaskContext) -> anyhow::Result<()> {
        self.journal.record(MockEvent::TaskStarted(self.label.clone()));

        if self.ignore_pause {
            tokio::time::sleep(self.duration.unwrap_or(Duration::from_secs(3600))).await;
        } else {
            let deadline = self.duration.map(|d| tokio::time::Instant::now() + d);
            while deadline.map_or(true, |d| tokio::time::Instant::now() < d) {
                match self.blind {
                    Some(interval) => {
                        ctx.checkpoint().await?;
                        tokio::time::sleep(interval).await;
                    }
                    None => ctx.sleep(self.tick).await?,
                }
                for (_, module) in ctx.modules() {
                    if let Some(module) = module.as_any().downcast_ref::<MockModule>() {
                        module.command();
                    }
                }
            }
        }

        if self.fail {
            bail!("mock task '{}' failed on purpose", self.label);
        }
        self.journal.record(MockEvent::TaskCompleted(self.label.clone()));
        Ok(())
    }

    async fn on_pause(&self) -> anyhow::Result<()> {
        self.journal.record(MockEvent::TaskPaused(self.label.clone()));
        Ok(())
    }

    async fn on_resume(&self) -> anyhow::Result<()> {
        self.journal.record(MockEvent::TaskResumed(self.label.clone()));
        Ok(())
    }

    async fn on_interrupt(&self) -> anyhow::Result<()> {
        self.journal.record(MockEvent::TaskInterrupted(self.label.clone()));
        if self.fail_interrupt {
            bail!("mock task '{}' left hardware in an unknown state", self.label);
        }
        Ok(())
    }
}
