//! Module lifecycle management.
//!
//! [`ModuleManager`] owns every live module instance. Each instance moves through
//!
//! ```text
//! Unloaded -> Loaded -> Active -> Deactivating -> Unloaded
//! ```
//!
//! `Loaded` means the factory built a handle whose connections are not bound yet. A
//! failure on the way to `Active` drops the handle, leaves the instance `Unloaded` and
//! records the error on it; nothing is retried.
//!
//! Transitions are serialized per module by an async transition lock. Activating a
//! chain of dependencies takes one lock at a time, so independent modules progress
//! concurrently.
//!
//! The manager is cheap to clone; clones share the same instances.

pub mod hooks;
pub mod mock;

pub use hooks::{BoundConnections, FactoryRegistry, ModuleFactory, ModuleHandle};

use crate::config::descriptor::{ModuleCategory, ModuleDescriptor};
use crate::config::settings::Settings;
use crate::config::store::{DescriptorStore, WiringSnapshot};
use crate::error::{render_chain, AppResult, OrchestratorError};
use crate::graph::{ModuleResolver, OrderDelta};
use crate::remote::RemoteDirectory;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runtime state of a module instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// No live instance
    #[default]
    Unloaded,
    /// Constructed, connections not bound yet
    Loaded,
    /// Connections bound and activation hook succeeded
    Active,
    /// Deactivation hook in progress
    Deactivating,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Unloaded => write!(f, "unloaded"),
            ModuleState::Loaded => write!(f, "loaded"),
            ModuleState::Active => write!(f, "active"),
            ModuleState::Deactivating => write!(f, "deactivating"),
        }
    }
}

/// Serialisable status record for one module.
#[derive(Clone, Debug, Serialize)]
pub struct ModuleStatus {
    /// Module name
    pub name: String,
    /// Declared category
    pub category: ModuleCategory,
    /// Current lifecycle state
    pub state: ModuleState,
    /// Runtime failure, or the validation error keeping the module out of the graph
    pub last_error: Option<String>,
    /// Tasks currently borrowing the module
    pub borrowers: Vec<String>,
    /// Modules connecting to this one
    pub dependents: Vec<String>,
    /// Published for remote access
    pub remote: bool,
    /// Successful activations since the manager was created
    pub activations: u64,
}

/// What a descriptor change did to the running modules.
#[derive(Clone, Debug, Default)]
pub struct Reconfiguration {
    /// Resolver update
    pub delta: OrderDelta,
    /// Modules deactivated for the change, dependents first
    pub stopped: Vec<String>,
    /// Stopped modules that were brought back up
    pub restarted: Vec<String>,
    /// Stopped modules that failed to come back
    pub failures: BTreeMap<String, OrchestratorError>,
}

#[derive(Default)]
struct ModuleSlot {
    transition: tokio::sync::Mutex<()>,
    inner: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    state: ModuleState,
    /// Activation in progress; dependencies must stay up
    pending: bool,
    last_error: Option<OrchestratorError>,
    handle: Option<Arc<dyn ModuleHandle>>,
    connections: Option<BoundConnections>,
    borrowers: BTreeMap<u64, Borrow>,
    exclusive: bool,
    activations: u64,
}

struct Borrow {
    borrower: String,
    revoked: watch::Sender<bool>,
}

impl SlotState {
    fn borrower_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.borrowers.values().map(|b| b.borrower.clone()).collect();
        names.sort();
        names
    }
}

/// Time-scoped access to an active module. Dropping the lease ends the borrow.
///
/// A forced deactivation revokes the lease; the holder must stop using the handle.
pub struct ModuleLease {
    module: String,
    borrower: String,
    id: u64,
    handle: Arc<dyn ModuleHandle>,
    revoked: watch::Receiver<bool>,
    slot: Arc<ModuleSlot>,
}

impl ModuleLease {
    /// Borrowed module
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Name the borrow was taken for
    pub fn borrower(&self) -> &str {
        &self.borrower
    }

    /// Handle of the instance that was active when the borrow was taken
    pub fn handle(&self) -> &Arc<dyn ModuleHandle> {
        &self.handle
    }

    /// Whether the module was deactivated underneath the lease
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Receiver that turns `true` on revocation. It closes without turning `true` once
    /// the lease is dropped.
    pub fn revocation(&self) -> watch::Receiver<bool> {
        self.revoked.clone()
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        self.slot.inner.lock().borrowers.remove(&self.id);
        debug!(module = %self.module, borrower = %self.borrower, "Borrow released");
    }
}

impl fmt::Debug for ModuleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLease")
            .field("module", &self.module)
            .field("borrower", &self.borrower)
            .finish()
    }
}

struct ManagerInner {
    factory: Arc<dyn ModuleFactory>,
    store: Arc<DescriptorStore>,
    resolver: RwLock<ModuleResolver>,
    slots: Mutex<BTreeMap<String, Arc<ModuleSlot>>>,
    remote: Arc<RemoteDirectory>,
    reconfigure: tokio::sync::Mutex<()>,
    next_lease: AtomicU64,
}

/// Owner of all module instances built from one descriptor store.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

impl ModuleManager {
    /// Creates a manager over `store`, validating its module descriptors.
    pub fn new(store: Arc<DescriptorStore>, strict: bool, factory: Arc<dyn ModuleFactory>) -> Self {
        let snapshot = store.snapshot();
        let resolver = ModuleResolver::build(snapshot.modules.values().cloned(), strict);
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                store,
                resolver: RwLock::new(resolver),
                slots: Mutex::new(BTreeMap::new()),
                remote: Arc::new(RemoteDirectory::new()),
                reconfigure: tokio::sync::Mutex::new(()),
                next_lease: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a manager over a fresh store holding `modules`.
    pub fn from_descriptors(
        modules: impl IntoIterator<Item = ModuleDescriptor>,
        strict: bool,
        factory: Arc<dyn ModuleFactory>,
    ) -> Self {
        let store = Arc::new(DescriptorStore::new(WiringSnapshot::new(modules, [])));
        Self::new(store, strict, factory)
    }

    /// Creates a manager for loaded settings.
    pub fn from_settings(settings: &Settings, factory: Arc<dyn ModuleFactory>) -> Self {
        let store = Arc::new(DescriptorStore::new(settings.snapshot()));
        Self::new(store, settings.lifecycle.strict_connections, factory)
    }

    /// Descriptor store the manager reads from
    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.inner.store
    }

    /// Current descriptor snapshot
    pub fn descriptors(&self) -> Arc<WiringSnapshot> {
        self.inner.store.snapshot()
    }

    /// Modules published for remote access
    pub fn remote(&self) -> &Arc<RemoteDirectory> {
        &self.inner.remote
    }

    /// Activation order of every valid module
    pub fn activation_order(&self) -> Vec<String> {
        self.inner.resolver.read().activation_order().to_vec()
    }

    /// Modules kept out of the graph by validation
    pub fn validation_errors(&self) -> BTreeMap<String, OrchestratorError> {
        self.inner.resolver.read().invalid().clone()
    }

    /// Current state of `name`
    pub fn state(&self, name: &str) -> AppResult<ModuleState> {
        self.ensure_declared(name)?;
        Ok(self
            .existing_slot(name)
            .map(|slot| slot.inner.lock().state)
            .unwrap_or_default())
    }

    /// Last runtime error recorded on `name`, or its validation error
    pub fn last_error(&self, name: &str) -> Option<OrchestratorError> {
        let runtime = self
            .existing_slot(name)
            .and_then(|slot| slot.inner.lock().last_error.clone());
        runtime.or_else(|| self.inner.resolver.read().error_for(name).cloned())
    }

    /// Live handle of an active module
    pub fn handle(&self, name: &str) -> Option<Arc<dyn ModuleHandle>> {
        let slot = self.existing_slot(name)?;
        let inner = slot.inner.lock();
        match inner.state {
            ModuleState::Active => inner.handle.clone(),
            _ => None,
        }
    }

    /// Connections cached on an active module
    pub fn connections(&self, name: &str) -> Option<BoundConnections> {
        self.existing_slot(name)?.inner.lock().connections.clone()
    }

    /// Status record for `name`
    pub fn status(&self, name: &str) -> AppResult<ModuleStatus> {
        let (category, remote, dependents) = {
            let resolver = self.inner.resolver.read();
            let descriptor = resolver
                .descriptor(name)
                .ok_or_else(|| OrchestratorError::UnknownModule(name.to_string()))?;
            (
                descriptor.category,
                descriptor.remote_access,
                resolver.dependents(name),
            )
        };

        let (state, borrowers, activations) = match self.existing_slot(name) {
            Some(slot) => {
                let inner = slot.inner.lock();
                (inner.state, inner.borrower_names(), inner.activations)
            }
            None => (ModuleState::Unloaded, Vec::new(), 0),
        };

        Ok(ModuleStatus {
            name: name.to_string(),
            category,
            state,
            last_error: self.last_error(name).map(|e| e.to_string()),
            borrowers,
            dependents,
            remote: remote || self.inner.remote.contains(name),
            activations,
        })
    }

    /// Status of every declared module, by name
    pub fn snapshot(&self) -> Vec<ModuleStatus> {
        let names: Vec<String> = self
            .inner
            .resolver
            .read()
            .descriptors()
            .map(|d| d.name.clone())
            .collect();
        names.iter().filter_map(|n| self.status(n).ok()).collect()
    }

    /// Brings `name` to `Active`, activating its dependencies first.
    ///
    /// Dependencies are activated in resolver order. The chain stops at the first
    /// failure; modules already activated stay active. Activating an active module is
    /// a no-op.
    pub async fn activate(&self, name: &str) -> AppResult<()> {
        let chain = self.inner.resolver.read().activation_chain(name)?;
        debug!(module = %name, chain = ?chain, "Activating module chain");

        for module in &chain {
            if let Err(error) = self.activate_one(module).await {
                warn!(module = %name, failed = %module, error = %error, "Activation chain aborted");
                return Err(error);
            }
        }
        Ok(())
    }

    /// Activates each startup module in turn, continuing past failures.
    pub async fn activate_startup(&self, names: &[String]) -> Vec<(String, AppResult<()>)> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.activate(name).await;
            match &result {
                Ok(()) => info!(module = %name, "Startup module active"),
                Err(error) => warn!(module = %name, error = %error, "Startup module failed"),
            }
            results.push((name.clone(), result));
        }
        results
    }

    /// Deactivates `name`.
    ///
    /// Fails with `ActiveDependents` while anything depending on it is loaded, and with
    /// `ModuleBusy` while it is borrowed. With `force`, dependents are deactivated first
    /// (dependents before their dependencies) and borrows are revoked.
    pub async fn deactivate(&self, name: &str, force: bool) -> AppResult<()> {
        let order = self.teardown_order(name)?;

        let mut blocking: Vec<String> = order
            .iter()
            .filter(|n| n.as_str() != name && self.is_loaded(n))
            .cloned()
            .collect();
        blocking.sort();

        if !blocking.is_empty() && !force {
            return Err(OrchestratorError::ActiveDependents {
                module: name.to_string(),
                dependents: blocking,
            });
        }

        let mut first_error = None;
        for module in order
            .iter()
            .filter(|n| n.as_str() == name || blocking.contains(n))
        {
            if let Err(error) = self.deactivate_one(module, force).await {
                if !force {
                    return Err(error);
                }
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deactivates `name` and reactivates it, re-resolving its connections.
    ///
    /// With a new descriptor, the descriptor is swapped in between. Dependents that were
    /// loaded are stopped first and brought back afterwards; nothing else is touched.
    pub async fn reload(&self, name: &str, descriptor: Option<ModuleDescriptor>) -> AppResult<()> {
        let _reconfigure = self.inner.reconfigure.lock().await;

        let order = self.teardown_order(name)?;
        let restart: Vec<String> = order.iter().filter(|n| self.is_loaded(n)).cloned().collect();
        info!(module = %name, restart = ?restart, "Reloading module");

        for module in &restart {
            if let Err(error) = self.deactivate_one(module, true).await {
                warn!(module = %module, error = %error, "Deactivation failed during reload");
            }
        }

        if let Some(mut descriptor) = descriptor {
            descriptor.name = name.to_string();
            let mut next = self.inner.resolver.read().clone();
            next.upsert(descriptor.clone());
            self.inner.store.upsert_module(descriptor);
            *self.inner.resolver.write() = next;
        }

        self.activate(name).await?;
        for module in restart.iter().rev().filter(|n| n.as_str() != name) {
            if let Err(error) = self.activate(module).await {
                warn!(module = %module, error = %error, "Dependent did not come back after reload");
            }
        }
        Ok(())
    }

    /// Adds or replaces a module descriptor.
    ///
    /// Only the module and its dependents are revalidated. Those that were loaded are
    /// stopped before the swap and restarted afterwards if still valid.
    pub async fn apply_descriptor(&self, descriptor: ModuleDescriptor) -> AppResult<Reconfiguration> {
        if descriptor.name.is_empty() {
            return Err(OrchestratorError::Configuration(
                "module descriptor has no name".to_string(),
            ));
        }
        let _reconfigure = self.inner.reconfigure.lock().await;

        let mut next = self.inner.resolver.read().clone();
        let delta = next.upsert(descriptor.clone());
        Ok(self
            .commit(next, delta, move |store| {
                store.upsert_module(descriptor);
            })
            .await)
    }

    /// Removes a module descriptor. The module and its dependents are force-deactivated;
    /// the dependents stay rejected until their target reappears.
    pub async fn remove_descriptor(&self, name: &str) -> AppResult<Reconfiguration> {
        let _reconfigure = self.inner.reconfigure.lock().await;
        self.ensure_declared(name)?;

        let mut next = self.inner.resolver.read().clone();
        let delta = next.remove(name);
        let owned = name.to_string();
        let report = self
            .commit(next, delta, move |store| {
                store.remove_module(&owned);
            })
            .await;
        self.inner.slots.lock().remove(name);
        Ok(report)
    }

    /// Borrows an active module on behalf of `borrower`.
    ///
    /// Exclusive modules admit a single borrower at a time.
    pub fn borrow(&self, name: &str, borrower: &str) -> AppResult<ModuleLease> {
        self.ensure_declared(name)?;
        let slot = self.slot(name);
        let mut inner = slot.inner.lock();

        if inner.state != ModuleState::Active {
            return Err(OrchestratorError::InvalidTransition {
                entity: name.to_string(),
                operation: "be borrowed".to_string(),
                state: inner.state.to_string(),
            });
        }
        if inner.exclusive && !inner.borrowers.is_empty() {
            return Err(OrchestratorError::ModuleBusy {
                module: name.to_string(),
                borrowers: inner.borrower_names(),
            });
        }
        let handle = inner
            .handle
            .clone()
            .ok_or_else(|| OrchestratorError::UnknownModule(name.to_string()))?;

        let id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        let (revoked, revocation) = watch::channel(false);
        inner.borrowers.insert(
            id,
            Borrow {
                borrower: borrower.to_string(),
                revoked,
            },
        );
        drop(inner);

        debug!(module = %name, borrower = %borrower, "Module borrowed");
        Ok(ModuleLease {
            module: name.to_string(),
            borrower: borrower.to_string(),
            id,
            handle,
            revoked: revocation,
            slot,
        })
    }

    /// Publishes an active module in the remote directory.
    pub fn publish(&self, name: &str) -> AppResult<()> {
        let handle = self.handle(name).ok_or_else(|| OrchestratorError::InvalidTransition {
            entity: name.to_string(),
            operation: "be published".to_string(),
            state: self.state(name).map(|s| s.to_string()).unwrap_or_default(),
        })?;
        self.inner.remote.publish(name, handle);
        Ok(())
    }

    /// Withdraws a module from the remote directory.
    pub fn unpublish(&self, name: &str) -> bool {
        self.inner.remote.unpublish(name)
    }

    /// Deactivates every loaded module, dependents first. Returns the failures.
    pub async fn shutdown(&self) -> Vec<(String, OrchestratorError)> {
        let mut order = self.inner.resolver.read().shutdown_order();
        // Loaded modules the resolver no longer knows go last
        let stray: Vec<String> = self
            .inner
            .slots
            .lock()
            .keys()
            .filter(|n| !order.contains(n))
            .cloned()
            .collect();
        order.extend(stray);

        let mut failures = Vec::new();
        for name in order {
            if !self.is_loaded(&name) {
                continue;
            }
            if let Err(error) = self.deactivate_one(&name, true).await {
                failures.push((name, error));
            }
        }
        info!(failures = failures.len(), "Module shutdown complete");
        failures
    }

    async fn commit(
        &self,
        next: ModuleResolver,
        delta: OrderDelta,
        swap: impl FnOnce(&DescriptorStore) + Send,
    ) -> Reconfiguration {
        let stopped: Vec<String> = delta
            .affected
            .iter()
            .filter(|n| self.is_loaded(n))
            .cloned()
            .collect();

        for module in &stopped {
            if let Err(error) = self.deactivate_one(module, true).await {
                warn!(module = %module, error = %error, "Deactivation failed during reconfiguration");
            }
        }

        swap(&self.inner.store);
        *self.inner.resolver.write() = next;

        let mut report = Reconfiguration {
            delta,
            stopped,
            ..Default::default()
        };
        let admitted = report.delta.admitted.clone();
        for module in admitted.iter().filter(|n| report.stopped.contains(n)) {
            match self.activate(module).await {
                Ok(()) => report.restarted.push(module.clone()),
                Err(error) => {
                    report.failures.insert(module.clone(), error);
                }
            }
        }

        info!(
            stopped = ?report.stopped,
            restarted = ?report.restarted,
            rejected = ?report.delta.rejected.keys().collect::<Vec<_>>(),
            "Reconfiguration applied"
        );
        report
    }

    async fn activate_one(&self, name: &str) -> AppResult<()> {
        let slot = self.slot(name);
        let _transition = slot.transition.lock().await;

        if slot.inner.lock().state == ModuleState::Active {
            return Ok(());
        }

        let descriptor = {
            let resolver = self.inner.resolver.read();
            resolver.ensure_valid(name)?;
            resolver.descriptor(name).cloned()
        }
        .ok_or_else(|| OrchestratorError::UnknownModule(name.to_string()))?;

        // Claimed before the dependency handles are captured
        slot.inner.lock().pending = true;
        let connections = match self.bind_connections(&descriptor) {
            Ok(connections) => connections,
            Err(error) => {
                self.record_failure(&slot, name, error.clone());
                return Err(error);
            }
        };

        debug!(module = %name, class = %descriptor.module_class, "Constructing module");
        let handle = match self
            .inner
            .factory
            .construct(&descriptor.module_class, &descriptor.options)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let error = OrchestratorError::ConstructionError {
                    module: name.to_string(),
                    message: render_chain(&e),
                };
                self.record_failure(&slot, name, error.clone());
                return Err(error);
            }
        };

        {
            let mut inner = slot.inner.lock();
            inner.state = ModuleState::Loaded;
            inner.handle = Some(handle.clone());
        }
        debug!(module = %name, state = %ModuleState::Loaded, "Module constructed");

        if let Err(e) = handle.activate(&connections).await {
            let error = OrchestratorError::ActivationError {
                module: name.to_string(),
                message: render_chain(&e),
            };
            self.record_failure(&slot, name, error.clone());
            return Err(error);
        }

        // A forced deactivation may have taken a dependency down meanwhile
        if let Some(target) = self.stale_connection(&connections) {
            if let Err(e) = handle.deactivate().await {
                debug!(module = %name, error = %render_chain(&e), "Deactivation after lost dependency failed");
            }
            let error = OrchestratorError::ActivationError {
                module: name.to_string(),
                message: format!("dependency '{target}' went away during activation"),
            };
            self.record_failure(&slot, name, error.clone());
            return Err(error);
        }

        {
            let mut inner = slot.inner.lock();
            inner.state = ModuleState::Active;
            inner.pending = false;
            inner.connections = Some(connections);
            inner.last_error = None;
            inner.exclusive = descriptor.exclusive;
            inner.activations += 1;
        }

        if descriptor.remote_access {
            self.inner.remote.publish(name, handle);
        }
        info!(module = %name, state = %ModuleState::Active, "Module activated");
        Ok(())
    }

    async fn deactivate_one(&self, name: &str, force: bool) -> AppResult<()> {
        let Some(slot) = self.existing_slot(name) else {
            return Ok(());
        };
        let _transition = slot.transition.lock().await;

        let previous = {
            let mut inner = slot.inner.lock();
            if inner.state == ModuleState::Unloaded {
                return Ok(());
            }
            if !inner.borrowers.is_empty() && !force {
                return Err(OrchestratorError::ModuleBusy {
                    module: name.to_string(),
                    borrowers: inner.borrower_names(),
                });
            }
            std::mem::replace(&mut inner.state, ModuleState::Deactivating)
        };

        // Dependents binding from here on see this module as inactive
        if !force {
            let dependents = self.loaded_dependents(name);
            if !dependents.is_empty() {
                slot.inner.lock().state = previous;
                return Err(OrchestratorError::ActiveDependents {
                    module: name.to_string(),
                    dependents,
                });
            }
        }

        let handle = {
            let mut inner = slot.inner.lock();
            if !inner.borrowers.is_empty() {
                warn!(module = %name, borrowers = ?inner.borrower_names(), "Revoking borrows");
                for (_, borrow) in std::mem::take(&mut inner.borrowers) {
                    borrow.revoked.send_replace(true);
                }
            }
            inner.handle.take()
        };

        self.inner.remote.unpublish(name);
        debug!(module = %name, state = %ModuleState::Deactivating, "Deactivating module");

        let result = match handle {
            Some(handle) => handle.deactivate().await,
            None => Ok(()),
        };

        let mut inner = slot.inner.lock();
        inner.state = ModuleState::Unloaded;
        inner.connections = None;
        match result {
            Ok(()) => {
                info!(module = %name, state = %ModuleState::Unloaded, "Module deactivated");
                Ok(())
            }
            Err(e) => {
                let error = OrchestratorError::DeactivationError {
                    module: name.to_string(),
                    message: render_chain(&e),
                };
                warn!(module = %name, error = %error, "Deactivation hook failed; instance dropped");
                inner.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn bind_connections(&self, descriptor: &ModuleDescriptor) -> AppResult<BoundConnections> {
        let mut connections = BoundConnections::default();
        for (role, target) in &descriptor.connect {
            let handle = self.handle(target).ok_or_else(|| OrchestratorError::ActivationError {
                module: descriptor.name.clone(),
                message: format!("dependency '{target}' for role '{role}' is not active"),
            })?;
            connections.bind(role, target, handle);
        }
        Ok(connections)
    }

    /// First bound target that is no longer the active instance it was bound to.
    fn stale_connection(&self, connections: &BoundConnections) -> Option<String> {
        connections.roles().find_map(|role| {
            let target = connections.target(role)?;
            let bound = connections.get(role)?;
            match self.handle(target) {
                Some(live) if Arc::ptr_eq(&live, bound) => None,
                _ => Some(target.to_string()),
            }
        })
    }

    fn record_failure(&self, slot: &ModuleSlot, name: &str, error: OrchestratorError) {
        let mut inner = slot.inner.lock();
        inner.state = ModuleState::Unloaded;
        inner.pending = false;
        inner.handle = None;
        inner.connections = None;
        inner.last_error = Some(error.clone());
        warn!(module = %name, error = %error, "Module failed to activate");
    }

    /// `name` plus its loaded dependents, dependents first.
    fn teardown_order(&self, name: &str) -> AppResult<Vec<String>> {
        let resolver = self.inner.resolver.read();
        match resolver.deactivation_order(name) {
            Ok(order) => Ok(order),
            Err(_) if resolver.descriptor(name).is_some() || self.existing_slot(name).is_some() => {
                Ok(vec![name.to_string()])
            }
            Err(error) => Err(error),
        }
    }

    fn ensure_declared(&self, name: &str) -> AppResult<()> {
        if self.inner.resolver.read().descriptor(name).is_some() {
            Ok(())
        } else {
            Err(OrchestratorError::UnknownModule(name.to_string()))
        }
    }

    /// Has a live instance, or is on its way to one.
    fn is_loaded(&self, name: &str) -> bool {
        self.existing_slot(name)
            .map(|slot| {
                let inner = slot.inner.lock();
                inner.state != ModuleState::Unloaded || inner.pending
            })
            .unwrap_or(false)
    }

    fn loaded_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents = self.inner.resolver.read().dependents(name);
        dependents.retain(|n| self.is_loaded(n));
        dependents.sort();
        dependents
    }

    fn slot(&self, name: &str) -> Arc<ModuleSlot> {
        self.inner
            .slots
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<ModuleSlot>> {
        self.inner.slots.lock().get(name).cloned()
    }
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.inner.slots.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{mock_module, MockEvent, MockFactory, MockModule};
    use super::*;
    use crate::config::descriptor::ModuleCategory::{Hardware, Logic};

    fn manager(modules: Vec<ModuleDescriptor>) -> (ModuleManager, MockFactory) {
        let factory = MockFactory::new();
        let manager = ModuleManager::from_descriptors(modules, false, Arc::new(factory.clone()));
        (manager, factory)
    }

    #[tokio::test]
    async fn construction_failure_leaves_module_unloaded_with_error() {
        let (manager, factory) = manager(vec![
            mock_module("a", Hardware).option("fail_construct", serde_json::json!(true)),
        ]);

        let err = manager.activate("a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ConstructionError { ref module, .. } if module == "a"));
        assert_eq!(manager.state("a").unwrap(), ModuleState::Unloaded);
        assert_eq!(manager.last_error("a"), Some(err));
        assert!(factory.journal().events().is_empty());
    }

    #[tokio::test]
    async fn connections_are_bound_once_per_activation() {
        let (manager, _factory) = manager(vec![
            mock_module("a", Hardware),
            mock_module("b", Logic).connect("x", "a"),
        ]);
        manager.activate("b").await.unwrap();

        let connections = manager.connections("b").unwrap();
        assert_eq!(connections.target("x"), Some("a"));
        assert_eq!(connections.get_as::<MockModule>("x").map(|m| m.label()), Some("a"));

        let b = manager.handle("b").unwrap();
        let b = b.as_any().downcast_ref::<MockModule>().unwrap();
        assert_eq!(b.bound_roles(), vec!["x"]);
    }

    #[tokio::test]
    async fn exclusive_module_admits_one_borrower() {
        let (manager, _factory) = manager(vec![mock_module("cam", Hardware).exclusive()]);
        manager.activate("cam").await.unwrap();

        let lease = manager.borrow("cam", "scan").unwrap();
        let err = manager.borrow("cam", "refocus").unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::ModuleBusy {
                module: "cam".into(),
                borrowers: vec!["scan".into()]
            }
        );

        drop(lease);
        assert!(manager.borrow("cam", "refocus").is_ok());
    }

    #[tokio::test]
    async fn borrowed_module_refuses_plain_deactivation() {
        let (manager, factory) = manager(vec![mock_module("a", Hardware)]);
        manager.activate("a").await.unwrap();
        let lease = manager.borrow("a", "scan").unwrap();

        assert!(matches!(
            manager.deactivate("a", false).await,
            Err(OrchestratorError::ModuleBusy { .. })
        ));
        assert!(!lease.is_revoked());
        manager.deactivate("a", true).await.unwrap();
        assert_eq!(manager.state("a").unwrap(), ModuleState::Unloaded);
        assert!(lease.is_revoked());
        assert!(manager.status("a").unwrap().borrowers.is_empty());
        assert_eq!(factory.journal().count(&MockEvent::Deactivated("a".into())), 1);
    }

    #[tokio::test]
    async fn borrowing_requires_an_active_module() {
        let (manager, _factory) = manager(vec![mock_module("a", Hardware)]);
        assert!(matches!(
            manager.borrow("a", "scan"),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.borrow("ghost", "scan"),
            Err(OrchestratorError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn deactivation_failure_still_unloads() {
        let (manager, _factory) = manager(vec![
            mock_module("a", Hardware).option("fail_deactivate", serde_json::json!(true)),
        ]);
        manager.activate("a").await.unwrap();

        let err = manager.deactivate("a", false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeactivationError { .. }));
        assert_eq!(manager.state("a").unwrap(), ModuleState::Unloaded);
    }

    #[tokio::test]
    async fn remote_modules_are_published_while_active() {
        let (manager, _factory) = manager(vec![mock_module("a", Hardware).remote(), mock_module("b", Hardware)]);
        manager.activate("a").await.unwrap();
        manager.activate("b").await.unwrap();
        assert_eq!(manager.remote().names(), vec!["a"]);

        manager.publish("b").unwrap();
        assert!(manager.status("b").unwrap().remote);

        manager.deactivate("a", false).await.unwrap();
        assert!(manager.remote().lookup("a").is_none());
        assert!(manager.remote().lookup("b").is_some());
    }

    #[tokio::test]
    async fn status_reports_dependents_and_validation_errors() {
        let (manager, _factory) = manager(vec![
            mock_module("a", Hardware),
            mock_module("b", Logic).connect("x", "a"),
            mock_module("c", Logic).connect("x", "ghost"),
        ]);
        manager.activate("b").await.unwrap();

        let a = manager.status("a").unwrap();
        assert_eq!(a.state, ModuleState::Active);
        assert_eq!(a.dependents, vec!["b"]);
        assert_eq!(a.activations, 1);

        let c = manager.status("c").unwrap();
        assert_eq!(c.state, ModuleState::Unloaded);
        assert!(c.last_error.unwrap().contains("ghost"));

        assert_eq!(manager.snapshot().len(), 3);
    }
}
