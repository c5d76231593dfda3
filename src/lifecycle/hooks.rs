//! External hooks the lifecycle manager drives.
//!
//! Concrete modules live outside the orchestrator. A [`ModuleFactory`] turns an
//! implementation identifier plus options into a [`ModuleHandle`]; the manager then
//! activates the handle with its [`BoundConnections`] and later deactivates it.
//!
//! Hooks report failures as `anyhow::Error`; the manager wraps them into
//! `ConstructionError`, `ActivationError` or `DeactivationError` with the module name.

use crate::config::descriptor::OptionBag;
use async_trait::async_trait;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A live module implementation.
#[async_trait]
pub trait ModuleHandle: Send + Sync + 'static {
    /// Called once all connections are bound. Dependencies are already active.
    async fn activate(&self, connections: &BoundConnections) -> anyhow::Result<()>;

    /// Called before the handle is dropped. Dependents are already deactivated.
    async fn deactivate(&self) -> anyhow::Result<()>;

    /// Access to the concrete type for consumers that know it.
    fn as_any(&self) -> &dyn Any;
}

/// Creates module handles from implementation identifiers.
///
/// Factories are shared by every activation and must not keep per-build state
/// without internal synchronization.
#[async_trait]
pub trait ModuleFactory: Send + Sync + 'static {
    /// Builds a handle for `module_class` configured with `options`.
    async fn construct(
        &self,
        module_class: &str,
        options: &OptionBag,
    ) -> anyhow::Result<Arc<dyn ModuleHandle>>;
}

/// Dispatches construction to factories registered per implementation identifier.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: BTreeMap<String, Arc<dyn ModuleFactory>>,
    fallback: Option<Arc<dyn ModuleFactory>>,
}

impl FactoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `module_class`, replacing any previous one.
    pub fn register(&mut self, module_class: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        self.factories.insert(module_class.into(), factory);
    }

    /// Factory used for identifiers without a dedicated registration.
    pub fn with_fallback(mut self, factory: Arc<dyn ModuleFactory>) -> Self {
        self.fallback = Some(factory);
        self
    }

    /// Registered identifiers
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[async_trait]
impl ModuleFactory for FactoryRegistry {
    async fn construct(
        &self,
        module_class: &str,
        options: &OptionBag,
    ) -> anyhow::Result<Arc<dyn ModuleHandle>> {
        let factory = self
            .factories
            .get(module_class)
            .or(self.fallback.as_ref())
            .ok_or_else(|| anyhow::anyhow!("no factory registered for '{module_class}'"))?;
        factory.construct(module_class, options).await
    }
}

#[derive(Clone)]
struct Binding {
    target: String,
    handle: Arc<dyn ModuleHandle>,
}

/// Connections of one module, resolved to live handles.
///
/// Resolved once per activation and cached on the instance; roles are never looked
/// up by module name again while the module stays active.
#[derive(Clone, Default)]
pub struct BoundConnections {
    bindings: BTreeMap<String, Binding>,
}

impl BoundConnections {
    pub(crate) fn bind(&mut self, role: &str, target: &str, handle: Arc<dyn ModuleHandle>) {
        self.bindings.insert(
            role.to_string(),
            Binding {
                target: target.to_string(),
                handle,
            },
        );
    }

    /// Handle bound to `role`
    pub fn get(&self, role: &str) -> Option<&Arc<dyn ModuleHandle>> {
        self.bindings.get(role).map(|b| &b.handle)
    }

    /// Handle bound to `role`, downcast to its concrete type
    pub fn get_as<T: 'static>(&self, role: &str) -> Option<&T> {
        self.get(role).and_then(|h| h.as_any().downcast_ref::<T>())
    }

    /// Module name bound to `role`
    pub fn target(&self, role: &str) -> Option<&str> {
        self.bindings.get(role).map(|b| b.target.as_str())
    }

    /// Bound roles in order
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Number of bound roles
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing was bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for BoundConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.bindings.iter().map(|(role, b)| (role, &b.target)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::mock::{MockFactory, MockModule};

    #[tokio::test]
    async fn registry_dispatches_on_class_then_fallback() {
        let mut registry = FactoryRegistry::new();
        registry.register("ni.XSeries", Arc::new(MockFactory::new()));
        assert_eq!(registry.classes().collect::<Vec<_>>(), vec!["ni.XSeries"]);

        let handle = registry.construct("ni.XSeries", &OptionBag::new()).await.unwrap();
        let module = handle.as_any().downcast_ref::<MockModule>().unwrap();
        assert_eq!(module.label(), "ni.XSeries");

        let err = registry
            .construct("jpe.Stage", &OptionBag::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("jpe.Stage"));

        let registry = registry.with_fallback(Arc::new(MockFactory::new()));
        assert!(registry.construct("jpe.Stage", &OptionBag::new()).await.is_ok());
    }
}
