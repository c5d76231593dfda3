//! Module and task descriptors.
//!
//! Descriptors are the parsed, immutable description of every named module instance
//! and task in a wiring configuration. They carry no runtime state; the lifecycle
//! manager and the scheduler create runtime instances from them.
//!
//! # Example
//!
//! ```toml
//! [modules.counter_logic]
//! category = "logic"
//! module_class = "counter_logic.CounterLogic"
//! connect = { counter = "nicard" }
//! [modules.counter_logic.options]
//! count_frequency = 50
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The category a module belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    /// Drivers talking to physical instruments
    Hardware,
    /// Control and measurement logic
    Logic,
    /// Presentation layers
    Gui,
}

impl ModuleCategory {
    /// Whether a module of this category may bind a connection to a module of `target`.
    ///
    /// Hardware only talks to hardware, logic talks to hardware and logic, a GUI may talk
    /// to anything. Nothing may depend on a GUI.
    pub fn can_connect_to(self, target: ModuleCategory) -> bool {
        match (self, target) {
            (_, ModuleCategory::Gui) => false,
            (ModuleCategory::Hardware, ModuleCategory::Hardware) => true,
            (ModuleCategory::Hardware, _) => false,
            (ModuleCategory::Logic, _) => true,
            (ModuleCategory::Gui, _) => true,
        }
    }
}

impl fmt::Display for ModuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleCategory::Hardware => write!(f, "hardware"),
            ModuleCategory::Logic => write!(f, "logic"),
            ModuleCategory::Gui => write!(f, "gui"),
        }
    }
}

/// Option bag passed to module constructors and task bodies.
///
/// Values are arbitrary scalars or arrays as they appear in the configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionBag {
    /// Option values keyed by name
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl OptionBag {
    /// Creates an empty option bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets an option by key
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    /// Sets an option
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.params.insert(key.into(), value);
    }

    /// Builder-style variant of [`OptionBag::set`]
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(key, value);
        self
    }

    /// Gets an option as `f64`
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Gets an option as `u64`
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    /// Gets an option as `bool`
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Gets an option as `&str`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Whether the bag holds no options
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Descriptor for one named module instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name. Filled from the table key when loaded from a file.
    #[serde(default)]
    pub name: String,
    /// Module category
    pub category: ModuleCategory,
    /// Opaque implementation identifier resolved by a [`ModuleFactory`](crate::lifecycle::ModuleFactory)
    pub module_class: String,
    /// Interfaces the implementation provides
    #[serde(default)]
    pub interfaces: BTreeSet<String>,
    /// Required role -> target module name
    #[serde(default)]
    pub connect: BTreeMap<String, String>,
    /// Required role -> interface the target has to provide
    #[serde(default)]
    pub required_interfaces: BTreeMap<String, String>,
    /// At most one concurrent borrower when set
    #[serde(default)]
    pub exclusive: bool,
    /// Publish in the remote directory while active
    #[serde(default)]
    pub remote_access: bool,
    /// Constructor options
    #[serde(default)]
    pub options: OptionBag,
}

impl ModuleDescriptor {
    /// Creates a descriptor with no connections and no options.
    pub fn new(
        name: impl Into<String>,
        category: ModuleCategory,
        module_class: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            module_class: module_class.into(),
            interfaces: BTreeSet::new(),
            connect: BTreeMap::new(),
            required_interfaces: BTreeMap::new(),
            exclusive: false,
            remote_access: false,
            options: OptionBag::new(),
        }
    }

    /// Binds `role` to the module named `target`.
    pub fn connect(mut self, role: impl Into<String>, target: impl Into<String>) -> Self {
        self.connect.insert(role.into(), target.into());
        self
    }

    /// Requires the target bound to `role` to provide `interface`.
    pub fn require_interface(mut self, role: impl Into<String>, interface: impl Into<String>) -> Self {
        self.required_interfaces.insert(role.into(), interface.into());
        self
    }

    /// Declares an interface this module provides.
    pub fn provides(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.insert(interface.into());
        self
    }

    /// Marks the module as single-borrower.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Publishes the module for remote access while it is active.
    pub fn remote(mut self) -> Self {
        self.remote_access = true;
        self
    }

    /// Adds a constructor option.
    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.set(key, value);
        self
    }

    /// Names of the modules this one depends on, deduplicated and sorted.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.connect.values().map(String::as_str).collect()
    }
}

/// Descriptor for one named task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique task name. Filled from the table key when loaded from a file.
    #[serde(default)]
    pub name: String,
    /// Opaque implementation identifier resolved by a [`TaskFactory`](crate::tasks::TaskFactory)
    pub module_class: String,
    /// Role -> module name the task borrows while running
    #[serde(default)]
    pub needsmodules: BTreeMap<String, String>,
    /// Tasks that must have completed in this run before this one may start
    #[serde(default)]
    pub preposttasks: Vec<String>,
    /// Tasks paused while this one runs
    #[serde(default)]
    pub pausetasks: Vec<String>,
    /// Options handed to the task body
    #[serde(default)]
    pub options: OptionBag,
}

impl TaskDescriptor {
    /// Creates a task descriptor with no requirements.
    pub fn new(name: impl Into<String>, module_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_class: module_class.into(),
            ..Default::default()
        }
    }

    /// Borrows `module` under `role` while running.
    pub fn needs(mut self, role: impl Into<String>, module: impl Into<String>) -> Self {
        self.needsmodules.insert(role.into(), module.into());
        self
    }

    /// Requires `task` to have completed first.
    pub fn after(mut self, task: impl Into<String>) -> Self {
        self.preposttasks.push(task.into());
        self
    }

    /// Pauses `task` while this one runs.
    pub fn pauses(mut self, task: impl Into<String>) -> Self {
        self.pausetasks.push(task.into());
        self
    }

    /// Adds a body option.
    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.set(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_compatibility() {
        use ModuleCategory::*;
        assert!(Hardware.can_connect_to(Hardware));
        assert!(!Hardware.can_connect_to(Logic));
        assert!(Logic.can_connect_to(Hardware));
        assert!(Logic.can_connect_to(Logic));
        assert!(Gui.can_connect_to(Logic));
        assert!(!Logic.can_connect_to(Gui));
        assert!(!Gui.can_connect_to(Gui));
    }

    #[test]
    fn parses_module_from_toml() {
        let desc: ModuleDescriptor = toml::from_str(
            r#"
            category = "logic"
            module_class = "counter_logic.CounterLogic"
            connect = { counter = "nicard", save = "savelogic" }
            [options]
            count_frequency = 50
            channels = [1, 2]
            "#,
        )
        .unwrap();

        assert_eq!(desc.category, ModuleCategory::Logic);
        assert_eq!(desc.connect.len(), 2);
        assert_eq!(desc.options.get_u64("count_frequency"), Some(50));
        assert_eq!(desc.options.get("channels"), Some(&json!([1, 2])));
        assert!(!desc.exclusive);
        assert_eq!(
            desc.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["nicard", "savelogic"]
        );
    }

    #[test]
    fn absent_task_fields_stay_empty() {
        let desc: TaskDescriptor = toml::from_str(r#"module_class = "scan.Task""#).unwrap();
        assert!(desc.needsmodules.is_empty());
        assert!(desc.preposttasks.is_empty());
        assert!(desc.pausetasks.is_empty());
        assert!(desc.options.is_empty());
    }
}
