//! Configuration management.
//!
//! - [`descriptor`]: module and task descriptors (the abstract wiring data model)
//! - [`store`]: atomically swapped descriptor snapshots
//! - [`settings`]: Figment-based loading of application settings and descriptors

pub mod descriptor;
pub mod settings;
pub mod store;

pub use descriptor::{ModuleCategory, ModuleDescriptor, OptionBag, TaskDescriptor};
pub use settings::{ApplicationConfig, LifecycleConfig, SchedulerConfig, Settings};
pub use store::{DescriptorStore, WiringSnapshot};
