//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML wiring file (base configuration)
//! 2. Environment variables (prefixed with `DAQ_ORCH_`, `__` separates nesting levels)
//!
//! # Example
//! ```no_run
//! use daq_orchestrator::config::Settings;
//!
//! let settings = Settings::load_from("config/lab.toml")?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), daq_orchestrator::error::OrchestratorError>(())
//! ```

use super::descriptor::{ModuleDescriptor, TaskDescriptor};
use super::store::WiringSnapshot;
use crate::error::{AppResult, OrchestratorError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DAQ_ORCH_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Module lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Task scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Module descriptors keyed by instance name
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDescriptor>,
    /// Task descriptors keyed by task name
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDescriptor>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Module lifecycle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Reject connections whose target category or interface cannot satisfy the role
    #[serde(default)]
    pub strict_connections: bool,
    /// Modules activated immediately at startup
    #[serde(default)]
    pub startup: Vec<String>,
}

/// Task scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a task may take to acknowledge a pause request
    #[serde(default = "default_pause_timeout")]
    pub pause_timeout_ms: u64,
    /// How long an interrupted task body may take to return before it is aborted
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace_ms: u64,
}

impl SchedulerConfig {
    /// Pause acknowledgement timeout
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    /// Interrupt grace period
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

// Default value functions
fn default_name() -> String {
    "daq-orchestrator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_pause_timeout() -> u64 {
    5000
}

fn default_interrupt_grace() -> u64 {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pause_timeout_ms: default_pause_timeout(),
            interrupt_grace_ms: default_interrupt_grace(),
        }
    }
}

impl Settings {
    /// Load configuration from a TOML file and environment variables
    ///
    /// Example override: `DAQ_ORCH_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings.with_names())
    }

    /// Load configuration from an in-memory TOML document (no environment overrides)
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let settings: Settings = Figment::new().merge(Toml::string(source)).extract()?;
        Ok(settings.with_names())
    }

    /// Descriptor names come from their table keys.
    fn with_names(mut self) -> Self {
        for (name, module) in self.modules.iter_mut() {
            module.name = name.clone();
        }
        for (name, task) in self.tasks.iter_mut() {
            task.name = name.clone();
        }
        self
    }

    /// Validate configuration after loading
    ///
    /// Graph-level problems (cycles, dangling connections) are not reported here; the
    /// resolver isolates them per module so the rest of the graph still loads.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(OrchestratorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(OrchestratorError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.scheduler.pause_timeout_ms == 0 {
            return Err(OrchestratorError::Configuration(
                "pause_timeout_ms must be greater than zero".to_string(),
            ));
        }

        for name in &self.lifecycle.startup {
            if !self.modules.contains_key(name) {
                return Err(OrchestratorError::Configuration(format!(
                    "Startup module '{name}' is not declared"
                )));
            }
        }

        if let Some(name) = self.modules.keys().find(|name| self.tasks.contains_key(*name)) {
            return Err(OrchestratorError::Configuration(format!(
                "'{name}' is declared both as a module and as a task"
            )));
        }

        Ok(())
    }

    /// Effective configuration, overrides applied, as a TOML document
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Descriptor snapshot for the store
    pub fn snapshot(&self) -> WiringSnapshot {
        WiringSnapshot::new(self.modules.values().cloned(), self.tasks.values().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::descriptor::ModuleCategory;

    const WIRING: &str = r#"
        [application]
        name = "confocal"
        log_level = "debug"

        [lifecycle]
        strict_connections = true
        startup = ["scanner_logic"]

        [modules.nicard]
        category = "hardware"
        module_class = "national_instruments_x_series.NationalInstrumentsXSeries"
        interfaces = ["ConfocalScannerInterface"]
        [modules.nicard.options]
        clock_frequency = 100

        [modules.scanner_logic]
        category = "logic"
        module_class = "confocal_logic.ConfocalLogic"
        connect = { confocalscanner1 = "nicard" }

        [tasks.refocus]
        module_class = "refocus.Task"
        needsmodules = { optimizer = "scanner_logic" }
        # pausetasks = ["scan"]
    "#;

    #[test]
    fn parses_wiring_and_fills_names() {
        let settings = Settings::from_toml_str(WIRING).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.application.name, "confocal");
        assert!(settings.lifecycle.strict_connections);

        let nicard = &settings.modules["nicard"];
        assert_eq!(nicard.name, "nicard");
        assert_eq!(nicard.category, ModuleCategory::Hardware);
        assert_eq!(nicard.options.get_u64("clock_frequency"), Some(100));

        let refocus = &settings.tasks["refocus"];
        assert_eq!(refocus.name, "refocus");
        assert!(refocus.pausetasks.is_empty());

        let snapshot = settings.snapshot();
        assert_eq!(snapshot.modules.len(), 2);
        assert!(snapshot.task("refocus").is_some());
    }

    #[test]
    fn effective_config_reloads_to_the_same_wiring() {
        let settings = Settings::from_toml_str(WIRING).unwrap();
        let rendered = settings.to_toml().unwrap();
        let reloaded = Settings::from_toml_str(&rendered).unwrap();

        assert_eq!(reloaded.modules, settings.modules);
        assert_eq!(reloaded.tasks, settings.tasks);
        assert_eq!(reloaded.lifecycle.startup, vec!["scanner_logic"]);
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.scheduler.pause_timeout(), Duration::from_secs(5));
        assert!(settings.lifecycle.startup.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_undeclared_startup_module() {
        let mut settings = Settings::default();
        settings.lifecycle.startup.push("ghost".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_name_used_by_module_and_task() {
        let settings = Settings::from_toml_str(
            r#"
            [modules.scan]
            category = "logic"
            module_class = "x"
            [tasks.scan]
            module_class = "y"
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_category_is_a_config_error() {
        let result = Settings::from_toml_str(
            r#"
            [modules.x]
            category = "firmware"
            module_class = "x"
            "#,
        );
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }
}
