//! Wiring files end to end: load, override from the environment, bring up.

use daq_orchestrator::config::Settings;
use daq_orchestrator::error::OrchestratorError;
use daq_orchestrator::lifecycle::mock::MockFactory;
use daq_orchestrator::lifecycle::{ModuleManager, ModuleState};
use daq_orchestrator::tasks::{TaskScheduler, TaskState};
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFOCAL: &str = r#"
[application]
name = "confocal"

[lifecycle]
startup = ["scanner_logic"]

[scheduler]
pause_timeout_ms = 1000

[modules.nicard]
category = "hardware"
module_class = "national_instruments_x_series.NationalInstrumentsXSeries"
interfaces = ["ConfocalScannerInterface"]
exclusive = true

[modules.scanner_logic]
category = "logic"
module_class = "confocal_logic.ConfocalLogic"
connect = { confocalscanner1 = "nicard" }
required_interfaces = { confocalscanner1 = "ConfocalScannerInterface" }
remote_access = true

[modules.scanner_gui]
category = "gui"
module_class = "confocal.ConfocalGui"
connect = { confocallogic1 = "scanner_logic" }

[tasks.scan]
module_class = "mock.Task"
needsmodules = { logic = "scanner_logic" }

[tasks.refocus]
module_class = "mock.Task"
needsmodules = { logic = "scanner_logic" }
pausetasks = ["scan"]
"#;

fn wiring_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn loads_a_wiring_file() {
    let file = wiring_file(CONFOCAL);
    let settings = Settings::load_from(file.path()).unwrap();
    settings.validate().unwrap();

    assert_eq!(settings.application.name, "confocal");
    assert_eq!(settings.scheduler.pause_timeout_ms, 1000);
    assert_eq!(settings.modules.len(), 3);
    assert_eq!(settings.tasks["refocus"].pausetasks, vec!["scan"]);
    assert!(settings.modules["nicard"].exclusive);
}

#[test]
#[serial]
fn environment_overrides_the_file() {
    let file = wiring_file(CONFOCAL);
    std::env::set_var("DAQ_ORCH_SCHEDULER__PAUSE_TIMEOUT_MS", "250");
    std::env::set_var("DAQ_ORCH_APPLICATION__LOG_LEVEL", "debug");

    let loaded = Settings::load_from(file.path());

    std::env::remove_var("DAQ_ORCH_SCHEDULER__PAUSE_TIMEOUT_MS");
    std::env::remove_var("DAQ_ORCH_APPLICATION__LOG_LEVEL");

    let settings = loaded.unwrap();
    assert_eq!(settings.scheduler.pause_timeout_ms, 250);
    assert_eq!(settings.application.log_level, "debug");
}

#[test]
#[serial]
fn malformed_file_is_a_config_error() {
    let file = wiring_file("[modules.nicard]\ncategory = \"hardware\"\n");
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(OrchestratorError::Config(_))
    ));
}

#[tokio::test]
#[serial]
async fn wiring_file_comes_up_with_mock_modules() {
    let file = wiring_file(CONFOCAL);
    let settings = Settings::load_from(file.path()).unwrap();

    let factory = Arc::new(MockFactory::new());
    let manager = ModuleManager::from_settings(&settings, factory.clone());
    assert!(manager.validation_errors().is_empty());
    assert_eq!(
        manager.activation_order(),
        vec!["nicard", "scanner_logic", "scanner_gui"]
    );

    for (name, result) in manager.activate_startup(&settings.lifecycle.startup).await {
        assert!(result.is_ok(), "{name} failed to start");
    }
    assert_eq!(manager.state("nicard").unwrap(), ModuleState::Active);
    assert_eq!(manager.state("scanner_gui").unwrap(), ModuleState::Unloaded);
    assert!(manager.remote().contains("scanner_logic"));

    let scheduler = TaskScheduler::new(manager.clone(), factory, settings.scheduler.clone());
    scheduler.begin_run();
    scheduler.start("scan").await.unwrap();
    scheduler.start("refocus").await.unwrap();
    assert_eq!(scheduler.state("scan").unwrap(), TaskState::Paused);

    scheduler.finish("refocus").await.unwrap();
    scheduler
        .wait_for_state("scan", TaskState::Running, Duration::from_secs(1))
        .await
        .unwrap();

    scheduler.shutdown().await;
    assert!(manager.shutdown().await.is_empty());
    assert!(manager.remote().is_empty());
}

#[test]
#[serial]
fn strict_wiring_isolates_incompatible_connections() {
    let file = wiring_file(
        r#"
        [lifecycle]
        strict_connections = true

        [modules.nicard]
        category = "hardware"
        module_class = "ni"

        [modules.scanner_logic]
        category = "logic"
        module_class = "logic"
        connect = { confocalscanner1 = "nicard" }
        required_interfaces = { confocalscanner1 = "ConfocalScannerInterface" }
        "#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    let manager = ModuleManager::from_settings(&settings, Arc::new(MockFactory::new()));

    assert!(matches!(
        manager.validation_errors().get("scanner_logic"),
        Some(OrchestratorError::IncompatibleConnection { target, .. }) if target == "nicard"
    ));
    assert_eq!(manager.activation_order(), vec!["nicard"]);
}
