//! Descriptor changes at runtime: incremental re-resolution and reloads.

use daq_orchestrator::config::ModuleCategory::{Hardware, Logic};
use daq_orchestrator::config::ModuleDescriptor;
use daq_orchestrator::error::OrchestratorError;
use daq_orchestrator::lifecycle::mock::{mock_module, MockEvent, MockFactory, MockModule};
use daq_orchestrator::lifecycle::{ModuleManager, ModuleState};
use std::sync::Arc;

fn manager(modules: Vec<ModuleDescriptor>) -> (ModuleManager, MockFactory) {
    let factory = MockFactory::new();
    let manager = ModuleManager::from_descriptors(modules, false, Arc::new(factory.clone()));
    (manager, factory)
}

#[tokio::test]
async fn reload_swaps_a_dependency_without_touching_unrelated_modules() {
    let (manager, factory) = manager(vec![
        mock_module("old_card", Hardware),
        mock_module("new_card", Hardware),
        mock_module("scanner", Logic).connect("card", "old_card"),
        mock_module("laser", Hardware),
    ]);
    manager.activate("scanner").await.unwrap();
    manager.activate("laser").await.unwrap();

    manager
        .reload(
            "scanner",
            Some(mock_module("scanner", Logic).connect("card", "new_card")),
        )
        .await
        .unwrap();

    let connections = manager.connections("scanner").unwrap();
    assert_eq!(connections.target("card"), Some("new_card"));
    assert_eq!(
        connections.get_as::<MockModule>("card").map(|m| m.label()),
        Some("new_card")
    );
    assert_eq!(manager.state("new_card").unwrap(), ModuleState::Active);
    assert_eq!(manager.status("laser").unwrap().activations, 1);
    assert_eq!(factory.journal().count(&MockEvent::Deactivated("laser".into())), 0);

    // The old card is no longer a dependency and can go
    manager.deactivate("old_card", false).await.unwrap();
}

#[tokio::test]
async fn reload_restarts_loaded_dependents() -> anyhow::Result<()> {
    let (manager, factory) = manager(vec![
        mock_module("card", Hardware),
        mock_module("scanner", Logic).connect("card", "card"),
    ]);
    manager.activate("scanner").await?;

    manager.reload("card", None).await?;

    assert_eq!(manager.state("scanner").unwrap(), ModuleState::Active);
    assert_eq!(manager.status("card").unwrap().activations, 2);
    assert_eq!(manager.status("scanner").unwrap().activations, 2);

    let journal = factory.journal();
    assert_eq!(journal.count(&MockEvent::Deactivated("scanner".into())), 1);
    assert_eq!(journal.count(&MockEvent::Activated("card".into())), 2);
    Ok(())
}

#[tokio::test]
async fn new_descriptor_admits_a_dangling_dependent() {
    let (manager, _factory) = manager(vec![mock_module("scanner", Logic).connect("card", "card")]);
    assert!(matches!(
        manager.activate("scanner").await.unwrap_err(),
        OrchestratorError::UnresolvedDependency { .. }
    ));

    let report = manager
        .apply_descriptor(mock_module("card", Hardware))
        .await
        .unwrap();
    assert_eq!(report.delta.admitted, vec!["card", "scanner"]);
    assert!(report.stopped.is_empty());

    manager.activate("scanner").await.unwrap();
    assert_eq!(manager.activation_order(), vec!["card", "scanner"]);
}

#[tokio::test]
async fn replacing_a_descriptor_restarts_what_was_running() {
    let (manager, _factory) = manager(vec![
        mock_module("card", Hardware),
        mock_module("scanner", Logic).connect("card", "card"),
        mock_module("laser", Hardware),
    ]);
    manager.activate("scanner").await.unwrap();
    manager.activate("laser").await.unwrap();

    let report = manager
        .apply_descriptor(mock_module("card", Hardware).provides("ScannerInterface"))
        .await
        .unwrap();

    assert_eq!(report.stopped, vec!["scanner", "card"]);
    assert_eq!(report.restarted, vec!["card", "scanner"]);
    assert!(report.failures.is_empty());
    assert_eq!(manager.state("scanner").unwrap(), ModuleState::Active);
    assert_eq!(manager.status("laser").unwrap().activations, 1);
}

#[tokio::test]
async fn removing_a_descriptor_isolates_its_dependents() {
    let (manager, _factory) = manager(vec![
        mock_module("card", Hardware),
        mock_module("scanner", Logic).connect("card", "card"),
        mock_module("laser", Hardware),
    ]);
    manager.activate("scanner").await.unwrap();
    manager.activate("laser").await.unwrap();

    let report = manager.remove_descriptor("card").await.unwrap();
    assert_eq!(report.stopped, vec!["scanner", "card"]);
    assert!(report.delta.rejected.contains_key("scanner"));

    assert_eq!(
        manager.state("card").unwrap_err(),
        OrchestratorError::UnknownModule("card".into())
    );
    assert_eq!(manager.state("scanner").unwrap(), ModuleState::Unloaded);
    assert!(matches!(
        manager.activate("scanner").await.unwrap_err(),
        OrchestratorError::UnresolvedDependency { .. }
    ));
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Active);
    assert!(manager.descriptors().module("card").is_none());
}

#[tokio::test]
async fn descriptor_store_swaps_are_visible_to_new_readers_only() -> anyhow::Result<()> {
    let (manager, _factory) = manager(vec![mock_module("card", Hardware)]);
    let before = manager.descriptors();

    manager
        .apply_descriptor(mock_module("laser", Hardware))
        .await?;

    assert!(before.module("laser").is_none());
    assert!(manager.descriptors().module("laser").is_some());
    assert!(manager.descriptors().version > before.version);
    Ok(())
}
