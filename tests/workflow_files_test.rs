//! The shipped configuration and workflow files load, build and run.

mod common;

use common::drive;
use daq_actions::action::ActionState;
use daq_actions::config::EngineConfig;
use daq_actions::control::Control;
use daq_actions::workflow::{ControlRegistry, Workflow};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

fn repo_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

fn shipped_config() -> EngineConfig {
    EngineConfig::load_from(repo_path("config/daq_actions.toml")).unwrap()
}

#[test]
fn test_shipped_config_is_valid() {
    let config = shipped_config();
    let names: Vec<_> = config.controls.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y", "z"]);
    assert!(!config.controls[2].can_stop);
}

#[test]
fn test_every_shipped_workflow_builds() {
    let config = shipped_config();
    let registry = ControlRegistry::simulated_from_config(&config);
    let mut built = 0;

    for entry in std::fs::read_dir(repo_path("workflows")).unwrap() {
        let path = entry.unwrap().path();
        let workflow = Workflow::from_path(&path).unwrap();
        for name in workflow.control_names() {
            assert!(registry.get(name).is_some(), "{}: unknown control {name}", path.display());
        }
        let (tree, root) = workflow.build(&registry, &config).unwrap();
        assert_eq!(tree.state(root), Some(ActionState::Constructed));
        assert!(!tree.outline(root).is_empty());
        built += 1;
    }
    assert!(built >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_focus_scan_runs_in_virtual_time() {
    let config = shipped_config();
    let registry = ControlRegistry::simulated_from_config(&config);
    let workflow = Workflow::from_path(repo_path("workflows/focus_scan.toml")).unwrap();
    let (mut tree, root) = workflow.build(&registry, &config).unwrap();
    let began = Instant::now();

    assert!(tree.start(root));
    drive(&mut tree, root).await;

    assert_eq!(tree.state(root), Some(ActionState::Succeeded), "{:?}", tree.failure(root));
    let z = registry.get("z").unwrap();
    assert!((z.current_value() - 2.0).abs() < 1e-9);

    // x travels 12.5 mm at 10 mm/s, then 0.5 s settle, then z moves 2 mm and 4 mm at 1 mm/s.
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(7700), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(7800), "{elapsed:?}");
}
