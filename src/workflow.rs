//! Declarative workflow documents.
//!
//! A workflow file describes one action tree. The format is picked from the
//! file extension (`.toml`, `.yaml`/`.yml`, `.json`):
//!
//! ```toml
//! name = "focus scan"
//!
//! [root]
//! type = "sequential"
//! description = "Scan focus"
//!
//! [[root.children]]
//! type = "move"
//! description = "Move z to start"
//! control = "z"
//! target = -2.0
//!
//! [[root.children]]
//! type = "wait"
//! description = "Let the stage settle"
//! duration = "500ms"
//! ```
//!
//! Building a workflow resolves every `control` by name against a
//! [`ControlRegistry`]; an unknown name is a build error rather than an
//! action failure.

use crate::action::{ActionId, ActionInfo, ActionTree, ExecutionMode};
use crate::actions::{MoveAction, MoveMode, WaitAction};
use crate::config::EngineConfig;
use crate::control::{Control, SimulatedControl};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn default_true() -> bool {
    true
}

/// A named action tree description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Name shown in logs.
    pub name: String,
    /// Top-level action.
    pub root: WorkflowNode,
}

/// One node of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Full description.
    pub description: String,
    /// Short description; defaults to `description`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    /// Declared expected duration, e.g. `"1m 30s"`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<Duration>,
    /// Node type and its parameters.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Children run one after another.
    Sequential {
        /// Steps in order.
        #[serde(default)]
        children: Vec<WorkflowNode>,
        /// Record finished children in the action log.
        #[serde(default = "default_true")]
        log_sub_actions: bool,
    },
    /// Children run at the same time.
    Parallel {
        /// Branches.
        #[serde(default)]
        children: Vec<WorkflowNode>,
        /// Record finished children in the action log.
        #[serde(default = "default_true")]
        log_sub_actions: bool,
    },
    /// Move a control to a setpoint.
    Move {
        /// Registered control name.
        control: String,
        /// Setpoint, absolute unless `relative`.
        target: f64,
        /// Treat `target` as an offset from the current value.
        #[serde(default)]
        relative: bool,
        /// Maximum allowed distance between final value and target.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },
    /// Wait for a fixed time.
    Wait {
        /// Time to wait, e.g. `"500ms"`.
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

/// Controls available to workflows, by name.
#[derive(Default, Clone)]
pub struct ControlRegistry {
    controls: BTreeMap<String, Arc<dyn Control>>,
}

impl fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.controls.keys()).finish()
    }
}

impl ControlRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`SimulatedControl`] per configured control.
    pub fn simulated_from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for control in &config.controls {
            registry.register(Arc::new(SimulatedControl::new(control.clone())));
        }
        registry
    }

    /// Add a control under its own name, replacing any previous one.
    pub fn register(&mut self, control: Arc<dyn Control>) -> Option<Arc<dyn Control>> {
        self.controls.insert(control.name().to_string(), control)
    }

    /// Control registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Control>> {
        self.controls.get(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.controls.keys().map(String::as_str)
    }

    /// Number of registered controls.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// True when no control is registered.
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

impl Workflow {
    /// Read a workflow file, choosing the format from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match extension.as_str() {
            "toml" => Self::from_toml(&text),
            "yaml" | "yml" => Self::from_yaml(&text),
            "json" => Ok(serde_json::from_str(&text)?),
            other => Err(EngineError::Workflow(format!(
                "Unsupported workflow format '{other}' for {}",
                path.display()
            ))),
        }
    }

    /// Parse a TOML workflow.
    pub fn from_toml(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::Workflow(e.to_string()))
    }

    /// Parse a YAML workflow.
    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::Workflow(e.to_string()))
    }

    /// Names of every control the workflow refers to.
    pub fn control_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            match &node.kind {
                NodeKind::Sequential { children, .. } | NodeKind::Parallel { children, .. } => {
                    stack.extend(children.iter())
                }
                NodeKind::Move { control, .. } => names.push(control.as_str()),
                NodeKind::Wait { .. } => {}
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Build a fresh tree for this workflow.
    pub fn build(
        &self,
        registry: &ControlRegistry,
        config: &EngineConfig,
    ) -> EngineResult<(ActionTree, ActionId)> {
        let mut tree = ActionTree::with_settings(config.engine.tree_settings(), config.action_log.open()?);
        let root = build_node(&mut tree, registry, &self.root)?;
        debug!(workflow = %self.name, actions = tree.len(), "workflow built");
        Ok((tree, root))
    }
}

fn build_node(
    tree: &mut ActionTree,
    registry: &ControlRegistry,
    node: &WorkflowNode,
) -> EngineResult<ActionId> {
    let mut info = ActionInfo::new(node.description.clone());
    if let Some(short) = &node.short_description {
        info = info.with_short_description(short.clone());
    }
    if let Some(expected) = node.expected_duration {
        info = info.with_expected_duration(expected);
    }

    let id = match &node.kind {
        NodeKind::Sequential {
            children,
            log_sub_actions,
        }
        | NodeKind::Parallel {
            children,
            log_sub_actions,
        } => {
            let mode = match node.kind {
                NodeKind::Parallel { .. } => ExecutionMode::Parallel,
                _ => ExecutionMode::Sequential,
            };
            let id = tree.add_composite(info, mode);
            tree.set_log_sub_actions(id, *log_sub_actions)?;
            for child in children {
                let child = build_node(tree, registry, child)?;
                tree.add_child(id, child)?;
            }
            id
        }
        NodeKind::Move {
            control,
            target,
            relative,
            tolerance,
        } => {
            let handle = registry
                .get(control)
                .cloned()
                .ok_or_else(|| EngineError::UnknownControl(control.clone()))?;
            let mode = if *relative {
                MoveMode::Relative
            } else {
                MoveMode::Absolute
            };
            let mut action = MoveAction::new(handle, *target, mode);
            if let Some(tolerance) = tolerance {
                action = action.with_tolerance(*tolerance);
            }
            tree.add_leaf(info, action)
        }
        NodeKind::Wait { duration } => tree.add_leaf(info, WaitAction::new(*duration)),
    };
    Ok(id)
}
