//! ST-034: Wire form of ordered stages.

use super::graph::{OrderedAction, OrderedStage};
use crate::core::types::*;
use indexmap::IndexSet;
use serde_json::Value;

/// `Stages` list for the target resource.
pub fn stages_to_node(stages: &[OrderedStage]) -> Node {
    Value::Array(stages.iter().map(stage_to_node).collect())
}

fn stage_to_node(stage: &OrderedStage) -> Node {
    let mut map = Mapping::new();
    map.insert("Name".into(), Value::String(stage.name.clone()));
    map.insert(
        "Actions".into(),
        Value::Array(stage.actions.iter().map(action_to_node).collect()),
    );
    for (key, value) in &stage.extra {
        map.insert(key.clone(), value.clone());
    }
    conditional(stage.condition.as_deref(), Value::Object(map))
}

fn action_to_node(action: &OrderedAction) -> Node {
    let decl = &action.decl;
    let mut map = Mapping::new();
    map.insert("Name".into(), Value::String(decl.name.clone()));
    map.insert("ActionTypeId".into(), decl.type_id.to_node());
    if !decl.configuration.is_empty() {
        map.insert("Configuration".into(), Value::Object(decl.configuration.clone()));
    }
    if !decl.inputs.is_empty() {
        map.insert("InputArtifacts".into(), artifacts(&decl.inputs));
    }
    if !decl.outputs.is_empty() {
        map.insert("OutputArtifacts".into(), artifacts(&decl.outputs));
    }
    if let Some(ref namespace) = action.namespace {
        map.insert("Namespace".into(), Value::String(namespace.clone()));
    }
    map.insert("RunOrder".into(), Value::from(action.run_order));
    for (key, value) in &decl.extra {
        map.insert(key.clone(), value.clone());
    }
    conditional(decl.condition.as_deref(), Value::Object(map))
}

fn artifacts(names: &IndexSet<String>) -> Node {
    Value::Array(
        names
            .iter()
            .map(|name| serde_json::json!({ "Name": name }))
            .collect(),
    )
}

fn conditional(condition: Option<&str>, item: Node) -> Node {
    match condition {
        Some(condition) => if_present(condition, item),
        None => item,
    }
}
