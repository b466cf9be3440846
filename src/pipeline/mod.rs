//! Pipeline shorthand — stages of named actions compiled into native stages.
//!
//! A pipeline resource opts in by giving at least one stage its `Actions` as
//! a mapping. Its stages are then parsed, linked and ordered by [`graph`],
//! and written back through [`codegen`].

pub mod action;
pub mod codegen;
pub mod graph;
pub mod namespace;

use crate::core::error::{ExpandError, Result};
use crate::core::fragment::FragmentCompiler;
use crate::core::types::*;
use serde_json::Value;

/// Run orders computed for one pipeline resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub resource_id: String,
    /// (`Stage:Action`, run order), in emitted order
    pub run_orders: Vec<(String, u64)>,
}

/// Whether a resource uses the shorthand.
pub fn is_shorthand_pipeline(resource: &Node, pipeline_types: &[String]) -> bool {
    let Some(resource_type) = resource.get("Type").and_then(Value::as_str) else {
        return false;
    };
    if !pipeline_types.iter().any(|t| t == resource_type) {
        return false;
    }
    resource
        .pointer("/Properties/Stages")
        .and_then(Value::as_array)
        .is_some_and(|stages| stages.iter().any(|s| s.get("Actions").is_some_and(Value::is_object)))
}

/// Expand every shorthand pipeline in `resources`, in place.
pub fn expand_pipelines(resources: &mut Mapping, pipeline_types: &[String]) -> Result<Vec<PipelineSummary>> {
    let mut summaries = Vec::new();
    for (id, resource) in resources.iter_mut() {
        if !is_shorthand_pipeline(resource, pipeline_types) {
            continue;
        }
        let Some(stages) = resource.pointer_mut("/Properties/Stages") else {
            continue;
        };
        let Value::Array(items) = std::mem::take(stages) else {
            return Err(ExpandError::malformed(format!("pipeline '{}'", id), "Stages must be a list"));
        };
        let (expanded, summary) = expand_stages(id, items)?;
        *stages = expanded;
        tracing::debug!(pipeline = %id, actions = summary.run_orders.len(), "expanded pipeline");
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Parse, link, order and emit one pipeline's stages.
pub fn expand_stages(resource_id: &str, stages: Vec<Node>) -> Result<(Node, PipelineSummary)> {
    let context = format!("pipeline '{}'", resource_id);
    let mut compiler = FragmentCompiler::new();
    let parsed = action::parse_stages(stages, &mut compiler, &context)?;
    let ordered = graph::build(parsed, &mut compiler).map_err(|e| match e {
        ExpandError::Malformed { context: inner, message } => ExpandError::Malformed {
            context: format!("{} {}", context, inner),
            message,
        },
        other => other,
    })?;

    let run_orders = ordered
        .stages
        .iter()
        .flat_map(|stage| {
            stage
                .actions
                .iter()
                .map(move |a| (format!("{}:{}", stage.name, a.decl.name), a.run_order))
        })
        .collect();
    Ok((
        codegen::stages_to_node(&ordered.stages),
        PipelineSummary {
            resource_id: resource_id.to_string(),
            run_orders,
        },
    ))
}
