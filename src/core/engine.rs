//! ST-009: Expansion engine — one deterministic pass over a template.
//!
//! API section → matrix section → merge → pipelines → call rewrite.
//! Resolver state lives only for the duration of one [`expand`] call.

use super::config::ExpandOptions;
use super::dispatch::Dispatcher;
use super::error::{ExpandError, Result};
use super::tree::take_key;
use super::types::*;
use crate::pipeline::{expand_pipelines, PipelineSummary};
use crate::resolvers::api::ApiResolver;
use crate::resolvers::import::ImportResolver;
use crate::resolvers::matrix::MatrixResolver;
use serde_json::Value;
use std::fmt;

const RESOURCES: &str = "Resources";

/// What one expansion generated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionReport {
    pub apis: usize,
    pub api_resources: usize,
    pub matrices: usize,
    pub matrix_resources: usize,
    pub pipelines: Vec<PipelineSummary>,
}

impl ExpansionReport {
    pub fn generated(&self) -> usize {
        self.api_resources + self.matrix_resources
    }
}

impl fmt::Display for ExpansionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "APIs:      {} ({} resources)", self.apis, self.api_resources)?;
        writeln!(f, "Matrices:  {} ({} resources)", self.matrices, self.matrix_resources)?;
        write!(f, "Pipelines: {}", self.pipelines.len())?;
        for pipeline in &self.pipelines {
            write!(f, "\n  {}", pipeline.resource_id)?;
            for (action, run_order) in &pipeline.run_orders {
                write!(f, "\n    [{}] {}", run_order, action)?;
            }
        }
        Ok(())
    }
}

/// An expanded template and its report.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub template: Node,
    pub report: ExpansionReport,
}

/// Expand every shorthand section of `template` and rewrite references.
pub fn expand(template: Node, params: &Params, options: &ExpandOptions) -> Result<Expansion> {
    let Value::Object(template) = template else {
        return Err(ExpandError::malformed("template", "top level must be a mapping"));
    };
    let params = params.clone().with_template_defaults(&template);
    let mut report = ExpansionReport::default();

    let (api_section, template) = take_key(template, &options.api_section);
    let (matrix_section, mut template) = take_key(template, &options.matrix_section);

    let mut api = ApiResolver::new(options.deployment_hash_len);
    let mut generated = Vec::new();
    if let Some(section) = api_section {
        let defs = api.expand_section(section)?;
        report.apis = api.api_count();
        report.api_resources = defs.len();
        generated.extend(defs);
    }

    let mut matrix = MatrixResolver::new();
    if let Some(section) = matrix_section {
        let defs = matrix.expand_section(section, &params)?;
        report.matrices = matrix.matrix_count();
        report.matrix_resources = defs.len();
        generated.extend(defs);
    }

    if !generated.is_empty() && !template.contains_key(RESOURCES) {
        template.insert(RESOURCES.to_string(), Value::Object(Mapping::new()));
    }
    if let Some(resources) = template.get_mut(RESOURCES) {
        let Value::Object(resources) = resources else {
            return Err(ExpandError::malformed("template", "Resources must be a mapping"));
        };
        merge(resources, generated)?;
        report.pipelines = expand_pipelines(resources, &options.pipeline_types)?;
    }

    let import = ImportResolver::new();
    let dispatcher = Dispatcher::new().register(&api).register(&matrix).register(&import);
    let template = dispatcher.rewrite_template(template)?;

    tracing::info!(
        generated = report.generated(),
        pipelines = report.pipelines.len(),
        "expansion complete"
    );
    Ok(Expansion {
        template: Value::Object(template),
        report,
    })
}

/// Add generated definitions. An id already present is an error.
fn merge(resources: &mut Mapping, generated: Vec<ResourceDefinition>) -> Result<()> {
    for def in generated {
        if resources.contains_key(&def.id) {
            return Err(ExpandError::DuplicateLogicalId(def.id));
        }
        tracing::trace!(resource = %def, "merging generated resource");
        resources.insert(def.id.clone(), def.to_node());
    }
    Ok(())
}
