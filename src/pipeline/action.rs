//! ST-031: Pipeline stage and action declarations.
//!
//! Parsing is per action and independent of every other action: kind,
//! artifacts, dependency names and configuration are read here, and
//! cross-action links are resolved later by the graph builder.

use crate::core::error::{ExpandError, Result};
use crate::core::fragment::FragmentCompiler;
use crate::core::tree::{as_str, into_mapping, take_key};
use crate::core::types::*;
use indexmap::IndexSet;
use serde_json::Value;
use std::fmt;

/// Keys that stay on the action itself instead of going into `Configuration`.
const ACTION_LEVEL_KEYS: &[&str] = &["Region", "RoleArn", "TimeoutInMinutes"];

/// Closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Build,
    Generic,
    S3Source,
    S3Deploy,
    EcrSource,
    CloudFormation,
}

impl ActionKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Build" => Some(Self::Build),
            "Generic" => Some(Self::Generic),
            "S3Source" => Some(Self::S3Source),
            "S3Deploy" => Some(Self::S3Deploy),
            "EcrSource" => Some(Self::EcrSource),
            "CloudFormation" => Some(Self::CloudFormation),
            _ => None,
        }
    }

    /// The fixed type id of a kind. Generic actions carry their own.
    pub fn type_id(&self) -> Option<ActionTypeId> {
        let (category, provider) = match self {
            Self::Build => ("Build", "CodeBuild"),
            Self::S3Source => ("Source", "S3"),
            Self::S3Deploy => ("Deploy", "S3"),
            Self::EcrSource => ("Source", "ECR"),
            Self::CloudFormation => ("Deploy", "CloudFormation"),
            Self::Generic => return None,
        };
        Some(ActionTypeId::new(category, "AWS", provider, "1"))
    }

    /// Kind for an explicit type id. Unknown tuples are generic.
    pub fn from_type_id(type_id: &ActionTypeId) -> Self {
        [
            Self::Build,
            Self::S3Source,
            Self::S3Deploy,
            Self::EcrSource,
            Self::CloudFormation,
        ]
        .into_iter()
        .find(|kind| kind.type_id().as_ref() == Some(type_id))
        .unwrap_or(Self::Generic)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Build => "Build",
            Self::Generic => "Generic",
            Self::S3Source => "S3Source",
            Self::S3Deploy => "S3Deploy",
            Self::EcrSource => "EcrSource",
            Self::CloudFormation => "CloudFormation",
        };
        write!(f, "{}", s)
    }
}

/// Category/owner/provider/version tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTypeId {
    pub category: String,
    pub owner: String,
    pub provider: String,
    pub version: String,
}

impl ActionTypeId {
    pub fn new(category: &str, owner: &str, provider: &str, version: &str) -> Self {
        Self {
            category: category.to_string(),
            owner: owner.to_string(),
            provider: provider.to_string(),
            version: version.to_string(),
        }
    }

    fn parse(node: &Node, context: &str) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            node.get(key).map(scalar_to_string).filter(|s| !s.is_empty()).ok_or_else(|| {
                ExpandError::malformed(context, format!("ActionTypeId needs a '{}'", key))
            })
        };
        Ok(Self {
            category: field("Category")?,
            owner: field("Owner")?,
            provider: field("Provider")?,
            version: field("Version")?,
        })
    }

    pub fn to_node(&self) -> Node {
        serde_json::json!({
            "Category": self.category,
            "Owner": self.owner,
            "Provider": self.provider,
            "Version": self.version,
        })
    }
}

/// `Action` (same stage) or `Stage:Action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyName {
    pub stage: Option<String>,
    pub action: String,
}

impl DependencyName {
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((stage, action)) => Self {
                stage: Some(stage.to_string()),
                action: action.to_string(),
            },
            None => Self {
                stage: None,
                action: text.to_string(),
            },
        }
    }
}

impl fmt::Display for DependencyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(ref stage) => write!(f, "{}:{}", stage, self.action),
            None => write!(f, "{}", self.action),
        }
    }
}

/// One parsed action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDecl {
    pub name: String,
    pub kind: ActionKind,
    pub type_id: ActionTypeId,
    pub inputs: IndexSet<String>,
    pub outputs: IndexSet<String>,
    pub depends_on: Vec<DependencyName>,
    pub namespace: Option<String>,
    /// Explicit `RunOrder`; the computed order never goes below it
    pub run_order: Option<u64>,
    pub condition: Option<String>,
    pub configuration: Mapping,
    /// Raw CloudFormation parameter overrides, compiled after linking
    pub parameter_overrides: Option<Node>,
    /// Action-level attributes emitted as-is
    pub extra: Mapping,
}

/// One parsed stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDecl {
    pub name: String,
    pub condition: Option<String>,
    pub actions: Vec<ActionDecl>,
    pub extra: Mapping,
}

/// Parse the `Stages` list of one pipeline.
pub fn parse_stages(stages: Vec<Node>, compiler: &mut FragmentCompiler, context: &str) -> Result<Vec<StageDecl>> {
    let mut parsed: Vec<StageDecl> = Vec::with_capacity(stages.len());
    for stage in stages {
        let stage = parse_stage(stage, compiler, context)?;
        if parsed.iter().any(|s| s.name == stage.name) {
            return Err(ExpandError::malformed(context, format!("stage '{}' declared twice", stage.name)));
        }
        parsed.push(stage);
    }
    Ok(parsed)
}

fn parse_stage(stage: Node, compiler: &mut FragmentCompiler, context: &str) -> Result<StageDecl> {
    if !stage.is_object() {
        return Err(ExpandError::malformed(context, format!("stage must be a mapping, got {}", stage)));
    }
    let (name, rest) = take_key(into_mapping(stage), "Name");
    let name = name
        .as_ref()
        .and_then(as_str)
        .map(str::to_string)
        .ok_or_else(|| ExpandError::malformed(context, "every stage needs a string Name"))?;
    let context = format!("{} stage '{}'", context, name);
    let (condition, rest) = take_key(rest, "Condition");
    let condition = optional_name(condition, "Condition", &context)?;
    let (actions, extra) = take_key(rest, "Actions");

    let actions = match actions {
        Some(Value::Object(actions)) => actions
            .into_iter()
            .map(|(action, body)| parse_action(action, body, compiler, &context))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Array(items)) => {
            let mut parsed: Vec<ActionDecl> = Vec::with_capacity(items.len());
            for item in items {
                let (action, body) = take_key(into_mapping(item), "Name");
                let action = action
                    .as_ref()
                    .and_then(as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ExpandError::malformed(&context, "listed actions need a string Name"))?;
                if parsed.iter().any(|a| a.name == action) {
                    return Err(ExpandError::malformed(&context, format!("action '{}' declared twice", action)));
                }
                parsed.push(parse_action(action, Value::Object(body), compiler, &context)?);
            }
            parsed
        }
        _ => return Err(ExpandError::malformed(&context, "Actions must be a mapping or a list")),
    };
    if actions.is_empty() {
        return Err(ExpandError::malformed(&context, "stage has no actions"));
    }

    Ok(StageDecl {
        name,
        condition,
        actions,
        extra,
    })
}

fn parse_action(name: String, body: Node, compiler: &mut FragmentCompiler, context: &str) -> Result<ActionDecl> {
    let context = format!("{} action '{}'", context, name);
    if !body.is_object() {
        return Err(ExpandError::malformed(&context, "action must be a mapping"));
    }
    let body = into_mapping(body);

    let (tag, body) = take_key(body, "Type");
    let (type_id, body) = take_key(body, "ActionTypeId");
    let (kind, type_id) = match (tag, type_id) {
        (Some(tag), None) => {
            let tag_text = as_str(&tag).unwrap_or_default();
            let kind = ActionKind::from_tag(tag_text)
                .ok_or_else(|| ExpandError::malformed(&context, format!("unknown action type {}", tag)))?;
            let type_id = kind
                .type_id()
                .ok_or_else(|| ExpandError::malformed(&context, "Generic actions need an ActionTypeId"))?;
            (kind, type_id)
        }
        (None, Some(type_id)) => {
            let type_id = ActionTypeId::parse(&type_id, &context)?;
            (ActionKind::from_type_id(&type_id), type_id)
        }
        (Some(tag), Some(type_id)) => {
            let type_id = ActionTypeId::parse(&type_id, &context)?;
            if as_str(&tag) != Some("Generic") {
                return Err(ExpandError::malformed(
                    &context,
                    "give either a Type or an ActionTypeId, not both",
                ));
            }
            (ActionKind::Generic, type_id)
        }
        (None, None) => return Err(ExpandError::malformed(&context, "needs a Type or an ActionTypeId")),
    };

    let (inputs, body) = take_key(body, "InputArtifacts");
    let (outputs, body) = take_key(body, "OutputArtifacts");
    let (depends_on, body) = take_key(body, "DependsOn");
    let (namespace, body) = take_key(body, "Namespace");
    let (run_order, body) = take_key(body, "RunOrder");
    let (condition, body) = take_key(body, "Condition");
    let (configuration, mut body) = take_key(body, "Configuration");

    let mut configuration = match configuration {
        None => Mapping::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ExpandError::malformed(&context, format!("Configuration must be a mapping, got {}", other)))
        }
    };
    let mut extra = Mapping::new();
    for key in ACTION_LEVEL_KEYS {
        if let Some(value) = body.shift_remove(*key) {
            extra.insert(key.to_string(), value);
        }
    }
    let parameter_overrides = configure(kind, body, &mut configuration, compiler, &context)?;

    Ok(ActionDecl {
        name,
        kind,
        type_id,
        inputs: parse_artifacts(inputs, "InputArtifacts", &context)?,
        outputs: parse_artifacts(outputs, "OutputArtifacts", &context)?,
        depends_on: parse_names(depends_on, &context)?,
        namespace: optional_name(namespace, "Namespace", &context)?,
        run_order: parse_run_order(run_order, &context)?,
        condition: optional_name(condition, "Condition", &context)?,
        configuration,
        parameter_overrides,
        extra,
    })
}

/// Fold kind-specific keys into `configuration`. Unknown keys pass through.
fn configure(
    kind: ActionKind,
    body: Mapping,
    configuration: &mut Mapping,
    compiler: &mut FragmentCompiler,
    context: &str,
) -> Result<Option<Node>> {
    let mut overrides = None;
    let mut body = body;

    match kind {
        ActionKind::Build => {
            rename(&mut body, "Project", "ProjectName", configuration);
            require(configuration, "ProjectName", "Project", context)?;
            if let Some(vars) = body.shift_remove("EnvironmentVariables") {
                let compiled = environment_variables(vars, compiler, context)?;
                configuration.insert("EnvironmentVariables".into(), compiled);
            }
        }
        ActionKind::S3Source => {
            rename(&mut body, "Bucket", "S3Bucket", configuration);
            rename(&mut body, "Key", "S3ObjectKey", configuration);
            require(configuration, "S3Bucket", "Bucket", context)?;
            require(configuration, "S3ObjectKey", "Key", context)?;
            configuration
                .entry("PollForSourceChanges")
                .or_insert(Value::Bool(false));
        }
        ActionKind::S3Deploy => {
            rename(&mut body, "Bucket", "BucketName", configuration);
            rename(&mut body, "ObjectKey", "ObjectKey", configuration);
            require(configuration, "BucketName", "Bucket", context)?;
            let extract = body
                .shift_remove("Extract")
                .or_else(|| configuration.shift_remove("Extract"))
                .unwrap_or(Value::Bool(true));
            if extract == Value::Bool(false) && !configuration.contains_key("ObjectKey") {
                return Err(ExpandError::malformed(context, "S3Deploy with Extract false needs an ObjectKey"));
            }
            configuration.insert("Extract".into(), extract);
        }
        ActionKind::EcrSource => {
            rename(&mut body, "Repository", "RepositoryName", configuration);
            require(configuration, "RepositoryName", "Repository", context)?;
            let tag = body
                .shift_remove("ImageTag")
                .unwrap_or_else(|| Value::String("latest".into()));
            configuration.entry("ImageTag").or_insert(tag);
        }
        ActionKind::CloudFormation => {
            overrides = body
                .shift_remove("ParameterOverrides")
                .or_else(|| configuration.shift_remove("ParameterOverrides"));
            configuration
                .entry("ActionMode")
                .or_insert_with(|| Value::String("CREATE_UPDATE".into()));
        }
        ActionKind::Generic => {}
    }

    for (key, value) in body {
        configuration.insert(key, value);
    }
    Ok(overrides)
}

fn rename(body: &mut Mapping, from: &str, to: &str, configuration: &mut Mapping) {
    if let Some(value) = body.shift_remove(from) {
        configuration.insert(to.to_string(), value);
    }
}

fn require(configuration: &Mapping, key: &str, shorthand: &str, context: &str) -> Result<()> {
    if configuration.contains_key(key) {
        Ok(())
    } else {
        Err(ExpandError::malformed(context, format!("missing '{}'", shorthand)))
    }
}

/// `{NAME: value | {Type, Value}}` → one string holding `[{name, type, value}]`.
fn environment_variables(vars: Node, compiler: &mut FragmentCompiler, context: &str) -> Result<Node> {
    let Value::Object(vars) = vars else {
        return Err(ExpandError::malformed(context, "EnvironmentVariables must be a mapping"));
    };
    let mut list = Vec::with_capacity(vars.len());
    for (name, value) in vars {
        let (var_type, value) = match value {
            Value::Object(ref spec) if spec.contains_key("Value") && as_call(&value).is_none() => {
                let var_type = spec.get("Type").cloned().unwrap_or_else(|| Value::String("PLAINTEXT".into()));
                (var_type, spec.get("Value").cloned().unwrap_or_default())
            }
            other => (Value::String("PLAINTEXT".into()), other),
        };
        let mut entry = Mapping::new();
        entry.insert("name".into(), Value::String(name));
        entry.insert("type".into(), var_type);
        entry.insert("value".into(), value);
        list.push(Value::Object(entry));
    }
    Ok(compiler.compile(&Value::Array(list)).into_node())
}

/// Artifact names, as plain strings or native `{Name}` mappings.
fn parse_artifacts(node: Option<Node>, key: &str, context: &str) -> Result<IndexSet<String>> {
    let items = match node {
        None | Some(Value::Null) => return Ok(IndexSet::new()),
        Some(Value::String(name)) => vec![Value::String(name)],
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ExpandError::malformed(context, format!("{} must be a list, got {}", key, other)))
        }
    };
    let mut names = IndexSet::with_capacity(items.len());
    for item in items {
        let name = match item {
            Value::String(name) => name,
            Value::Object(ref map) => map
                .get("Name")
                .and_then(as_str)
                .map(str::to_string)
                .ok_or_else(|| ExpandError::malformed(context, format!("{} entry {} has no Name", key, item)))?,
            other => {
                return Err(ExpandError::malformed(context, format!("{} entry must be a name, got {}", key, other)))
            }
        };
        if !names.insert(name.clone()) {
            return Err(ExpandError::malformed(context, format!("{} lists '{}' twice", key, name)));
        }
    }
    Ok(names)
}

fn parse_names(node: Option<Node>, context: &str) -> Result<Vec<DependencyName>> {
    match node {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(name)) => Ok(vec![DependencyName::parse(&name)]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                as_str(item)
                    .map(DependencyName::parse)
                    .ok_or_else(|| ExpandError::malformed(context, format!("DependsOn entry must be a name, got {}", item)))
            })
            .collect(),
        Some(other) => Err(ExpandError::malformed(context, format!("DependsOn must be a list, got {}", other))),
    }
}

fn parse_run_order(node: Option<Node>, context: &str) -> Result<Option<u64>> {
    match node {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n >= 1 => Ok(Some(n)),
            _ => Err(ExpandError::malformed(context, format!("RunOrder must be a positive integer, got {}", value))),
        },
    }
}

fn optional_name(node: Option<Node>, key: &str, context: &str) -> Result<Option<String>> {
    match node {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) if !name.is_empty() => Ok(Some(name)),
        Some(other) => Err(ExpandError::malformed(context, format!("{} must be a name, got {}", key, other))),
    }
}
