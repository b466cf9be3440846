//! ST-001: Core types shared by every expansion stage.
//!
//! The template tree is a `serde_json::Value` (ordered mappings), so every
//! traversal is an exhaustive match over mapping / sequence / scalar.

use super::error::{ExpandError, Result};
use indexmap::IndexSet;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Universal tree node.
pub type Node = Value;

/// A mapping node's contents.
pub type Mapping = Map<String, Node>;

// ============================================================================
// Intrinsic call names
// ============================================================================

pub const REF: &str = "Ref";
pub const GET_ATT: &str = "Fn::GetAtt";
pub const SUB: &str = "Fn::Sub";
pub const IMPORT_VALUE: &str = "Fn::ImportValue";
pub const IF: &str = "Fn::If";
pub const LENGTH: &str = "Fn::Length";
/// Artifact/file parameter extraction; evaluated by the pipeline service, never rewritten.
pub const GET_PARAM: &str = "Fn::GetParam";
pub const NO_VALUE: &str = "AWS::NoValue";

/// Whether `name` is a call name the target template language understands.
pub fn is_call_name(name: &str) -> bool {
    name == REF || name.starts_with("Fn::")
}

/// If `node` is a single-key mapping, return its key and value.
pub fn single_entry(node: &Node) -> Option<(&str, &Node)> {
    match node {
        Value::Object(map) if map.len() == 1 => map.iter().next().map(|(k, v)| (k.as_str(), v)),
        _ => None,
    }
}

/// If `node` is a recognised function call, return its name and argument.
pub fn as_call(node: &Node) -> Option<(&str, &Node)> {
    single_entry(node).filter(|(name, _)| is_call_name(name))
}

/// Build a single-key call mapping.
pub fn call(name: &str, arg: Node) -> Node {
    let mut map = Mapping::new();
    map.insert(name.to_string(), arg);
    Value::Object(map)
}

/// `{"Ref": id}`
pub fn ref_to(id: &str) -> Node {
    call(REF, Value::String(id.to_string()))
}

/// `{"Fn::GetAtt": [id, attr]}`
pub fn get_att(id: &str, attr: &str) -> Node {
    call(
        GET_ATT,
        Value::Array(vec![Value::String(id.to_string()), Value::String(attr.to_string())]),
    )
}

/// `{"Fn::If": [condition, when_true, {"Ref": "AWS::NoValue"}]}`
pub fn if_present(condition: &str, when_true: Node) -> Node {
    call(
        IF,
        Value::Array(vec![Value::String(condition.to_string()), when_true, ref_to(NO_VALUE)]),
    )
}

// ============================================================================
// Resource definitions
// ============================================================================

/// A canonical resource produced by a shorthand expander.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// Logical id, unique within one expansion
    pub id: String,

    /// Target resource type (e.g. `AWS::ApiGateway::Method`)
    pub resource_type: String,

    pub condition: Option<String>,

    /// Ordered, duplicate-free
    pub depends_on: IndexSet<String>,

    pub properties: Mapping,

    /// Other resource attributes (`DeletionPolicy`, `Metadata`, ...), passed through
    pub attributes: Mapping,
}

impl ResourceDefinition {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            condition: None,
            depends_on: IndexSet::new(),
            properties: Mapping::new(),
            attributes: Mapping::new(),
        }
    }

    /// Parse a definition from its wire form. `Type` is required.
    pub fn from_node(id: impl Into<String>, node: Node) -> Result<Self> {
        let id = id.into();
        let context = format!("resource '{}'", id);
        let Value::Object(mut map) = node else {
            return Err(ExpandError::malformed(context, "definition must be a mapping"));
        };
        let resource_type = match map.shift_remove("Type") {
            Some(Value::String(t)) => t,
            _ => return Err(ExpandError::malformed(context, "definition needs a string Type")),
        };
        let condition = match map.shift_remove("Condition") {
            None | Some(Value::Null) => None,
            Some(Value::String(c)) => Some(c),
            Some(other) => {
                return Err(ExpandError::malformed(context, format!("Condition must be a name, got {}", other)))
            }
        };
        let mut depends_on = IndexSet::new();
        match map.shift_remove("DependsOn") {
            None | Some(Value::Null) => {}
            Some(Value::String(dep)) => {
                depends_on.insert(dep);
            }
            Some(Value::Array(items)) => {
                for item in items {
                    match item {
                        Value::String(dep) => {
                            depends_on.insert(dep);
                        }
                        other => {
                            return Err(ExpandError::malformed(
                                context,
                                format!("DependsOn entries must be ids, got {}", other),
                            ))
                        }
                    }
                }
            }
            Some(other) => {
                return Err(ExpandError::malformed(context, format!("DependsOn must be a list, got {}", other)))
            }
        };
        let properties = match map.shift_remove("Properties") {
            None | Some(Value::Null) => Mapping::new(),
            Some(Value::Object(p)) => p,
            Some(other) => {
                return Err(ExpandError::malformed(context, format!("Properties must be a mapping, got {}", other)))
            }
        };
        Ok(Self {
            id,
            resource_type,
            condition,
            depends_on,
            properties,
            attributes: map,
        })
    }

    pub fn with_properties(mut self, properties: Mapping) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_condition(mut self, condition: Option<String>) -> Self {
        self.condition = condition;
        self
    }

    /// Wire form. Empty `Condition`, `DependsOn` and `Properties` are omitted.
    pub fn to_node(&self) -> Node {
        let mut map = Mapping::new();
        map.insert("Type".to_string(), Value::String(self.resource_type.clone()));
        if let Some(ref condition) = self.condition {
            map.insert("Condition".to_string(), Value::String(condition.clone()));
        }
        if !self.depends_on.is_empty() {
            map.insert(
                "DependsOn".to_string(),
                Value::Array(self.depends_on.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.properties.is_empty() {
            map.insert("Properties".to_string(), Value::Object(self.properties.clone()));
        }
        for (key, value) in &self.attributes {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

impl fmt::Display for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.resource_type)
    }
}

// ============================================================================
// Ambient parameters
// ============================================================================

/// Ambient parameter values supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Fill gaps from the template's own `Parameters.<Name>.Default` values.
    pub fn with_template_defaults(mut self, template: &Mapping) -> Self {
        let Some(Value::Object(declared)) = template.get("Parameters") else {
            return self;
        };
        for (name, decl) in declared {
            if self.values.contains_key(name) {
                continue;
            }
            if let Some(default) = decl.get("Default") {
                self.values.insert(name.clone(), scalar_to_string(default));
            }
        }
        self
    }
}

/// Render a scalar the way the target would stringify it. Structures are JSON.
pub fn scalar_to_string(val: &Node) -> String {
    match val {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(scalar_to_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => val.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_st001_call_names() {
        assert!(is_call_name("Ref"));
        assert!(is_call_name("Fn::GetAtt"));
        assert!(is_call_name("Fn::Whatever"));
        assert!(!is_call_name("From"));
        assert!(!is_call_name("Condition"));
    }

    #[test]
    fn test_st001_as_call_requires_single_key() {
        assert!(as_call(&json!({"Ref": "X"})).is_some());
        assert!(as_call(&json!({"Ref": "X", "Other": 1})).is_none());
        assert!(as_call(&json!({"From": "To"})).is_none());
        assert!(as_call(&json!("Ref")).is_none());
    }

    #[test]
    fn test_st001_definition_omits_empty_fields() {
        let def = ResourceDefinition::new("Bucket", "AWS::S3::Bucket");
        assert_eq!(def.to_node(), json!({"Type": "AWS::S3::Bucket"}));
    }

    #[test]
    fn test_st001_definition_full_wire_form() {
        let mut def = ResourceDefinition::new("M", "AWS::ApiGateway::Method")
            .with_condition(Some("IsProd".into()));
        def.depends_on.insert("A".into());
        def.depends_on.insert("A".into());
        def.properties.insert("HttpMethod".into(), json!("GET"));
        assert_eq!(
            def.to_node(),
            json!({
                "Type": "AWS::ApiGateway::Method",
                "Condition": "IsProd",
                "DependsOn": ["A"],
                "Properties": {"HttpMethod": "GET"}
            })
        );
    }

    #[test]
    fn test_st001_definition_from_node() {
        let def = ResourceDefinition::from_node(
            "Bucket",
            json!({"Type": "AWS::S3::Bucket", "DependsOn": "Key", "DeletionPolicy": "Retain", "Properties": {"A": 1}}),
        )
        .unwrap();
        assert_eq!(def.resource_type, "AWS::S3::Bucket");
        assert!(def.depends_on.contains("Key"));
        assert_eq!(def.attributes["DeletionPolicy"], json!("Retain"));
        assert_eq!(
            def.to_node(),
            json!({"Type": "AWS::S3::Bucket", "DependsOn": ["Key"], "Properties": {"A": 1}, "DeletionPolicy": "Retain"})
        );
    }

    #[test]
    fn test_st001_definition_from_node_requires_type() {
        assert!(ResourceDefinition::from_node("X", json!({"Properties": {}})).is_err());
        assert!(ResourceDefinition::from_node("X", json!({"Type": "T", "DependsOn": [1]})).is_err());
        assert!(ResourceDefinition::from_node("X", json!("T")).is_err());
    }

    #[test]
    fn test_st001_params_template_defaults() {
        let template = json!({
            "Parameters": {
                "Domains": {"Type": "CommaDelimitedList", "Default": "a,b"},
                "Stage": {"Type": "String", "Default": "dev"}
            }
        });
        let mut params = Params::default();
        params.insert("Stage", "prod");
        let params = params.with_template_defaults(template.as_object().unwrap());
        assert_eq!(params.get("Domains"), Some("a,b"));
        assert_eq!(params.get("Stage"), Some("prod"));
        assert_eq!(params.get("Missing"), None);
    }

    #[test]
    fn test_st001_scalar_to_string() {
        assert_eq!(scalar_to_string(&json!("x")), "x");
        assert_eq!(scalar_to_string(&json!(3)), "3");
        assert_eq!(scalar_to_string(&json!(true)), "true");
        assert_eq!(scalar_to_string(&json!(null)), "");
        assert_eq!(scalar_to_string(&json!(["a", "b"])), "a,b");
    }

    #[test]
    fn test_st001_if_present_shape() {
        assert_eq!(
            if_present("C", json!({"Name": "s"})),
            json!({"Fn::If": ["C", {"Name": "s"}, {"Ref": "AWS::NoValue"}]})
        );
    }
}
