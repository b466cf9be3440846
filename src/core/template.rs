//! ST-008: Template I/O — read YAML or JSON into a tree, write it back.
//!
//! YAML short-form intrinsics (`!Ref`, `!GetAtt`, `!Sub`, ...) are expanded to
//! their long form while reading, so the engine only ever sees single-key
//! call mappings.

use super::error::{ExpandError, Result};
use super::types::{Mapping, Node, GET_ATT, REF};
use serde_json::Value;
use serde_yaml_ng::Value as Yaml;
use std::path::Path;

/// Output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Format {
    #[default]
    Yaml,
    Json,
}

/// Parse template text. JSON is valid YAML, so one reader serves both.
pub fn parse_str(text: &str) -> Result<Node> {
    let yaml: Yaml = serde_yaml_ng::from_str(text)?;
    from_yaml(yaml)
}

/// Read a template file.
pub fn load(path: &Path) -> Result<Node> {
    let text = std::fs::read_to_string(path).map_err(|source| ExpandError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if path.extension().is_some_and(|ext| ext == "json") {
        return Ok(serde_json::from_str(&text)?);
    }
    parse_str(&text)
}

/// Render a tree in the requested format.
pub fn render(node: &Node, format: Format) -> Result<String> {
    Ok(match format {
        Format::Yaml => serde_yaml_ng::to_string(node)?,
        Format::Json => {
            let mut text = serde_json::to_string_pretty(node)?;
            text.push('\n');
            text
        }
    })
}

/// Convert a YAML tree, expanding short-form tags.
pub fn from_yaml(yaml: Yaml) -> Result<Node> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| ExpandError::malformed("template", format!("number {} has no JSON form", n)))?
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => Value::Array(items.into_iter().map(from_yaml).collect::<Result<Vec<_>>>()?),
        Yaml::Mapping(map) => {
            let mut out = Mapping::new();
            for (key, value) in map {
                out.insert(key_string(key)?, from_yaml(value)?);
            }
            Value::Object(out)
        }
        Yaml::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let name = tag.trim_start_matches('!');
            let value = from_yaml(tagged.value)?;
            short_form(name, value)
        }
    })
}

fn key_string(key: Yaml) -> Result<String> {
    match key {
        Yaml::String(s) => Ok(s),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Number(n) => Ok(n.to_string()),
        other => Err(ExpandError::malformed(
            "template",
            format!("mapping key {:?} is not a scalar", other),
        )),
    }
}

/// `!Name value` → `{"Fn::Name": value}`; `!Ref` and `!Condition` keep their names.
fn short_form(name: &str, value: Node) -> Node {
    let mut map = Mapping::new();
    match name {
        REF | "Condition" => {
            map.insert(name.to_string(), value);
        }
        "GetAtt" => {
            let value = match value {
                Value::String(path) => match path.split_once('.') {
                    Some((id, attr)) => Value::Array(vec![Value::String(id.into()), Value::String(attr.into())]),
                    None => Value::String(path),
                },
                other => other,
            };
            map.insert(GET_ATT.to_string(), value);
        }
        other => {
            map.insert(format!("Fn::{}", other), value);
        }
    }
    Value::Object(map)
}
