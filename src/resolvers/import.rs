//! ST-022: Import resolver — turns `${Import:Name}` placeholders into bindings.
//!
//! The fragment compiler cannot express a cross-stack import inline, so it
//! leaves `${Import:Name}` in the text. This resolver binds each one to a
//! `Fn::ImportValue` parameter of the enclosing `Fn::Sub`.

use crate::core::dispatch::Resolver;
use crate::core::error::Result;
use crate::core::types::*;
use crate::grammar::placeholder::rewrite_placeholders;
use serde_json::Value;

const IMPORT_PREFIX: &str = "Import:";

#[derive(Debug, Default)]
pub struct ImportResolver;

impl ImportResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for ImportResolver {
    fn name(&self) -> &'static str {
        "import"
    }

    fn can_handle(&self, call: &str) -> bool {
        call == SUB
    }

    fn expand(&self, name: &str, arg: Node) -> Result<Node> {
        let (template, mut bindings) = match arg {
            Value::String(template) => (template, Mapping::new()),
            Value::Array(mut parts) if parts.len() == 2 => match (parts.remove(0), parts.remove(0)) {
                (Value::String(template), Value::Object(bindings)) => (template, bindings),
                (first, second) => return Ok(call(name, Value::Array(vec![first, second]))),
            },
            other => return Ok(call(name, other)),
        };

        let had_bindings = !bindings.is_empty();
        let mut imported: Vec<(String, String)> = Vec::new();
        let mut counter = 0usize;
        let rewritten = rewrite_placeholders(&template, |body| {
            let Some(export) = body.strip_prefix(IMPORT_PREFIX) else {
                return Ok(None);
            };
            if let Some((param, _)) = imported.iter().find(|(_, e)| e == export) {
                return Ok(Some(param.clone()));
            }
            // Never hands out a name issued earlier in this call.
            let param = loop {
                counter += 1;
                let candidate = format!("Import{}", counter);
                if !bindings.contains_key(&candidate) {
                    break candidate;
                }
            };
            imported.push((param.clone(), export.to_string()));
            Ok(Some(param))
        })?;

        if imported.is_empty() {
            let arg = if had_bindings {
                Value::Array(vec![Value::String(template), Value::Object(bindings)])
            } else {
                Value::String(template)
            };
            return Ok(call(name, arg));
        }

        for (param, export) in imported {
            tracing::trace!(export = %export, param = %param, "binding import");
            bindings.insert(param, call(IMPORT_VALUE, Value::String(export)));
        }
        Ok(call(
            name,
            Value::Array(vec![Value::String(rewritten), Value::Object(bindings)]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_st022_plain_sub_untouched() {
        let r = ImportResolver::new();
        assert_eq!(r.expand(SUB, json!("${AWS::Region}")).unwrap(), json!({"Fn::Sub": "${AWS::Region}"}));
    }

    #[test]
    fn test_st022_import_bound() {
        let r = ImportResolver::new();
        let out = r.expand(SUB, json!(r#"{"vpc":"${Import:shared-vpc}"}"#)).unwrap();
        assert_eq!(
            out,
            json!({"Fn::Sub": [r#"{"vpc":"${Import1}"}"#, {"Import1": {"Fn::ImportValue": "shared-vpc"}}]})
        );
    }

    #[test]
    fn test_st022_repeated_import_shares_binding() {
        let r = ImportResolver::new();
        let out = r.expand(SUB, json!("${Import:a}/${Import:a}/${Import:b}")).unwrap();
        assert_eq!(
            out,
            json!({"Fn::Sub": ["${Import1}/${Import1}/${Import2}", {
                "Import1": {"Fn::ImportValue": "a"},
                "Import2": {"Fn::ImportValue": "b"}
            }]})
        );
    }

    #[test]
    fn test_st022_each_export_gets_distinct_binding_around_existing() {
        let r = ImportResolver::new();
        let out = r
            .expand(SUB, json!(["${Import2}|${Import:a}|${Import:b}|${Import:c}", {"Import2": "mine"}]))
            .unwrap();
        assert_eq!(
            out,
            json!({"Fn::Sub": ["${Import2}|${Import1}|${Import3}|${Import4}", {
                "Import2": "mine",
                "Import1": {"Fn::ImportValue": "a"},
                "Import3": {"Fn::ImportValue": "b"},
                "Import4": {"Fn::ImportValue": "c"}
            }]})
        );
        let bindings = out["Fn::Sub"][1].as_object().unwrap();
        assert_eq!(bindings.len(), 4);
    }

    #[test]
    fn test_st022_existing_bindings_kept_and_avoided() {
        let r = ImportResolver::new();
        let out = r
            .expand(SUB, json!(["${Import1}-${Import:x}", {"Import1": "mine"}]))
            .unwrap();
        assert_eq!(
            out,
            json!({"Fn::Sub": ["${Import1}-${Import2}", {
                "Import1": "mine",
                "Import2": {"Fn::ImportValue": "x"}
            }]})
        );
    }
}
