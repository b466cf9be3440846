//! ST-005: Call-rewrite dispatcher.
//!
//! Walks the `Resources` and `Outputs` sections. Wherever a single-key mapping
//! names a call a registered [`Resolver`] can handle, the resolver rewrites
//! it; the walk then continues into the (possibly replaced) mapping's values.
//! Resolvers never see tree shape, only one call at a time.

use super::error::Result;
use super::types::{single_entry, Mapping, Node};
use serde_json::Value;

/// Sections the dispatcher rewrites.
pub const REWRITTEN_SECTIONS: [&str; 2] = ["Resources", "Outputs"];

/// Rewrites one recognised call into its final form.
pub trait Resolver {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn can_handle(&self, call: &str) -> bool;

    /// Return the replacement for `{call: arg}` (itself a single-key mapping).
    fn expand(&self, call: &str, arg: Node) -> Result<Node>;
}

/// Ordered chain of resolvers applied at every call site.
#[derive(Default)]
pub struct Dispatcher<'a> {
    resolvers: Vec<&'a dyn Resolver>,
}

impl<'a> Dispatcher<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, resolver: &'a dyn Resolver) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Rewrite the `Resources` and `Outputs` sections of `template`.
    pub fn rewrite_template(&self, mut template: Mapping) -> Result<Mapping> {
        for section in REWRITTEN_SECTIONS {
            if let Some(slot) = template.get_mut(section) {
                let node = std::mem::take(slot);
                *slot = self.rewrite(node)?;
            }
        }
        Ok(template)
    }

    /// Rewrite an arbitrary subtree.
    pub fn rewrite(&self, node: Node) -> Result<Node> {
        match node {
            Value::Object(_) => {
                let replaced = self.apply_resolvers(node)?;
                match replaced {
                    Value::Object(map) => {
                        let mut out = Mapping::with_capacity(map.len());
                        for (k, v) in map {
                            out.insert(k, self.rewrite(v)?);
                        }
                        Ok(Value::Object(out))
                    }
                    other => self.rewrite(other),
                }
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.rewrite(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null) => Ok(scalar),
        }
    }

    fn apply_resolvers(&self, mut node: Node) -> Result<Node> {
        for resolver in &self.resolvers {
            let Some((name, _)) = single_entry(&node) else {
                break;
            };
            if !resolver.can_handle(name) {
                continue;
            }
            let name = name.to_string();
            let arg = match node {
                Value::Object(mut map) => map.shift_remove(&name).unwrap_or(Value::Null),
                other => other,
            };
            tracing::trace!(resolver = resolver.name(), call = %name, "rewriting call");
            node = resolver.expand(&name, arg)?;
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{call, REF};
    use serde_json::json;

    /// Renames `Ref: Old:*` targets by stripping the prefix.
    struct StripPrefix;

    impl Resolver for StripPrefix {
        fn name(&self) -> &'static str {
            "strip"
        }
        fn can_handle(&self, call: &str) -> bool {
            call == REF
        }
        fn expand(&self, name: &str, arg: Node) -> Result<Node> {
            let arg = match arg {
                Value::String(s) => Value::String(s.trim_start_matches("Old:").to_string()),
                other => other,
            };
            Ok(call(name, arg))
        }
    }

    /// Appends `!` to every Ref target.
    struct Shout;

    impl Resolver for Shout {
        fn name(&self) -> &'static str {
            "shout"
        }
        fn can_handle(&self, call: &str) -> bool {
            call == REF
        }
        fn expand(&self, name: &str, arg: Node) -> Result<Node> {
            Ok(call(name, json!(format!("{}!", arg.as_str().unwrap_or_default()))))
        }
    }

    #[test]
    fn test_st005_noop_template_unchanged() {
        let template = json!({
            "Resources": {"B": {"Type": "AWS::S3::Bucket", "Properties": {"Tags": [{"Key": "k"}]}}},
            "Outputs": {"O": {"Value": {"Fn::Join": ["", ["a"]]}}}
        });
        let d = Dispatcher::new().register(&StripPrefix);
        let out = d.rewrite_template(template.as_object().unwrap().clone()).unwrap();
        assert_eq!(Value::Object(out), template);
    }

    #[test]
    fn test_st005_rewrites_nested_calls() {
        let template = json!({
            "Resources": {"B": {"Properties": {"List": [{"Ref": "Old:A"}, {"x": {"Ref": "Old:C"}}]}}},
            "Outputs": {"O": {"Value": {"Ref": "Old:D"}}}
        });
        let d = Dispatcher::new().register(&StripPrefix);
        let out = Value::Object(d.rewrite_template(template.as_object().unwrap().clone()).unwrap());
        assert_eq!(out["Resources"]["B"]["Properties"]["List"][0], json!({"Ref": "A"}));
        assert_eq!(out["Resources"]["B"]["Properties"]["List"][1]["x"], json!({"Ref": "C"}));
        assert_eq!(out["Outputs"]["O"]["Value"], json!({"Ref": "D"}));
    }

    #[test]
    fn test_st005_other_sections_untouched() {
        let template = json!({"Conditions": {"C": {"Ref": "Old:X"}}});
        let d = Dispatcher::new().register(&StripPrefix);
        let out = Value::Object(d.rewrite_template(template.as_object().unwrap().clone()).unwrap());
        assert_eq!(out, template);
    }

    #[test]
    fn test_st005_resolvers_chain_in_order() {
        let d = Dispatcher::new().register(&StripPrefix).register(&Shout);
        let out = d.rewrite(json!({"Ref": "Old:A"})).unwrap();
        assert_eq!(out, json!({"Ref": "A!"}));
    }

    #[test]
    fn test_st005_multi_key_mapping_not_a_call() {
        let d = Dispatcher::new().register(&StripPrefix);
        let node = json!({"Ref": "Old:A", "Other": 1});
        assert_eq!(d.rewrite(node.clone()).unwrap(), node);
    }
}
