//! ST-004: Fragment compiler — flatten a tree with embedded calls into one string.
//!
//! Shorthand properties that accept a structure but must reach the target as a
//! single string (request templates, model schemas, pipeline parameter
//! overrides, build environment variables) go through here. Calls are spliced
//! into the text as `${...}` placeholders; anything that cannot be spliced is
//! bound to a synthesized parameter instead of being rejected.

use super::types::*;
use crate::grammar::placeholder::{escape_literal, rewrite_placeholders};
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of compiling one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// No calls were found: plain JSON text.
    Json(String),
    /// Calls were spliced inline; no parameters needed.
    Sub(String),
    /// Calls were spliced and some needed parameter bindings.
    SubWithParams(String, Mapping),
}

impl Fragment {
    /// Wire form: a string, `{"Fn::Sub": text}` or `{"Fn::Sub": [text, params]}`.
    pub fn into_node(self) -> Node {
        match self {
            Self::Json(s) => Value::String(s),
            Self::Sub(s) => call(SUB, Value::String(s)),
            Self::SubWithParams(s, params) => {
                call(SUB, Value::Array(vec![Value::String(s), Value::Object(params)]))
            }
        }
    }
}

/// Compiler state. Parameter names stay unique across calls on one instance.
#[derive(Debug, Default)]
pub struct FragmentCompiler {
    counter: usize,
    params: Mapping,
}

impl FragmentCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `node` into a single string fragment. Never fails.
    pub fn compile(&mut self, node: &Node) -> Fragment {
        self.params = Mapping::new();
        if !contains_call(node) {
            return Fragment::Json(node.to_string());
        }
        let substituted = self.walk(node);
        let text = substituted.to_string();
        let params = std::mem::take(&mut self.params);
        if params.is_empty() {
            Fragment::Sub(text)
        } else {
            Fragment::SubWithParams(text, params)
        }
    }

    fn walk(&mut self, node: &Node) -> Node {
        if let Some((name, arg)) = as_call(node) {
            return self.splice(name, arg, node);
        }
        match node {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (escape_literal(k), self.walk(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.walk(item)).collect()),
            Value::String(s) => Value::String(escape_literal(s)),
            Value::Number(_) | Value::Bool(_) | Value::Null => node.clone(),
        }
    }

    fn splice(&mut self, name: &str, arg: &Node, whole: &Node) -> Node {
        match (name, arg) {
            (REF, Value::String(id)) => placeholder(id),
            (GET_ATT, Value::String(path)) => placeholder(path),
            (GET_ATT, Value::Array(parts)) => match parts.as_slice() {
                [Value::String(id), Value::String(attr)] => placeholder(&format!("{}.{}", id, attr)),
                _ => self.opaque(whole),
            },
            (SUB, Value::String(template)) => Value::String(template.clone()),
            (SUB, Value::Array(parts)) => match parts.as_slice() {
                [Value::String(template), Value::Object(bindings)] => self.merge_sub(template, bindings, whole),
                _ => self.opaque(whole),
            },
            (IMPORT_VALUE, Value::String(export)) => placeholder(&format!("Import:{}", export)),
            (GET_PARAM, _) => whole.clone(),
            _ => self.opaque(whole),
        }
    }

    /// Merge a Sub's bindings. A name already bound to a different value is
    /// renamed, along with its placeholders in `template`.
    fn merge_sub(&mut self, template: &str, bindings: &Mapping, whole: &Node) -> Node {
        let mut renames: HashMap<String, String> = HashMap::new();
        for (name, value) in bindings {
            if self.params.get(name).is_some_and(|bound| bound != value) {
                let fresh = self.fresh_name(bindings);
                renames.insert(name.clone(), fresh);
            }
        }
        let text = if renames.is_empty() {
            template.to_string()
        } else {
            match rewrite_placeholders(template, |body| Ok(renames.get(body).cloned())) {
                Ok(text) => text,
                Err(_) => return self.opaque(whole),
            }
        };
        for (name, value) in bindings {
            let name = renames.get(name).unwrap_or(name);
            self.params.insert(name.clone(), value.clone());
        }
        Value::String(text)
    }

    fn opaque(&mut self, whole: &Node) -> Node {
        let name = self.fresh_name(&Mapping::new());
        self.params.insert(name.clone(), whole.clone());
        placeholder(&name)
    }

    /// Next `paramN` not bound here and not in `avoid`.
    fn fresh_name(&mut self, avoid: &Mapping) -> String {
        loop {
            self.counter += 1;
            let candidate = format!("param{}", self.counter);
            if !self.params.contains_key(&candidate) && !avoid.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

fn placeholder(body: &str) -> Node {
    Value::String(format!("${{{}}}", body))
}

/// Whether `node` holds any call that the compiler would splice.
pub fn contains_call(node: &Node) -> bool {
    if let Some((name, _)) = as_call(node) {
        return name != GET_PARAM;
    }
    match node {
        Value::Object(map) => map.values().any(contains_call),
        Value::Array(items) => items.iter().any(contains_call),
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => false,
    }
}
