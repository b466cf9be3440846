//! Reference resolvers — shorthand families expanded into canonical resources.
//!
//! Each family owns a private symbol table. After expansion, the family is
//! registered with the [`Dispatcher`](crate::core::dispatch::Dispatcher) and
//! rewrites references written in its grammar back into native calls.

pub mod api;
pub mod import;
pub mod matrix;

use crate::core::error::{ExpandError, Result};
use crate::core::types::*;
use crate::grammar::placeholder::rewrite_placeholders;
use serde_json::Value;

/// Where a symbolic reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    /// Attribute to read; `None` means the resource itself.
    pub attr: Option<String>,
}

impl Target {
    pub fn resource(id: impl Into<String>) -> Self {
        Self { id: id.into(), attr: None }
    }

    pub fn attribute(id: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attr: Some(attr.into()),
        }
    }

    fn with_suffix(mut self, suffix: Option<String>) -> Self {
        if suffix.is_some() {
            self.attr = suffix;
        }
        self
    }

    /// `Id` or `Id.Attr`, as written inside `${...}`.
    fn placeholder_body(&self) -> String {
        match self.attr {
            Some(ref attr) => format!("{}.{}", self.id, attr),
            None => self.id.clone(),
        }
    }
}

/// A family's private id registry.
pub trait SymbolTable {
    /// Whether `text` is written in this table's grammar.
    fn owns(&self, text: &str) -> bool;

    /// Resolve a reference. Unknown ids are fatal.
    fn lookup(&self, text: &str) -> Result<Target>;
}

/// Rewrite `Ref`, `Fn::GetAtt` and `Fn::Sub` calls whose references `table` owns.
pub fn rewrite_reference_call<S: SymbolTable + ?Sized>(table: &S, name: &str, arg: Node) -> Result<Node> {
    match (name, arg) {
        (REF, Value::String(text)) if table.owns(&text) => {
            let target = table.lookup(&text)?;
            Ok(match target.attr {
                Some(ref attr) => get_att(&target.id, attr),
                None => ref_to(&target.id),
            })
        }
        (GET_ATT, Value::String(text)) if table.owns(&text) => {
            let target = table.lookup(&text)?;
            let attr = target
                .attr
                .ok_or_else(|| ExpandError::unknown(&text, "Fn::GetAtt needs an attribute suffix"))?;
            Ok(get_att(&target.id, &attr))
        }
        (GET_ATT, Value::Array(parts)) => {
            if let [Value::String(text), Value::String(attr)] = parts.as_slice() {
                if table.owns(text) {
                    let target = table.lookup(text)?;
                    return Ok(get_att(&target.id, attr));
                }
            }
            Ok(call(name, Value::Array(parts)))
        }
        (SUB, Value::String(template)) => {
            let rewritten = rewrite_sub_template(table, &template)?;
            Ok(call(name, Value::String(rewritten)))
        }
        (SUB, Value::Array(mut parts)) => {
            if let Some(Value::String(template)) = parts.first_mut() {
                *template = rewrite_sub_template(table, template)?;
            }
            Ok(call(name, Value::Array(parts)))
        }
        (_, arg) => Ok(call(name, arg)),
    }
}

fn rewrite_sub_template<S: SymbolTable + ?Sized>(table: &S, template: &str) -> Result<String> {
    rewrite_placeholders(template, |body| {
        if !table.owns(body) {
            return Ok(None);
        }
        table.lookup(body).map(|target| Some(target.placeholder_body()))
    })
}

/// Keep ASCII alphanumerics and uppercase the leading character.
pub fn slugify(text: &str) -> String {
    let mut chars = text.chars().filter(char::is_ascii_alphanumeric);
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.collect::<String>(),
        None => String::new(),
    }
}
