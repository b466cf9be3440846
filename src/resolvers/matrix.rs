//! ST-023: Matrix family — stamp out one resource per dimension combination.
//!
//! Each entry of the cartesian product is keyed by its per-dimension option
//! keys (used in logical ids and selectors) and carries the per-dimension
//! substitution values (spliced into `${Each:<Name>}` in the template body).

use super::{rewrite_reference_call, SymbolTable, Target};
use crate::core::dispatch::Resolver;
use crate::core::error::{ExpandError, Result};
use crate::core::tree::{as_str, into_mapping, take_key};
use crate::core::types::*;
use crate::grammar::matrix::{self as grammar, MatrixRef};
use crate::grammar::placeholder::placeholders;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const EACH_PREFIX: &str = "${Each:";

/// One named option set.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    /// (option key, substitution value), in declaration order
    pub options: Vec<(String, String)>,
}

impl Dimension {
    fn parse(matrix_id: &str, name: &str, node: Node, params: &Params) -> Result<Self> {
        let context = || format!("matrix '{}' dimension '{}'", matrix_id, name);
        let options: Vec<(String, String)> = match node {
            Value::Array(items) => indexed(items.iter().map(scalar_to_string)),
            Value::Object(map) => match (map.len(), map.get(REF)) {
                (1, Some(Value::String(param))) => {
                    let value = params.get(param).ok_or_else(|| {
                        ExpandError::Parameter(format!("{} references undefined parameter '{}'", context(), param))
                    })?;
                    indexed(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|item| !item.is_empty())
                            .map(str::to_string),
                    )
                }
                _ => map.iter().map(|(k, v)| (k.clone(), scalar_to_string(v))).collect(),
            },
            other => {
                return Err(ExpandError::malformed(
                    context(),
                    format!("options must be a list, a mapping or a parameter Ref, got {}", other),
                ))
            }
        };
        if options.is_empty() {
            return Err(ExpandError::malformed(context(), "has no options"));
        }
        Ok(Self {
            name: name.to_string(),
            options,
        })
    }

    fn value_of(&self, key: &str) -> Option<&str> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// List options are keyed by their 1-based position.
fn indexed(values: impl Iterator<Item = String>) -> Vec<(String, String)> {
    values.enumerate().map(|(i, v)| ((i + 1).to_string(), v)).collect()
}

/// One combination of option keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub keys: Vec<String>,
    /// dimension name → substitution value
    pub values: IndexMap<String, String>,
    pub logical_id: String,
}

/// An expanded matrix declaration.
#[derive(Debug, Clone)]
pub struct Matrix {
    pub id: String,
    pub id_pattern: String,
    pub dimensions: Vec<Dimension>,
    pub entries: Vec<Entry>,
    by_keys: HashMap<Vec<String>, usize>,
}

impl Matrix {
    /// Build the full cartesian product of `dimensions`.
    pub fn new(id: &str, id_pattern: String, dimensions: Vec<Dimension>) -> Result<Self> {
        let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
        for dim in &dimensions {
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    (0..dim.options.len()).map(move |i| {
                        let mut next = prefix.clone();
                        next.push(i);
                        next
                    })
                })
                .collect();
        }

        let mut entries = Vec::with_capacity(combos.len());
        let mut by_keys = HashMap::with_capacity(combos.len());
        for combo in combos {
            let mut keys = Vec::with_capacity(dimensions.len());
            let mut values = IndexMap::new();
            for (dim, &i) in dimensions.iter().zip(&combo) {
                let (key, value) = &dim.options[i];
                keys.push(key.clone());
                values.insert(dim.name.clone(), value.clone());
            }
            let logical_id = fold_id(&id_pattern, &dimensions, &keys);
            if logical_id.is_empty() || !logical_id.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ExpandError::malformed(
                    format!("matrix '{}'", id),
                    format!("LogicalId '{}' is not alphanumeric for keys {:?}", logical_id, keys),
                ));
            }
            by_keys.insert(keys.clone(), entries.len());
            entries.push(Entry {
                keys,
                values,
                logical_id,
            });
        }

        Ok(Self {
            id: id.to_string(),
            id_pattern,
            dimensions,
            entries,
            by_keys,
        })
    }

    /// Resolve a `name=key` selector to its entry.
    fn select(&self, selector: &[(String, String)], text: &str) -> Result<&Entry> {
        let mut chosen: HashMap<&str, &str> = HashMap::new();
        for (dim, key) in selector {
            if !self.dimensions.iter().any(|d| &d.name == dim) {
                return Err(ExpandError::unknown(text, format!("matrix '{}' has no dimension '{}'", self.id, dim)));
            }
            if chosen.insert(dim, key).is_some() {
                return Err(ExpandError::unknown(text, format!("dimension '{}' selected twice", dim)));
            }
        }
        let mut keys = Vec::with_capacity(self.dimensions.len());
        for dim in &self.dimensions {
            let key = chosen
                .get(dim.name.as_str())
                .ok_or_else(|| ExpandError::unknown(text, format!("selector is missing dimension '{}'", dim.name)))?;
            if dim.value_of(key).is_none() {
                return Err(ExpandError::unknown(
                    text,
                    format!("dimension '{}' has no option '{}'", dim.name, key),
                ));
            }
            keys.push(key.to_string());
        }
        self.by_keys
            .get(&keys)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ExpandError::unknown(text, "no such entry"))
    }
}

/// Replace each `${<Dimension>}` in `pattern` with that dimension's option key.
fn fold_id(pattern: &str, dimensions: &[Dimension], keys: &[String]) -> String {
    dimensions
        .iter()
        .zip(keys)
        .fold(pattern.to_string(), |id, (dim, key)| id.replace(&format!("${{{}}}", dim.name), key))
}

/// Deep-copy `node`, replacing `${Each:<Name>}` in string leaves.
fn materialize(node: &Node, values: &IndexMap<String, String>) -> Node {
    match node {
        Value::String(s) if s.contains(EACH_PREFIX) => Value::String(
            values
                .iter()
                .fold(s.clone(), |acc, (name, value)| acc.replace(&format!("${{Each:{}}}", name), value)),
        ),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), materialize(v, values))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(|item| materialize(item, values)).collect()),
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => node.clone(),
    }
}

/// Expands matrix declarations and resolves `Matrix:` references.
#[derive(Debug, Default)]
pub struct MatrixResolver {
    matrices: IndexMap<String, Matrix>,
    issued: HashSet<String>,
}

impl MatrixResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matrix(&self, id: &str) -> Option<&Matrix> {
        self.matrices.get(id)
    }

    pub fn matrix_count(&self) -> usize {
        self.matrices.len()
    }

    /// Expand a whole section (`{MatrixId: declaration}`) into definitions.
    pub fn expand_section(&mut self, section: Node, params: &Params) -> Result<Vec<ResourceDefinition>> {
        let Value::Object(declared) = section else {
            return Err(ExpandError::malformed("matrix section", "must be a mapping of matrix ids"));
        };
        let mut definitions = Vec::new();
        for (matrix_id, decl) in declared {
            if self.matrices.contains_key(&matrix_id) {
                return Err(ExpandError::DuplicateLogicalId(matrix_id));
            }
            let context = format!("matrix '{}'", matrix_id);
            if !decl.is_object() {
                return Err(ExpandError::malformed(context, "declaration must be a mapping"));
            }
            let (dimensions, rest) = take_key(into_mapping(decl), "Dimensions");
            let (id_pattern, rest) = take_key(rest, "LogicalId");
            let (template, rest) = take_key(rest, "Resource");
            if let Some(key) = rest.keys().next() {
                return Err(ExpandError::malformed(context, format!("unknown key '{}'", key)));
            }

            let Some(Value::Object(dimensions)) = dimensions else {
                return Err(ExpandError::malformed(context, "Dimensions must be a non-empty mapping"));
            };
            if dimensions.is_empty() {
                return Err(ExpandError::malformed(context, "Dimensions must be a non-empty mapping"));
            }
            let dimensions = dimensions
                .into_iter()
                .map(|(name, node)| Dimension::parse(&matrix_id, &name, node, params))
                .collect::<Result<Vec<_>>>()?;
            let id_pattern = match id_pattern {
                None => default_pattern(&matrix_id, &dimensions),
                Some(node) => as_str(&node)
                    .map(str::to_string)
                    .ok_or_else(|| ExpandError::malformed(&context, "LogicalId must be a string"))?,
            };
            let template = template.ok_or_else(|| ExpandError::malformed(&context, "missing Resource"))?;
            for used in referenced_dimensions(&template) {
                if !dimensions.iter().any(|d| d.name == used) {
                    return Err(ExpandError::malformed(
                        &context,
                        format!("Resource uses ${{Each:{}}} but no such dimension is declared", used),
                    ));
                }
            }

            let matrix = Matrix::new(&matrix_id, id_pattern, dimensions)?;
            for entry in &matrix.entries {
                if !self.issued.insert(entry.logical_id.clone()) {
                    return Err(ExpandError::DuplicateLogicalId(entry.logical_id.clone()));
                }
                let body = materialize(&template, &entry.values);
                definitions.push(ResourceDefinition::from_node(&entry.logical_id, body)?);
            }
            tracing::debug!(matrix = %matrix_id, entries = matrix.entries.len(), "expanded matrix");
            self.matrices.insert(matrix_id, matrix);
        }
        Ok(definitions)
    }

    fn find(&self, reference: &MatrixRef, text: &str) -> Result<&Matrix> {
        self.matrices
            .get(&reference.matrix_id)
            .ok_or_else(|| ExpandError::unknown(text, format!("no matrix '{}'", reference.matrix_id)))
    }

    /// `Fn::Length: Matrix:<Id>` → `[0, 1, …, n-1]`.
    fn length(&self, text: &str) -> Result<Node> {
        let reference = MatrixRef::parse(text)?;
        if reference.selector.is_some() || reference.suffix.is_some() {
            return Err(ExpandError::unknown(text, "Fn::Length takes a bare matrix reference"));
        }
        let matrix = self.find(&reference, text)?;
        let indices = (0..matrix.entries.len()).map(Value::from).collect();
        Ok(call(LENGTH, Value::Array(indices)))
    }
}

fn default_pattern(matrix_id: &str, dimensions: &[Dimension]) -> String {
    dimensions
        .iter()
        .fold(matrix_id.to_string(), |acc, dim| format!("{}${{{}}}", acc, dim.name))
}

impl SymbolTable for MatrixResolver {
    fn owns(&self, text: &str) -> bool {
        grammar::matches(text)
    }

    fn lookup(&self, text: &str) -> Result<Target> {
        let reference = MatrixRef::parse(text)?;
        let matrix = self.find(&reference, text)?;
        let selector = reference
            .selector
            .as_deref()
            .ok_or_else(|| ExpandError::unknown(text, "a matrix reference needs a [Name=key,...] selector"))?;
        let entry = matrix.select(selector, text)?;
        Ok(Target::resource(&entry.logical_id).with_suffix(reference.suffix))
    }
}

impl Resolver for MatrixResolver {
    fn name(&self) -> &'static str {
        "matrix"
    }

    fn can_handle(&self, call: &str) -> bool {
        matches!(call, REF | GET_ATT | SUB | LENGTH)
    }

    fn expand(&self, name: &str, arg: Node) -> Result<Node> {
        match (name, arg) {
            (LENGTH, Value::String(text)) if self.owns(&text) => self.length(&text),
            (name, arg) => rewrite_reference_call(self, name, arg),
        }
    }
}

/// Dimension names a template body actually uses.
pub fn referenced_dimensions(template: &Node) -> Vec<String> {
    let mut found = Vec::new();
    collect_each(template, &mut found);
    found
}

fn collect_each(node: &Node, found: &mut Vec<String>) {
    match node {
        Value::String(s) => {
            for body in placeholders(s) {
                if let Some(name) = body.strip_prefix("Each:") {
                    if !found.iter().any(|f| f == name) {
                        found.push(name.to_string());
                    }
                }
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_each(v, found)),
        Value::Array(items) => items.iter().for_each(|v| collect_each(v, found)),
        Value::Number(_) | Value::Bool(_) | Value::Null => {}
    }
}
