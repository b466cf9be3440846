//! ST-032: Action variable namespaces.
//!
//! A namespace is issued only when some other action reads one of the
//! action's output variables. Explicit namespaces are reserved up front so
//! generated ones never collide with them.

use super::graph::ActionId;
use crate::core::error::{ExpandError, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// `#{Stage:Action.Field}` with no nested braces.
static STAGE_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([^{}:.]+):([^{}.]+)\.([^{}]+)\}").expect("stage variable regex is valid"));

/// Issued namespaces for one pipeline.
#[derive(Debug, Default)]
pub struct Namespaces {
    issued: HashSet<String>,
    assigned: HashMap<ActionId, String>,
}

impl Namespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an explicit namespace. Two actions may not share one.
    pub fn declare(&mut self, id: ActionId, namespace: &str, context: &str) -> Result<()> {
        if !self.issued.insert(namespace.to_string()) {
            return Err(ExpandError::malformed(
                context,
                format!("namespace '{}' is already in use", namespace),
            ));
        }
        self.assigned.insert(id, namespace.to_string());
        Ok(())
    }

    /// The action's namespace, generating one from `stage-action` on first use.
    pub fn ensure(&mut self, id: ActionId, stage: &str, action: &str) -> String {
        if let Some(existing) = self.assigned.get(&id) {
            return existing.clone();
        }
        let base = derive(stage, action);
        let mut candidate = base.clone();
        let mut n = 2;
        while self.issued.contains(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        tracing::trace!(stage, action, namespace = %candidate, "issued namespace");
        self.issued.insert(candidate.clone());
        self.assigned.insert(id, candidate.clone());
        candidate
    }

    pub fn get(&self, id: ActionId) -> Option<&str> {
        self.assigned.get(&id).map(String::as_str)
    }
}

/// `Stage:Action` → `stage-action`, restricted to the namespace alphabet.
pub fn derive(stage: &str, action: &str) -> String {
    format!("{}-{}", stage, action)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// A `#{Stage:Action.Field}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageVariable<'a> {
    pub stage: &'a str,
    pub action: &'a str,
    pub field: &'a str,
}

/// Rewrite every `#{Stage:Action.Field}` in `text` to `#{<namespace>.Field}`.
///
/// `resolve` maps each occurrence to the namespace of the action it names.
pub fn rewrite_stage_variables<F>(text: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&StageVariable<'_>) -> Result<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in STAGE_VARIABLE.captures_iter(text) {
        let (Some(whole), Some(stage), Some(action), Some(field)) = (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let variable = StageVariable {
            stage: stage.as_str(),
            action: action.as_str(),
            field: field.as_str(),
        };
        let namespace = resolve(&variable)?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&format!("#{{{}.{}}}", namespace, variable.field));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
