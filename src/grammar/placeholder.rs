//! ST-010: `${...}` placeholder scanning for string templates.
//!
//! `${!Literal}` is the template language's escape for a literal `${` and is
//! never handed to a rewriter.

use crate::core::error::{ExpandError, Result};

/// Rewrite every `${body}` placeholder in `template`.
///
/// `rewrite` returns `Some(new_body)` to replace the body or `None` to keep it.
pub fn rewrite_placeholders<F>(template: &str, mut rewrite: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find('}').ok_or_else(|| {
            ExpandError::malformed("string template", format!("unclosed placeholder in '{}'", template))
        })?;
        let body = &after[..close];
        out.push_str("${");
        if body.starts_with('!') {
            out.push_str(body);
        } else {
            match rewrite(body)? {
                Some(new_body) => out.push_str(&new_body),
                None => out.push_str(body),
            }
        }
        out.push('}');
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// List the (non-escaped) placeholder bodies in `template`.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else { break };
        let body = &after[..close];
        if !body.starts_with('!') {
            found.push(body.to_string());
        }
        rest = &after[close + 1..];
    }
    found
}

/// Escape literal `${` so a string survives being embedded in a template.
pub fn escape_literal(text: &str) -> String {
    text.replace("${", "${!")
}
