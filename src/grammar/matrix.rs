//! ST-012: Reference grammar for the matrix family.
//!
//! `Matrix:<MatrixId>[<Dimension>=<OptionKey>,...][.<Suffix>]`

use crate::core::error::{ExpandError, Result};
use regex::Regex;
use std::sync::LazyLock;

pub const PREFIX: &str = "Matrix:";

static MATRIX_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Matrix:([A-Za-z0-9]+)(?:\[([^\]]*)\])?(?:\.([A-Za-z0-9.]+))?$")
        .expect("matrix reference regex is valid")
});

/// A parsed matrix reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixRef {
    pub matrix_id: String,
    /// `None` for a bare `Matrix:<Id>`
    pub selector: Option<Vec<(String, String)>>,
    pub suffix: Option<String>,
}

/// Whether `text` is written in this grammar at all.
pub fn matches(text: &str) -> bool {
    text.starts_with(PREFIX)
}

impl MatrixRef {
    pub fn parse(text: &str) -> Result<Self> {
        let caps = MATRIX_REF
            .captures(text)
            .ok_or_else(|| ExpandError::unknown(text, "not a valid Matrix reference"))?;
        let selector = match caps.get(2) {
            None => None,
            Some(m) => Some(parse_selector(text, m.as_str())?),
        };
        Ok(Self {
            matrix_id: caps[1].to_string(),
            selector,
            suffix: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }
}

fn parse_selector(text: &str, body: &str) -> Result<Vec<(String, String)>> {
    body.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (dim, key) = pair
                .split_once('=')
                .ok_or_else(|| ExpandError::unknown(text, format!("selector '{}' is not name=key", pair)))?;
            Ok((dim.trim().to_string(), key.trim().to_string()))
        })
        .collect()
}
