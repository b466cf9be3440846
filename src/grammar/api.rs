//! ST-011: Reference grammar for the API family.
//!
//! `RestApi:<ApiId>[:<Kind>[/<Lookup>]][.<Suffix>]`
//!
//! Resource and method lookups are paths. A `%` stands in for `{` and `}`
//! (alternating) so that path parameters do not clash with the `${...}`
//! delimiters of the surrounding string template.

use crate::core::error::{ExpandError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

pub const PREFIX: &str = "RestApi:";

static API_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^RestApi:([A-Za-z0-9]+)(?::([A-Za-z]+)(?:/([^.]*))?)?(?:\.([A-Za-z0-9.]+))?$")
        .expect("api reference regex is valid")
});

/// Request-validator flavours. One resource per flavour per API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidatorMode {
    Body,
    Params,
    BodyAndParams,
}

impl ValidatorMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "body" => Some(Self::Body),
            "params" | "parameters" => Some(Self::Params),
            "all" | "both" | "body-and-params" => Some(Self::BodyAndParams),
            _ => None,
        }
    }

    /// Logical-id fragment.
    pub fn id_part(&self) -> &'static str {
        match self {
            Self::Body => "Body",
            Self::Params => "Params",
            Self::BodyAndParams => "BodyAndParams",
        }
    }

    pub fn validates_body(&self) -> bool {
        matches!(self, Self::Body | Self::BodyAndParams)
    }

    pub fn validates_params(&self) -> bool {
        matches!(self, Self::Params | Self::BodyAndParams)
    }
}

impl fmt::Display for ValidatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body => write!(f, "body"),
            Self::Params => write!(f, "params"),
            Self::BodyAndParams => write!(f, "all"),
        }
    }
}

/// What an API reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiTarget {
    /// The RestApi resource itself.
    Container,
    Authorizer(String),
    Validator(ValidatorMode),
    Model(String),
    /// Full decoded path, e.g. `/users/{id}`. `/` is the root resource.
    Resource(String),
    Method { path: String, verb: String },
    Deployment,
}

/// A parsed API reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRef {
    pub api_id: String,
    pub target: ApiTarget,
    pub suffix: Option<String>,
}

/// Whether `text` is written in this grammar at all.
pub fn matches(text: &str) -> bool {
    text.starts_with(PREFIX)
}

impl ApiRef {
    pub fn parse(text: &str) -> Result<Self> {
        let caps = API_REF
            .captures(text)
            .ok_or_else(|| ExpandError::unknown(text, "not a valid RestApi reference"))?;
        let api_id = caps[1].to_string();
        let lookup = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        let suffix = caps.get(4).map(|m| m.as_str().to_string());

        let target = match caps.get(2).map(|m| m.as_str()) {
            None => ApiTarget::Container,
            Some("Authorizer") => ApiTarget::Authorizer(required(text, lookup)?.to_string()),
            Some("Model") => ApiTarget::Model(required(text, lookup)?.to_string()),
            Some("Validator") => {
                let mode = ValidatorMode::parse(required(text, lookup)?)
                    .ok_or_else(|| ExpandError::unknown(text, format!("unknown validator '{}'", lookup)))?;
                ApiTarget::Validator(mode)
            }
            Some("Resource") => ApiTarget::Resource(decode_path(lookup)),
            Some("Method") => {
                let decoded = decode_path(lookup);
                let (path, verb) = match decoded.rsplit_once('/') {
                    Some((path, verb)) if !verb.is_empty() => (path, verb),
                    _ => return Err(ExpandError::unknown(text, "method lookup needs <path>/<VERB>")),
                };
                ApiTarget::Method {
                    path: normalize_path(path),
                    verb: verb.to_ascii_uppercase(),
                }
            }
            Some("Deployment") => ApiTarget::Deployment,
            Some(other) => return Err(ExpandError::unknown(text, format!("unknown kind '{}'", other))),
        };

        Ok(Self { api_id, target, suffix })
    }
}

fn required<'a>(text: &str, lookup: &'a str) -> Result<&'a str> {
    if lookup.is_empty() {
        Err(ExpandError::unknown(text, "missing lookup after kind"))
    } else {
        Ok(lookup)
    }
}

/// Replace the `%` escape with alternating `{` and `}` and normalize.
pub fn decode_path(encoded: &str) -> String {
    let mut open = true;
    let decoded: String = encoded
        .chars()
        .map(|c| {
            if c == '%' {
                let brace = if open { '{' } else { '}' };
                open = !open;
                brace
            } else {
                c
            }
        })
        .collect();
    normalize_path(&decoded)
}

/// Leading `/`, no trailing `/`, no empty segments. Root is `/`.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}
