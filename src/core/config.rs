//! ST-007: Expansion options, optionally loaded from a TOML file.

use super::error::{ExpandError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs for one expansion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandOptions {
    /// Top-level section holding API declarations
    #[serde(default = "default_api_section")]
    pub api_section: String,

    /// Top-level section holding matrix declarations
    #[serde(default = "default_matrix_section")]
    pub matrix_section: String,

    /// Hex chars of the definitions digest embedded in deployment ids
    #[serde(default = "default_hash_len")]
    pub deployment_hash_len: usize,

    /// Resource types whose `Stages` get the pipeline treatment
    #[serde(default = "default_pipeline_types")]
    pub pipeline_types: Vec<String>,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            api_section: default_api_section(),
            matrix_section: default_matrix_section(),
            deployment_hash_len: default_hash_len(),
            pipeline_types: default_pipeline_types(),
        }
    }
}

fn default_api_section() -> String {
    "RestApis".to_string()
}

fn default_matrix_section() -> String {
    "Matrices".to_string()
}

fn default_hash_len() -> usize {
    10
}

fn default_pipeline_types() -> Vec<String> {
    vec!["AWS::CodePipeline::Pipeline".to_string()]
}

impl ExpandOptions {
    /// Parse options from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|e| ExpandError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ExpandError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.api_section.is_empty() || self.matrix_section.is_empty() {
            return Err(ExpandError::Config("section names must not be empty".to_string()));
        }
        if self.api_section == self.matrix_section {
            return Err(ExpandError::Config(format!(
                "api_section and matrix_section are both '{}'",
                self.api_section
            )));
        }
        if !(4..=64).contains(&self.deployment_hash_len) {
            return Err(ExpandError::Config(format!(
                "deployment_hash_len must be within 4..=64, got {}",
                self.deployment_hash_len
            )));
        }
        Ok(())
    }
}
