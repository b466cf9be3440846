//! ST-040: CLI subcommands — expand, check.

use crate::core::config::ExpandOptions;
use crate::core::engine::{self, Expansion};
use crate::core::error::{ExpandError, Result};
use crate::core::hasher;
use crate::core::template::{self, Format};
use crate::core::types::{scalar_to_string, Params};
use clap::Subcommand;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expand shorthand sections and print the resulting template
    Expand {
        /// Template to expand (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,

        /// Parameter value, NAME=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// YAML mapping of parameter values
        #[arg(long)]
        params_file: Option<PathBuf>,

        /// Expansion options (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Expand without printing the template; report what would be generated
    Check {
        /// Template to check (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// Parameter value, NAME=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// YAML mapping of parameter values
        #[arg(long)]
        params_file: Option<PathBuf>,

        /// Expansion options (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Expand {
            file,
            output,
            format,
            params,
            params_file,
            config,
        } => cmd_expand(
            &file,
            output.as_deref(),
            format,
            &params,
            params_file.as_deref(),
            config.as_deref(),
        ),
        Commands::Check {
            file,
            params,
            params_file,
            config,
        } => cmd_check(&file, &params, params_file.as_deref(), config.as_deref()),
    }
}

fn cmd_expand(
    file: &Path,
    output: Option<&Path>,
    format: Format,
    params: &[String],
    params_file: Option<&Path>,
    config: Option<&Path>,
) -> Result<()> {
    let expansion = run(file, params, params_file, config)?;
    let text = template::render(&expansion.template, format)?;
    match output {
        Some(path) => {
            std::fs::write(path, &text).map_err(|source| ExpandError::Io {
                path: path.display().to_string(),
                source,
            })?;
            eprintln!(
                "Expanded {} -> {} ({} generated resources)",
                file.display(),
                path.display(),
                expansion.report.generated()
            );
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn cmd_check(file: &Path, params: &[String], params_file: Option<&Path>, config: Option<&Path>) -> Result<()> {
    let expansion = run(file, params, params_file, config)?;
    let digest = hasher::hash_string(&expansion.template.to_string());
    println!("OK: {}", file.display());
    println!("{}", expansion.report);
    println!("Digest:    {}", digest);
    Ok(())
}

/// Load options, parameters and template, then expand.
fn run(file: &Path, params: &[String], params_file: Option<&Path>, config: Option<&Path>) -> Result<Expansion> {
    let options = match config {
        Some(path) => ExpandOptions::load(path)?,
        None => ExpandOptions::default(),
    };
    let mut values = match params_file {
        Some(path) => load_params_file(path)?,
        None => Params::default(),
    };
    for (name, value) in parse_params(params)? {
        values.insert(name, value);
    }
    let template = template::load(file)?;
    tracing::debug!(file = %file.display(), "loaded template");
    engine::expand(template, &values, &options)
}

/// Parse `NAME=VALUE` pairs.
fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| ExpandError::Parameter(format!("'{}' is not NAME=VALUE", pair)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ExpandError::Parameter(format!("'{}' has an empty name", pair)));
            }
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

/// A YAML (or JSON) mapping of parameter names to scalar or list values.
fn load_params_file(path: &Path) -> Result<Params> {
    let node = template::load(path)?;
    let Value::Object(map) = node else {
        return Err(ExpandError::Parameter(format!(
            "{} must hold a mapping of parameter values",
            path.display()
        )));
    };
    let mut params = Params::default();
    for (name, value) in map {
        if value.is_object() {
            return Err(ExpandError::Parameter(format!("parameter '{}' must be a scalar or a list", name)));
        }
        params.insert(name, scalar_to_string(&value));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
RestApis:
  Api:
    /users:
      $GET: {}
Matrices:
  Queues:
    Dimensions:
      Tier: {Ref: Tiers}
    Resource:
      Type: AWS::SQS::Queue
      Properties:
        QueueName: "${Each:Tier}"
Outputs:
  Users:
    Value: !Ref "RestApi:Api:Resource/users"
"#;

    fn write_template(dir: &Path) -> PathBuf {
        let path = dir.join("template.yaml");
        std::fs::write(&path, TEMPLATE).unwrap();
        path
    }

    #[test]
    fn test_st040_expand_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_template(dir.path());
        let out = dir.path().join("out.json");
        cmd_expand(&file, Some(&out), Format::Json, &["Tiers=gold,silver".to_string()], None, None).unwrap();
        let rendered: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(rendered["Outputs"]["Users"]["Value"], serde_json::json!({"Ref": "ApiUsers"}));
        assert_eq!(rendered["Resources"]["Queues2"]["Properties"]["QueueName"], serde_json::json!("silver"));
    }

    #[test]
    fn test_st040_params_file_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_template(dir.path());
        let params = dir.path().join("params.yaml");
        std::fs::write(&params, "Tiers: [a, b, c]\n").unwrap();
        let expansion = run(&file, &[], Some(&params), None).unwrap();
        assert_eq!(expansion.report.matrix_resources, 3);
        let expansion = run(&file, &["Tiers=solo".to_string()], Some(&params), None).unwrap();
        assert_eq!(expansion.report.matrix_resources, 1);
    }

    #[test]
    fn test_st040_missing_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_template(dir.path());
        let err = run(&file, &[], None, None).unwrap_err();
        assert!(matches!(err, ExpandError::Parameter(_)));
    }

    #[test]
    fn test_st040_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_template(dir.path());
        let config = dir.path().join("stencil.toml");
        std::fs::write(&config, "deployment_hash_len = 16\n").unwrap();
        let expansion = run(&file, &["Tiers=a".to_string()], None, Some(&config)).unwrap();
        let resources = expansion.template["Resources"].as_object().unwrap();
        let deployment = resources.keys().find(|k| k.starts_with("ApiDeployment")).unwrap();
        assert_eq!(deployment.len(), "ApiDeployment".len() + 16);
    }

    #[test]
    fn test_st040_check() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_template(dir.path());
        cmd_check(&file, &["Tiers=a".to_string()], None, None).unwrap();
    }

    #[test]
    fn test_st040_parse_params() {
        let parsed = parse_params(&["A=1".to_string(), " B =x=y".to_string()]).unwrap();
        assert_eq!(parsed, vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]);
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=v".to_string()]).is_err());
    }

    #[test]
    fn test_st040_params_file_rejects_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "Bad: {a: 1}\n").unwrap();
        assert!(load_params_file(&path).is_err());
    }
}
