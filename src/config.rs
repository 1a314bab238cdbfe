use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::Error;
use crate::external::{ExternalStackConfig, DEFAULT_NAME_SUFFIX};
use crate::provider::StackParameter;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_TEMPLATE_FILE: &str = "template.yml";
const SAMCONFIG_FILE_NAMES: &[&str] = &["samconfig.yaml", "samconfig.yml"];

/// Options the CLI layer hands in. Parsing and help rendering live
/// outside the core; these are consumed by name only.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub stage: Option<String>,
    pub region: Option<String>,
    pub stack: Option<String>,
    pub bucket: Option<String>,
    pub template: Option<String>,
    pub parameter_overrides: Option<String>,
    pub external_stack: bool,
}

/// Persisted configuration: one table per stage, each with deploy
/// parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamConfig(pub IndexMap<String, StageConfig>);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub deploy: Option<DeploySection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default)]
    pub parameters: Option<DeployParameters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployParameters {
    #[serde(default)]
    pub stack_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub template_file: Option<String>,
    #[serde(default)]
    pub parameter_overrides: Option<String>,
    #[serde(default)]
    pub external_stack: Option<bool>,
    #[serde(default)]
    pub external_stack_suffix: Option<String>,
}

impl SamConfig {
    /// Load the persisted config next to the service, if any. A
    /// missing file is an empty config, not an error.
    pub fn load(service_path: &Path) -> Result<Self, Error> {
        for file_name in SAMCONFIG_FILE_NAMES {
            let path = service_path.join(file_name);
            let contents = match fs::read_to_string(&path) {
                Ok(raw_contents) => raw_contents,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(Error::InvalidConfig(error.to_string())),
            };
            return serde_yaml::from_str(&contents)
                .map_err(|error| Error::InvalidConfig(error.to_string()));
        }
        Ok(Self::default())
    }

    fn parameters(&self, stage: &str) -> Option<&DeployParameters> {
        self.0.get(stage)?.deploy.as_ref()?.parameters.as_ref()
    }

    /// Stage-specific value first, then the default table.
    fn lookup<'a, T: ?Sized>(
        &'a self,
        stage: &str,
        pick: impl Fn(&'a DeployParameters) -> Option<&'a T>,
    ) -> Option<&'a T> {
        if stage != "default" {
            if let Some(value) = self.parameters(stage).and_then(&pick) {
                return Some(value);
            }
        }
        self.parameters("default").and_then(&pick)
    }
}

/// Fully resolved configuration for one command invocation.
#[derive(Debug, Clone, Validate)]
pub struct CfnConfig {
    #[validate(length(min = 1))]
    pub stack_name: String,
    pub stage: String,
    pub region: String,
    pub bucket: Option<String>,
    #[validate(custom = "validate_template_extension")]
    pub template_file: String,
    pub parameter_overrides: Vec<StackParameter>,
    pub external: ExternalStackConfig,
}

fn validate_template_extension(template_file: &str) -> Result<(), ValidationError> {
    let extension = Path::new(template_file)
        .extension()
        .and_then(|extension| extension.to_str());
    match extension {
        Some("yml") | Some("yaml") | Some("json") => Ok(()),
        _ => Err(ValidationError::new(
            "The template file has to end with `.yml`, `.yaml` or `.json`",
        )),
    }
}

/// Resolve the effective configuration. Precedence per field: explicit
/// CLI option, then the stage table, then the default table, then the
/// derived fallback. A stack name that survives none of those is a
/// hard error, never a silent default.
pub fn resolve(
    options: &CliOptions,
    samconfig: &SamConfig,
    compose_service_name: Option<&str>,
) -> Result<CfnConfig, Error> {
    let stage = options
        .stage
        .clone()
        .unwrap_or_else(|| String::from("default"));

    let stack_name = options
        .stack
        .clone()
        .or_else(|| {
            samconfig
                .lookup(&stage, |parameters| parameters.stack_name.as_ref())
                .cloned()
        })
        .or_else(|| compose_service_name.map(String::from))
        .ok_or(Error::MissingStackName)?;

    let region = options
        .region
        .clone()
        .or_else(|| {
            samconfig
                .lookup(&stage, |parameters| parameters.region.as_ref())
                .cloned()
        })
        .unwrap_or_else(|| String::from(DEFAULT_REGION));

    let bucket = options.bucket.clone().or_else(|| {
        samconfig
            .lookup(&stage, |parameters| parameters.s3_bucket.as_ref())
            .cloned()
    });

    let template_file = options
        .template
        .clone()
        .or_else(|| {
            samconfig
                .lookup(&stage, |parameters| parameters.template_file.as_ref())
                .cloned()
        })
        .unwrap_or_else(|| String::from(DEFAULT_TEMPLATE_FILE));

    let overrides_source = options.parameter_overrides.clone().or_else(|| {
        samconfig
            .lookup(&stage, |parameters| parameters.parameter_overrides.as_ref())
            .cloned()
    });
    let parameter_overrides = parse_parameter_overrides(overrides_source.as_deref())?;

    let external_enabled = options.external_stack
        || samconfig
            .lookup(&stage, |parameters| parameters.external_stack.as_ref())
            .copied()
            .unwrap_or(false);
    let external_suffix = samconfig
        .lookup(&stage, |parameters| {
            parameters.external_stack_suffix.as_ref()
        })
        .cloned()
        .unwrap_or_else(|| String::from(DEFAULT_NAME_SUFFIX));

    let config = CfnConfig {
        stack_name,
        stage,
        region,
        bucket,
        template_file,
        parameter_overrides,
        external: ExternalStackConfig {
            enabled: external_enabled,
            name_suffix: external_suffix,
        },
    };

    match config.validate() {
        Ok(()) => Ok(config),
        Err(error) => Err(Error::InvalidConfig(error.to_string())),
    }
}

/// Space-separated `KEY=VALUE` pairs. Values may themselves contain
/// `=`; only the first one splits.
fn parse_parameter_overrides(source: Option<&str>) -> Result<Vec<StackParameter>, Error> {
    let source = match source {
        Some(source) => source,
        None => return Ok(Vec::new()),
    };

    let mut parameters = Vec::new();
    for pair in source.split_whitespace() {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => parameters.push(StackParameter {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "parameter override \"{}\" is not of the form KEY=VALUE",
                    pair
                )))
            }
        }
    }
    Ok(parameters)
}
