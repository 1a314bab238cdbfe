use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// The only valid format version for CloudFormation/SAM templates.
/// Always forced after load: the YAML parser reads the bare date form
/// as a timestamp, so templates round-trip through here.
pub const FORMAT_VERSION: &str = "2010-09-09";

const FUNCTION_TYPES: &[&str] = &["AWS::Serverless::Function", "AWS::Lambda::Function"];

const MONITORING_TYPES: &[&str] = &[
    "AWS::CloudWatch::Alarm",
    "AWS::CloudWatch::CompositeAlarm",
    "AWS::CloudWatch::Dashboard",
    "AWS::Logs::MetricFilter",
];

/// A compiled CloudFormation template. The sections the deployer
/// reasons about are typed; everything else (Globals, Mappings,
/// Conditions, Transform, Metadata) is retained as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    #[serde(
        rename = "AWSTemplateFormatVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub format_version: Option<String>,

    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Parameters", default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, CfnParameter>,

    #[serde(rename = "Resources", default)]
    pub resources: IndexMap<String, Resource>,

    #[serde(rename = "Outputs", default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfnParameter {
    #[serde(rename = "Type")]
    pub parameter_type: String,

    #[serde(rename = "Default", default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(flatten, default)]
    pub extra: IndexMap<String, Value>,
}

impl CfnParameter {
    /// A String parameter whose default carries a physical resource
    /// name resolved from another stack.
    pub fn string_with_default(default: Value) -> Self {
        Self {
            parameter_type: String::from("String"),
            default: Some(default),
            extra: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(rename = "DependsOn", default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,

    #[serde(rename = "Properties", default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,

    #[serde(flatten, default)]
    pub extra: IndexMap<String, Value>,
}

impl Resource {
    pub fn is_function(&self) -> bool {
        FUNCTION_TYPES.contains(&self.resource_type.as_str())
    }

    pub fn is_monitoring(&self) -> bool {
        MONITORING_TYPES.contains(&self.resource_type.as_str())
    }

    /// A property value, when it is present and a plain string.
    pub fn string_property(&self, name: &str) -> Option<&str> {
        self.properties.as_ref()?.get(name)?.as_str()
    }
}

/// `DependsOn` accepts a single logical id or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    One(String),
    Many(Vec<String>),
}

impl Template {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = match fs::read_to_string(path) {
            Ok(raw_contents) => raw_contents,
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => {
                    return Err(Error::TemplateFileNotFound(path.display().to_string()))
                }
                _ => {
                    return Err(Error::TemplateParse {
                        file: path.display().to_string(),
                        message: error.to_string(),
                    })
                }
            },
        };

        let is_json = path
            .extension()
            .map(|extension| extension == "json")
            .unwrap_or(false);

        let mut template: Template = if is_json {
            serde_json::from_str(&contents).map_err(|error| Error::TemplateParse {
                file: path.display().to_string(),
                message: error.to_string(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|error| Error::TemplateParse {
                file: path.display().to_string(),
                message: error.to_string(),
            })?
        };

        template.format_version = Some(String::from(FORMAT_VERSION));
        Ok(template)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|error| Error::TemplateParse {
            file: String::from("<compiled template>"),
            message: error.to_string(),
        })
    }

    /// Logical ids of every function resource, in template order.
    pub fn function_names(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|(_, resource)| resource.is_function())
            .map(|(logical_id, _)| logical_id.clone())
            .collect()
    }

    /// The template-global code location, if one is declared under
    /// `Globals.Function.CodeUri`.
    pub fn global_code_uri(&self) -> Option<&str> {
        self.extra
            .get("Globals")?
            .get("Function")?
            .get("CodeUri")?
            .as_str()
    }

    /// The function's own code location, when declared as a local path.
    pub fn function_code_uri(&self, logical_id: &str) -> Option<&str> {
        self.resources.get(logical_id)?.string_property("CodeUri")
    }

    /// Point a function resource's code location at an uploaded
    /// artifact. SAM functions take an S3 URI string; plain Lambda
    /// functions take the `Code` object form.
    pub fn attach_code_location(
        &mut self,
        logical_id: &str,
        bucket: &str,
        key: &str,
        uri: &str,
    ) {
        let resource = match self.resources.get_mut(logical_id) {
            Some(resource) if resource.is_function() => resource,
            _ => return,
        };

        let properties = resource
            .properties
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
        let properties = match properties.as_object_mut() {
            Some(map) => map,
            None => return,
        };

        if resource.resource_type == "AWS::Lambda::Function" {
            properties.insert(
                String::from("Code"),
                serde_json::json!({ "S3Bucket": bucket, "S3Key": key }),
            );
        } else {
            properties.insert(String::from("CodeUri"), Value::String(uri.to_owned()));
        }
    }

    /// Remove every monitoring resource (alarms, dashboards, metric
    /// filters) and return them in template order, for deployment into
    /// the external stack.
    pub fn split_monitoring_resources(&mut self) -> IndexMap<String, Resource> {
        let monitoring_ids: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, resource)| resource.is_monitoring())
            .map(|(logical_id, _)| logical_id.clone())
            .collect();

        let mut split = IndexMap::new();
        for logical_id in monitoring_ids {
            if let Some(resource) = self.resources.shift_remove(&logical_id) {
                split.insert(logical_id, resource);
            }
        }
        split
    }
}
