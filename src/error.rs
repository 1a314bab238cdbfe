use crate::provider::ProviderError;

/// Errors surfaced to the command layer. Configuration and resource
/// errors carry a stable machine code; remote-call failures pass
/// through unchanged.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Stack name is not configured. Set `stack_name` in samconfig or pass --stack.")]
    MissingStackName,

    #[error("No deployment bucket is configured and no default bucket could be resolved.")]
    MissingDeploymentBucket,

    #[error("Could not find the specified template file \"{0}\"")]
    TemplateFileNotFound(String),

    #[error("Could not parse template file \"{file}\": {message}")]
    TemplateParse { file: String, message: String },

    #[error("Deployment bucket \"{0}\" does not exist")]
    BucketNotFound(String),

    #[error("Stack \"{0}\" does not exist")]
    StackNotFound(String),

    #[error("{0}")]
    DeployFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Could not package function \"{function}\": {message}")]
    Package { function: String, message: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Error {
    /// Stable code for programmatic consumers, where one exists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::MissingStackName => Some("MISSING_STACK_NAME"),
            Error::MissingDeploymentBucket => Some("MISSING_DEPLOYMENT_BUCKET"),
            Error::TemplateFileNotFound(_) => Some("TEMPLATE_FILE_NOT_FOUND"),
            Error::TemplateParse { .. } => Some("TEMPLATE_FILE_NOT_FOUND"),
            Error::BucketNotFound(_) => Some("BUCKET_NOT_FOUND"),
            Error::StackNotFound(_) => Some("STACK_NOT_FOUND"),
            Error::DeployFailed(_) => Some("DEPLOY_FAILED"),
            Error::InvalidConfig(_) => Some("INVALID_CONFIG"),
            Error::Package { .. } => None,
            Error::Provider(_) => None,
        }
    }
}
