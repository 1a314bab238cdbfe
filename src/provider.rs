use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::model::{Capability, OnFailure, Parameter, Tag};
use aws_sdk_cloudformation::Region;
use aws_sdk_s3::error::HeadBucketErrorKind;
use aws_sdk_s3::model::{Delete, ObjectIdentifier};
use aws_sdk_s3::types::ByteStream;
use indexmap::IndexMap;

use crate::event::StackEvent;

/// Errors from remote control-plane and object-store calls. These
/// propagate to the command layer unchanged; callers that expect a
/// specific condition (absence, no-op update, missing bucket) classify
/// them with the helpers below.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("Service error occurred: {message}")]
    Service { code: String, message: String },

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn service(code: &str, message: &str) -> Self {
        ProviderError::Service {
            code: code.to_owned(),
            message: message.to_owned(),
        }
    }

    /// The control plane's way of saying a described stack is absent.
    pub fn is_stack_missing(&self) -> bool {
        match self {
            ProviderError::Service { message, .. } => message.ends_with("does not exist"),
            ProviderError::Unknown(_) => false,
        }
    }

    /// An update rejected because the template and parameters are
    /// unchanged.
    pub fn is_no_updates(&self) -> bool {
        match self {
            ProviderError::Service { message, .. } => message.starts_with("No updates"),
            ProviderError::Unknown(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::Service { code, .. } => {
                code == "NotFound" || code == "NoSuchBucket" || code == "404"
            }
            ProviderError::Unknown(_) => false,
        }
    }
}

/// Remote description of an existing stack.
#[derive(Debug, Clone)]
pub struct StackDescription {
    pub stack_id: Option<String>,
    pub stack_status: String,
    pub outputs: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackParameter {
    pub key: String,
    pub value: String,
}

/// Everything a create or update request carries.
#[derive(Debug, Clone)]
pub struct StackRequest {
    pub stack_name: String,
    pub template_body: String,
    pub parameters: Vec<StackParameter>,
    pub tags: Vec<(String, String)>,
}

#[async_trait]
pub trait CloudFormationApi: Send + Sync {
    /// Describe a stack. Absence surfaces as an error whose message the
    /// caller classifies with [`ProviderError::is_stack_missing`].
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription, ProviderError>;

    async fn stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>, ProviderError>;

    /// Returns the provider-assigned stack id.
    async fn create_stack(&self, request: &StackRequest) -> Result<String, ProviderError>;

    async fn update_stack(&self, request: &StackRequest) -> Result<(), ProviderError>;

    async fn delete_stack(&self, stack_name: &str) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Probe for a bucket. A missing bucket surfaces as an error that
    /// answers true to [`ProviderError::is_not_found`].
    async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ProviderError>;

    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, ProviderError>;

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), ProviderError>;
}

/// Resolve the effective region and load the shared SDK configuration,
/// preferring an explicitly configured region over the environment
/// chain.
pub async fn load_sdk_config(region: Option<&str>) -> aws_types::SdkConfig {
    let region = match region {
        Some(provided_region) => Region::new(provided_region.to_owned()),
        None => RegionProviderChain::default_provider()
            .region()
            .await
            .unwrap_or_else(|| Region::new("us-east-1")),
    };

    aws_config::from_env().region(region).load().await
}

macro_rules! into_provider_error {
    ($error:expr) => {
        match $error {
            aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. } => {
                ProviderError::Service {
                    code: err.code().unwrap_or("Unknown").to_owned(),
                    message: match err.message() {
                        Some(message) => message.to_owned(),
                        None => err.to_string(),
                    },
                }
            }
            other => ProviderError::Unknown(other.to_string()),
        }
    };
}

pub struct AwsCloudFormation {
    client: aws_sdk_cloudformation::Client,
}

impl AwsCloudFormation {
    pub fn new(sdk_config: &aws_types::SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudformation::Client::new(sdk_config),
        }
    }
}

fn to_sdk_parameters(parameters: &[StackParameter]) -> Vec<Parameter> {
    parameters
        .iter()
        .map(|parameter| {
            Parameter::builder()
                .parameter_key(&parameter.key)
                .parameter_value(&parameter.value)
                .build()
        })
        .collect()
}

fn to_sdk_tags(tags: &[(String, String)]) -> Vec<Tag> {
    tags.iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

#[async_trait]
impl CloudFormationApi for AwsCloudFormation {
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription, ProviderError> {
        let response = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        let stacks = response.stacks().unwrap_or_default();
        let stack = match stacks.first() {
            Some(stack) => stack,
            None => {
                return Err(ProviderError::service(
                    "ValidationError",
                    &format!("Stack with id {} does not exist", stack_name),
                ))
            }
        };

        let mut outputs = IndexMap::new();
        for output in stack.outputs().unwrap_or_default() {
            if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
                outputs.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(StackDescription {
            stack_id: stack.stack_id().map(String::from),
            stack_status: stack
                .stack_status()
                .map(|status| status.as_str().to_owned())
                .unwrap_or_default(),
            outputs,
        })
    }

    async fn stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>, ProviderError> {
        let response = self
            .client
            .describe_stack_events()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        let events = response
            .stack_events()
            .unwrap_or_default()
            .iter()
            .map(|event| StackEvent {
                resource_logical_id: event.logical_resource_id().unwrap_or_default().to_owned(),
                resource_type: event.resource_type().unwrap_or_default().to_owned(),
                resource_status: event
                    .resource_status()
                    .map(|status| status.as_str().to_owned())
                    .unwrap_or_default(),
                resource_status_reason: event.resource_status_reason().map(String::from),
                timestamp_ms: event
                    .timestamp()
                    .and_then(|timestamp| timestamp.to_millis().ok())
                    .unwrap_or_default(),
            })
            .collect();

        Ok(events)
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .create_stack()
            .stack_name(&request.stack_name)
            .template_body(&request.template_body)
            .on_failure(OnFailure::Rollback)
            .capabilities(Capability::CapabilityIam)
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityAutoExpand)
            .set_parameters(Some(to_sdk_parameters(&request.parameters)))
            .set_tags(Some(to_sdk_tags(&request.tags)))
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        Ok(response.stack_id().unwrap_or_default().to_owned())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<(), ProviderError> {
        self.client
            .update_stack()
            .stack_name(&request.stack_name)
            .template_body(&request.template_body)
            .capabilities(Capability::CapabilityIam)
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityAutoExpand)
            .set_parameters(Some(to_sdk_parameters(&request.parameters)))
            .set_tags(Some(to_sdk_tags(&request.tags)))
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        Ok(())
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), ProviderError> {
        self.client
            .delete_stack()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        Ok(())
    }
}

pub struct AwsObjectStore {
    client: aws_sdk_s3::Client,
}

impl AwsObjectStore {
    pub fn new(sdk_config: &aws_types::SdkConfig) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for AwsObjectStore {
    async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(aws_sdk_s3::types::SdkError::ServiceError { err, .. }) => {
                if matches!(err.kind, HeadBucketErrorKind::NotFound(_)) {
                    return Err(ProviderError::service(
                        "NotFound",
                        &format!("Bucket {} not found", bucket),
                    ));
                }
                Err(ProviderError::Service {
                    code: err.code().unwrap_or("Unknown").to_owned(),
                    message: match err.message() {
                        Some(message) => message.to_owned(),
                        None => err.to_string(),
                    },
                })
            }
            Err(other) => Err(ProviderError::Unknown(other.to_string())),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ProviderError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|error| into_provider_error!(error))?;

        Ok(())
    }

    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, ProviderError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|error| into_provider_error!(error))?;

            for object in response.contents().unwrap_or_default() {
                if let Some(key) = object.key() {
                    keys.push(key.to_owned());
                }
            }

            if !response.is_truncated() {
                break;
            }
            continuation_token = response.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), ProviderError> {
        // DeleteObjects accepts at most 1000 keys per request.
        for chunk in keys.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Vec<_>>();
            let delete = Delete::builder().set_objects(Some(objects)).build();

            self.client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|error| into_provider_error!(error))?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{
        CloudFormationApi, ObjectStoreApi, ProviderError, StackDescription, StackRequest,
    };
    use crate::event::StackEvent;

    /// Scripted CloudFormation double. Each remote call pops the next
    /// scripted result, the way the original's tests stub
    /// `provider.request` with a result per invocation.
    #[derive(Default)]
    pub struct FakeCloudFormation {
        pub describe_results: Mutex<VecDeque<Result<StackDescription, ProviderError>>>,
        pub events_results: Mutex<VecDeque<Result<Vec<StackEvent>, ProviderError>>>,
        pub create_result: Mutex<Option<Result<String, ProviderError>>>,
        pub update_result: Mutex<Option<Result<(), ProviderError>>>,
        pub delete_result: Mutex<Option<Result<(), ProviderError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    pub fn stack_missing_error(stack_name: &str) -> ProviderError {
        ProviderError::service(
            "ValidationError",
            &format!("Stack with id {} does not exist", stack_name),
        )
    }

    pub fn described(status: &str) -> StackDescription {
        StackDescription {
            stack_id: Some(String::from("arn:aws:cloudformation:stack/fake/id")),
            stack_status: String::from(status),
            outputs: indexmap::IndexMap::new(),
        }
    }

    impl FakeCloudFormation {
        pub fn push_describe(&self, result: Result<StackDescription, ProviderError>) {
            self.describe_results.lock().unwrap().push_back(result);
        }

        pub fn push_missing(&self, stack_name: &str) {
            self.push_describe(Err(stack_missing_error(stack_name)));
        }

        pub fn push_status(&self, status: &str) {
            self.push_describe(Ok(described(status)));
        }

        pub fn push_events(&self, events: Vec<StackEvent>) {
            self.events_results.lock().unwrap().push_back(Ok(events));
        }

        pub fn recorded_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }
    }

    #[async_trait]
    impl CloudFormationApi for FakeCloudFormation {
        async fn describe_stack(
            &self,
            stack_name: &str,
        ) -> Result<StackDescription, ProviderError> {
            self.record("describe_stack");
            self.describe_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(stack_missing_error(stack_name)))
        }

        async fn stack_events(&self, _stack_name: &str) -> Result<Vec<StackEvent>, ProviderError> {
            self.record("stack_events");
            self.events_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn create_stack(&self, _request: &StackRequest) -> Result<String, ProviderError> {
            self.record("create_stack");
            self.create_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(String::from("arn:aws:cloudformation:stack/fake/id")))
        }

        async fn update_stack(&self, _request: &StackRequest) -> Result<(), ProviderError> {
            self.record("update_stack");
            self.update_result.lock().unwrap().take().unwrap_or(Ok(()))
        }

        async fn delete_stack(&self, _stack_name: &str) -> Result<(), ProviderError> {
            self.record("delete_stack");
            self.delete_result.lock().unwrap().take().unwrap_or(Ok(()))
        }
    }

    /// In-memory object store double recording uploads and deletions.
    #[derive(Default)]
    pub struct FakeObjectStore {
        pub bucket_exists: Mutex<bool>,
        pub uploads: Mutex<Vec<(String, String, usize, String)>>,
        pub keys: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
    }

    impl FakeObjectStore {
        pub fn existing() -> Self {
            let store = Self::default();
            *store.bucket_exists.lock().unwrap() = true;
            store
        }

        pub fn uploaded_keys(&self) -> Vec<String> {
            self.uploads
                .lock()
                .unwrap()
                .iter()
                .map(|(_, key, _, _)| key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ObjectStoreApi for FakeObjectStore {
        async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
            if *self.bucket_exists.lock().unwrap() {
                Ok(())
            } else {
                Err(ProviderError::service(
                    "NotFound",
                    &format!("Bucket {} not found", bucket),
                ))
            }
        }

        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> Result<(), ProviderError> {
            self.uploads.lock().unwrap().push((
                bucket.to_owned(),
                key.to_owned(),
                body.len(),
                content_type.to_owned(),
            ));
            Ok(())
        }

        async fn list_keys(&self, _bucket: &str) -> Result<Vec<String>, ProviderError> {
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn delete_objects(
            &self,
            _bucket: &str,
            keys: &[String],
        ) -> Result<(), ProviderError> {
            self.deleted.lock().unwrap().extend_from_slice(keys);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProviderError;

    #[test]
    fn stack_absence_is_detected_from_the_message() {
        let error = ProviderError::service(
            "ValidationError",
            "Stack with id svc-dev does not exist",
        );
        assert!(error.is_stack_missing());
        assert!(!error.is_no_updates());
    }

    #[test]
    fn no_op_update_is_detected_from_the_message() {
        let error = ProviderError::service("ValidationError", "No updates are to be performed.");
        assert!(error.is_no_updates());
        assert!(!error.is_stack_missing());
    }

    #[test]
    fn other_service_errors_classify_as_neither() {
        let error = ProviderError::service("AccessDenied", "User is not authorized");
        assert!(!error.is_stack_missing());
        assert!(!error.is_no_updates());
        assert!(!error.is_not_found());
    }

    #[test]
    fn missing_bucket_is_not_found() {
        assert!(ProviderError::service("NotFound", "Bucket my-bucket not found").is_not_found());
        assert!(ProviderError::service("NoSuchBucket", "gone").is_not_found());
    }
}
