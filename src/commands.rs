use std::io::Write;
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;

use crate::bucket::ArtifactBucket;
use crate::config::CfnConfig;
use crate::error::Error;
use crate::external::{ExternalOutcome, ExternalStack};
use crate::provider::{CloudFormationApi, ObjectStoreApi};
use crate::stack::StackReconciler;
use crate::status;
use crate::template::Template;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub stack_name: String,
    pub status: Option<String>,
    pub up_to_date: bool,
    pub outputs: IndexMap<String, String>,
    pub external: ExternalOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub external: ExternalOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInfo {
    pub stack_name: String,
    pub stage: String,
    pub region: String,
    pub status: String,
    pub outputs: IndexMap<String, String>,
}

/// Deploy the service: upload artifacts, create or update the stack,
/// poll to convergence, then run the external-stack pass.
///
/// `default_bucket` is the process-wide fallback bucket resolved by
/// the caller; it applies only when no bucket is configured.
pub async fn deploy<C: CloudFormationApi, S: ObjectStoreApi>(
    config: &CfnConfig,
    service_path: &Path,
    default_bucket: Option<&str>,
    cloudformation: &C,
    object_store: &S,
    poll_interval: Duration,
) -> Result<DeployOutcome, Error> {
    let bucket_name = match config.bucket.as_deref().or(default_bucket) {
        Some(bucket_name) => bucket_name.to_owned(),
        None => return Err(Error::MissingDeploymentBucket),
    };

    let mut template = Template::load(&service_path.join(&config.template_file))?;

    let bucket = ArtifactBucket::new(
        object_store,
        &bucket_name,
        &config.region,
        &config.stack_name,
    );
    if !bucket.exists().await? {
        return Err(Error::BucketNotFound(bucket_name));
    }

    let mut external =
        ExternalStack::new(config.external.clone()).with_poll_interval(poll_interval);
    if external.is_enabled() {
        external.queue_resources(template.split_monitoring_resources());
    }

    println!("Packaging and uploading function artifacts...");
    let artifacts = bucket.upload_functions(service_path, &template).await?;
    for (function_name, artifact) in &artifacts.functions {
        template.attach_code_location(
            function_name,
            &artifacts.bucket,
            &artifact.key,
            &artifact.uri,
        );
    }
    bucket.upload_template(&template).await?;

    let mut reconciler = StackReconciler::new(cloudformation, &config.stack_name)
        .with_parameters(config.parameter_overrides.clone())
        .with_tags(vec![(String::from("STAGE"), config.stage.clone())])
        .with_poll_interval(poll_interval)
        .with_status_listener(progress_dots());

    reconciler.get().await?;

    let (final_status, up_to_date) = if reconciler.exists() {
        println!("Updating stack {}...", config.stack_name);
        let outcome = reconciler.update(&mut template, &artifacts).await?;
        (outcome.status, outcome.up_to_date)
    } else {
        println!("Creating stack {}...", config.stack_name);
        let created = reconciler.create(&mut template, &artifacts).await?;
        (created, false)
    };
    println!();

    if up_to_date {
        println!("Stack {} has not changed. No changes to deploy.", config.stack_name);
    } else {
        match final_status.as_deref() {
            Some(current) if status::is_success(current) => {
                println!("Stack {} deployed successfully ({}).", config.stack_name, current);
            }
            Some(current) => {
                return Err(Error::DeployFailed(format!(
                    "Deployment of stack {} failed ({})",
                    config.stack_name, current
                )))
            }
            None => {
                return Err(Error::DeployFailed(format!(
                    "Stack {} disappeared while deploying",
                    config.stack_name
                )))
            }
        }
    }
    print_outputs(&reconciler.stack.outputs);

    let external_outcome = external
        .run_after_deploy(
            cloudformation,
            &bucket,
            &template,
            &config.stack_name,
            &config.stage,
        )
        .await?;

    Ok(DeployOutcome {
        stack_name: config.stack_name.clone(),
        status: final_status,
        up_to_date,
        outputs: reconciler.stack.outputs.clone(),
        external: external_outcome,
    })
}

/// Remove the stack. Removing a stack that does not exist is a
/// success no-op. Uploaded artifacts are retained: the bucket is
/// shared across deployments and is never emptied here.
pub async fn remove<C: CloudFormationApi>(
    config: &CfnConfig,
    default_bucket: Option<&str>,
    cloudformation: &C,
    poll_interval: Duration,
) -> Result<RemoveOutcome, Error> {
    let external = ExternalStack::new(config.external.clone()).with_poll_interval(poll_interval);
    let external_outcome = external.remove(cloudformation, &config.stack_name).await?;

    let mut reconciler = StackReconciler::new(cloudformation, &config.stack_name)
        .with_poll_interval(poll_interval)
        .with_status_listener(progress_dots());
    reconciler.get().await?;

    if !reconciler.exists() {
        println!(
            "Stack {} does not exist. Nothing to remove.",
            config.stack_name
        );
        return Ok(RemoveOutcome {
            removed: false,
            external: external_outcome,
        });
    }

    // The bucket must resolve even though it is left untouched.
    if config.bucket.as_deref().or(default_bucket).is_none() {
        return Err(Error::MissingDeploymentBucket);
    }

    println!("Removing stack {}...", config.stack_name);
    reconciler.delete().await?;
    println!();
    println!("Stack {} removed successfully.", config.stack_name);

    Ok(RemoveOutcome {
        removed: true,
        external: external_outcome,
    })
}

/// Describe the stack. Absence is an error here: there is nothing to
/// report on.
pub async fn info<C: CloudFormationApi>(
    config: &CfnConfig,
    cloudformation: &C,
) -> Result<StackInfo, Error> {
    let mut reconciler = StackReconciler::new(cloudformation, &config.stack_name);
    reconciler.get().await?;

    let current_status = match &reconciler.stack.status {
        Some(current_status) => current_status.clone(),
        None => return Err(Error::StackNotFound(config.stack_name.clone())),
    };

    println!("name: {}", config.stack_name);
    println!("stage: {}", config.stage);
    println!("region: {}", config.region);
    println!("status: {}", current_status);
    print_outputs(&reconciler.stack.outputs);

    Ok(StackInfo {
        stack_name: config.stack_name.clone(),
        stage: config.stage.clone(),
        region: config.region.clone(),
        status: current_status,
        outputs: reconciler.stack.outputs.clone(),
    })
}

fn progress_dots() -> Box<dyn Fn(Option<&str>) + Send + Sync + 'static> {
    Box::new(|_status| {
        print!(".");
        let _ = std::io::stdout().flush();
    })
}

fn print_outputs(outputs: &IndexMap<String, String>) {
    if outputs.is_empty() {
        return;
    }
    println!("outputs:");
    for (key, value) in outputs {
        println!("  {}: {}", key, value);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use indexmap::IndexMap;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::config::CfnConfig;
    use crate::external::ExternalStackConfig;
    use crate::provider::fakes::{FakeCloudFormation, FakeObjectStore};
    use crate::provider::{ProviderError, StackDescription};

    const FAST: Duration = Duration::from_millis(1);

    fn config(bucket: Option<&str>) -> CfnConfig {
        CfnConfig {
            stack_name: String::from("svc-dev"),
            stage: String::from("dev"),
            region: String::from("us-east-1"),
            bucket: bucket.map(String::from),
            template_file: String::from("template.yml"),
            parameter_overrides: Vec::new(),
            external: ExternalStackConfig::default(),
        }
    }

    fn service_dir() -> TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("hello")).unwrap();
        fs::write(dir.path().join("hello/index.js"), "x").unwrap();
        fs::write(
            dir.path().join("template.yml"),
            r#"
AWSTemplateFormatVersion: 2010-09-09
Resources:
  Hello:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: hello/
"#,
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn deploy_without_any_bucket_fails_with_a_stable_code() {
        let cloudformation = FakeCloudFormation::default();
        let object_store = FakeObjectStore::existing();
        let dir = service_dir();

        let error = deploy(
            &config(None),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap_err();

        assert_eq!(error.code(), Some("MISSING_DEPLOYMENT_BUCKET"));
        assert!(cloudformation.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn deploy_against_a_missing_bucket_fails_with_a_stable_code() {
        let cloudformation = FakeCloudFormation::default();
        let object_store = FakeObjectStore::default();
        let dir = service_dir();

        let error = deploy(
            &config(Some("my-bucket")),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap_err();

        assert_eq!(error.code(), Some("BUCKET_NOT_FOUND"));
        assert_eq!(
            error.to_string(),
            "Deployment bucket \"my-bucket\" does not exist"
        );
    }

    #[tokio::test]
    async fn deploy_falls_back_to_the_default_bucket() {
        let cloudformation = FakeCloudFormation::default();
        // get() probe: absent, so create; then one poll to completion.
        cloudformation.push_missing("svc-dev");
        cloudformation.push_status("CREATE_COMPLETE");
        cloudformation.push_events(Vec::new());
        let object_store = FakeObjectStore::existing();
        let dir = service_dir();

        let outcome = deploy(
            &config(None),
            dir.path(),
            Some("shared-deploys"),
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status.as_deref(), Some("CREATE_COMPLETE"));
        assert_eq!(outcome.external, ExternalOutcome::Disabled);
        assert!(cloudformation
            .recorded_calls()
            .contains(&String::from("create_stack")));
        let uploads = object_store.uploaded_keys();
        assert!(uploads.iter().any(|key| key.ends_with("Hello.zip")));
        assert!(uploads.iter().any(|key| key.ends_with("template.json")));
    }

    #[tokio::test]
    async fn deploy_updates_an_existing_stack_and_reports_outputs() {
        let cloudformation = FakeCloudFormation::default();
        let mut outputs = IndexMap::new();
        outputs.insert(String::from("ApiUrl"), String::from("https://api.example"));
        cloudformation.push_describe(Ok(StackDescription {
            stack_id: Some(String::from("stack/svc-dev/1")),
            stack_status: String::from("CREATE_COMPLETE"),
            outputs: outputs.clone(),
        }));
        cloudformation.push_describe(Ok(StackDescription {
            stack_id: Some(String::from("stack/svc-dev/1")),
            stack_status: String::from("UPDATE_COMPLETE"),
            outputs: outputs.clone(),
        }));
        cloudformation.push_events(Vec::new());
        let object_store = FakeObjectStore::existing();
        let dir = service_dir();

        let outcome = deploy(
            &config(Some("my-bucket")),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status.as_deref(), Some("UPDATE_COMPLETE"));
        assert!(!outcome.up_to_date);
        assert_eq!(outcome.outputs, outputs);
        assert!(cloudformation
            .recorded_calls()
            .contains(&String::from("update_stack")));
    }

    #[tokio::test]
    async fn deploy_with_nothing_to_update_reports_no_changes() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_status("CREATE_COMPLETE");
        *cloudformation.update_result.lock().unwrap() = Some(Err(ProviderError::service(
            "ValidationError",
            "No updates are to be performed.",
        )));
        let object_store = FakeObjectStore::existing();
        let dir = service_dir();

        let outcome = deploy(
            &config(Some("my-bucket")),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap();

        assert!(outcome.up_to_date);
    }

    #[tokio::test]
    async fn deploy_fails_when_the_terminal_status_is_a_failure() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_status("CREATE_COMPLETE");
        cloudformation.push_status("UPDATE_ROLLBACK_COMPLETE");
        cloudformation.push_events(Vec::new());
        let object_store = FakeObjectStore::existing();
        let dir = service_dir();

        let error = deploy(
            &config(Some("my-bucket")),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap_err();

        assert_eq!(error.code(), Some("DEPLOY_FAILED"));
    }

    #[tokio::test]
    async fn deploy_with_a_missing_template_file_fails_before_any_remote_call() {
        let cloudformation = FakeCloudFormation::default();
        let object_store = FakeObjectStore::existing();
        let dir = tempdir().unwrap();

        let error = deploy(
            &config(Some("my-bucket")),
            dir.path(),
            None,
            &cloudformation,
            &object_store,
            FAST,
        )
        .await
        .unwrap_err();

        assert_eq!(error.code(), Some("TEMPLATE_FILE_NOT_FOUND"));
        assert!(cloudformation.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn remove_of_an_absent_stack_is_a_success_no_op() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_missing("svc-dev");

        let outcome = remove(&config(Some("my-bucket")), None, &cloudformation, FAST)
            .await
            .unwrap();

        assert!(!outcome.removed);
        assert!(!cloudformation
            .recorded_calls()
            .contains(&String::from("delete_stack")));
    }

    #[tokio::test]
    async fn remove_deletes_an_existing_stack() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_status("CREATE_COMPLETE");
        cloudformation.push_status("DELETE_IN_PROGRESS");
        cloudformation.push_missing("svc-dev");
        cloudformation.push_events(Vec::new());
        cloudformation.push_events(Vec::new());

        let outcome = remove(&config(Some("my-bucket")), None, &cloudformation, FAST)
            .await
            .unwrap();

        assert!(outcome.removed);
        assert!(cloudformation
            .recorded_calls()
            .contains(&String::from("delete_stack")));
    }

    #[tokio::test]
    async fn remove_still_requires_a_resolvable_bucket() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_status("CREATE_COMPLETE");

        let error = remove(&config(None), None, &cloudformation, FAST)
            .await
            .unwrap_err();

        assert_eq!(error.code(), Some("MISSING_DEPLOYMENT_BUCKET"));
        assert!(!cloudformation
            .recorded_calls()
            .contains(&String::from("delete_stack")));
    }

    #[tokio::test]
    async fn info_on_a_missing_stack_is_an_error() {
        let cloudformation = FakeCloudFormation::default();
        cloudformation.push_missing("svc-dev");

        let error = info(&config(None), &cloudformation).await.unwrap_err();
        assert_eq!(error.code(), Some("STACK_NOT_FOUND"));
    }

    #[tokio::test]
    async fn info_reports_the_described_stack() {
        let cloudformation = FakeCloudFormation::default();
        let mut outputs = IndexMap::new();
        outputs.insert(String::from("ApiUrl"), String::from("https://api.example"));
        cloudformation.push_describe(Ok(StackDescription {
            stack_id: Some(String::from("stack/svc-dev/1")),
            stack_status: String::from("UPDATE_COMPLETE"),
            outputs: outputs.clone(),
        }));

        let stack_info = info(&config(None), &cloudformation).await.unwrap();
        assert_eq!(stack_info.stack_name, "svc-dev");
        assert_eq!(stack_info.status, "UPDATE_COMPLETE");
        assert_eq!(stack_info.outputs, outputs);
    }
}
