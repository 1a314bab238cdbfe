use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;

use crate::error::Error;
use crate::package;
use crate::provider::ObjectStoreApi;
use crate::template::Template;

/// Uploaded artifact locations for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionArtifact {
    pub key: String,
    pub url: String,
    pub uri: String,
}

/// All function artifacts of one deployment, keyed by logical id.
#[derive(Debug, Clone, Default)]
pub struct FunctionArtifacts {
    pub bucket: String,
    pub functions: IndexMap<String, FunctionArtifact>,
}

/// The object-store namespace backing one deployment. The deployment
/// id is fixed at construction, so two deployments of the same stack
/// never collide even when run back to back.
pub struct ArtifactBucket<'a, S> {
    store: &'a S,
    pub name: String,
    pub region: String,
    stack_name: String,
    pub deployment_id: String,
}

/// ISO-8601 timestamp with the punctuation collapsed to `-` and the
/// trailing timezone marker trimmed, giving millisecond-resolution
/// uniqueness per deployment.
pub fn deployment_id_from(timestamp: DateTime<Utc>) -> String {
    timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
        .trim_end_matches('Z')
        .to_owned()
}

// Region-specific endpoints: govcloud and China partitions carry the
// region in the hostname.
fn s3_endpoint_for_region(region: &str) -> String {
    let region = region.to_lowercase();
    if region.contains("us-gov") {
        return format!("s3-{}.amazonaws.com", region);
    }
    if region.starts_with("cn-") {
        return format!("s3.{}.amazonaws.com.cn", region);
    }
    String::from("s3.amazonaws.com")
}

impl<'a, S: ObjectStoreApi> ArtifactBucket<'a, S> {
    pub fn new(store: &'a S, name: &str, region: &str, stack_name: &str) -> Self {
        Self {
            store,
            name: name.to_owned(),
            region: region.to_owned(),
            stack_name: stack_name.to_owned(),
            deployment_id: deployment_id_from(Utc::now()),
        }
    }

    pub fn deployment_dir(&self) -> String {
        format!("serverless/{}/{}", self.stack_name, self.deployment_id)
    }

    pub fn template_key(&self) -> String {
        format!("{}/template.json", self.deployment_dir())
    }

    pub fn template_url(&self) -> String {
        format!(
            "https://{}/{}/{}",
            s3_endpoint_for_region(&self.region),
            self.name,
            self.template_key()
        )
    }

    /// Probe for the bucket. Any not-found condition answers `false`;
    /// other errors propagate.
    pub async fn exists(&self) -> Result<bool, Error> {
        match self.store.head_bucket(&self.name).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Package and upload every function's code directory. Uploads run
    /// concurrently; all complete before this resolves.
    pub async fn upload_functions(
        &self,
        service_path: &Path,
        template: &Template,
    ) -> Result<FunctionArtifacts, Error> {
        let mut pending = Vec::new();

        for function_name in template.function_names() {
            let code_dir = self.resolve_code_dir(service_path, template, &function_name);
            let bytes = package::zip_directory(&function_name, &code_dir)?;
            let key = format!("{}/{}.zip", self.deployment_dir(), function_name);

            pending.push(async move {
                self.store
                    .put_object(&self.name, &key, bytes, "application/zip")
                    .await
                    .map(|_| (function_name, key))
            });
        }

        let uploaded = futures::future::try_join_all(pending).await?;

        let endpoint = s3_endpoint_for_region(&self.region);
        let mut artifacts = FunctionArtifacts {
            bucket: self.name.clone(),
            functions: IndexMap::new(),
        };
        for (function_name, key) in uploaded {
            artifacts.functions.insert(
                function_name,
                FunctionArtifact {
                    url: format!("https://{}/{}/{}", endpoint, self.name, key),
                    uri: format!("s3://{}/{}", self.name, key),
                    key,
                },
            );
        }

        Ok(artifacts)
    }

    /// Upload the compiled template JSON under the deployment dir and
    /// return its URL.
    pub async fn upload_template(&self, template: &Template) -> Result<String, Error> {
        self.upload_named_template(template, "template.json").await
    }

    /// Upload a compiled template under the deployment dir with an
    /// explicit file name (the external stack keeps its template next
    /// to the main one).
    pub async fn upload_named_template(
        &self,
        template: &Template,
        file_name: &str,
    ) -> Result<String, Error> {
        let body = template.to_json()?;
        let key = format!("{}/{}", self.deployment_dir(), file_name);
        self.store
            .put_object(&self.name, &key, body.into_bytes(), "application/json")
            .await?;
        Ok(format!(
            "https://{}/{}/{}",
            s3_endpoint_for_region(&self.region),
            self.name,
            key
        ))
    }

    /// Delete every object in the bucket. A no-op when the bucket is
    /// already empty. Not part of the remove flow; kept as the
    /// precondition for bucket deletion elsewhere.
    pub async fn empty(&self) -> Result<(), Error> {
        let keys = self.store.list_keys(&self.name).await?;
        if keys.is_empty() {
            return Ok(());
        }
        self.store.delete_objects(&self.name, &keys).await?;
        Ok(())
    }

    // The function's own CodeUri wins, then the template-global one,
    // then the service root. Remote (s3://) locations fall through to
    // the service root, matching the local-directory default.
    fn resolve_code_dir(
        &self,
        service_path: &Path,
        template: &Template,
        function_name: &str,
    ) -> PathBuf {
        let declared = template
            .function_code_uri(function_name)
            .or_else(|| template.global_code_uri())
            .filter(|uri| !uri.starts_with("s3://"));

        match declared {
            Some(relative) => service_path.join(relative),
            None => service_path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::provider::fakes::FakeObjectStore;

    fn sam_template(yaml: &str) -> Template {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn deployment_id_collapses_punctuation_and_trims_the_zone() {
        let timestamp = Utc.with_ymd_and_hms(2022, 11, 23, 8, 30, 5).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(deployment_id_from(timestamp), "2022-11-23T08-30-05-123");
    }

    #[test]
    fn deployment_dir_is_namespaced_per_stack_and_deployment() {
        let store = FakeObjectStore::existing();
        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");
        let dir = bucket.deployment_dir();
        assert!(dir.starts_with("serverless/svc-dev/"));
        assert_eq!(bucket.template_key(), format!("{}/template.json", dir));
        assert!(bucket
            .template_url()
            .starts_with("https://s3.amazonaws.com/my-bucket/serverless/svc-dev/"));
    }

    #[test]
    fn endpoints_differ_for_special_partitions() {
        assert_eq!(s3_endpoint_for_region("us-east-1"), "s3.amazonaws.com");
        assert_eq!(
            s3_endpoint_for_region("us-gov-west-1"),
            "s3-us-gov-west-1.amazonaws.com"
        );
        assert_eq!(
            s3_endpoint_for_region("cn-north-1"),
            "s3.cn-north-1.amazonaws.com.cn"
        );
    }

    #[tokio::test]
    async fn exists_is_false_when_the_bucket_is_missing() {
        let store = FakeObjectStore::default();
        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");
        assert!(!bucket.exists().await.unwrap());

        let store = FakeObjectStore::existing();
        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");
        assert!(bucket.exists().await.unwrap());
    }

    #[tokio::test]
    async fn uploads_one_zip_per_function() {
        let service_dir = tempdir().unwrap();
        fs::create_dir(service_dir.path().join("hello")).unwrap();
        fs::write(service_dir.path().join("hello/index.js"), "x").unwrap();
        fs::create_dir(service_dir.path().join("worker")).unwrap();
        fs::write(service_dir.path().join("worker/worker.js"), "y").unwrap();

        let template = sam_template(
            r#"
Resources:
  Hello:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: hello/
  Worker:
    Type: AWS::Lambda::Function
    Properties:
      CodeUri: worker/
"#,
        );

        let store = FakeObjectStore::existing();
        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");
        let artifacts = bucket
            .upload_functions(service_dir.path(), &template)
            .await
            .unwrap();

        assert_eq!(artifacts.bucket, "my-bucket");
        assert_eq!(
            artifacts.functions.keys().collect::<Vec<_>>(),
            vec!["Hello", "Worker"]
        );

        let hello = &artifacts.functions["Hello"];
        assert_eq!(
            hello.key,
            format!("{}/Hello.zip", bucket.deployment_dir())
        );
        assert_eq!(hello.uri, format!("s3://my-bucket/{}", hello.key));
        assert_eq!(
            hello.url,
            format!("https://s3.amazonaws.com/my-bucket/{}", hello.key)
        );

        let uploaded = store.uploaded_keys();
        assert_eq!(uploaded.len(), 2);
        assert!(uploaded.contains(&hello.key));
    }

    #[tokio::test]
    async fn upload_template_puts_json_under_the_deployment_dir() {
        let template = sam_template("Resources: {}\n");
        let store = FakeObjectStore::existing();
        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");

        let url = bucket.upload_template(&template).await.unwrap();
        assert_eq!(url, bucket.template_url());

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, bucket.template_key());
        assert_eq!(uploads[0].3, "application/json");
    }

    #[tokio::test]
    async fn empty_deletes_everything_and_noops_when_clear() {
        let store = FakeObjectStore::existing();
        store.keys.lock().unwrap().extend([
            String::from("serverless/svc-dev/a/template.json"),
            String::from("serverless/svc-dev/a/Hello.zip"),
        ]);

        let bucket = ArtifactBucket::new(&store, "my-bucket", "us-east-1", "svc-dev");
        bucket.empty().await.unwrap();
        assert_eq!(store.deleted.lock().unwrap().len(), 2);

        store.keys.lock().unwrap().clear();
        store.deleted.lock().unwrap().clear();
        bucket.empty().await.unwrap();
        assert!(store.deleted.lock().unwrap().is_empty());
    }
}
