use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

use crate::bucket::{ArtifactBucket, FunctionArtifacts};
use crate::error::Error;
use crate::provider::{CloudFormationApi, ObjectStoreApi};
use crate::stack::{StackReconciler, POLL_INTERVAL};
use crate::status::{self, StatusKind};
use crate::template::{CfnParameter, DependsOn, Resource, Template};

pub const DEFAULT_NAME_SUFFIX: &str = "-alerts";

#[derive(Debug, Clone)]
pub struct ExternalStackConfig {
    pub enabled: bool,
    pub name_suffix: String,
}

impl Default for ExternalStackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name_suffix: String::from(DEFAULT_NAME_SUFFIX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

/// Human phrase for a terminal outcome, per operation.
fn phrase(operation: StackOperation, kind: StatusKind) -> &'static str {
    match (operation, kind) {
        (StackOperation::Create, StatusKind::Success) => "created successfully",
        (StackOperation::Create, _) => "create failed",
        (StackOperation::Update, StatusKind::Success) => "updated successfully",
        (StackOperation::Update, _) => "update failed",
        (StackOperation::Delete, StatusKind::Success) => "removed successfully",
        (StackOperation::Delete, _) => "remove failed",
    }
}

/// What the external-stack pass ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalOutcome {
    Disabled,
    Deployed { status: Option<String> },
    UpToDate,
    Removed,
    NothingToRemove,
}

/// Manages the secondary stack holding monitoring resources split out
/// of the main stack, repairing the references that cross the stack
/// boundary.
pub struct ExternalStack {
    config: ExternalStackConfig,
    poll_interval: Duration,
    queued_resources: Vec<IndexMap<String, Resource>>,
    pub merged_resources: IndexMap<String, Resource>,
    pub ref_parameters: IndexMap<String, CfnParameter>,
}

impl ExternalStack {
    pub fn new(config: ExternalStackConfig) -> Self {
        Self {
            config,
            poll_interval: POLL_INTERVAL,
            queued_resources: Vec::new(),
            merged_resources: IndexMap::new(),
            ref_parameters: IndexMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn stack_name(&self, main_stack_name: &str) -> String {
        format!("{}{}", main_stack_name, self.config.name_suffix)
    }

    /// Queue a batch of compiled resources for the external stack.
    /// Batches flush once, after the main deployment completes.
    pub fn queue_resources(&mut self, resources: IndexMap<String, Resource>) {
        self.queued_resources.push(resources);
    }

    /// Flatten the queued batches (last-queued wins on a logical-id
    /// collision) and repair every `Ref`/`DependsOn` edge that crosses
    /// the stack boundary, consulting the main stack's compiled
    /// template as the reference oracle.
    pub fn merge_queued_resources(&mut self, main_template: &Template) {
        let merged_ids: HashSet<String> = self
            .queued_resources
            .iter()
            .flat_map(|batch| batch.keys().cloned())
            .collect();

        for batch in std::mem::take(&mut self.queued_resources) {
            for (logical_id, mut resource) in batch {
                fix_depends_on(&mut resource, &merged_ids, main_template);
                if let Some(properties) = &resource.properties {
                    collect_ref_parameters(
                        properties,
                        &merged_ids,
                        main_template,
                        &mut self.ref_parameters,
                    );
                }
                self.merged_resources.insert(logical_id, resource);
            }
        }
    }

    /// The compiled template of the secondary stack: the merged
    /// resources plus one String parameter per repaired reference.
    pub fn build_template(&self) -> Template {
        Template {
            format_version: Some(String::from(crate::template::FORMAT_VERSION)),
            description: Some(String::from(
                "External CloudFormation template for monitoring resources",
            )),
            parameters: self.ref_parameters.clone(),
            resources: self.merged_resources.clone(),
            outputs: None,
            extra: IndexMap::new(),
        }
    }

    /// Runs after the main deployment: merge, then deploy the secondary
    /// stack, or delete it when the merge produced nothing.
    pub async fn run_after_deploy<C: CloudFormationApi, S: ObjectStoreApi>(
        &mut self,
        provider: &C,
        bucket: &ArtifactBucket<'_, S>,
        main_template: &Template,
        main_stack_name: &str,
        stage: &str,
    ) -> Result<ExternalOutcome, Error> {
        if !self.is_enabled() {
            return Ok(ExternalOutcome::Disabled);
        }

        self.merge_queued_resources(main_template);
        let stack_name = self.stack_name(main_stack_name);

        if self.merged_resources.is_empty() {
            // Nothing to deploy; make sure no stale stack lingers.
            return self.remove(provider, main_stack_name).await;
        }

        let mut template = self.build_template();
        bucket
            .upload_named_template(&template, "template-alerts.json")
            .await?;

        let mut reconciler = StackReconciler::new(provider, &stack_name)
            .with_poll_interval(self.poll_interval)
            .with_tags(vec![(String::from("STAGE"), String::from(stage))]);
        reconciler.get().await?;

        let artifacts = FunctionArtifacts::default();
        if reconciler.exists() {
            println!(
                "Updating external stack {} ({} resources configured)...",
                stack_name,
                self.merged_resources.len()
            );
            let outcome = reconciler.update(&mut template, &artifacts).await?;
            if outcome.up_to_date {
                println!("External stack {} has not changed.", stack_name);
                return Ok(ExternalOutcome::UpToDate);
            }
            self.report(&stack_name, StackOperation::Update, outcome.status.as_deref())?;
            Ok(ExternalOutcome::Deployed {
                status: outcome.status,
            })
        } else {
            println!(
                "Creating external stack {} ({} resources configured)...",
                stack_name,
                self.merged_resources.len()
            );
            let final_status = reconciler.create(&mut template, &artifacts).await?;
            self.report(&stack_name, StackOperation::Create, final_status.as_deref())?;
            Ok(ExternalOutcome::Deployed {
                status: final_status,
            })
        }
    }

    /// Runs before the main stack is removed, and when a merge leaves
    /// the secondary stack empty.
    pub async fn remove<C: CloudFormationApi>(
        &self,
        provider: &C,
        main_stack_name: &str,
    ) -> Result<ExternalOutcome, Error> {
        if !self.is_enabled() {
            return Ok(ExternalOutcome::Disabled);
        }

        let stack_name = self.stack_name(main_stack_name);
        let mut reconciler =
            StackReconciler::new(provider, &stack_name).with_poll_interval(self.poll_interval);
        reconciler.get().await?;

        if !reconciler.exists() {
            return Ok(ExternalOutcome::NothingToRemove);
        }

        println!("Removing external stack {}...", stack_name);
        reconciler.delete().await?;
        println!("External stack {} removed successfully.", stack_name);
        Ok(ExternalOutcome::Removed)
    }

    fn report(
        &self,
        stack_name: &str,
        operation: StackOperation,
        final_status: Option<&str>,
    ) -> Result<(), Error> {
        let final_status = match final_status {
            Some(final_status) => final_status,
            None => {
                println!("External stack {} removed successfully.", stack_name);
                return Ok(());
            }
        };
        let kind = status::classify(final_status).kind;
        let message = format!(
            "External stack {} {} ({}).",
            stack_name,
            phrase(operation, kind),
            final_status
        );
        if kind == StatusKind::Failure {
            return Err(Error::DeployFailed(message));
        }
        println!("{}", message);
        Ok(())
    }
}

/// Repair a `DependsOn` edge that crosses the stack boundary. Targets
/// inside the merged set stay; a metric filter's dependency on a main
/// stack log group is implicitly satisfied and is dropped, as is any
/// target the main stack already deployed. Anything else warns and
/// stays.
fn fix_depends_on(resource: &mut Resource, merged_ids: &HashSet<String>, main_template: &Template) {
    let depends_on = match resource.depends_on.take() {
        Some(depends_on) => depends_on,
        None => return,
    };
    let is_metric_filter = resource.resource_type == "AWS::Logs::MetricFilter";

    let keep = |target: &String| -> bool {
        if merged_ids.contains(target) {
            return true;
        }
        if target.ends_with("LogGroup") && is_metric_filter {
            return false;
        }
        if main_template.resources.contains_key(target) {
            return false;
        }
        eprintln!("Warning: Unresolved external stack dependency: {}", target);
        true
    };

    resource.depends_on = match depends_on {
        DependsOn::One(target) => {
            if keep(&target) {
                Some(DependsOn::One(target))
            } else {
                None
            }
        }
        DependsOn::Many(targets) => {
            let kept: Vec<String> = targets.into_iter().filter(|target| keep(target)).collect();
            if kept.is_empty() {
                None
            } else {
                Some(DependsOn::Many(kept))
            }
        }
    };
}

/// Walk a resource body looking for `Ref` edges that leave the merged
/// set. A target found in the main stack with a physical function name
/// becomes a String parameter that resolves the otherwise-dangling
/// reference; anything else warns and is left unresolved.
fn collect_ref_parameters(
    value: &Value,
    merged_ids: &HashSet<String>,
    main_template: &Template,
    ref_parameters: &mut IndexMap<String, CfnParameter>,
) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_ref_parameters(item, merged_ids, main_template, ref_parameters);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                if key == "Ref" {
                    if let Some(target) = child.as_str() {
                        if !merged_ids.contains(target) {
                            resolve_ref(target, main_template, ref_parameters);
                        }
                    }
                }
                collect_ref_parameters(child, merged_ids, main_template, ref_parameters);
            }
        }
        _ => {}
    }
}

fn resolve_ref(
    target: &str,
    main_template: &Template,
    ref_parameters: &mut IndexMap<String, CfnParameter>,
) {
    let physical_name = main_template
        .resources
        .get(target)
        .and_then(|resource| resource.properties.as_ref())
        .and_then(|properties| properties.get("FunctionName"));

    match physical_name {
        Some(name) => {
            ref_parameters.insert(
                target.to_owned(),
                CfnParameter::string_with_default(name.clone()),
            );
        }
        None => {
            eprintln!("Warning: Unresolved external stack reference: {}", target);
        }
    }
}
