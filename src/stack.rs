use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;

use crate::bucket::FunctionArtifacts;
use crate::error::Error;
use crate::event::StackEvent;
use crate::provider::{CloudFormationApi, StackDescription, StackParameter, StackRequest};
use crate::status;
use crate::template::Template;

/// Fixed convergence poll delay. No backoff, no jitter; convergence is
/// bounded by the remote operation itself.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Local view of one remote stack. `status == None` holds exactly when
/// the stack is absent from the control plane.
#[derive(Debug)]
pub struct Stack {
    pub name: String,
    pub id: Option<String>,
    pub status: Option<String>,
    pub outputs: IndexMap<String, String>,
    pub parameters: Vec<StackParameter>,
    pub tags: Vec<(String, String)>,
    /// Fixed at construction; events at or before this instant belong
    /// to earlier operations.
    pub deployment_start_ms: i64,
}

pub type StatusListener<'a> = Box<dyn Fn(Option<&str>) + Send + Sync + 'a>;

/// Outcome of an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The control plane rejected the update because nothing changed.
    pub up_to_date: bool,
    pub status: Option<String>,
}

/// Owns one named stack's lifecycle against the control plane: fetch,
/// create, update, delete, and the polling loop that drives any of
/// them to a terminal outcome.
pub struct StackReconciler<'a, C> {
    provider: &'a C,
    pub stack: Stack,
    poll_interval: Duration,
    fingerprints: HashSet<String>,
    status_listener: Option<StatusListener<'a>>,
}

impl<'a, C: CloudFormationApi> StackReconciler<'a, C> {
    pub fn new(provider: &'a C, stack_name: &str) -> Self {
        Self {
            provider,
            stack: Stack {
                name: stack_name.to_owned(),
                id: None,
                status: None,
                outputs: IndexMap::new(),
                parameters: Vec::new(),
                tags: Vec::new(),
                deployment_start_ms: Utc::now().timestamp_millis(),
            },
            poll_interval: POLL_INTERVAL,
            fingerprints: HashSet::new(),
            status_listener: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<StackParameter>) -> Self {
        self.stack.parameters = parameters;
        self
    }

    pub fn with_tags(mut self, tags: Vec<(String, String)>) -> Self {
        self.stack.tags = tags;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_status_listener(mut self, listener: StatusListener<'a>) -> Self {
        self.status_listener = Some(listener);
        self
    }

    pub fn exists(&self) -> bool {
        self.stack.status.is_some()
    }

    /// Refresh id, status and outputs from the remote description.
    /// Absence is not an error: status becomes `None`.
    pub async fn get(&mut self) -> Result<(), Error> {
        let description = self.fetch_description().await?;
        self.apply_description(description);
        Ok(())
    }

    /// Issue a create request and poll it to a terminal outcome.
    /// Returns the final status.
    pub async fn create(
        &mut self,
        template: &mut Template,
        artifacts: &FunctionArtifacts,
    ) -> Result<Option<String>, Error> {
        let request = self.prepare_request(template, artifacts)?;
        let stack_id = self.provider.create_stack(&request).await?;
        if !stack_id.is_empty() {
            self.stack.id = Some(stack_id);
        }
        self.progress().await
    }

    /// Issue an update request and poll it to a terminal outcome. A
    /// rejection because nothing changed is success with `up_to_date`.
    pub async fn update(
        &mut self,
        template: &mut Template,
        artifacts: &FunctionArtifacts,
    ) -> Result<UpdateOutcome, Error> {
        let request = self.prepare_request(template, artifacts)?;
        match self.provider.update_stack(&request).await {
            Ok(()) => {}
            Err(error) if error.is_no_updates() => {
                return Ok(UpdateOutcome {
                    up_to_date: true,
                    status: self.stack.status.clone(),
                })
            }
            Err(error) => return Err(error.into()),
        }

        let status = self.progress().await?;
        Ok(UpdateOutcome {
            up_to_date: false,
            status,
        })
    }

    /// Issue a delete request and poll until the stack is gone.
    pub async fn delete(&mut self) -> Result<(), Error> {
        self.provider.delete_stack(&self.stack.name).await?;
        self.progress().await?;
        Ok(())
    }

    /// The convergence loop. Each iteration fetches the description and
    /// the event list together, notifies the status listener, surfaces
    /// the first new failure event, and stops once the stack is absent
    /// or its status is terminal.
    pub async fn progress(&mut self) -> Result<Option<String>, Error> {
        loop {
            let (description, raw_events) =
                futures::try_join!(self.fetch_description(), self.fetch_raw_events())?;
            self.apply_description(description);

            if let Some(listener) = &self.status_listener {
                listener(self.stack.status.as_deref());
            }

            if let Some(event) = self.record_new_failures(raw_events).into_iter().next() {
                return Err(Error::DeployFailed(format!(
                    "An error occurred: {} - {}.",
                    event.resource_logical_id,
                    event.resource_status_reason.unwrap_or_default()
                )));
            }

            match &self.stack.status {
                None => return Ok(None),
                Some(current) if status::is_terminal(current) => return Ok(Some(current.clone())),
                Some(_) => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Fetch the current event list and return the events that are new
    /// and reportable, recording their fingerprints so no event is
    /// surfaced twice in this process's lifetime.
    pub async fn get_events(&mut self) -> Result<Vec<StackEvent>, Error> {
        let raw_events = self.fetch_raw_events().await?;
        Ok(self.record_new_failures(raw_events))
    }

    async fn fetch_description(&self) -> Result<Option<StackDescription>, Error> {
        match self.provider.describe_stack(&self.stack.name).await {
            Ok(description) => Ok(Some(description)),
            Err(error) if error.is_stack_missing() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn fetch_raw_events(&self) -> Result<Vec<StackEvent>, Error> {
        match self.provider.stack_events(&self.stack.name).await {
            Ok(events) => Ok(events),
            Err(error) if error.is_stack_missing() => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn apply_description(&mut self, description: Option<StackDescription>) {
        match description {
            Some(description) => {
                if description.stack_id.is_some() {
                    self.stack.id = description.stack_id;
                }
                self.stack.status = Some(description.stack_status);
                self.stack.outputs = description.outputs;
            }
            None => {
                self.stack.status = None;
                self.stack.outputs = IndexMap::new();
            }
        }
    }

    fn record_new_failures(&mut self, events: Vec<StackEvent>) -> Vec<StackEvent> {
        let mut new_failures = Vec::new();
        for event in events {
            let fingerprint = event.fingerprint();
            if self.fingerprints.contains(&fingerprint) {
                continue;
            }
            if event.is_reportable(self.stack.deployment_start_ms) {
                self.fingerprints.insert(fingerprint);
                new_failures.push(event);
            }
        }
        new_failures
    }

    fn prepare_request(
        &self,
        template: &mut Template,
        artifacts: &FunctionArtifacts,
    ) -> Result<StackRequest, Error> {
        for (function_name, artifact) in &artifacts.functions {
            template.attach_code_location(
                function_name,
                &artifacts.bucket,
                &artifact.key,
                &artifact.uri,
            );
        }

        Ok(StackRequest {
            stack_name: self.stack.name.clone(),
            template_body: template.to_json()?,
            parameters: self.stack.parameters.clone(),
            tags: self.stack.tags.clone(),
        })
    }
}
