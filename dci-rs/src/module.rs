//! Resource modules: turn a parameter set into control-server calls and an
//! Ansible-style result.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::action::{
    is_present, resolve, ExcludedKeys, JobAction, ParameterSet, ResolvedAction, TopicAction,
    ABSENT, ID_KEY, STATE_KEY,
};
use crate::api::jobs;
use crate::api::{
    ApiResponse, FileTarget, FileUpload, JobId, JobStateId, Resource, StatusTag, UnknownResource,
    MIME_TEXT_PLAIN,
};
use crate::client::{Query, ReportError, ResourceClient, Uploader};
use crate::oval::{self, OvalError};

/// Embeds requested when returning a freshly created job.
const JOB_EMBED: &str = "topic,remoteci,components";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{0} parameter must be specified")]
    MissingRequiredField(String),
    #[error("{0}")]
    InvalidParameter(String),
    /// The control-server answered, but not the way the action needs.
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Api(#[from] ReportError),
    #[error("error while parsing {src} to generate junit at {dest}: {source}")]
    Oval {
        src: String,
        dest: String,
        source: OvalError,
    },
}

/// Result of one module run, serialized the way Ansible modules report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleOutcome {
    pub changed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ModuleOutcome {
    pub fn changed(data: Map<String, Value>) -> Self {
        ModuleOutcome {
            changed: true,
            data,
            ..Default::default()
        }
    }

    pub fn unchanged(data: Map<String, Value>) -> Self {
        ModuleOutcome {
            changed: false,
            data,
            ..Default::default()
        }
    }

    pub fn failure(error: &ModuleError) -> Self {
        ModuleOutcome {
            changed: false,
            failed: true,
            msg: Some(error.to_string()),
            data: Map::new(),
        }
    }
}

fn rejected(status: u16, message: impl Into<String>) -> ModuleError {
    ModuleError::Rejected {
        status,
        message: message.into(),
    }
}

/// Error for a response that prevents an action from going on.
fn raise(resource: Resource, id: Option<&str>, response: &ApiResponse) -> ModuleError {
    let message = response.message().unwrap_or_default();
    let detail = match response.status {
        404 => format!("{resource} resource not found ({message})"),
        401 => format!(
            "{} not authorized on {resource} ({message})",
            id.unwrap_or_default()
        ),
        _ => message.to_string(),
    };
    rejected(
        response.status,
        format!("HTTP Error Code {}: {detail}", response.status),
    )
}

fn search_query(params: &ParameterSet) -> Query {
    Query {
        embed: params.get_str("embed").map(str::to_string),
        where_: params.get_str("where").map(str::to_string),
        query: params.get_str("query").map(str::to_string),
        sort: params.get_str("sort").map(str::to_string),
        limit: params.get("limit").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }),
    }
}

/// Fields sent on create and update: every supplied, non-excluded
/// parameter, with `active` turned into `state: active|inactive`.
fn request_body(params: &ParameterSet, excluded: &ExcludedKeys) -> Value {
    let mut body: Map<String, Value> = params
        .iter()
        .filter(|(k, v)| !excluded.contains(k) && k.as_str() != ID_KEY && is_present(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if params.contains("active") {
        let state = if params.flag("active") {
            "active"
        } else {
            "inactive"
        };
        body.insert(STATE_KEY.to_string(), json!(state));
    }
    Value::Object(body)
}

fn string_list(params: &ParameterSet, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => s.split(',').map(|s| s.trim().to_string()).collect(),
        _ => Vec::new(),
    }
}

fn require_str<'a>(params: &'a ParameterSet, key: &str) -> Result<&'a str, ModuleError> {
    params
        .get_str(key)
        .ok_or_else(|| ModuleError::MissingRequiredField(key.to_string()))
}

fn parse_uuid(key: &str, value: &str) -> Result<Uuid, ModuleError> {
    Uuid::parse_str(value)
        .map_err(|_| ModuleError::InvalidParameter(format!("{key}: {value:?} is not a valid id")))
}

fn requires_name(resource: Resource) -> bool {
    matches!(
        resource,
        Resource::Component
            | Resource::Feeder
            | Resource::Product
            | Resource::Remoteci
            | Resource::Role
            | Resource::Team
            | Resource::Test
            | Resource::Topic
            | Resource::User
    )
}

/// A module the driver can run: one per resource, plus the modules acting
/// on a single relation or a local file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ModuleName {
    Resource(Resource),
    JobComponent,
    Keys,
    OvalToJunit,
}

impl FromStr for ModuleName {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("dci_").unwrap_or(s) {
            "job_component" => Ok(ModuleName::JobComponent),
            "keys" => Ok(ModuleName::Keys),
            "oval_to_junit" => Ok(ModuleName::OvalToJunit),
            _ => s.parse().map(ModuleName::Resource),
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleName::Resource(resource) => write!(f, "{resource}"),
            ModuleName::JobComponent => f.write_str("job_component"),
            ModuleName::Keys => f.write_str("keys"),
            ModuleName::OvalToJunit => f.write_str("oval_to_junit"),
        }
    }
}

/// Run the module `name` with `params`.
pub async fn run_named<C>(
    client: &C,
    name: ModuleName,
    params: &ParameterSet,
) -> Result<ModuleOutcome, ModuleError>
where
    C: ResourceClient + Uploader,
{
    match name {
        ModuleName::Resource(resource) => run_module(client, resource, params).await,
        ModuleName::JobComponent => add_job_component(client, params).await,
        ModuleName::Keys => refresh_keys(client, params).await,
        ModuleName::OvalToJunit => oval_to_junit(params),
    }
}

/// Attach `component_id` to `job_id`. Attaching twice is not an error.
#[instrument(skip(client, params))]
pub async fn add_job_component<C>(
    client: &C,
    params: &ParameterSet,
) -> Result<ModuleOutcome, ModuleError>
where
    C: ResourceClient,
{
    let job_id = require_str(params, "job_id")?.trim();
    let component_id = require_str(params, "component_id")?.trim();
    let response = client.add_job_component(job_id, component_id).await?;
    match response.status {
        201 | 409 => {
            let mut data = Map::new();
            data.insert("component_id".to_string(), json!(component_id));
            data.insert("job_id".to_string(), json!(job_id));
            Ok(ModuleOutcome::changed(data))
        }
        code => Err(rejected(
            code,
            response
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| response.body.to_string()),
        )),
    }
}

/// Regenerate the key pair of `remoteci_id` and return it.
#[instrument(skip(client, params))]
pub async fn refresh_keys<C>(client: &C, params: &ParameterSet) -> Result<ModuleOutcome, ModuleError>
where
    C: ResourceClient,
{
    let id = require_str(params, "remoteci_id")?;
    let current = client.get(Resource::Remoteci, id, &Query::default()).await?;
    if current.status != 200 {
        return Err(raise(Resource::Remoteci, Some(id), &current));
    }
    let etag = current
        .etag(Resource::Remoteci)
        .ok_or_else(|| rejected(current.status, "remoteci has no etag"))?;
    let response = client.refresh_remoteci_keys(id, etag).await?;
    if response.status != 201 {
        return Err(raise(Resource::Remoteci, Some(id), &response));
    }
    let keys = response.body.get("keys").cloned().unwrap_or(Value::Null);
    Ok(ModuleOutcome::unchanged(into_map(keys)))
}

/// Convert the OVAL results at `oval_result_src` into a JUnit report at
/// `junit_dest`. Needs no control-server.
pub fn oval_to_junit(params: &ParameterSet) -> Result<ModuleOutcome, ModuleError> {
    let src = require_str(params, "oval_result_src")?;
    let dest = require_str(params, "junit_dest")?;
    let report = oval::convert(Path::new(src), Path::new(dest)).map_err(|source| {
        ModuleError::Oval {
            src: src.to_string(),
            dest: dest.to_string(),
            source,
        }
    })?;
    debug!(tests = report.tests(), failures = report.failures(), "OVAL report written");
    Ok(ModuleOutcome::changed(Map::new()))
}

/// Run the module of `resource` with `params`.
///
/// `Err` carries everything that should surface as a failed module run;
/// use [`ModuleOutcome::failure`] to report it.
#[instrument(skip(client, params))]
pub async fn run_module<C>(
    client: &C,
    resource: Resource,
    params: &ParameterSet,
) -> Result<ModuleOutcome, ModuleError>
where
    C: ResourceClient + Uploader,
{
    let module = Module {
        client,
        resource,
        params,
    };
    match resource {
        Resource::Job => {
            let action = JobAction::from_params(params);
            debug!(?action, "job module action");
            module.run_job(action).await
        }
        Resource::Topic => {
            let action = TopicAction::from_params(params);
            debug!(?action, "topic module action");
            match action {
                TopicAction::AttachTeam => module.attach_teams().await,
                TopicAction::Standard(action) => {
                    module.run_standard(action, &ExcludedKeys::standard()).await
                }
            }
        }
        _ => {
            let excluded = ExcludedKeys::standard();
            let action = resolve(params, &excluded);
            debug!(?action, "module action");
            module.run_standard(action, &excluded).await
        }
    }
}

struct Module<'a, C> {
    client: &'a C,
    resource: Resource,
    params: &'a ParameterSet,
}

impl<'a, C> Module<'a, C>
where
    C: ResourceClient + Uploader,
{
    fn id(&self) -> Option<&'a str> {
        self.params.get_str(ID_KEY)
    }

    fn require_id(&self) -> Result<&'a str, ModuleError> {
        require_str(self.params, ID_KEY)
    }

    async fn run_standard(
        &self,
        action: ResolvedAction,
        excluded: &ExcludedKeys,
    ) -> Result<ModuleOutcome, ModuleError> {
        let response = match action {
            ResolvedAction::List => {
                self.client
                    .list(self.resource, &search_query(self.params))
                    .await?
            }
            ResolvedAction::Get => {
                self.client
                    .get(self.resource, self.require_id()?, &search_query(self.params))
                    .await?
            }
            ResolvedAction::Delete => self.delete().await?,
            ResolvedAction::Update => {
                let id = self.require_id()?;
                let etag = self.current_etag(id).await?;
                self.client
                    .update(self.resource, id, &etag, request_body(self.params, excluded))
                    .await?
            }
            ResolvedAction::Create => {
                if self.resource == Resource::File {
                    return self.create_file().await;
                }
                if requires_name(self.resource) {
                    require_str(self.params, "name")?;
                }
                if self.resource == Resource::Component {
                    require_str(self.params, "type")?;
                }
                self.client
                    .create(self.resource, request_body(self.params, excluded))
                    .await?
            }
        };
        self.interpret(response).await
    }

    /// Files and topics are deleted without an etag; everything else is
    /// fetched first so the delete is conditional on the current version.
    async fn delete(&self) -> Result<ApiResponse, ModuleError> {
        let id = self.require_id()?;
        let etag = match self.resource {
            Resource::File | Resource::Topic => None,
            _ => {
                let current = self.client.get(self.resource, id, &Query::default()).await?;
                if current.status != 200 {
                    return Err(raise(self.resource, Some(id), &current));
                }
                current.etag(self.resource).map(str::to_string)
            }
        };
        Ok(self.client.delete(self.resource, id, etag.as_deref()).await?)
    }

    async fn current_etag(&self, id: &str) -> Result<String, ModuleError> {
        let current = self.client.get(self.resource, id, &Query::default()).await?;
        if current.status != 200 {
            return Err(raise(self.resource, Some(id), &current));
        }
        current
            .etag(self.resource)
            .map(str::to_string)
            .ok_or_else(|| rejected(current.status, format!("{} has no etag", self.resource)))
    }

    /// Map a final response to the module result.
    async fn interpret(&self, response: ApiResponse) -> Result<ModuleOutcome, ModuleError> {
        let singular = self.resource.singular();
        match response.status {
            404 => Err(rejected(404, "The specified resource does not exist")),
            401 | 412 => Err(rejected(response.status, "Unauthorized resource access")),
            500 => Err(rejected(500, "Internal Server Error")),
            400 => {
                let payload = response.body.get("payload").cloned().unwrap_or(Value::Null);
                Err(rejected(
                    400,
                    format!(
                        "{} - {}",
                        response.message().unwrap_or_default(),
                        payload
                    ),
                ))
            }
            204 => {
                let mut data = Map::new();
                if self.params.get_str(STATE_KEY) != Some(ABSENT) {
                    let id = self.require_id()?;
                    let current = self.client.get(self.resource, id, &Query::default()).await?;
                    data.insert(singular.to_string(), envelope(&current, singular));
                }
                Ok(ModuleOutcome::changed(data))
            }
            409 => {
                let existing = match self.params.get_str("name") {
                    Some(name) => {
                        let found = self
                            .client
                            .list(self.resource, &Query::where_clause(format!("name:{name}")))
                            .await?;
                        found
                            .body
                            .get(self.resource.collection())
                            .and_then(|items| items.get(0))
                            .cloned()
                            .unwrap_or(Value::Null)
                    }
                    None => {
                        let current = self
                            .client
                            .get(self.resource, self.require_id()?, &Query::default())
                            .await?;
                        envelope(&current, singular)
                    }
                };
                let mut data = Map::new();
                data.insert(singular.to_string(), existing);
                Ok(ModuleOutcome::unchanged(data))
            }
            _ if response.is_success() => Ok(ModuleOutcome::changed(into_map(response.body))),
            _ => Err(raise(self.resource, self.id(), &response)),
        }
    }

    async fn create_file(&self) -> Result<ModuleOutcome, ModuleError> {
        let job_id = self.params.get_str("job_id");
        let jobstate_id = self.params.get_str("jobstate_id");
        if job_id.is_none() && jobstate_id.is_none() {
            return Err(ModuleError::InvalidParameter(
                "Either job_id or jobstate_id must be specified".into(),
            ));
        }

        let content = self.params.get_str("content");
        let path = self.params.get_str("path");
        let (name, content) = match (content, path) {
            (Some(_), Some(_)) => {
                return Err(ModuleError::InvalidParameter(
                    "parameters are mutually exclusive: content, path".into(),
                ))
            }
            (Some(content), None) => (
                require_str(self.params, "name")?.to_string(),
                content.as_bytes().to_vec(),
            ),
            (None, Some(path)) => {
                let bytes = std::fs::read(Path::new(path))
                    .map_err(|_| ModuleError::InvalidParameter(format!("{path}: No such file")))?;
                let name = self.params.get_str("name").unwrap_or(path).to_string();
                (name, bytes)
            }
            (None, None) => {
                return Err(ModuleError::InvalidParameter(
                    "Either content or path must be specified".into(),
                ))
            }
        };

        let target = match jobstate_id {
            Some(jobstate_id) => {
                let jobstate_id = JobStateId(parse_uuid("jobstate_id", jobstate_id)?);
                let job_id = match job_id {
                    Some(job_id) => JobId(parse_uuid("job_id", job_id)?),
                    None => self.job_of_jobstate(jobstate_id).await?,
                };
                FileTarget::JobState {
                    job_id,
                    jobstate_id,
                }
            }
            None => FileTarget::Job(JobId(parse_uuid("job_id", job_id.unwrap_or_default())?)),
        };

        let upload = FileUpload {
            name,
            content,
            mime: self
                .params
                .get_str("mime")
                .unwrap_or(MIME_TEXT_PLAIN)
                .to_string(),
            target,
        };
        let ack = self.client.upload(&upload).await?;

        let mut data = Map::new();
        if let Some(file_id) = ack.file_id {
            let current = self
                .client
                .get(Resource::File, &file_id, &Query::default())
                .await?;
            data.insert("file".to_string(), envelope(&current, "file"));
        }
        Ok(ModuleOutcome::changed(data))
    }

    async fn job_of_jobstate(&self, jobstate_id: JobStateId) -> Result<JobId, ModuleError> {
        let id = jobstate_id.to_string();
        let current = self
            .client
            .get(Resource::Jobstate, &id, &Query::default())
            .await?;
        if current.status != 200 {
            return Err(raise(Resource::Jobstate, Some(&id), &current));
        }
        let job_id = current
            .body
            .pointer("/jobstate/job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| rejected(current.status, "jobstate has no job_id"))?;
        Ok(JobId(parse_uuid("job_id", job_id)?))
    }

    async fn attach_teams(&self) -> Result<ModuleOutcome, ModuleError> {
        let id = self.require_id()?;
        let mut last = None;
        for team_id in string_list(self.params, "team_ids") {
            last = Some(self.client.attach_team(id, &team_id).await?);
        }
        match last {
            Some(response) => self.interpret(response).await,
            None => Err(ModuleError::MissingRequiredField("team_ids".into())),
        }
    }

    async fn run_job(&self, action: JobAction) -> Result<ModuleOutcome, ModuleError> {
        let job_excluded = ExcludedKeys::standard().extend(["update", "upgrade", "value"]);
        match action {
            JobAction::Standard(ResolvedAction::Create) => self.create_job().await,
            JobAction::Standard(action) => self.run_standard(action, &job_excluded).await,
            JobAction::Status => {
                let id = self.require_id()?;
                let status: StatusTag = require_str(self.params, "status")?
                    .parse()
                    .map_err(|e: crate::api::UnknownStatus| {
                        ModuleError::InvalidParameter(e.to_string())
                    })?;
                let request = jobs::jobstate::Request {
                    status,
                    comment: self
                        .params
                        .get_str("comment")
                        .unwrap_or_default()
                        .to_string(),
                    job_id: JobId(parse_uuid("id", id)?),
                };
                let body = serde_json::to_value(&request)
                    .map_err(|e| ModuleError::InvalidParameter(e.to_string()))?;
                let response = self.client.create(Resource::Jobstate, body).await?;
                if response.status != 201 {
                    return Err(raise(Resource::Jobstate, Some(id), &response));
                }
                Ok(ModuleOutcome::changed(into_map(response.body)))
            }
            JobAction::SetKeyValue => {
                let id = self.require_id()?;
                let key = require_str(self.params, "key")?;
                let value = self
                    .params
                    .get("value")
                    .and_then(|v| match v {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.parse().ok(),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        ModuleError::InvalidParameter("key and value are mandatory".into())
                    })?;
                let request = jobs::kv::Request {
                    key: key.to_string(),
                    value,
                };
                let response = self.client.add_job_kv(id, &request).await?;
                if response.status != 201 {
                    return Err(raise(Resource::Job, Some(id), &response));
                }
                let current = self.client.get(Resource::Job, id, &Query::default()).await?;
                self.interpret(current).await
            }
            JobAction::SetTags => {
                let id = self.require_id()?;
                for tag in string_list(self.params, "tags") {
                    let response = self.client.add_job_tag(id, &tag).await?;
                    if response.status != 200 {
                        return Err(raise(Resource::Job, Some(id), &response));
                    }
                }
                let current = self.client.get(Resource::Job, id, &Query::default()).await?;
                self.interpret(current).await
            }
            JobAction::JobUpdate => {
                let id = self.require_id()?;
                let response = self.client.job_update(id).await?;
                self.fetch_new_job(response, Some(id)).await
            }
            JobAction::Upgrade => {
                let id = self.require_id()?;
                let response = self.client.job_upgrade(id).await?;
                self.fetch_new_job(response, Some(id)).await
            }
            JobAction::Schedule => {
                let topic_id = self.topic_id().await?;
                let request = jobs::schedule::Request {
                    topic_id,
                    comment: self.opt_str("comment"),
                    configuration: self.opt_str("configuration"),
                    name: self.opt_str("name"),
                    url: self.opt_str("url"),
                    previous_job_id: self.opt_str("previous_job_id"),
                    pipeline_id: self.opt_str("pipeline_id"),
                };
                let response = self.client.schedule_job(&request).await?;
                self.fetch_new_job(response, None).await
            }
        }
    }

    fn opt_str(&self, key: &str) -> Option<String> {
        self.params.get_str(key).map(str::to_string)
    }

    async fn create_job(&self) -> Result<ModuleOutcome, ModuleError> {
        let topic_id = self.topic_id().await?;
        let mut components = string_list(self.params, "components");
        for clause in string_list(self.params, "components_by_query") {
            components.push(self.find_component(&topic_id, &clause).await?);
        }
        let request = jobs::create::Request {
            topic_id,
            components,
            comment: self.opt_str("comment"),
            configuration: self.opt_str("configuration"),
            name: self.opt_str("name"),
            team_id: self.opt_str("team_id"),
            pipeline_id: self.opt_str("pipeline_id"),
            url: self.opt_str("url"),
            previous_job_id: self.opt_str("previous_job_id"),
        };
        let response = self.client.create_job(&request).await?;
        self.fetch_new_job(response, None).await
    }

    /// Resolve the `topic` parameter (a topic name) to its id.
    async fn topic_id(&self) -> Result<String, ModuleError> {
        let topic = require_str(self.params, "topic")?;
        let response = self
            .client
            .list(Resource::Topic, &Query::where_clause(format!("name:{topic}")))
            .await?;
        if response.status != 200 {
            return Err(raise(Resource::Topic, None, &response));
        }
        response
            .body
            .pointer("/topics/0/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                rejected(
                    404,
                    format!(
                        "Not found or not enough permissions on topic {topic} ({})",
                        response.message().unwrap_or_default()
                    ),
                )
            })
    }

    async fn find_component(&self, topic_id: &str, clause: &str) -> Result<String, ModuleError> {
        let response = self
            .client
            .list_topic_components(topic_id, &Query::where_clause(clause))
            .await?;
        let message = response.message().unwrap_or_default();
        match response.status {
            200 => response
                .body
                .pointer("/components/0/id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    rejected(
                        404,
                        format!(
                            "Not found or not enough permissions on component {clause} ({message})"
                        ),
                    )
                }),
            401 | 412 => Err(rejected(
                response.status,
                format!("Not enough permissions on component {clause} ({message})"),
            )),
            code => Err(rejected(
                code,
                format!("Error while retrieving {clause} ({message})"),
            )),
        }
    }

    /// After a job-creating call: fetch the new job with its embeds.
    async fn fetch_new_job(
        &self,
        response: ApiResponse,
        previous: Option<&str>,
    ) -> Result<ModuleOutcome, ModuleError> {
        if response.status != 201 {
            return Err(raise(Resource::Job, previous, &response));
        }
        let job_id = response
            .body
            .pointer("/job/id")
            .and_then(Value::as_str)
            .ok_or_else(|| rejected(response.status, "created job has no id"))?
            .to_string();
        let current = self
            .client
            .get(Resource::Job, &job_id, &Query::embed(JOB_EMBED))
            .await?;
        self.interpret(current).await
    }
}

fn envelope(response: &ApiResponse, singular: &str) -> Value {
    response.body.get(singular).cloned().unwrap_or(Value::Null)
}

fn into_map(body: Value) -> Map<String, Value> {
    match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("body".to_string(), other);
            map
        }
    }
}
