use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::api::jobs;
use crate::api::{ApiResponse, FileUpload, JobId, JobStateId, Resource, StatusTag};

/// Failure of a single call to the control-server.
///
/// The run backlog treats every variant as transient: the call is retried on
/// the next flush, never skipped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReportError {
    #[error("HTTP Error Code {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ReportError {
    pub fn from_response(response: &ApiResponse) -> Self {
        ReportError::Status {
            code: response.status,
            message: response.message().unwrap_or_default().to_string(),
        }
    }
}

/// Acknowledgement of an accepted file.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub file_id: Option<String>,
}

/// Search criteria passed along with list and get calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub embed: Option<String>,
    pub where_: Option<String>,
    pub query: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn where_clause(clause: impl Into<String>) -> Self {
        Query {
            where_: Some(clause.into()),
            ..Default::default()
        }
    }

    pub fn embed(embed: impl Into<String>) -> Self {
        Query {
            embed: Some(embed.into()),
            ..Default::default()
        }
    }

    /// Key/value pairs for the URL query string, in a stable order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(embed) = &self.embed {
            pairs.push(("embed", embed.clone()));
        }
        if let Some(where_) = &self.where_ {
            pairs.push(("where", where_.clone()));
        }
        if let Some(query) = &self.query {
            pairs.push(("query", query.clone()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort", sort.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

/// Attaches files to jobs and jobstates.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload one file. Any non-2xx answer is reported as an error.
    async fn upload(&self, file: &FileUpload) -> Result<Ack, ReportError>;
}

/// Records job lifecycle transitions.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Create a new jobstate on `job_id` and return its identifier.
    async fn create_jobstate(
        &self,
        status: StatusTag,
        comment: &str,
        job_id: JobId,
    ) -> Result<JobStateId, ReportError>;
}

/// Generic access to control-server resources.
///
/// Unlike [`Uploader`] and [`StatusReporter`], these methods hand back the
/// response whatever its status code is, so that callers can interpret
/// conflicts and missing resources themselves. An `Err` only means that no
/// response was obtained at all.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self, resource: Resource, query: &Query) -> Result<ApiResponse, ReportError>;

    async fn get(
        &self,
        resource: Resource,
        id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError>;

    async fn create(&self, resource: Resource, body: Value) -> Result<ApiResponse, ReportError>;

    async fn update(
        &self,
        resource: Resource,
        id: &str,
        etag: &str,
        body: Value,
    ) -> Result<ApiResponse, ReportError>;

    async fn delete(
        &self,
        resource: Resource,
        id: &str,
        etag: Option<&str>,
    ) -> Result<ApiResponse, ReportError>;

    async fn schedule_job(&self, request: &jobs::schedule::Request)
        -> Result<ApiResponse, ReportError>;

    async fn create_job(&self, request: &jobs::create::Request) -> Result<ApiResponse, ReportError>;

    /// Schedule an update job succeeding `job_id`.
    async fn job_update(&self, job_id: &str) -> Result<ApiResponse, ReportError>;

    /// Schedule an upgrade job succeeding `job_id`.
    async fn job_upgrade(&self, job_id: &str) -> Result<ApiResponse, ReportError>;

    async fn add_job_tag(&self, job_id: &str, tag: &str) -> Result<ApiResponse, ReportError>;

    async fn add_job_kv(
        &self,
        job_id: &str,
        request: &jobs::kv::Request,
    ) -> Result<ApiResponse, ReportError>;

    /// Attach an extra component to an existing job.
    async fn add_job_component(
        &self,
        job_id: &str,
        component_id: &str,
    ) -> Result<ApiResponse, ReportError>;

    async fn attach_team(&self, topic_id: &str, team_id: &str)
        -> Result<ApiResponse, ReportError>;

    /// Regenerate the key pair of a remoteci, conditional on its etag.
    async fn refresh_remoteci_keys(
        &self,
        remoteci_id: &str,
        etag: &str,
    ) -> Result<ApiResponse, ReportError>;

    async fn list_topic_components(
        &self,
        topic_id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError>;
}
