//! `reqwest` implementation of the DCI collaborator traits, talking to the
//! control-server REST API (`<cs_url>/api/v1`).

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use dci_rs::api::{jobs, ApiResponse, FileUpload, JobId, JobStateId, Resource, StatusTag};
use dci_rs::client::{Ack, Query, ReportError, ResourceClient, StatusReporter, Uploader};
use dci_rs::config::{ConfigError, Credentials, DciConfig};

const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("client id/API secret authentication is not supported, use a login and password")]
    UnsupportedCredentials,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct DciClient {
    http_client: reqwest::Client,
    base_url: String,
    login: String,
    password: String,
}

impl DciClient {
    pub fn new(
        cs_url: &str,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ConnectorError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("dci-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(DciClient {
            http_client,
            base_url: format!("{}{API_PREFIX}", cs_url.trim_end_matches('/')),
            login: login.into(),
            password: password.into(),
        })
    }

    pub fn from_config(config: &DciConfig) -> Result<Self, ConnectorError> {
        match config.credentials()? {
            Credentials::Login { login, password } => DciClient::new(&config.cs_url, login, password),
            Credentials::Signature { .. } => Err(ConnectorError::UnsupportedCredentials),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}/{}", self.base_url, path))
            .basic_auth(&self.login, Some(&self.password))
    }

    /// Send `request` and decode whatever comes back. Only a failure to get
    /// a response at all is an error.
    async fn send(&self, request: RequestBuilder) -> Result<ApiResponse, ReportError> {
        let response = request
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({ "text": text }))
        };
        debug!(status, "control-server response");
        Ok(ApiResponse::new(status, body))
    }

    async fn send_ok(&self, request: RequestBuilder) -> Result<ApiResponse, ReportError> {
        let response = self.send(request).await?;
        if !response.is_success() {
            warn!(
                status = response.status,
                message = response.message().unwrap_or_default(),
                "control-server rejected the request"
            );
            return Err(ReportError::from_response(&response));
        }
        Ok(response)
    }
}

fn with_etag(request: RequestBuilder, etag: Option<&str>) -> RequestBuilder {
    match etag {
        Some(etag) => request.header("If-match", etag),
        None => request,
    }
}

#[async_trait]
impl ResourceClient for DciClient {
    async fn list(&self, resource: Resource, query: &Query) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::GET, resource.collection())
                .query(&query.pairs()),
        )
        .await
    }

    async fn get(
        &self,
        resource: Resource,
        id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::GET, &format!("{}/{id}", resource.collection()))
                .query(&query.pairs()),
        )
        .await
    }

    async fn create(&self, resource: Resource, body: Value) -> Result<ApiResponse, ReportError> {
        self.send(self.request(Method::POST, resource.collection()).json(&body))
            .await
    }

    async fn update(
        &self,
        resource: Resource,
        id: &str,
        etag: &str,
        body: Value,
    ) -> Result<ApiResponse, ReportError> {
        let request = self
            .request(Method::PUT, &format!("{}/{id}", resource.collection()))
            .json(&body);
        self.send(with_etag(request, Some(etag))).await
    }

    async fn delete(
        &self,
        resource: Resource,
        id: &str,
        etag: Option<&str>,
    ) -> Result<ApiResponse, ReportError> {
        let request = self.request(Method::DELETE, &format!("{}/{id}", resource.collection()));
        self.send(with_etag(request, etag)).await
    }

    async fn schedule_job(
        &self,
        request: &jobs::schedule::Request,
    ) -> Result<ApiResponse, ReportError> {
        self.send(self.request(Method::POST, "jobs/schedule").json(request))
            .await
    }

    async fn create_job(&self, request: &jobs::create::Request) -> Result<ApiResponse, ReportError> {
        self.send(self.request(Method::POST, "jobs").json(request))
            .await
    }

    async fn job_update(&self, job_id: &str) -> Result<ApiResponse, ReportError> {
        let body = jobs::lineage::Request {
            job_id: job_id.to_string(),
        };
        self.send(self.request(Method::POST, "jobs/update").json(&body))
            .await
    }

    async fn job_upgrade(&self, job_id: &str) -> Result<ApiResponse, ReportError> {
        let body = jobs::lineage::Request {
            job_id: job_id.to_string(),
        };
        self.send(self.request(Method::POST, "jobs/upgrade").json(&body))
            .await
    }

    async fn add_job_tag(&self, job_id: &str, tag: &str) -> Result<ApiResponse, ReportError> {
        let body = jobs::tag::Request {
            name: tag.to_string(),
        };
        self.send(
            self.request(Method::POST, &format!("jobs/{job_id}/tags"))
                .json(&body),
        )
        .await
    }

    async fn add_job_kv(
        &self,
        job_id: &str,
        request: &jobs::kv::Request,
    ) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::POST, &format!("jobs/{job_id}/kv"))
                .json(request),
        )
        .await
    }

    async fn add_job_component(
        &self,
        job_id: &str,
        component_id: &str,
    ) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::POST, &format!("jobs/{job_id}/components"))
                .json(&json!({ "id": component_id })),
        )
        .await
    }

    async fn attach_team(&self, topic_id: &str, team_id: &str) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::POST, &format!("topics/{topic_id}/teams"))
                .json(&json!({ "team_id": team_id })),
        )
        .await
    }

    async fn refresh_remoteci_keys(
        &self,
        remoteci_id: &str,
        etag: &str,
    ) -> Result<ApiResponse, ReportError> {
        self.send(with_etag(
            self.request(Method::PUT, &format!("remotecis/{remoteci_id}/keys")),
            Some(etag),
        ))
        .await
    }

    async fn list_topic_components(
        &self,
        topic_id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError> {
        self.send(
            self.request(Method::GET, &format!("topics/{topic_id}/components"))
                .query(&query.pairs()),
        )
        .await
    }
}

#[async_trait]
impl Uploader for DciClient {
    #[instrument(skip(self, file), fields(name = %file.name, job_id = %file.target.job_id()))]
    async fn upload(&self, file: &FileUpload) -> Result<Ack, ReportError> {
        let mut request = self
            .request(Method::POST, "files")
            .header("DCI-NAME", file.name.as_str())
            .header("DCI-MIME", file.mime.as_str())
            .header("DCI-JOB-ID", file.target.job_id().to_string());
        if let Some(jobstate_id) = file.target.jobstate_id() {
            request = request.header("DCI-JOBSTATE-ID", jobstate_id.to_string());
        }

        let response = self.send_ok(request.body(file.content.clone())).await?;
        Ok(Ack {
            file_id: response
                .body
                .pointer("/file/id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl StatusReporter for DciClient {
    #[instrument(skip(self, comment))]
    async fn create_jobstate(
        &self,
        status: StatusTag,
        comment: &str,
        job_id: JobId,
    ) -> Result<JobStateId, ReportError> {
        let body = jobs::jobstate::Request {
            status,
            comment: comment.to_string(),
            job_id,
        };
        let response = self
            .send_ok(self.request(Method::POST, "jobstates").json(&body))
            .await?;
        let created: jobs::jobstate::Response = serde_json::from_value(response.body)
            .map_err(|e| ReportError::Decode(e.to_string()))?;
        Ok(created.jobstate.id)
    }
}
