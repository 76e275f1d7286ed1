//! Recording collaborators for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::api::jobs;
use crate::api::{ApiResponse, FileTarget, FileUpload, JobId, JobStateId, Resource, StatusTag};
use crate::client::{Ack, Query, ReportError, ResourceClient, StatusReporter, Uploader};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Upload {
        file: FileUpload,
        ok: bool,
    },
    Jobstate {
        status: StatusTag,
        comment: String,
        job_id: JobId,
        ok: bool,
    },
}

impl Call {
    /// File name for uploads, status for jobstates.
    pub fn label(&self) -> &str {
        match self {
            Call::Upload { file, .. } => &file.name,
            Call::Jobstate { status, .. } => status.as_str(),
        }
    }

    pub fn ok(&self) -> bool {
        match self {
            Call::Upload { ok, .. } | Call::Jobstate { ok, .. } => *ok,
        }
    }

    pub fn target(&self) -> Option<FileTarget> {
        match self {
            Call::Upload { file, .. } => Some(file.target),
            Call::Jobstate { .. } => None,
        }
    }
}

#[derive(Default)]
struct Script {
    upload_failures: HashMap<String, usize>,
    jobstate_failures: usize,
    fail_all_uploads: bool,
}

#[derive(Default)]
pub struct MockReporter {
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
}

impl MockReporter {
    pub fn new() -> Self {
        MockReporter::default()
    }

    /// Make the next `times` uploads of `name` fail.
    pub fn fail_upload(&self, name: &str, times: usize) {
        self.script
            .lock()
            .unwrap()
            .upload_failures
            .insert(name.to_string(), times);
    }

    pub fn fail_all_uploads(&self, fail: bool) {
        self.script.lock().unwrap().fail_all_uploads = fail;
    }

    /// Make the next `times` jobstate creations fail.
    pub fn fail_jobstates(&self, times: usize) {
        self.script.lock().unwrap().jobstate_failures = times;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn successful_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::ok).collect()
    }

    pub fn outcomes(&self) -> Vec<(String, bool)> {
        self.calls()
            .iter()
            .map(|c| (c.label().to_string(), c.ok()))
            .collect()
    }

    pub fn uploads(&self) -> Vec<FileUpload> {
        self.successful_calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload { file, .. } => Some(file),
                Call::Jobstate { .. } => None,
            })
            .collect()
    }

    pub fn jobstates(&self) -> Vec<(StatusTag, String)> {
        self.successful_calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Jobstate {
                    status, comment, ..
                } => Some((status, comment)),
                Call::Upload { .. } => None,
            })
            .collect()
    }
}

fn failure() -> ReportError {
    ReportError::Status {
        code: 503,
        message: "scripted failure".into(),
    }
}

#[async_trait]
impl Uploader for MockReporter {
    async fn upload(&self, file: &FileUpload) -> Result<Ack, ReportError> {
        let fail = {
            let mut script = self.script.lock().unwrap();
            let scripted = match script.upload_failures.get_mut(&file.name) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            scripted || script.fail_all_uploads
        };
        self.calls.lock().unwrap().push(Call::Upload {
            file: file.clone(),
            ok: !fail,
        });
        if fail {
            Err(failure())
        } else {
            Ok(Ack { file_id: None })
        }
    }
}

#[async_trait]
impl StatusReporter for MockReporter {
    async fn create_jobstate(
        &self,
        status: StatusTag,
        comment: &str,
        job_id: JobId,
    ) -> Result<JobStateId, ReportError> {
        let fail = {
            let mut script = self.script.lock().unwrap();
            if script.jobstate_failures > 0 {
                script.jobstate_failures -= 1;
                true
            } else {
                false
            }
        };
        self.calls.lock().unwrap().push(Call::Jobstate {
            status,
            comment: comment.to_string(),
            job_id,
            ok: !fail,
        });
        if fail {
            Err(failure())
        } else {
            Ok(JobStateId(Uuid::new_v4()))
        }
    }
}

/// Resource client answering from a script, in order, and recording each
/// request as a one-line summary such as `GET teams/t1 embed=topic`.
#[derive(Default)]
pub struct MockResources {
    responses: Mutex<VecDeque<ApiResponse>>,
    requests: Mutex<Vec<String>>,
    uploads: Mutex<Vec<FileUpload>>,
}

impl MockResources {
    pub fn new() -> Self {
        MockResources::default()
    }

    pub fn respond(&self, response: ApiResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<FileUpload> {
        self.uploads.lock().unwrap().clone()
    }

    fn answer(&self, request: String) -> Result<ApiResponse, ReportError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ReportError::Transport("no scripted response left".into()))
    }
}

fn with_query(mut line: String, query: &Query) -> String {
    for (k, v) in query.pairs() {
        line.push_str(&format!(" {k}={v}"));
    }
    line
}

#[async_trait]
impl ResourceClient for MockResources {
    async fn list(&self, resource: Resource, query: &Query) -> Result<ApiResponse, ReportError> {
        self.answer(with_query(format!("LIST {}", resource.collection()), query))
    }

    async fn get(
        &self,
        resource: Resource,
        id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(with_query(
            format!("GET {}/{id}", resource.collection()),
            query,
        ))
    }

    async fn create(&self, resource: Resource, body: Value) -> Result<ApiResponse, ReportError> {
        self.answer(format!("POST {} {body}", resource.collection()))
    }

    async fn update(
        &self,
        resource: Resource,
        id: &str,
        etag: &str,
        body: Value,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(format!(
            "PUT {}/{id} etag={etag} {body}",
            resource.collection()
        ))
    }

    async fn delete(
        &self,
        resource: Resource,
        id: &str,
        etag: Option<&str>,
    ) -> Result<ApiResponse, ReportError> {
        let mut line = format!("DELETE {}/{id}", resource.collection());
        if let Some(etag) = etag {
            line.push_str(&format!(" etag={etag}"));
        }
        self.answer(line)
    }

    async fn schedule_job(
        &self,
        request: &jobs::schedule::Request,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(format!("SCHEDULE {}", serde_json::to_string(request).unwrap()))
    }

    async fn create_job(&self, request: &jobs::create::Request) -> Result<ApiResponse, ReportError> {
        self.answer(format!("CREATE JOB {}", serde_json::to_string(request).unwrap()))
    }

    async fn job_update(&self, job_id: &str) -> Result<ApiResponse, ReportError> {
        self.answer(format!("UPDATE {job_id}"))
    }

    async fn job_upgrade(&self, job_id: &str) -> Result<ApiResponse, ReportError> {
        self.answer(format!("UPGRADE {job_id}"))
    }

    async fn add_job_tag(&self, job_id: &str, tag: &str) -> Result<ApiResponse, ReportError> {
        self.answer(format!("TAG jobs/{job_id} {tag}"))
    }

    async fn add_job_kv(
        &self,
        job_id: &str,
        request: &jobs::kv::Request,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(format!(
            "KV jobs/{job_id} {}={}",
            request.key, request.value
        ))
    }

    async fn add_job_component(
        &self,
        job_id: &str,
        component_id: &str,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(format!("ADD jobs/{job_id}/components {component_id}"))
    }

    async fn attach_team(&self, topic_id: &str, team_id: &str) -> Result<ApiResponse, ReportError> {
        self.answer(format!("ATTACH topics/{topic_id} team={team_id}"))
    }

    async fn refresh_remoteci_keys(
        &self,
        remoteci_id: &str,
        etag: &str,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(format!("PUT remotecis/{remoteci_id}/keys etag={etag}"))
    }

    async fn list_topic_components(
        &self,
        topic_id: &str,
        query: &Query,
    ) -> Result<ApiResponse, ReportError> {
        self.answer(with_query(
            format!("LIST topics/{topic_id}/components"),
            query,
        ))
    }
}

#[async_trait]
impl Uploader for MockResources {
    async fn upload(&self, file: &FileUpload) -> Result<Ack, ReportError> {
        self.requests
            .lock()
            .unwrap()
            .push(format!("UPLOAD {}", file.name));
        self.uploads.lock().unwrap().push(file.clone());
        Ok(Ack {
            file_id: Some(format!("f{}", self.uploads.lock().unwrap().len())),
        })
    }
}

