use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod jobs;

/// Default mime type of files attached to jobs and jobstates.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Mime type of JUnit reports. These files attach to the job itself, never
/// to one of its jobstates.
pub const MIME_JUNIT: &str = "application/junit";

/// Default control-server URL.
pub const DEFAULT_CS_URL: &str = "https://api.distributed-ci.io";

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobStateId(pub Uuid);

impl fmt::Display for JobStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle status of a job, as recorded by a jobstate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusTag {
    New,
    PreRun,
    Running,
    PostRun,
    Success,
    Failure,
    Error,
    Killed,
}

impl StatusTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTag::New => "new",
            StatusTag::PreRun => "pre-run",
            StatusTag::Running => "running",
            StatusTag::PostRun => "post-run",
            StatusTag::Success => "success",
            StatusTag::Failure => "failure",
            StatusTag::Error => "error",
            StatusTag::Killed => "killed",
        }
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unknown job status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for StatusTag {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => StatusTag::New,
            "pre-run" => StatusTag::PreRun,
            "running" => StatusTag::Running,
            "post-run" => StatusTag::PostRun,
            "success" => StatusTag::Success,
            "failure" => StatusTag::Failure,
            "error" => StatusTag::Error,
            "killed" => StatusTag::Killed,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Resource types exposed by the control-server REST API.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Component,
    Feeder,
    File,
    Job,
    Jobstate,
    Product,
    Remoteci,
    Role,
    Team,
    Test,
    Topic,
    User,
}

impl Resource {
    pub const ALL: [Resource; 12] = [
        Resource::Component,
        Resource::Feeder,
        Resource::File,
        Resource::Job,
        Resource::Jobstate,
        Resource::Product,
        Resource::Remoteci,
        Resource::Role,
        Resource::Team,
        Resource::Test,
        Resource::Topic,
        Resource::User,
    ];

    /// Key wrapping a single object in response bodies, e.g. `{"team": {..}}`.
    pub fn singular(&self) -> &'static str {
        match self {
            Resource::Component => "component",
            Resource::Feeder => "feeder",
            Resource::File => "file",
            Resource::Job => "job",
            Resource::Jobstate => "jobstate",
            Resource::Product => "product",
            Resource::Remoteci => "remoteci",
            Resource::Role => "role",
            Resource::Team => "team",
            Resource::Test => "test",
            Resource::Topic => "topic",
            Resource::User => "user",
        }
    }

    /// URL segment of the collection, which is also the key wrapping list
    /// responses.
    pub fn collection(&self) -> &'static str {
        match self {
            Resource::Component => "components",
            Resource::Feeder => "feeders",
            Resource::File => "files",
            Resource::Job => "jobs",
            Resource::Jobstate => "jobstates",
            Resource::Product => "products",
            Resource::Remoteci => "remotecis",
            Resource::Role => "roles",
            Resource::Team => "teams",
            Resource::Test => "tests",
            Resource::Topic => "topics",
            Resource::User => "users",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unknown resource type: {0:?}")]
pub struct UnknownResource(pub String);

impl FromStr for Resource {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("dci_").unwrap_or(s);
        Resource::ALL
            .into_iter()
            .find(|r| r.singular() == name || r.collection() == name)
            .ok_or_else(|| UnknownResource(s.to_string()))
    }
}

/// Where an uploaded file is attached.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FileTarget {
    Job(JobId),
    JobState {
        job_id: JobId,
        jobstate_id: JobStateId,
    },
}

impl FileTarget {
    pub fn job_id(&self) -> JobId {
        match self {
            FileTarget::Job(job_id) | FileTarget::JobState { job_id, .. } => *job_id,
        }
    }

    pub fn jobstate_id(&self) -> Option<JobStateId> {
        match self {
            FileTarget::Job(_) => None,
            FileTarget::JobState { jobstate_id, .. } => Some(*jobstate_id),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileUpload {
    pub name: String,
    pub content: Vec<u8>,
    pub mime: String,
    pub target: FileTarget,
}

/// Raw response of the control-server: status code and decoded JSON body
/// (`{"text": ..}` when the body was not JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        ApiResponse { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `etag` of the object wrapped under `resource`'s singular key.
    pub fn etag(&self, resource: Resource) -> Option<&str> {
        self.body
            .get(resource.singular())
            .and_then(|obj| obj.get("etag"))
            .and_then(serde_json::Value::as_str)
    }

    /// The server-provided error message, if any.
    pub fn message(&self) -> Option<&str> {
        self.body
            .get("message")
            .or_else(|| self.body.get("text"))
            .and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_tag_wire_names() {
        assert_eq!(
            serde_json::to_value(StatusTag::PreRun).unwrap(),
            json!("pre-run")
        );
        assert_eq!("post-run".parse::<StatusTag>().unwrap(), StatusTag::PostRun);
        assert!("started".parse::<StatusTag>().is_err());
    }

    #[test]
    fn resource_from_module_name() {
        assert_eq!("dci_remoteci".parse::<Resource>().unwrap(), Resource::Remoteci);
        assert_eq!("topics".parse::<Resource>().unwrap(), Resource::Topic);
        assert!("dci_widget".parse::<Resource>().is_err());
    }

    #[test]
    fn etag_is_read_from_envelope() {
        let res = ApiResponse::new(200, json!({"team": {"id": "x", "etag": "abc"}}));
        assert_eq!(res.etag(Resource::Team), Some("abc"));
        assert_eq!(res.etag(Resource::User), None);
        assert!(res.is_success());
    }
}
