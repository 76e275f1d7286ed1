pub mod schedule {
    use serde::{Deserialize, Serialize};

    /// Body of `POST /jobs/schedule`: let the control-server pick the
    /// components of a new job on a topic.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Request {
        pub topic_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub comment: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub configuration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub previous_job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub pipeline_id: Option<String>,
    }
}

pub mod create {
    use serde::{Deserialize, Serialize};

    /// Body of `POST /jobs`: create a job from an explicit component list.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Request {
        pub topic_id: String,
        pub components: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub comment: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub configuration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub team_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub pipeline_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub previous_job_id: Option<String>,
    }
}

pub mod jobstate {
    use crate::api::{JobId, JobStateId, StatusTag};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub status: StatusTag,
        pub comment: String,
        pub job_id: JobId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Created {
        pub id: JobStateId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Response {
        pub jobstate: Created,
    }
}

pub mod kv {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub key: String,
        pub value: f64,
    }
}

pub mod tag {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub name: String,
    }
}

pub mod lineage {
    use serde::{Deserialize, Serialize};

    /// Body of `POST /jobs/update` and `POST /jobs/upgrade`, which schedule
    /// a successor of an existing job.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub job_id: String,
    }
}
