//! Playbook-run integration.
//!
//! The runner emits one [`PlaybookEvent`] per lifecycle step. Consumers
//! implement [`PlaybookCallback`]: [`DciCallback`] reports the run to the
//! control-server through a [`RunBacklog`], [`JunitCallback`] turns it into
//! a JUnit report.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{JobId, StatusTag, MIME_TEXT_PLAIN};
use crate::client::{StatusReporter, Uploader};
use crate::formatter::format_output;
use crate::junit::JunitError;
use crate::session::{BacklogEntry, RunBacklog};

pub mod junit;

pub use junit::JunitCallback;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("invalid test case expression: {0}")]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Junit(#[from] JunitError),
}

/// A task as seen by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub uuid: String,
    pub name: String,
    /// Module run by the task, e.g. `command` or `dci_job`.
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// `file.yml:line` where the task is defined.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub no_log: bool,
}

/// Lifecycle event of a playbook run, one JSON object per line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PlaybookEvent {
    PlaybookStart {
        file_name: String,
    },
    PlayStart {
        name: String,
        #[serde(default)]
        hosts: Vec<String>,
        #[serde(default)]
        vars: Map<String, Value>,
        /// Facts gathered so far, by host.
        #[serde(default)]
        facts: Map<String, Value>,
    },
    TaskStart {
        task: TaskInfo,
    },
    RunnerOnOk {
        task: TaskInfo,
        host: String,
        #[serde(default)]
        result: Value,
    },
    RunnerOnFailed {
        task: TaskInfo,
        host: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        ignore_errors: bool,
    },
    RunnerOnSkipped {
        task: TaskInfo,
        host: String,
        #[serde(default)]
        result: Value,
    },
    RunnerOnUnreachable {
        task: TaskInfo,
        host: String,
        #[serde(default)]
        result: Value,
    },
    /// Tasks pulled in by an include, reported once per host.
    PlaybookOnInclude {
        task: TaskInfo,
        host: String,
        #[serde(default)]
        result: Value,
    },
    PlaybookOnStats {
        #[serde(default)]
        stats: Value,
    },
}

/// Consumer of playbook events.
#[async_trait]
pub trait PlaybookCallback: Send {
    async fn handle(&mut self, event: &PlaybookEvent) -> Result<(), CallbackError>;
}

/// Reports a playbook run to the control-server: one jobstate per play
/// status, one file per task output.
pub struct DciCallback<R> {
    backlog: RunBacklog<R>,
    /// `dci_status` of the current play, which decides how failures are
    /// reported.
    play_status: Option<StatusTag>,
    mime: String,
    unsent: Vec<BacklogEntry>,
}

fn play_comment(name: &str, hosts: &[String], vars: &Map<String, Value>) -> String {
    match vars.get("dci_comment") {
        Some(Value::String(comment)) => comment.clone(),
        Some(other) => other.to_string(),
        // An unnamed play is named after its hosts.
        None if !name.is_empty() && !hosts.iter().any(|h| h == name) => name.to_string(),
        None => String::new(),
    }
}

fn job_from_facts(facts: &Map<String, Value>) -> Option<JobId> {
    facts
        .values()
        .filter_map(|f| f.pointer("/job_informations/id").and_then(Value::as_str))
        .find_map(|id| Uuid::parse_str(id).ok())
        .map(JobId)
}

/// The successor job id when `task` scheduled an update or upgrade job.
fn successor_job(task: &TaskInfo, result: &Value) -> Option<JobId> {
    if task.action != "dci_job" {
        return None;
    }
    let requested = |key: &str| {
        result
            .pointer(&format!("/invocation/module_args/{key}"))
            .map(|v| matches!(v, Value::Bool(true)) || v.as_str() == Some("true"))
            .unwrap_or(false)
    };
    if !requested("upgrade") && !requested("update") {
        return None;
    }
    result
        .pointer("/job/id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .map(JobId)
}

impl<R: Uploader + StatusReporter> DciCallback<R> {
    pub fn new(backlog: RunBacklog<R>) -> Self {
        DciCallback {
            backlog,
            play_status: None,
            mime: MIME_TEXT_PLAIN.to_string(),
            unsent: Vec::new(),
        }
    }

    pub fn backlog(&self) -> &RunBacklog<R> {
        &self.backlog
    }

    /// Entries still queued when the run was closed.
    pub fn unsent(&self) -> &[BacklogEntry] {
        &self.unsent
    }

    async fn upload(&mut self, task: &TaskInfo, output: String) {
        let mime = self.mime.clone();
        self.backlog
            .enqueue_file(task.name.clone(), output, mime)
            .await;
    }

    async fn play_start(
        &mut self,
        name: &str,
        hosts: &[String],
        vars: &Map<String, Value>,
        facts: &Map<String, Value>,
    ) {
        // A play without vars keeps the status and mime type of the
        // previous one.
        if !vars.is_empty() {
            self.mime = vars
                .get("dci_mime_type")
                .and_then(Value::as_str)
                .unwrap_or(MIME_TEXT_PLAIN)
                .to_string();
            self.play_status = match vars.get("dci_status").and_then(Value::as_str) {
                Some(status) => match status.parse::<StatusTag>() {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(%e, play = name, "Ignoring play status");
                        None
                    }
                },
                None => None,
            };
        }
        let Some(status) = self.play_status else {
            return;
        };

        if self.backlog.session().job_id().is_none() {
            if let Some(job_id) = job_from_facts(facts) {
                self.backlog.adopt_job_id(job_id).await;
            }
        }
        self.backlog
            .set_status(play_comment(name, hosts, vars), Some(status))
            .await;
    }

    async fn runner_on_ok(&mut self, task: &TaskInfo, result: &Value) {
        if let Some(job_id) = successor_job(task, result) {
            self.backlog.adopt_job_id(job_id).await;
            self.backlog
                .set_status("starting the update/upgrade", Some(StatusTag::PreRun))
                .await;
        }
        if task.action != "setup" {
            self.upload(task, format_output(result)).await;
        }
    }

    async fn runner_on_failed(&mut self, task: &TaskInfo, result: &Value, ignore_errors: bool) {
        let output = format_output(result);
        if !ignore_errors {
            // Failing while still preparing the job is an error of the
            // environment rather than of the product under test.
            let status = match self.play_status {
                Some(StatusTag::New | StatusTag::PreRun) => StatusTag::Error,
                _ => StatusTag::Failure,
            };
            self.backlog.record_status(task.name.clone(), status).await;
        }
        self.upload(task, output).await;
    }

    async fn runner_on_unreachable(&mut self, task: &TaskInfo, result: &Value) {
        self.backlog
            .record_status(task.name.clone(), StatusTag::Failure)
            .await;
        let msg = match result.get("msg") {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        self.upload(task, msg).await;
    }
}

#[async_trait]
impl<R: Uploader + StatusReporter> PlaybookCallback for DciCallback<R> {
    async fn handle(&mut self, event: &PlaybookEvent) -> Result<(), CallbackError> {
        match event {
            PlaybookEvent::PlayStart {
                name,
                hosts,
                vars,
                facts,
            } => self.play_start(name, hosts, vars, facts).await,
            PlaybookEvent::RunnerOnOk { task, result, .. } => self.runner_on_ok(task, result).await,
            PlaybookEvent::RunnerOnFailed {
                task,
                result,
                ignore_errors,
                ..
            } => self.runner_on_failed(task, result, *ignore_errors).await,
            PlaybookEvent::RunnerOnUnreachable { task, result, .. } => {
                self.runner_on_unreachable(task, result).await
            }
            PlaybookEvent::PlaybookOnStats { .. } => {
                self.unsent = self.backlog.close();
            }
            PlaybookEvent::PlaybookStart { .. }
            | PlaybookEvent::TaskStart { .. }
            | PlaybookEvent::RunnerOnSkipped { .. }
            | PlaybookEvent::PlaybookOnInclude { .. } => {
                debug!(?event, "Nothing to report");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{FileTarget, JobStateId};
    use crate::mock::{Call, MockReporter};
    use crate::session::RunSession;
    use serde_json::json;

    const JOB: &str = "6a0c2c0e-4a5c-4f38-9a8f-6d3d0c1b2a11";
    const NEXT_JOB: &str = "0f1e2d3c-4b5a-4968-8776-a5b4c3d2e1f0";

    fn job(id: &str) -> JobId {
        JobId(Uuid::parse_str(id).unwrap())
    }

    fn task(name: &str, action: &str) -> TaskInfo {
        TaskInfo {
            uuid: format!("uuid-{name}"),
            name: name.to_string(),
            action: action.to_string(),
            args: Map::new(),
            path: None,
            no_log: false,
        }
    }

    fn play(name: &str, vars: Value, facts: Value) -> PlaybookEvent {
        PlaybookEvent::PlayStart {
            name: name.to_string(),
            hosts: vec!["jumphost".to_string()],
            vars: vars.as_object().cloned().unwrap_or_default(),
            facts: facts.as_object().cloned().unwrap_or_default(),
        }
    }

    fn ok(task: TaskInfo, result: Value) -> PlaybookEvent {
        PlaybookEvent::RunnerOnOk {
            task,
            host: "jumphost".to_string(),
            result,
        }
    }

    fn failed(task: TaskInfo, ignore_errors: bool) -> PlaybookEvent {
        failed_on("jumphost", task, ignore_errors)
    }

    fn failed_on(host: &str, task: TaskInfo, ignore_errors: bool) -> PlaybookEvent {
        PlaybookEvent::RunnerOnFailed {
            task,
            host: host.to_string(),
            result: json!({"msg": "boom"}),
            ignore_errors,
        }
    }

    fn callback() -> DciCallback<MockReporter> {
        DciCallback::new(RunBacklog::new(MockReporter::new()))
    }

    async fn run(cb: &mut DciCallback<MockReporter>, events: Vec<PlaybookEvent>) {
        for event in &events {
            cb.handle(event).await.unwrap();
        }
    }

    fn reporter(cb: &DciCallback<MockReporter>) -> &MockReporter {
        cb.backlog().reporter()
    }

    #[tokio::test]
    async fn test_job_adopted_from_facts() {
        let mut cb = callback();
        run(
            &mut cb,
            vec![
                play(
                    "Install",
                    json!({"dci_status": "running"}),
                    json!({"jumphost": {"job_informations": {"id": JOB}}}),
                ),
                ok(
                    task("Run tests", "command"),
                    json!({"invocation": {"module_name": "command"}, "stdout_lines": ["ok"]}),
                ),
            ],
        )
        .await;

        assert_eq!(
            reporter(&cb).jobstates(),
            [(StatusTag::Running, "Install".to_string())]
        );
        let uploads = reporter(&cb).uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].name, "Run tests");
        assert_eq!(uploads[0].content, b"ok\n");
        assert_eq!(uploads[0].mime, MIME_TEXT_PLAIN);
        assert!(matches!(
            uploads[0].target,
            FileTarget::JobState { job_id, .. } if job_id == job(JOB)
        ));
    }

    #[tokio::test]
    async fn test_output_before_job_is_known_is_replayed() {
        let mut cb = callback();
        run(
            &mut cb,
            vec![
                play("Prepare", json!({"dci_status": "new"}), json!({})),
                ok(task("Gather", "shell"), json!({"stdout": "early"})),
            ],
        )
        .await;
        assert!(reporter(&cb).calls().is_empty());
        assert_eq!(cb.backlog().backlog_len(), 2);

        run(
            &mut cb,
            vec![play(
                "Run",
                json!({"dci_status": "running"}),
                json!({"jumphost": {"job_informations": {"id": JOB}}}),
            )],
        )
        .await;
        assert_eq!(
            reporter(&cb).outcomes(),
            [
                ("new".to_string(), true),
                ("Gather".to_string(), true),
                ("running".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_status_depends_on_phase() {
        let session = RunSession::preseeded(None, None);
        let mut cb = DciCallback::new(RunBacklog::with_session(session, MockReporter::new()));
        cb.backlog.adopt_job_id(job(JOB)).await;

        run(
            &mut cb,
            vec![
                play("Setup", json!({"dci_status": "pre-run"}), json!({})),
                failed(task("Provision", "command"), false),
            ],
        )
        .await;
        run(
            &mut cb,
            vec![
                play("Tests", json!({"dci_status": "running"}), json!({})),
                failed(task("Check", "command"), false),
            ],
        )
        .await;

        assert_eq!(
            reporter(&cb).jobstates(),
            [
                (StatusTag::PreRun, "Setup".to_string()),
                (StatusTag::Error, "Provision".to_string()),
                (StatusTag::Running, "Tests".to_string()),
                (StatusTag::Failure, "Check".to_string()),
            ]
        );
        assert_eq!(reporter(&cb).uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_every_failure_of_a_preparing_play_is_an_error() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![
                play("Setup", json!({"dci_status": "pre-run"}), json!({})),
                failed_on("h1", task("Provision", "command"), false),
                failed_on("h2", task("Provision", "command"), false),
            ],
        )
        .await;

        assert_eq!(
            reporter(&cb).jobstates(),
            [
                (StatusTag::PreRun, "Setup".to_string()),
                (StatusTag::Error, "Provision".to_string()),
                (StatusTag::Error, "Provision".to_string()),
            ]
        );
        assert_eq!(reporter(&cb).uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_play_without_status_resets_failure_kind() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![
                play("Setup", json!({"dci_status": "new"}), json!({})),
                // No vars at all: still preparing.
                play("Packages", json!({}), json!({})),
                failed(task("Install", "dnf"), false),
                // Vars without a status: no longer preparing.
                play("Checks", json!({"check_mode": true}), json!({})),
                failed(task("Verify", "command"), false),
            ],
        )
        .await;

        assert_eq!(
            reporter(&cb).jobstates(),
            [
                (StatusTag::New, "Setup".to_string()),
                (StatusTag::Error, "Install".to_string()),
                (StatusTag::Failure, "Verify".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_failure_only_uploads() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(&mut cb, vec![failed(task("Optional", "command"), true)]).await;

        assert!(reporter(&cb).jobstates().is_empty());
        let uploads = reporter(&cb).uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].content, b"boom\n");
        // No jobstate yet, the file goes to the job itself.
        assert_eq!(uploads[0].target, FileTarget::Job(job(JOB)));
    }

    #[tokio::test]
    async fn test_upgrade_switches_to_successor_job() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![ok(
                task("Schedule upgrade", "dci_job"),
                json!({
                    "invocation": {"module_args": {"upgrade": true, "update": false}},
                    "job": {"id": NEXT_JOB},
                    "changed": true
                }),
            )],
        )
        .await;

        let calls = reporter(&cb).calls();
        assert!(matches!(
            &calls[0],
            Call::Jobstate { status: StatusTag::PreRun, comment, job_id, ok: true }
                if comment == "starting the update/upgrade" && *job_id == job(NEXT_JOB)
        ));
        assert_eq!(calls[1].target().map(|t| t.job_id()), Some(job(NEXT_JOB)));
        assert_eq!(cb.backlog().session().job_id(), Some(job(NEXT_JOB)));
    }

    #[tokio::test]
    async fn test_setup_task_is_not_uploaded() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![ok(task("Gathering Facts", "setup"), json!({"ansible_facts": {}}))],
        )
        .await;
        assert!(reporter(&cb).calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![PlaybookEvent::RunnerOnUnreachable {
                task: task("Connect", "ping"),
                host: "jumphost".into(),
                result: json!({"msg": "ssh: connection refused"}),
            }],
        )
        .await;

        assert_eq!(
            reporter(&cb).jobstates(),
            [(StatusTag::Failure, "Connect".to_string())]
        );
        assert_eq!(reporter(&cb).uploads()[0].content, b"ssh: connection refused");
    }

    #[tokio::test]
    async fn test_mime_type_and_comment_from_vars() {
        let mut cb = callback();
        cb.backlog.adopt_job_id(job(JOB)).await;
        run(
            &mut cb,
            vec![
                PlaybookEvent::PlayStart {
                    name: "jumphost".into(),
                    hosts: vec!["jumphost".into()],
                    vars: json!({"dci_status": "running", "dci_mime_type": "application/junit"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                    facts: Map::new(),
                },
                ok(task("Results", "command"), json!({"stdout": "<testsuites/>"})),
            ],
        )
        .await;

        // A play named after its hosts has no comment.
        assert_eq!(reporter(&cb).jobstates(), [(StatusTag::Running, String::new())]);
        let upload = &reporter(&cb).uploads()[0];
        assert_eq!(upload.mime, "application/junit");
        assert_eq!(upload.target, FileTarget::Job(job(JOB)));
    }

    #[tokio::test]
    async fn test_stats_close_the_run() {
        let mock = MockReporter::new();
        mock.fail_all_uploads(true);
        let session = RunSession::preseeded(
            Some(job(JOB)),
            Some(JobStateId(Uuid::parse_str(NEXT_JOB).unwrap())),
        );
        let mut cb = DciCallback::new(RunBacklog::with_session(session, mock));
        run(
            &mut cb,
            vec![
                ok(task("Lost", "command"), json!({"stdout": "x"})),
                PlaybookEvent::PlaybookOnStats { stats: json!({}) },
                ok(task("Late", "command"), json!({"stdout": "y"})),
            ],
        )
        .await;

        assert_eq!(cb.unsent().len(), 1);
        assert_eq!(cb.backlog().backlog_len(), 0);
        assert!(reporter(&cb).calls().iter().all(|c| c.label() == "Lost"));
    }

    #[test]
    fn test_event_wire_format() {
        let line = r#"{"event_type": "runner_on_failed", "host": "jumphost",
            "task": {"uuid": "1", "name": "Check", "action": "command"},
            "result": {"rc": 2}, "ignore_errors": true}"#;
        let event: PlaybookEvent = serde_json::from_str(line).unwrap();
        assert!(matches!(
            event,
            PlaybookEvent::RunnerOnFailed { ref task, ignore_errors: true, .. } if task.name == "Check"
        ));

        let stats: PlaybookEvent =
            serde_json::from_str(r#"{"event_type": "playbook_on_stats"}"#).unwrap();
        assert_eq!(stats, PlaybookEvent::PlaybookOnStats { stats: Value::Null });
    }
}
