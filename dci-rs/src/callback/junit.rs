//! JUnit report of a playbook run.
//!
//! Every selected task becomes one test case per host:
//!
//! | task outcome                               | test case |
//! |--------------------------------------------|-----------|
//! | ok                                         | pass      |
//! | failed, name contains `EXPECTED FAILURE`   | pass      |
//! | failed, name contains `TOGGLE RESULT`      | pass      |
//! | ok, name contains `TOGGLE RESULT`          | failure   |
//! | failed with an exception                   | error     |
//! | failed otherwise                           | failure   |
//! | skipped                                    | skipped   |

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{info, warn};

use super::{CallbackError, PlaybookCallback, PlaybookEvent, TaskInfo};
use crate::config::JunitConfig;
use crate::formatter::remove_duplicated_content;
use crate::junit::{JunitError, TestCase, TestResult, TestSuite, TestSuites};

const EXPECTED_FAILURE: &str = "EXPECTED FAILURE";
const TOGGLE_RESULT: &str = "TOGGLE RESULT";

/// Actions gathering facts, left out of the report on request.
const SETUP_ACTIONS: [&str; 3] = ["setup", "ansible.builtin.setup", "ansible.legacy.setup"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HostStatus {
    Ok,
    Failed,
    Skipped,
    Included,
}

#[derive(Debug, Clone)]
struct HostData {
    name: String,
    status: HostStatus,
    result: Value,
    /// Concatenated include output, for [`HostStatus::Included`].
    included: String,
    finish: Instant,
}

#[derive(Debug, Clone)]
struct TaskData {
    uuid: String,
    name: String,
    path: Option<String>,
    play: String,
    action: String,
    start: Instant,
    hosts: Vec<HostData>,
}

impl TaskData {
    fn add_host(&mut self, host: HostData) {
        match self.hosts.iter_mut().find(|h| h.name == host.name) {
            Some(existing) if host.status == HostStatus::Included => {
                existing.included = format!("{}\n{}", existing.included, host.included);
                existing.finish = host.finish;
            }
            Some(_) => warn!(
                task = %self.name,
                host = %host.name,
                "Duplicate host callback, keeping the first result"
            ),
            None => self.hosts.push(host),
        }
    }
}

/// Collects task results and writes `<output_dir>/<playbook>.xml` once.
pub struct JunitCallback {
    config: JunitConfig,
    test_case_re: Option<Regex>,
    playbook_name: String,
    play_name: String,
    /// Log directory of the job, from the `job_logs.path` fact.
    job_logs: Option<PathBuf>,
    tasks: Vec<TaskData>,
    report: Option<PathBuf>,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result as JSON without the runner's internal keys or duplicated
/// output lines.
fn dump_result(result: &Value) -> String {
    match &remove_duplicated_content(result) {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !k.starts_with("_ansible") && k.as_str() != "invocation")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(cleaned).to_string()
        }
        other => other.to_string(),
    }
}

/// `path` relative to `base`, both taken lexically.
fn relative_path(path: &str, base: &Path) -> String {
    let path: Vec<Component> = Path::new(path).components().collect();
    let base: Vec<Component> = base.components().collect();
    let common = path
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &path[common..] {
        relative.push(component.as_os_str());
    }
    relative.to_string_lossy().into_owned()
}

fn strip_line_number(classname: &str) -> String {
    static YML_LINE: OnceLock<Regex> = OnceLock::new();
    YML_LINE
        .get_or_init(|| Regex::new(r"\.yml:[0-9]+$").unwrap())
        .replace(classname, "")
        .into_owned()
}

impl JunitCallback {
    pub fn new(config: JunitConfig) -> Result<Self, CallbackError> {
        let test_case_re = if config.test_case_regex.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&config.test_case_regex)
                    .case_insensitive(true)
                    .build()?,
            )
        };
        Ok(JunitCallback {
            config,
            test_case_re,
            playbook_name: String::new(),
            play_name: String::new(),
            job_logs: None,
            tasks: Vec::new(),
            report: None,
        })
    }

    /// Path of the written report, once generated.
    pub fn report(&self) -> Option<&Path> {
        self.report.as_deref()
    }

    fn start_task(&mut self, task: &TaskInfo) -> Result<(), JunitError> {
        if self.tasks.iter().any(|t| t.uuid == task.uuid) {
            return Ok(());
        }

        let mut name = task.name.trim().to_string();
        if !task.no_log && !self.config.hide_task_arguments {
            let args = task
                .args
                .iter()
                .map(|(k, v)| format!("{k}={}", value_text(v)))
                .collect::<Vec<_>>()
                .join(", ");
            if !args.is_empty() {
                name = format!("{name} {args}");
            }
        }

        let generate = !self.config.generate_task_name.is_empty()
            && name.contains(&self.config.generate_task_name);

        self.tasks.push(TaskData {
            uuid: task.uuid.clone(),
            name,
            path: task.path.clone(),
            play: self.play_name.clone(),
            action: task.action.clone(),
            start: Instant::now(),
            hosts: Vec::new(),
        });

        if generate {
            let dir = self.job_logs.clone();
            self.generate_report(dir.as_deref())?;
        }
        Ok(())
    }

    fn finish_task(&mut self, task: &TaskInfo, host: &str, status: HostStatus, result: &Value) {
        let Some(data) = self.tasks.iter_mut().find(|t| t.uuid == task.uuid) else {
            warn!(task = %task.name, "Result for a task that never started");
            return;
        };

        let mut status = status;
        if self.config.fail_on_change
            && status == HostStatus::Ok
            && result.get("changed").and_then(Value::as_bool).unwrap_or(false)
        {
            status = HostStatus::Failed;
        }

        if status == HostStatus::Failed && data.name.contains(EXPECTED_FAILURE) {
            status = HostStatus::Ok;
        } else if data.name.contains(TOGGLE_RESULT) {
            status = match status {
                HostStatus::Failed => HostStatus::Ok,
                HostStatus::Ok => HostStatus::Failed,
                other => other,
            };
        }

        let selected = self
            .test_case_re
            .as_ref()
            .is_some_and(|re| re.is_match(&data.name));
        if selected {
            data.add_host(HostData {
                name: host.to_string(),
                status,
                included: value_text(result),
                result: result.clone(),
                finish: Instant::now(),
            });
        }
    }

    fn classname(&self, task: &TaskData) -> Option<String> {
        let path = task.path.as_deref()?;
        let mut classname = match &self.config.task_relative_path {
            Some(base) => relative_path(path, base),
            None => path.to_string(),
        };
        if let Some(replacement) = &self.config.replace_out_of_tree_path {
            if classname.starts_with("../") {
                let base = Path::new(&classname)
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default();
                classname = format!("{replacement}{base}");
            }
        }
        if self.config.task_class {
            classname = strip_line_number(&classname);
        }
        Some(classname)
    }

    fn build_test_case(&self, task: &TaskData, host: &HostData) -> TestCase {
        let mut case = TestCase {
            classname: self.classname(task),
            time: Some(host.finish.duration_since(task.start).as_secs_f64()),
            ..TestCase::new(format!("[{}] {}: {}", host.name, task.play, task.name))
        };

        let result = &host.result;
        match host.status {
            HostStatus::Included => case.system_out = Some(host.included.clone()),
            HostStatus::Ok => case.system_out = Some(dump_result(result)),
            HostStatus::Failed => {
                let dump = dump_result(result);
                if let Some(exception) = result.get("exception").and_then(Value::as_str) {
                    let message = exception.trim().lines().last().unwrap_or_default();
                    case.errors
                        .push(TestResult::error(message, Some(exception.to_string())));
                } else if let Some(msg) = result.get("msg") {
                    case.failures
                        .push(TestResult::failure(value_text(msg), Some(dump)));
                } else {
                    let rc = result.get("rc").cloned().unwrap_or(Value::from(0));
                    case.failures
                        .push(TestResult::failure(format!("rc={rc}"), Some(dump)));
                }
            }
            HostStatus::Skipped => {
                case.skipped = Some(
                    result
                        .get("skip_reason")
                        .map(value_text)
                        .unwrap_or_else(|| "skipped".to_string()),
                );
            }
        }
        case
    }

    pub fn suites(&self) -> TestSuites {
        let cases = self
            .tasks
            .iter()
            .filter(|t| {
                self.config.include_setup_tasks_in_report
                    || !SETUP_ACTIONS.contains(&t.action.as_str())
            })
            .flat_map(|t| t.hosts.iter().map(move |h| self.build_test_case(t, h)))
            .collect();
        TestSuites {
            name: None,
            suites: vec![TestSuite::new(self.playbook_name.clone(), cases)],
        }
    }

    /// Write the report, unless it was already written.
    fn generate_report(&mut self, dir: Option<&Path>) -> Result<(), JunitError> {
        if self.report.is_some() {
            return Ok(());
        }
        let xml = self.suites().to_pretty_xml()?;
        let dir = dir.unwrap_or(&self.config.output_dir);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.xml", self.playbook_name));
        std::fs::write(&path, xml)?;
        info!(report = %path.display(), "JUnit report written");
        self.report = Some(path);
        Ok(())
    }

    pub fn on_event(&mut self, event: &PlaybookEvent) -> Result<(), JunitError> {
        match event {
            PlaybookEvent::PlaybookStart { file_name } => {
                self.playbook_name = Path::new(file_name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
            PlaybookEvent::PlayStart { name, facts, .. } => {
                self.play_name = name.clone();
                self.job_logs = ["jumphost", "localhost"].iter().find_map(|host| {
                    facts
                        .get(*host)
                        .and_then(|f| f.pointer("/job_logs/path"))
                        .and_then(Value::as_str)
                        .map(PathBuf::from)
                });
            }
            PlaybookEvent::TaskStart { task } => self.start_task(task)?,
            PlaybookEvent::RunnerOnOk { task, host, result } => {
                self.finish_task(task, host, HostStatus::Ok, result)
            }
            PlaybookEvent::RunnerOnFailed {
                task,
                host,
                result,
                ignore_errors,
            } => {
                let status = if *ignore_errors && !self.config.fail_on_ignore {
                    HostStatus::Ok
                } else {
                    HostStatus::Failed
                };
                self.finish_task(task, host, status, result)
            }
            PlaybookEvent::RunnerOnSkipped { task, host, result } => {
                self.finish_task(task, host, HostStatus::Skipped, result)
            }
            PlaybookEvent::PlaybookOnInclude { task, host, result } => {
                self.finish_task(task, host, HostStatus::Included, result)
            }
            PlaybookEvent::PlaybookOnStats { .. } => self.generate_report(None)?,
            PlaybookEvent::RunnerOnUnreachable { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybookCallback for JunitCallback {
    async fn handle(&mut self, event: &PlaybookEvent) -> Result<(), CallbackError> {
        Ok(self.on_event(event)?)
    }
}
