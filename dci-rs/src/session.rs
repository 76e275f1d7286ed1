//! Job reporting state for one playbook run.
//!
//! Reporting intents (files to attach, status transitions to record) can
//! arrive before the job they belong to is known. [`RunBacklog`] queues them
//! until a job identifier is adopted, then replays them strictly in arrival
//! order. An entry that fails to go out stays at the head of the queue and is
//! retried by the next flush; nothing is skipped, reordered or sent twice.

use std::collections::VecDeque;

use tracing::{debug, info, instrument, warn};

use crate::api::{FileTarget, FileUpload, JobId, JobStateId, StatusTag, MIME_JUNIT};
use crate::client::{StatusReporter, Uploader};
use crate::config::DciConfig;

/// Attempts made on the head entry during a single flush before giving up
/// until the next one.
pub const DEFAULT_ATTEMPTS_PER_FLUSH: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacklogEntry {
    File {
        name: String,
        content: Vec<u8>,
        mime: String,
    },
    Status {
        comment: String,
        status: StatusTag,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No job identifier yet, intents are queued.
    Unbound,
    /// Job identifier known, intents are sent as they arrive.
    Bound,
    /// The playbook run ended.
    Closed,
}

/// Process-wide reporting state of one playbook run.
#[derive(Debug, Clone, Default)]
pub struct RunSession {
    job_id: Option<JobId>,
    jobstate_id: Option<JobStateId>,
    current_status: Option<StatusTag>,
    explicit_mode: bool,
    closed: bool,
    backlog: VecDeque<BacklogEntry>,
}

impl RunSession {
    pub fn new() -> Self {
        RunSession::default()
    }

    /// A session whose identifiers were handed over by an external actor,
    /// e.g. a restarted process resuming a job. A job id puts the session in
    /// explicit mode. A jobstate id alone cannot be reported to and is
    /// dropped, leaving the session to adopt its job as usual.
    pub fn preseeded(job_id: Option<JobId>, jobstate_id: Option<JobStateId>) -> Self {
        let jobstate_id = match (job_id, jobstate_id) {
            (None, Some(jobstate_id)) => {
                warn!(%jobstate_id, "Ignoring jobstate id given without its job id");
                None
            }
            (_, jobstate_id) => jobstate_id,
        };
        RunSession {
            job_id,
            jobstate_id,
            explicit_mode: job_id.is_some(),
            ..Default::default()
        }
    }

    /// Seed from `DCI_JOB_ID` / `DCI_JOBSTATE_ID`.
    pub fn from_config(config: &DciConfig) -> Self {
        RunSession::preseeded(config.job_id.map(JobId), config.jobstate_id.map(JobStateId))
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.job_id.is_some() {
            SessionState::Bound
        } else {
            SessionState::Unbound
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn jobstate_id(&self) -> Option<JobStateId> {
        self.jobstate_id
    }

    pub fn current_status(&self) -> Option<StatusTag> {
        self.current_status
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit_mode
    }

    pub fn backlog(&self) -> impl Iterator<Item = &BacklogEntry> {
        self.backlog.iter()
    }

    fn target_for(&self, job_id: JobId, mime: &str) -> FileTarget {
        match self.jobstate_id {
            Some(jobstate_id) if mime != MIME_JUNIT => FileTarget::JobState {
                job_id,
                jobstate_id,
            },
            _ => FileTarget::Job(job_id),
        }
    }
}

/// Outcome of a flush: how many entries went out, and how many are left.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub remaining: usize,
}

impl FlushReport {
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

pub struct RunBacklog<R> {
    session: RunSession,
    reporter: R,
    attempts_per_flush: u32,
}

impl<R: Uploader + StatusReporter> RunBacklog<R> {
    pub fn new(reporter: R) -> Self {
        RunBacklog::with_session(RunSession::new(), reporter)
    }

    pub fn with_session(session: RunSession, reporter: R) -> Self {
        RunBacklog {
            session,
            reporter,
            attempts_per_flush: DEFAULT_ATTEMPTS_PER_FLUSH,
        }
    }

    /// Number of attempts on a failing entry within one flush (at least 1).
    pub fn with_attempts_per_flush(mut self, attempts: u32) -> Self {
        self.attempts_per_flush = attempts.max(1);
        self
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn backlog_len(&self) -> usize {
        self.session.backlog.len()
    }

    pub fn peek(&self) -> Option<&BacklogEntry> {
        self.session.backlog.front()
    }

    /// Bind the run to `job_id` and flush whatever was queued.
    ///
    /// Ignored in explicit mode. Adopting a different id once bound starts a
    /// fresh logical session on the successor job: the jobstate and current
    /// status are forgotten, queued entries are kept.
    pub async fn adopt_job_id(&mut self, job_id: JobId) -> FlushReport {
        if self.session.closed {
            warn!(%job_id, "Ignoring job id adopted after the run was closed");
            return self.idle();
        }
        if self.session.explicit_mode {
            debug!(%job_id, "Explicit mode, not adopting job id");
            return self.idle();
        }

        match self.session.job_id {
            None => {
                info!(%job_id, queued = self.backlog_len(), "Adopting job id");
                self.session.job_id = Some(job_id);
            }
            Some(current) if current == job_id => {}
            Some(current) => {
                info!(previous = %current, %job_id, "Switching to successor job");
                self.session.job_id = Some(job_id);
                self.session.jobstate_id = None;
                self.session.current_status = None;
            }
        }

        self.flush().await
    }

    /// Hand identifier management over to an external actor. From now on
    /// [`adopt_job_id`](Self::adopt_job_id) and [`set_status`](Self::set_status)
    /// are no-ops.
    pub async fn bind_explicit(
        &mut self,
        job_id: JobId,
        jobstate_id: Option<JobStateId>,
    ) -> FlushReport {
        if self.session.closed {
            warn!(%job_id, "Ignoring explicit job id after the run was closed");
            return self.idle();
        }
        if self.session.job_id != Some(job_id) {
            self.session.jobstate_id = None;
        }
        self.session.explicit_mode = true;
        self.session.job_id = Some(job_id);
        if jobstate_id.is_some() {
            self.session.jobstate_id = jobstate_id;
        }
        self.flush().await
    }

    pub async fn enqueue_file(
        &mut self,
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
        mime: impl Into<String>,
    ) -> FlushReport {
        self.push(BacklogEntry::File {
            name: name.into(),
            content: content.into(),
            mime: mime.into(),
        })
        .await
    }

    /// Record a status transition unconditionally.
    pub async fn enqueue_status(
        &mut self,
        comment: impl Into<String>,
        status: StatusTag,
    ) -> FlushReport {
        self.push(BacklogEntry::Status {
            comment: comment.into(),
            status,
        })
        .await
    }

    /// Move the job to `status`, unless nothing changes: no status, the same
    /// status as the current one, or explicit mode.
    pub async fn set_status(
        &mut self,
        comment: impl Into<String>,
        status: Option<StatusTag>,
    ) -> FlushReport {
        if self.session.explicit_mode {
            return self.idle();
        }
        let Some(status) = status else {
            return self.idle();
        };
        if self.session.current_status == Some(status) {
            debug!(%status, "Status unchanged");
            return self.idle();
        }
        self.session.current_status = Some(status);
        self.enqueue_status(comment, status).await
    }

    /// Record a status inferred from a task outcome. Unlike
    /// [`set_status`](Self::set_status) a repeated status is recorded again,
    /// each failing task gets its own jobstate. Skipped in explicit mode.
    pub async fn record_status(
        &mut self,
        comment: impl Into<String>,
        status: StatusTag,
    ) -> FlushReport {
        if self.session.explicit_mode {
            return self.idle();
        }
        self.session.current_status = Some(status);
        self.enqueue_status(comment, status).await
    }

    /// Send queued entries in order until the queue is empty or an entry
    /// keeps failing. Does nothing while unbound.
    #[instrument(skip(self), fields(job_id = ?self.session.job_id))]
    pub async fn flush(&mut self) -> FlushReport {
        let Some(job_id) = self.session.job_id else {
            return self.idle();
        };

        let mut sent = 0;
        while let Some(entry) = self.session.backlog.front().cloned() {
            if !self.send_with_retry(job_id, &entry).await {
                break;
            }
            self.session.backlog.pop_front();
            sent += 1;
        }

        let report = FlushReport {
            sent,
            remaining: self.backlog_len(),
        };
        if !report.is_drained() {
            warn!(
                sent = report.sent,
                remaining = report.remaining,
                "Backlog not drained, will retry on next flush"
            );
        }
        report
    }

    /// End the run. Entries that never made it out are handed back to the
    /// caller; intents arriving afterwards are dropped.
    pub fn close(&mut self) -> Vec<BacklogEntry> {
        self.session.closed = true;
        let leftover: Vec<_> = self.session.backlog.drain(..).collect();
        if !leftover.is_empty() {
            warn!(lost = leftover.len(), "Run closed with unsent entries");
        }
        leftover
    }

    async fn push(&mut self, entry: BacklogEntry) -> FlushReport {
        if self.session.closed {
            warn!(?entry, "Run closed, dropping entry");
            return self.idle();
        }
        // Always queue first so that a new entry can never overtake one
        // stuck after an earlier failure.
        self.session.backlog.push_back(entry);
        match self.session.state() {
            SessionState::Bound => self.flush().await,
            _ => self.idle(),
        }
    }

    async fn send_with_retry(&mut self, job_id: JobId, entry: &BacklogEntry) -> bool {
        for attempt in 1..=self.attempts_per_flush {
            match self.send(job_id, entry).await {
                Ok(()) => return true,
                Err(err) => warn!(attempt, %err, "Reporting call failed"),
            }
        }
        false
    }

    async fn send(
        &mut self,
        job_id: JobId,
        entry: &BacklogEntry,
    ) -> Result<(), crate::client::ReportError> {
        match entry {
            BacklogEntry::File {
                name,
                content,
                mime,
            } => {
                let upload = FileUpload {
                    name: name.clone(),
                    content: content.clone(),
                    mime: mime.clone(),
                    target: self.session.target_for(job_id, mime),
                };
                self.reporter.upload(&upload).await?;
                debug!(%name, "Uploaded file");
            }
            BacklogEntry::Status { comment, status } => {
                let jobstate_id = self
                    .reporter
                    .create_jobstate(*status, comment, job_id)
                    .await?;
                debug!(%status, %jobstate_id, "Created jobstate");
                self.session.jobstate_id = Some(jobstate_id);
            }
        }
        Ok(())
    }

    fn idle(&self) -> FlushReport {
        FlushReport {
            sent: 0,
            remaining: self.backlog_len(),
        }
    }
}
