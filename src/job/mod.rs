//! Job Orchestrator: renderings as cancellable, observable background jobs.
//!
//! One execution per job; listener callbacks, `wait_blocking`,
//! `result_future` and `.await` are adapters over the same watch channel.

pub mod listener;
pub mod state;

pub use listener::{JobEvent, JobListener};
pub use state::{
    GeneratedOutput, GenerationResult, JobError, JobId, JobOutcome, JobState, JobStatus,
};

use crate::analyzer::Template;
use crate::data::DataSource;
use crate::error::{Result, TemplateError};
use crate::metrics::METRICS;
use crate::render::{ProgressSink, RenderHooks, TemplateEngine};
use futures::future::{BoxFuture, FutureExt};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a job puts its output.
#[derive(Debug, Clone)]
pub enum Destination {
    Bytes,
    Directory { dir: PathBuf, base_name: String },
}

/// State shared between a job's worker and its handles.
struct JobShared {
    id: JobId,
    status: watch::Sender<JobStatus>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl JobShared {
    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            // the listener task stops after a terminal event
            let _ = events.send(event);
        }
    }

    fn start(&self) -> bool {
        let started = self.status.send_if_modified(|s| s.advance(JobState::Running));
        if started {
            info!(job_id = %self.id, "job started");
            self.emit(JobEvent::Started);
        }
        started
    }

    fn progress(&self, written: u64, planned: u64) {
        self.status.send_modify(|s| {
            s.written = written;
            s.planned = planned;
        });
        self.emit(JobEvent::Progress { written, planned });
    }

    /// Commit a terminal outcome; the first commit wins.
    fn finish(&self, outcome: JobOutcome) -> bool {
        self.commit(outcome, |_| true)
    }

    /// Cancel a job that has not started yet.
    fn cancel_pending(&self) -> bool {
        self.commit(JobOutcome::Cancelled, |state| state == JobState::Pending)
    }

    fn commit(&self, outcome: JobOutcome, allowed: impl Fn(JobState) -> bool) -> bool {
        let event = match &outcome {
            JobOutcome::Completed(result) => JobEvent::Completed(result.clone()),
            JobOutcome::Failed(err) => JobEvent::Failed(Arc::clone(err)),
            JobOutcome::Cancelled => JobEvent::Cancelled,
        };
        let state = outcome.state();
        let committed = self
            .status
            .send_if_modified(|s| allowed(s.state) && s.finish(outcome));
        if committed {
            match &event {
                JobEvent::Failed(err) => {
                    let code = err.code();
                    warn!(
                        job_id = %self.id,
                        error = %err,
                        code = %code,
                        retryable = code.is_retryable(),
                        "job failed"
                    );
                    METRICS.record_job_failure(code.category());
                }
                _ => info!(job_id = %self.id, state = %state, "job finished"),
            }
            METRICS.record_job_finished(&state.to_string());
            self.emit(event);
        }
        committed
    }
}

/// Handle to a submitted job. Clones observe the same job.
#[derive(Clone)]
pub struct GenerationJob {
    shared: Arc<JobShared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for GenerationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationJob")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl GenerationJob {
    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        self.shared.status.borrow().state
    }

    /// `(rows_written, planned_rows)` as last reported.
    pub fn progress(&self) -> (u64, u64) {
        let status = self.shared.status.borrow();
        (status.written, status.planned)
    }

    pub fn status(&self) -> JobStatus {
        self.shared.status.borrow().clone()
    }

    /// Request cancellation. Returns `false` when the job already reached a
    /// terminal state. A pending job is cancelled at once; a running one
    /// stops after its current row.
    pub fn cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancel.cancel();
        if self.shared.cancel_pending() {
            debug!(job_id = %self.shared.id, "pending job cancelled");
        }
        true
    }

    pub async fn wait(&self) -> Result<GenerationResult, JobError> {
        let mut status = self.shared.status.subscribe();
        let outcome = match status.wait_for(|s| s.outcome.is_some()).await {
            Ok(status) => status.outcome.clone(),
            Err(_) => None,
        };
        outcome
            .map(JobOutcome::into_result)
            .unwrap_or(Err(JobError::Cancelled))
    }

    /// Block the calling thread until the job is terminal. Must not be
    /// called from inside an async task.
    pub fn wait_blocking(&self) -> Result<GenerationResult, JobError> {
        futures::executor::block_on(self.wait())
    }

    pub fn result_future(&self) -> BoxFuture<'static, Result<GenerationResult, JobError>> {
        let job = self.clone();
        async move { job.wait().await }.boxed()
    }
}

impl IntoFuture for GenerationJob {
    type Output = Result<GenerationResult, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.result_future()
    }
}

/// Runs renderings on a shared worker pool, bounded by
/// `max_concurrent_jobs`.
#[derive(Clone)]
pub struct JobOrchestrator {
    engine: TemplateEngine,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl JobOrchestrator {
    /// Must be called from within a tokio runtime.
    pub fn new(engine: TemplateEngine) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| TemplateError::config("JobOrchestrator needs a running tokio runtime"))?;
        Ok(Self::with_runtime(engine, runtime))
    }

    pub fn with_runtime(engine: TemplateEngine, runtime: Handle) -> Self {
        let permits = Arc::new(Semaphore::new(engine.config().max_concurrent_jobs));
        Self {
            engine,
            permits,
            runtime,
        }
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    /// Schedule a rendering and return immediately.
    pub fn submit(
        &self,
        template: Arc<Template>,
        data: Arc<dyn DataSource>,
        destination: Destination,
        listener: Option<Arc<dyn JobListener>>,
    ) -> GenerationJob {
        let id = JobId::new();
        let (status, _) = watch::channel(JobStatus::pending());
        let events = listener.map(|l| listener::spawn_listener(&self.runtime, id, l));
        let shared = Arc::new(JobShared { id, status, events });
        let cancel = CancellationToken::new();
        METRICS.record_job_submitted();
        info!(job_id = %id, ?destination, "job submitted");

        let worker = Worker {
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            engine: self.engine.clone(),
            permits: Arc::clone(&self.permits),
        };
        self.runtime
            .spawn(worker.run(template, data, destination));
        GenerationJob { shared, cancel }
    }

    /// Async entry point: submit and await the result.
    pub async fn generate(
        &self,
        template: Arc<Template>,
        data: Arc<dyn DataSource>,
        destination: Destination,
    ) -> Result<GenerationResult, JobError> {
        self.submit(template, data, destination, None).await
    }
}

struct Worker {
    shared: Arc<JobShared>,
    cancel: CancellationToken,
    engine: TemplateEngine,
    permits: Arc<Semaphore>,
}

impl Worker {
    async fn run(self, template: Arc<Template>, data: Arc<dyn DataSource>, destination: Destination) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
            _ = self.cancel.cancelled() => {
                self.shared.finish(JobOutcome::Cancelled);
                return;
            }
        };
        let Ok(_permit) = permit else {
            self.shared.finish(JobOutcome::Failed(Arc::new(TemplateError::Internal {
                message: "worker pool closed".into(),
            })));
            return;
        };
        if !self.shared.start() {
            debug!(job_id = %self.shared.id, "job ended before it started");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let engine = self.engine.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let progress = |written: u64, planned: u64| shared.progress(written, planned);
            let hooks = RenderHooks {
                progress: Some(&progress as &dyn ProgressSink),
                cancel: Some(&cancel),
            };
            match destination {
                Destination::Bytes => engine
                    .render_with(&template, data.as_ref(), hooks)
                    .map(|(bytes, report)| {
                        GenerationResult::new(GeneratedOutput::Bytes(Arc::new(bytes)), report)
                    }),
                Destination::Directory { dir, base_name } => engine
                    .render_to_file_with(&template, data.as_ref(), &dir, &base_name, hooks)
                    .map(|(path, report)| GenerationResult::new(GeneratedOutput::File(path), report)),
            }
        })
        .await;

        let outcome = match joined {
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(err)) if err.is_cancelled() => JobOutcome::Cancelled,
            Ok(Err(err)) => JobOutcome::Failed(Arc::new(err)),
            Err(join) => {
                let message = if join.is_panic() {
                    "rendering panicked".to_string()
                } else {
                    format!("rendering task aborted: {join}")
                };
                error!(job_id = %self.shared.id, "{message}");
                JobOutcome::Failed(Arc::new(TemplateError::Internal { message }))
            }
        };
        self.shared.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terminal_commit_wins() {
        let (status, _) = watch::channel(JobStatus::pending());
        let shared = JobShared {
            id: JobId::new(),
            status,
            events: None,
        };
        assert!(shared.start());
        assert!(shared.finish(JobOutcome::Cancelled));
        assert!(!shared.finish(JobOutcome::Failed(Arc::new(TemplateError::Cancelled))));
        assert_eq!(shared.status.borrow().state, JobState::Cancelled);
    }
}
