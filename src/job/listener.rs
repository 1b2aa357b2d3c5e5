//! Per-job event channel and the listener task that drains it.

use super::state::{GenerationResult, JobId};
use crate::error::TemplateError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Callbacks for one job. They run on a dedicated task, in order:
/// `on_started`, any number of `on_progress`, then exactly one terminal
/// callback. A job cancelled before it started only sees `on_cancelled`.
pub trait JobListener: Send + Sync + 'static {
    fn on_started(&self, _job: JobId) {}

    fn on_progress(&self, _job: JobId, _written: u64, _planned: u64) {}

    fn on_completed(&self, _job: JobId, _result: &GenerationResult) {}

    fn on_failed(&self, _job: JobId, _error: &TemplateError) {}

    fn on_cancelled(&self, _job: JobId) {}
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Started,
    Progress { written: u64, planned: u64 },
    Completed(GenerationResult),
    Failed(Arc<TemplateError>),
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed(_) | JobEvent::Failed(_) | JobEvent::Cancelled
        )
    }
}

fn dispatch(listener: &dyn JobListener, job: JobId, event: &JobEvent) {
    match event {
        JobEvent::Started => listener.on_started(job),
        JobEvent::Progress { written, planned } => listener.on_progress(job, *written, *planned),
        JobEvent::Completed(result) => listener.on_completed(job, result),
        JobEvent::Failed(error) => listener.on_failed(job, error),
        JobEvent::Cancelled => listener.on_cancelled(job),
    }
}

/// Spawn the consumer task for `listener`; events sent on the returned
/// channel are delivered in send order.
pub(crate) fn spawn_listener(
    runtime: &Handle,
    job: JobId,
    listener: Arc<dyn JobListener>,
) -> mpsc::UnboundedSender<JobEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
    runtime.spawn(async move {
        while let Some(event) = rx.recv().await {
            trace!(job_id = %job, ?event, "listener event");
            let terminal = event.is_terminal();
            if catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_ref(), job, &event))).is_err() {
                warn!(job_id = %job, "job listener panicked");
            }
            if terminal {
                break;
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl JobListener for Recorder {
        fn on_started(&self, _job: JobId) {
            self.0.lock().push("started".into());
        }

        fn on_progress(&self, _job: JobId, written: u64, _planned: u64) {
            self.0.lock().push(format!("progress:{written}"));
            if written == 2 {
                panic!("listener bug");
            }
        }

        fn on_cancelled(&self, _job: JobId) {
            self.0.lock().push("cancelled".into());
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_stop_after_terminal() {
        let recorder = Arc::new(Recorder::default());
        let tx = spawn_listener(&Handle::current(), JobId::new(), recorder.clone());
        tx.send(JobEvent::Started).unwrap();
        for written in 1..=3 {
            tx.send(JobEvent::Progress { written, planned: 3 }).unwrap();
        }
        tx.send(JobEvent::Cancelled).unwrap();
        tx.closed().await;
        assert!(tx.send(JobEvent::Cancelled).is_err());
        assert_eq!(
            *recorder.0.lock(),
            vec!["started", "progress:1", "progress:2", "progress:3", "cancelled"]
        );
    }
}
