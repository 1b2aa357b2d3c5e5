mod support;

use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{TestWorkspace, build_template, engine, read_output, sheet1, value};
use tokio::sync::Notify;
use xlsx_template::config::{MissingDataPolicy, StreamingMode};
use xlsx_template::data::DataSource;
use xlsx_template::job::{GenerationResult, JobError, JobId};
use xlsx_template::{
    Destination, JobListener, JobOrchestrator, JobState, MapDataSource, RenderConfig, Template,
    TemplateError,
};

fn rows_template() -> Arc<Template> {
    build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${title}");
        sheet.get_cell_mut("A2").set_value("${repeat(rows, A3:A3, r)}");
        sheet.get_cell_mut("A3").set_value("${r.label}");
    })
}

fn small_data() -> Arc<dyn DataSource> {
    Arc::new(
        MapDataSource::new()
            .with_value("title", "Jobs")
            .with_collection("rows", (0..20).map(|i| json!({"label": i})).collect()),
    )
}

/// Each row takes a millisecond to produce.
fn slow_data(rows: usize) -> Arc<dyn DataSource> {
    Arc::new(
        MapDataSource::new()
            .with_value("title", "Slow")
            .with_lazy_collection("rows", Some(rows), move || {
                Box::new((0..rows).map(|i| {
                    std::thread::sleep(Duration::from_millis(1));
                    json!({"label": i})
                }))
            }),
    )
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    progressed: Notify,
    finished: Notify,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    async fn until_finished(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.finished.notified())
            .await
            .expect("terminal callback");
    }
}

impl JobListener for Recorder {
    fn on_started(&self, _job: JobId) {
        self.events.lock().push("started".into());
    }

    fn on_progress(&self, _job: JobId, _written: u64, _planned: u64) {
        let mut events = self.events.lock();
        if events.last().map(String::as_str) != Some("progress") {
            events.push("progress".into());
        }
        self.progressed.notify_one();
    }

    fn on_completed(&self, _job: JobId, _result: &GenerationResult) {
        self.events.lock().push("completed".into());
        self.finished.notify_one();
    }

    fn on_failed(&self, _job: JobId, _error: &TemplateError) {
        self.events.lock().push("failed".into());
        self.finished.notify_one();
    }

    fn on_cancelled(&self, _job: JobId) {
        self.events.lock().push("cancelled".into());
        self.finished.notify_one();
    }
}

fn orchestrator(config: RenderConfig) -> JobOrchestrator {
    JobOrchestrator::new(engine(config)).expect("inside a runtime")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_returns_the_rendered_bytes() {
    let orchestrator = orchestrator(RenderConfig::default());
    let result = orchestrator
        .generate(rows_template(), small_data(), Destination::Bytes)
        .await
        .expect("job completes");
    assert_eq!(result.rows, 22);

    let book = read_output(result.output.bytes().expect("bytes output"));
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A1"), "Jobs");
    assert_eq!(value(sheet, "A22"), "19");

    let exposition = xlsx_template::metrics::METRICS.encode();
    assert!(exposition.contains("xlsx_template_jobs_submitted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_sees_started_progress_then_one_terminal_event() {
    let workspace = TestWorkspace::new();
    let dir = workspace.out_dir();
    let orchestrator = orchestrator(
        RenderConfig::builder()
            .streaming(StreamingMode::On)
            .progress_interval_rows(5)
            .build(),
    );
    let recorder = Arc::new(Recorder::default());
    let job = orchestrator.submit(
        rows_template(),
        small_data(),
        Destination::Directory {
            dir: dir.clone(),
            base_name: "listened".into(),
        },
        Some(recorder.clone()),
    );

    let result = job.wait().await.expect("job completes");
    recorder.until_finished().await;
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(recorder.events(), vec!["started", "progress", "completed"]);
    assert_eq!(result.output.path(), Some(&dir.join("listened.xlsx")));
    assert_eq!(job.progress(), (22, 22));
    assert!(!job.cancel(), "terminal jobs cannot be cancelled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_job_discards_its_output() {
    let workspace = TestWorkspace::new();
    let dir = workspace.out_dir();
    let orchestrator = orchestrator(
        RenderConfig::builder()
            .streaming(StreamingMode::On)
            .progress_interval_rows(5)
            .build(),
    );
    let recorder = Arc::new(Recorder::default());
    let job = orchestrator.submit(
        rows_template(),
        slow_data(10_000),
        Destination::Directory {
            dir: dir.clone(),
            base_name: "cancelled".into(),
        },
        Some(recorder.clone()),
    );

    tokio::time::timeout(Duration::from_secs(10), recorder.progressed.notified())
        .await
        .expect("job makes progress");
    assert!(job.cancel());

    assert_matches!(job.wait().await, Err(JobError::Cancelled));
    recorder.until_finished().await;
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(recorder.events().last().map(String::as_str), Some("cancelled"));
    assert!(TestWorkspace::files_in(&dir).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_jobs_cancel_without_starting() {
    let orchestrator = orchestrator(
        RenderConfig::builder()
            .max_concurrent_jobs(1)
            .streaming(StreamingMode::On)
            .build(),
    );
    let busy = orchestrator.submit(rows_template(), slow_data(2_000), Destination::Bytes, None);
    tokio::time::timeout(Duration::from_secs(10), async {
        while busy.state() != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first job holds the only slot");
    let recorder = Arc::new(Recorder::default());
    let queued = orchestrator.submit(
        rows_template(),
        small_data(),
        Destination::Bytes,
        Some(recorder.clone()),
    );

    assert!(queued.cancel());
    assert_matches!(queued.wait().await, Err(JobError::Cancelled));
    recorder.until_finished().await;
    assert_eq!(recorder.events(), vec!["cancelled"]);

    busy.cancel();
    assert_matches!(busy.wait().await, Err(JobError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_surface_through_every_adapter() {
    let orchestrator = orchestrator(
        RenderConfig::builder()
            .missing_data(MissingDataPolicy::Throw)
            .build(),
    );
    let recorder = Arc::new(Recorder::default());
    let job = orchestrator.submit(
        rows_template(),
        Arc::new(MapDataSource::new()),
        Destination::Bytes,
        Some(recorder.clone()),
    );

    let blocking = {
        let job = job.clone();
        tokio::task::spawn_blocking(move || job.wait_blocking())
    };
    let via_future = job.result_future().await;
    let via_await = job.clone().await;

    for result in [via_future, via_await, blocking.await.expect("blocking waiter")] {
        assert_matches!(
            result,
            Err(JobError::Failed(err)) if matches!(*err, TemplateError::MissingTemplateData { .. })
        );
    }
    recorder.until_finished().await;
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(recorder.events(), vec!["started", "failed"]);
}
