use crate::delivery::Delivery;
use crate::error::RenderError;
use crate::job::{JobId, JobState, RenderJob};
use crate::pool::CpuPool;
use crate::preview::{build_preview, preview_path, DEFAULT_PREVIEW_MAX_DIMENSION};
use crate::queue::{JobEvent, JobReceiver, Shared};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const PROCESSING_NOTICE: &str = "Your poster is processing now";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub preview_max_dimension: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            preview_max_dimension: DEFAULT_PREVIEW_MAX_DIMENSION,
        }
    }
}

/// The single consumer of a [`crate::RenderQueue`]. Jobs run strictly one at
/// a time, in submission order.
pub struct RenderWorker {
    rx: mpsc::UnboundedReceiver<(JobId, RenderJob)>,
    shared: Arc<Shared>,
    delivery: Arc<dyn Delivery>,
    pool: CpuPool,
    config: WorkerConfig,
}

impl RenderWorker {
    pub fn new(jobs: JobReceiver, delivery: Arc<dyn Delivery>, pool: CpuPool, config: WorkerConfig) -> Self {
        Self {
            rx: jobs.rx,
            shared: jobs.shared,
            delivery,
            pool,
            config,
        }
    }

    /// Runs the worker until every queue handle is dropped or `shutdown` fires.
    /// A job interrupted by shutdown has its renderer process killed.
    pub fn spawn(self, mut shutdown: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Render worker started.");
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown signal received, stopping render worker.");
                }
                _ = self.run() => {
                    tracing::info!("Render queue closed.");
                }
            }
            tracing::info!("Render worker has shut down.");
        })
    }

    pub async fn run(mut self) {
        while let Some((id, job)) = self.rx.recv().await {
            self.process(id, job).await;
            self.shared.finish();
        }
    }

    async fn process(&self, id: JobId, job: RenderJob) {
        let started = Instant::now();
        let wait_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds().max(0);
        tracing::info!(job = id.0, requester = job.requester.0, color = %job.color, wait_ms, "Render job started");

        self.shared.set_state(id, JobState::Running);
        if let Err(e) = self.delivery.notify(job.requester, PROCESSING_NOTICE).await {
            tracing::warn!(job = id.0, error = %e, "Failed to notify requester");
        }

        match self.render(id, &job).await {
            Ok(preview) => {
                self.shared.set_state(id, JobState::Delivering);
                if let Err(e) = self
                    .delivery
                    .deliver(job.requester, &job.output_path, &preview, &job.caption)
                    .await
                {
                    tracing::error!(job = id.0, error = %e, "Delivery failed");
                    self.shared.emit(JobEvent::DeliveryFailed {
                        id,
                        error: format!("{e:#}"),
                    });
                    remove_leftovers(&[&job.output_path, &preview]).await;
                }
                self.shared.set_state(id, JobState::Done);
                tracing::info!(
                    job = id.0,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Render job done"
                );
            }
            Err(e) => {
                tracing::error!(
                    job = id.0,
                    error = %e,
                    subprocess = e.is_subprocess_failure(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Render job failed"
                );
                remove_leftovers(&[&job.output_path, &preview_path(&job.output_path)]).await;
                self.shared.set_state(id, JobState::Failed);
                let text = format!("Sorry, your {} poster could not be rendered", job.color);
                if let Err(e) = self.delivery.notify(job.requester, &text).await {
                    tracing::warn!(job = id.0, error = %e, "Failed to notify requester");
                }
            }
        }

        if job.delete_geometry {
            remove_leftovers(&[&job.geometry_path]).await;
        }
    }

    /// Runs the renderer and builds the preview. Returns the preview path.
    async fn render(&self, id: JobId, job: &RenderJob) -> Result<PathBuf, RenderError> {
        tracing::debug!(job = id.0, command = %job.command, "Running renderer");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(RenderError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(job = id.0, stdout = %stdout.trim_end(), "Renderer output");
        }
        // Renderer warnings land on stderr; only the exit status decides failure.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::warn!(job = id.0, stderr = %stderr.trim_end(), "Renderer wrote to stderr");
        }
        if !output.status.success() {
            return Err(RenderError::Exit(output.status));
        }

        if tokio::fs::metadata(&job.output_path).await.is_err() {
            return Err(RenderError::MissingOutput(job.output_path.clone()));
        }

        let source = job.output_path.clone();
        let max_dimension = self.config.preview_max_dimension;
        let preview = self
            .pool
            .run(move || build_preview(&source, max_dimension))
            .await??;
        Ok(preview)
    }
}

async fn remove_leftovers(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CommandTemplate, RenderRequest, RequesterId};
    use crate::queue::RenderQueue;
    use anyhow::bail;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[derive(Debug, Clone, PartialEq)]
    enum Record {
        Notify(i64, String),
        Deliver { caption: String, artifact: String, preview: String },
    }

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<Record>>,
        fail_caption: Option<String>,
    }

    impl Recorder {
        fn deliveries(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| match r {
                    Record::Deliver { caption, .. } => Some(caption.clone()),
                    _ => None,
                })
                .collect()
        }

        fn records(&self) -> Vec<Record> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn notify(&self, recipient: RequesterId, text: &str) -> anyhow::Result<()> {
            self.records
                .lock()
                .unwrap()
                .push(Record::Notify(recipient.0, text.to_string()));
            Ok(())
        }

        async fn deliver(
            &self,
            _recipient: RequesterId,
            artifact: &Path,
            preview: &Path,
            caption: &str,
        ) -> anyhow::Result<()> {
            if self.fail_caption.as_deref() == Some(caption) {
                bail!("chat is unreachable");
            }
            assert!(artifact.exists() && preview.exists());
            let name = |p: &Path| p.file_name().unwrap().to_string_lossy().into_owned();
            self.records.lock().unwrap().push(Record::Deliver {
                caption: caption.to_string(),
                artifact: name(artifact),
                preview: name(preview),
            });
            std::fs::remove_file(artifact)?;
            std::fs::remove_file(preview)?;
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        shapefile: PathBuf,
        queue: RenderQueue,
        events: broadcast::Receiver<JobEvent>,
        rx: Option<JobReceiver>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            // The fake renderer copies its "shapefile" to the output, so make it a real PNG.
            let shapefile = dir.path().join("base.png");
            RgbImage::from_pixel(40, 20, Rgb([10, 200, 30])).save(&shapefile).unwrap();
            let (queue, rx) = RenderQueue::new();
            let events = queue.subscribe();
            Self {
                dir,
                shapefile,
                queue,
                events,
                rx: Some(rx),
            }
        }

        fn job(&self, template: &str, name: &str, delete_geometry: bool) -> RenderJob {
            let geometry = self.dir.path().join(format!("{name}.geojson"));
            std::fs::write(&geometry, "{}").unwrap();
            CommandTemplate::new(template).job(RenderRequest {
                shapefile: self.shapefile.clone(),
                geometry,
                color: "black".into(),
                prefix: self.dir.path().join(name),
                requester: RequesterId(42),
                caption: name.into(),
                delete_geometry,
            })
        }

        fn start(&mut self, delivery: Arc<Recorder>) -> (watch::Sender<()>, JoinHandle<()>) {
            let worker = RenderWorker::new(
                self.rx.take().unwrap(),
                delivery,
                CpuPool::new(1).unwrap(),
                WorkerConfig {
                    preview_max_dimension: 10,
                },
            );
            let (tx, rx) = watch::channel(());
            (tx, worker.spawn(rx))
        }

        /// Collects events until `n` jobs reached a terminal state.
        async fn settle(&mut self, n: usize) -> Vec<JobEvent> {
            let mut seen = Vec::new();
            let mut terminal = 0;
            while terminal < n {
                let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                    .await
                    .expect("timed out waiting for render jobs")
                    .unwrap();
                if let JobEvent::StateChanged { state, .. } = &event {
                    if state.is_terminal() {
                        terminal += 1;
                    }
                }
                seen.push(event);
            }
            seen
        }
    }

    const COPY: &str = "test -f {shp} && cp {shp} {prefix}_{colors}.png";

    fn final_state(events: &[JobEvent], id: JobId) -> Option<JobState> {
        events.iter().rev().find_map(|e| match e {
            JobEvent::StateChanged { id: i, state } if *i == id && state.is_terminal() => Some(*state),
            _ => None,
        })
    }

    #[tokio::test]
    async fn jobs_are_delivered_in_submission_order() {
        let mut h = Harness::new();
        let slow = format!("sleep 0.3 && {COPY}");
        let a = h.queue.submit(h.job(COPY, "first", true)).unwrap();
        let b = h.queue.submit(h.job(&slow, "second", true)).unwrap();
        let c = h.queue.submit(h.job(COPY, "third", true)).unwrap();
        assert_eq!([a.position, b.position, c.position], [1, 2, 3]);

        let delivery = Arc::new(Recorder::default());
        let _worker = h.start(delivery.clone());
        let events = h.settle(3).await;

        assert_eq!(delivery.deliveries(), ["first", "second", "third"]);
        for t in [a, b, c] {
            assert_eq!(final_state(&events, t.id), Some(JobState::Done));
            assert_eq!(h.queue.state(t.id), Some(JobState::Done));
        }
        assert!(delivery.records().contains(&Record::Deliver {
            caption: "first".into(),
            artifact: "first_black.png".into(),
            preview: "prev_first_black.png".into(),
        }));
        assert!(!h.dir.path().join("second.geojson").exists());
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn state_goes_through_running_and_delivering() {
        let mut h = Harness::new();
        let t = h.queue.submit(h.job(COPY, "only", false)).unwrap();
        let _worker = h.start(Arc::new(Recorder::default()));
        let events = h.settle(1).await;

        let states: Vec<JobState> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::StateChanged { id, state } if *id == t.id => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, [JobState::Running, JobState::Delivering, JobState::Done]);
        assert!(h.dir.path().join("only.geojson").exists(), "kept when not owned by the job");
    }

    #[tokio::test]
    async fn failing_renderer_marks_job_failed_and_cleans_up() {
        let mut h = Harness::new();
        let broken = "test -f /definitely/missing.shp && cp {shp} {prefix}_{colors}.png";
        let t = h.queue.submit(h.job(broken, "broken", true)).unwrap();
        let delivery = Arc::new(Recorder::default());
        let _worker = h.start(delivery.clone());
        let events = h.settle(1).await;

        assert_eq!(final_state(&events, t.id), Some(JobState::Failed));
        assert!(delivery.deliveries().is_empty());
        assert!(!h.dir.path().join("broken.geojson").exists());
        assert!(!h.dir.path().join("prev_broken_black.png").exists());

        let notices: Vec<_> = delivery
            .records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Notify(42, text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0], PROCESSING_NOTICE);
    }

    #[tokio::test]
    async fn stderr_alone_is_not_a_failure() {
        let mut h = Harness::new();
        let noisy = format!("echo 'deprecated option' >&2; {COPY}");
        let t = h.queue.submit(h.job(&noisy, "noisy", true)).unwrap();
        let delivery = Arc::new(Recorder::default());
        let _worker = h.start(delivery.clone());
        let events = h.settle(1).await;

        assert_eq!(final_state(&events, t.id), Some(JobState::Done));
        assert_eq!(delivery.deliveries(), ["noisy"]);
    }

    #[tokio::test]
    async fn missing_or_garbage_output_fails() {
        let mut h = Harness::new();
        let silent = h.queue.submit(h.job("true", "silent", true)).unwrap();
        let garbage = h
            .queue
            .submit(h.job("echo nope > {prefix}_{colors}.png", "garbage", true))
            .unwrap();
        let delivery = Arc::new(Recorder::default());
        let _worker = h.start(delivery.clone());
        let events = h.settle(2).await;

        assert_eq!(final_state(&events, silent.id), Some(JobState::Failed));
        assert_eq!(final_state(&events, garbage.id), Some(JobState::Failed));
        assert!(delivery.deliveries().is_empty());
        assert!(!h.dir.path().join("garbage_black.png").exists());
    }

    #[tokio::test]
    async fn delivery_failure_does_not_stall_the_queue() {
        let mut h = Harness::new();
        let lost = h.queue.submit(h.job(COPY, "lost", true)).unwrap();
        let next = h.queue.submit(h.job(COPY, "next", true)).unwrap();
        let delivery = Arc::new(Recorder {
            fail_caption: Some("lost".into()),
            ..Recorder::default()
        });
        let _worker = h.start(delivery.clone());
        let events = h.settle(2).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, JobEvent::DeliveryFailed { id, .. } if *id == lost.id)));
        assert_eq!(final_state(&events, lost.id), Some(JobState::Done));
        assert_eq!(final_state(&events, next.id), Some(JobState::Done));
        assert_eq!(delivery.deliveries(), ["next"]);
        assert!(!h.dir.path().join("lost_black.png").exists());
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let mut h = Harness::new();
        h.queue.submit(h.job("sleep 30", "stuck", true)).unwrap();
        let (stop, worker) = h.start(Arc::new(Recorder::default()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker ignored shutdown")
            .unwrap();
    }
}
