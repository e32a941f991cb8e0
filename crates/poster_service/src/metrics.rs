use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use render_pipeline::{JobEvent, JobState, RenderQueue};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Prometheus collectors for the poster service, shared behind an `Arc`.
pub struct Metrics {
    pub registry: Registry,
    /// Area photos successfully located in a reference map.
    pub areas_located_total: IntCounter,
    /// Area requests that fell back to the full city footprint.
    pub area_fallbacks_total: IntCounter,
    pub render_jobs_submitted_total: IntCounter,
    pub render_jobs_completed_total: IntCounter,
    pub render_jobs_failed_total: IntCounter,
    /// Rendered posters that could not be handed to the requester.
    pub deliveries_failed_total: IntCounter,
    /// Jobs queued or in progress.
    pub render_queue_length: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("poster_service".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric?;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            areas_located_total: reg!(IntCounter::new(
                "areas_located_total",
                "Area photos located in a reference map"
            )),
            area_fallbacks_total: reg!(IntCounter::new(
                "area_fallbacks_total",
                "Area requests answered with the full city footprint"
            )),
            render_jobs_submitted_total: reg!(IntCounter::new(
                "render_jobs_submitted_total",
                "Render jobs accepted by the queue"
            )),
            render_jobs_completed_total: reg!(IntCounter::new(
                "render_jobs_completed_total",
                "Render jobs that produced a poster"
            )),
            render_jobs_failed_total: reg!(IntCounter::new(
                "render_jobs_failed_total",
                "Render jobs that ended in the failed state"
            )),
            deliveries_failed_total: reg!(IntCounter::new(
                "deliveries_failed_total",
                "Rendered posters that could not be delivered"
            )),
            render_queue_length: reg!(IntGauge::new(
                "render_queue_length",
                "Render jobs queued or in progress"
            )),
            registry,
        })
    }

    /// Serves the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                        Ok(()) => String::from_utf8_lossy(&buffer).into_owned().into_response(),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode metrics");
                            StatusCode::INTERNAL_SERVER_ERROR.into_response()
                        }
                    }
                }
            }),
        )
    }

    pub fn record(&self, event: &JobEvent) {
        match event {
            JobEvent::Submitted { .. } => self.render_jobs_submitted_total.inc(),
            JobEvent::StateChanged { state: JobState::Done, .. } => self.render_jobs_completed_total.inc(),
            JobEvent::StateChanged { state: JobState::Failed, .. } => self.render_jobs_failed_total.inc(),
            JobEvent::StateChanged { .. } => {}
            JobEvent::DeliveryFailed { .. } => self.deliveries_failed_total.inc(),
        }
    }

    /// Follows the queue's event stream until shutdown.
    pub fn spawn_recorder(
        self: Arc<Self>,
        queue: RenderQueue,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut events = queue.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = events.recv() => match event {
                        Ok(event) => self.record(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Metrics recorder lagged behind job events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
                self.render_queue_length.set(queue.len() as i64);
            }
            tracing::debug!("Metrics recorder stopped.");
        })
    }
}
