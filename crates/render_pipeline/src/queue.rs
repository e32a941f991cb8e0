use crate::job::{JobId, JobState, RenderJob};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications, mostly for metrics and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Submitted { id: JobId, position: usize },
    StateChanged { id: JobId, state: JobState },
    /// Delivery failed after a successful render; the job still ends `Done`.
    DeliveryFailed { id: JobId, error: String },
}

/// Returned by [`RenderQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: JobId,
    /// Jobs ahead of and including this one at submission time, starting at 1.
    pub position: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("render queue is closed")]
pub struct QueueClosed;

pub(crate) struct Shared {
    outstanding: AtomicUsize,
    next_id: AtomicU64,
    states: DashMap<JobId, JobState>,
    events: broadcast::Sender<JobEvent>,
}

impl Shared {
    pub(crate) fn set_state(&self, id: JobId, state: JobState) {
        self.states.insert(id, state);
        tracing::debug!(job = id.0, state = state.as_str(), "Job state changed");
        let _ = self.events.send(JobEvent::StateChanged { id, state });
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Producer handle. Cheap to clone; every clone feeds the same worker.
#[derive(Clone)]
pub struct RenderQueue {
    tx: mpsc::UnboundedSender<(JobId, RenderJob)>,
    shared: Arc<Shared>,
}

/// Consumer end, owned by the single [`crate::RenderWorker`].
pub struct JobReceiver {
    pub(crate) rx: mpsc::UnboundedReceiver<(JobId, RenderJob)>,
    pub(crate) shared: Arc<Shared>,
}

impl RenderQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            outstanding: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            states: DashMap::new(),
            events,
        });
        (
            Self {
                tx,
                shared: shared.clone(),
            },
            JobReceiver { rx, shared },
        )
    }

    /// Enqueues `job` behind everything already submitted.
    pub fn submit(&self, job: RenderJob) -> Result<Ticket, QueueClosed> {
        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let position = self.shared.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.states.insert(id, JobState::Queued);

        if self.tx.send((id, job)).is_err() {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.shared.states.remove(&id);
            return Err(QueueClosed);
        }

        tracing::info!(job = id.0, position, "Render job queued");
        self.shared.emit(JobEvent::Submitted { id, position });
        Ok(Ticket { id, position })
    }

    /// Jobs queued or in progress.
    pub fn len(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.shared.states.get(&id).map(|s| *s)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CommandTemplate, RenderRequest, RequesterId};

    fn job(color: &str) -> RenderJob {
        CommandTemplate::default().job(RenderRequest {
            shapefile: "a.shp".into(),
            geometry: "a.geojson".into(),
            color: color.into(),
            prefix: "/tmp/p".into(),
            requester: RequesterId(1),
            caption: "c".into(),
            delete_geometry: false,
        })
    }

    #[test]
    fn positions_count_outstanding_jobs() {
        let (queue, _rx) = RenderQueue::new();
        let a = queue.submit(job("black")).unwrap();
        let b = queue.submit(job("white")).unwrap();
        let c = queue.submit(job("coral")).unwrap();
        assert_eq!([a.position, b.position, c.position], [1, 2, 3]);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.state(b.id), Some(JobState::Queued));

        queue.shared.finish();
        assert_eq!(queue.submit(job("black")).unwrap().position, 3);
    }

    #[test]
    fn submit_fails_once_the_worker_is_gone() {
        let (queue, rx) = RenderQueue::new();
        drop(rx);
        assert!(queue.submit(job("black")).is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_submissions() {
        let (queue, _rx) = RenderQueue::new();
        let mut events = queue.subscribe();
        let ticket = queue.submit(job("black")).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::Submitted {
                id: ticket.id,
                position: 1
            }
        );
    }
}
