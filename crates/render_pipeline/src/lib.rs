//! Render queue for map posters.
//!
//! Producers build a [`RenderJob`] from a [`CommandTemplate`] and push it onto
//! a [`RenderQueue`]. A single [`RenderWorker`] drains the queue in submission
//! order: it runs the external renderer, builds a downscaled preview on a
//! [`CpuPool`] and hands both files to a [`Delivery`] collaborator.

pub mod delivery;
pub mod error;
pub mod job;
pub mod pool;
pub mod preview;
pub mod queue;
pub mod worker;

pub use delivery::{Delivery, OutboxDelivery};
pub use error::{PoolError, RenderError};
pub use job::{output_prefix, CommandTemplate, JobId, JobState, RenderJob, RenderRequest, RequesterId};
pub use pool::CpuPool;
pub use preview::{build_preview, preview_path, DEFAULT_PREVIEW_MAX_DIMENSION};
pub use queue::{JobEvent, JobReceiver, QueueClosed, RenderQueue, Ticket};
pub use worker::{RenderWorker, WorkerConfig};
