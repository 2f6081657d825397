//! Shared domain types for dispatch.
//!
//! These types cross process boundaries: they are persisted by every queue
//! backend, streamed to event observers and returned by the HTTP surface.

pub mod events;
pub mod job;
pub mod metrics;

pub use events::{JobEvent, JobEventKind, JobPhase};
pub use job::{BOARD_CARD_KEY, DELIVERY_ID_KEY, Job, JobId, JobPayload, JobStatus, PayloadError, now};
pub use metrics::{LatencySummary, QueueMetrics};
