//! Token streams: the per-request channel from runner to HTTP writer,
//! and the manager that owns every live stream.

mod channel;
mod manager;

pub use channel::{CloseReason, CompletionReason, PushOutcome, StreamHandle, StreamReceiver};
pub use manager::{StreamConfig, StreamManager};
