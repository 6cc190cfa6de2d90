//! HTTP frontend, connection tracking, and shutdown coordination.

mod connections;
mod http;
mod shutdown;

pub use connections::{ConnectionGuard, ConnectionTracker};
pub use http::{router, ApiError, InferRequestBody, InferResponseBody, PeerAddr};
pub use shutdown::{FlightGuard, ShutdownCoordinator, ShutdownResult};
