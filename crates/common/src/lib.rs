//! Ambient infrastructure shared by the server: logging setup, a common
//! error type, the pending-request table, and the per-endpoint reply
//! serializer.

pub mod error;
pub mod logging;
pub mod pending;
pub mod reply_fifo;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pending::{PendingTable, RawEndpoint, RemoveOutcome};
pub use reply_fifo::{EndpointReplySerializer, ReplyFuture};
