//! Transport-independent tracer logic. Both the REST and websocket adapters
//! go through [`TracerService`]; nothing else writes to the store.

mod error;
mod service;

pub use error::{ErrorEnvelope, TracerError};
pub use service::TracerService;
