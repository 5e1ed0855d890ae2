pub mod config;
pub mod handlers;
pub mod protocol;

pub use config::WorkerConfig;
pub use protocol::{Request, Response, WorkerError, WorkerSession};
