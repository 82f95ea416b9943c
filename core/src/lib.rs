pub mod config;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use retry::{retry, RetryPolicy};
