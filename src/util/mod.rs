//! Shared helpers (error taxonomy, retry policies).

pub mod error;
pub mod retry;

pub use error::{LogError, LogResult};
pub use retry::{RetryHandle, RetryPolicy};
