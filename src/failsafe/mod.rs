//! Failsafe mechanisms: retry with exponential backoff

mod retry;

pub use retry::{RetryPolicy, with_retry};
