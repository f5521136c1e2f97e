//! Batch processing.
//!
//! [`BatchProcessor`] collects individual inputs and hands them to one
//! batch function in groups, flushing on size or after a short wait, with
//! whole-batch retry and linear backoff.
//!
//! ## Configuration
//!
//! ```toml
//! [batch]
//! max_batch_size = 100
//! max_wait_ms = 50
//! retry_attempts = 3
//! retry_delay_ms = 100
//! ```

mod options;
mod processor;

pub use options::BatchOptions;
pub use processor::{BatchError, BatchProcessor};
