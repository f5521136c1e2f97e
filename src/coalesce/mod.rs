//! Request coalescing.
//!
//! Two flavours share one contract, `coalesce(key, work, options)`:
//!
//! - [`Coalescer`] shares a single in-flight future between callers in this
//!   process, bounded by request age and a per-request caller count
//! - [`DistributedCoalescer`] takes an advisory lock in the shared store; the
//!   holder runs the work and publishes the result, other processes wait and
//!   read it
//!
//! Neither ever aborts the underlying work.
//!
//! ## Configuration
//!
//! ```toml
//! [coalesce]
//! window_ms = 10
//! timeout_ms = 5000
//! max_ref_count = 100
//! cleanup_delay_ms = 100
//! lock_ttl_secs = 30
//! lock_wait_ms = 5000
//! lock_retries = 1
//! lock_prefix = "lock:"
//! ```

mod config;
mod distributed;
mod local;

pub use config::{CoalesceConfig, CoalesceOptions, DistributedOptions};
pub use distributed::{CoalesceError, DistributedCoalescer};
pub use local::Coalescer;
