//! Hearth: request orchestration primitives that shield an expensive
//! downstream resource from duplicate, bursty or failure-amplified load.
//!
//! - [`cache`]: tagged, stale-while-revalidate cache over a shared store
//! - [`coalesce`]: in-process and cross-process request coalescing
//! - [`batch`]: size/time-triggered batching with whole-batch retry
//!
//! All three report to a [`sink::MetricsSink`] and, where they need shared
//! state, talk to a [`store::SharedStore`].

pub mod batch;
pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod infra;
pub mod sink;
pub mod store;

mod lock;
