//! Runtime bootstrap: telemetry, store selection and the binary's error type.

pub mod error;
pub mod store;
pub mod telemetry;
