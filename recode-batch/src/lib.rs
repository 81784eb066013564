//! recode-batch - learning batch media converter
//!
//! Converts whole media libraries to efficient codecs and learns from every
//! attempt: each conversion is recorded, the history is aggregated, and the
//! aggregates drive parameter predictions with a calibrated confidence.
//!
//! Component map:
//! - [`knowledge`] - durable ledger of conversion attempts + derived stats
//!   and the prediction tuner built on top of them
//! - [`monitor`] - system memory sampling with threshold callbacks
//! - [`concurrency`] - adaptive worker-pool sizing
//! - [`pipeline`] - per-file task state machine over a worker pool
//! - [`checkpoint`] - session persistence and idempotent resume
//! - [`tools`] - external converter/validator/characterizer collaborators

pub mod checkpoint;
pub mod concurrency;
pub mod knowledge;
pub mod monitor;
pub mod pipeline;
pub mod report;
pub mod tools;
pub mod types;
