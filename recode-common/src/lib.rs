//! Shared substrate for the recode batch converter
//!
//! Holds the pieces every recode crate needs: the common error type, TOML
//! configuration resolution, SQLite initialization with the knowledge
//! schema, and the batch event bus.

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
