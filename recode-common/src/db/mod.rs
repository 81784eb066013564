//! Database access for recode
//!
//! Pool initialization and idempotent schema creation. Row-level
//! operations live next to the components that own them (knowledge store,
//! checkpoint) in `recode-batch`.

pub mod init;

pub use init::init_database;
