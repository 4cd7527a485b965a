//! Data models for the statement mapper.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod params;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionState, DatabaseType, TransactionState};
pub use params::{ParamValue, Params};
pub use value::{Record, Value};
