//! Shared domain types for the wayfind workspace: configuration, the common
//! error type, the confirmation protocol, and log redaction.

pub mod config;
pub mod confirm;
pub mod error;
pub mod redact;

pub use error::{Error, Result};
