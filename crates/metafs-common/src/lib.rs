//! MetaFS Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, configuration,
//! and the injected clock handle used across the MetaFS metadata-server
//! crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{system_clock, Clock, SystemClock};
pub use config::JournalConfig;
pub use error::{Error, Result};
pub use types::*;
