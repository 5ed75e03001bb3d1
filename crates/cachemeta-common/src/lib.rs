//! cachemeta Common - Shared types and utilities
//!
//! This crate provides the identifiers, log positions, error definitions
//! and configuration types used across all cachemeta components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
