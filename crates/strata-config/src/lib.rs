//! # Strata Config
//!
//! Configuration management for the Strata cache layer.
//! Supports layered configuration from files, environment variables,
//! and runtime refresh.

mod app_config;
mod error;
mod loader;

pub use app_config::*;
pub use error::*;
pub use loader::*;
