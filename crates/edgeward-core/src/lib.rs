//! `edgeward` Core Library
//!
//! Shared functionality for `edgeward` components:
//! - Settings file model and hierarchical resolution
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
