//! Pagesgate Core Library
//!
//! This crate provides the pieces shared by every Pagesgate crate:
//! configuration loading and validation, and the top level error type.

pub mod config;
pub mod error;

pub use config::{Config, ConfigLoader, ConfigOverrides};
pub use error::{Error, Result};

/// Pagesgate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
