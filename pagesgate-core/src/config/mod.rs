//! Configuration for Pagesgate
//!
//! ⚙️ TOML/JSON file loading, command line overrides and validation.

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::*;
