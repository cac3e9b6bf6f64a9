//! Pagesgate Listeners
//!
//! The plain HTTP listener (HTTP-01 answers, HTTPS redirects) and the HTTPS
//! listener that terminates TLS with on-demand certificates.

pub mod https;
pub mod plain;

pub use https::{FallbackHandler, HttpsServer, PageHandler};
pub use plain::HttpServer;
