//! Configuration management for the webterm server
//!
//! A single [`ServerConfig`] value is loaded from TOML, overridden by
//! command-line flags, validated once, and then shared read-only.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::*;
