//! Configuration loading for the Drake task runner.
//!
//! Parses the declarative build document (targets, pipelines, stages,
//! selection criteria) and resolves every stage's target references.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{ConfigError, ConfigResult};
