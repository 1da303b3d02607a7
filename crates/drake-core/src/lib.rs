//! Core domain types for the Drake task runner.
//!
//! This crate contains:
//! - Targets and container specifications
//! - Pipelines, stages, and selection criteria
//! - Repository events and trigger interpretation
//! - Cluster project configuration
//! - The error taxonomy shared across the engine
//! - Execution-name minting and local secrets handling

pub mod error;
pub mod event;
pub mod names;
pub mod pipeline;
pub mod project;
pub mod secrets;
pub mod target;

pub use error::{Error, MultiError, Result};
pub use event::{Event, Revision, TriggerRef};
pub use pipeline::{Criteria, Pipeline, RefSelector, Stage};
pub use project::{ClusterSettings, Project, Repository};
pub use target::{ContainerSpec, Target};
