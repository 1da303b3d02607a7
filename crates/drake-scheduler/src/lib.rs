//! Pipeline and stage scheduling for the Drake task runner.
//!
//! Composes pipeline → stage → target execution over either backend:
//! the local container engine or the cluster orchestrator.

pub mod cluster;
pub mod local;
pub mod stage;

pub use cluster::{ClusterExecutor, DEFAULT_CLUSTER_CONFIG_PATH};
pub use local::LocalExecutor;
pub use stage::run_stage;
