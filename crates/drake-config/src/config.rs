//! The root of the Drake configuration tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use drake_core::pipeline::Criteria;
use drake_core::{ContainerSpec, Pipeline, Stage, Target};

use crate::{ConfigError, ConfigResult};

// The on-disk document shape. Entity names live in the map keys and are
// lifted onto the entities during resolution.
#[derive(Debug, Default, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    targets: BTreeMap<String, TargetDoc>,
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct TargetDoc {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineDoc {
    #[serde(default)]
    criteria: Option<Criteria>,
    #[serde(default)]
    stages: Vec<StageDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct StageDoc {
    #[serde(default)]
    targets: Vec<String>,
}

/// The loaded, fully resolved configuration. Read-only after load: every
/// stage holds shared handles to the targets it names.
#[derive(Debug, Clone)]
pub struct Config {
    targets: BTreeMap<String, Arc<Target>>,
    pipelines: BTreeMap<String, Arc<Pipeline>>,
}

impl Config {
    /// Parse and resolve a configuration document.
    ///
    /// Resolution is a second pass over the parsed maps: target names are
    /// lifted from the keys, then every stage's target references are
    /// resolved against the target table. A stage naming a missing target
    /// fails the whole load.
    pub fn from_bytes(bytes: &[u8]) -> ConfigResult<Self> {
        let doc: ConfigDoc = serde_yaml::from_slice(bytes)?;
        let targets: BTreeMap<String, Arc<Target>> = doc
            .targets
            .into_iter()
            .map(|(name, target)| {
                let resolved = Arc::new(Target::new(name.clone(), target.containers));
                (name, resolved)
            })
            .collect();
        let mut pipelines = BTreeMap::new();
        for (name, pipeline) in doc.pipelines {
            let mut stages = Vec::with_capacity(pipeline.stages.len());
            for (index, stage) in pipeline.stages.iter().enumerate() {
                let mut resolved = Vec::with_capacity(stage.targets.len());
                for target_name in &stage.targets {
                    let target = targets.get(target_name).ok_or_else(|| {
                        ConfigError::UndefinedTarget {
                            pipeline: name.clone(),
                            stage: index,
                            target: target_name.clone(),
                        }
                    })?;
                    resolved.push(Arc::clone(target));
                }
                stages.push(Stage::new(resolved));
            }
            let resolved = Arc::new(Pipeline::new(name.clone(), pipeline.criteria, stages));
            pipelines.insert(name, resolved);
        }
        Ok(Self { targets, pipelines })
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Look up targets by name, in the order given.
    pub fn targets(&self, names: &[String]) -> ConfigResult<Vec<Arc<Target>>> {
        names
            .iter()
            .map(|name| {
                self.targets
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::TargetNotFound(name.clone()))
            })
            .collect()
    }

    /// Look up pipelines by name, in the order given.
    pub fn pipelines(&self, names: &[String]) -> ConfigResult<Vec<Arc<Pipeline>>> {
        names
            .iter()
            .map(|name| {
                self.pipelines
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::PipelineNotFound(name.clone()))
            })
            .collect()
    }

    /// All pipelines, ordered by name so that callers see a deterministic
    /// sequence regardless of document order.
    pub fn all_pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.values().cloned().collect()
    }
}
