//! Local root executor: targets and pipelines on the developer
//! workstation.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use drake_config::Config;
use drake_core::{names, secrets, Error, Result, Target};
use drake_executor::TargetRunner;

use crate::stage::run_stage;

/// Executes targets and pipelines against a local container engine. One
/// executor serves one invocation: it mints a single execution name and
/// prefixes every container it creates with it.
pub struct LocalExecutor {
    runner: Arc<dyn TargetRunner>,
}

impl LocalExecutor {
    pub fn new(runner: Arc<dyn TargetRunner>) -> Self {
        Self { runner }
    }

    /// Execute the named targets as one synthetic stage.
    pub async fn run_targets(
        &self,
        token: &CancellationToken,
        config_path: &Path,
        secrets_path: Option<&Path>,
        source_path: &Path,
        target_names: &[String],
        debug_only: bool,
        concurrent: bool,
    ) -> Result<()> {
        let config = Config::from_file(config_path)?;
        let targets = config.targets(target_names)?;
        if debug_only {
            println!("would execute targets: {target_names:?}");
            return Ok(());
        }
        let secrets = load_secrets(secrets_path)?;
        self.runner
            .pull_images(token, &image_union(targets.iter().map(Arc::as_ref)))
            .await?;
        let execution_name = names::execution_name();
        info!(execution = %execution_name, "executing targets");
        let runner = Arc::clone(&self.runner);
        run_stage(&targets, concurrent, |target| {
            let runner = Arc::clone(&runner);
            let token = token.clone();
            let execution = format!("{execution_name}-{}", target.name());
            let source = source_path.to_path_buf();
            let secrets = secrets.clone();
            async move {
                runner
                    .run_target(&token, &execution, &source, &secrets, &target)
                    .await
            }
        })
        .await
    }

    /// Execute the named pipelines in argument order. Pipelines are never
    /// parallelized with one another; within each pipeline, stages run in
    /// order and stop at the first failure.
    pub async fn run_pipelines(
        &self,
        token: &CancellationToken,
        config_path: &Path,
        secrets_path: Option<&Path>,
        source_path: &Path,
        pipeline_names: &[String],
        debug_only: bool,
        concurrent: bool,
    ) -> Result<()> {
        let config = Config::from_file(config_path)?;
        let pipelines = config.pipelines(pipeline_names)?;
        if debug_only {
            println!("would execute:");
            for pipeline in &pipelines {
                let matrix: Vec<Vec<&str>> = pipeline
                    .stages()
                    .iter()
                    .map(|stage| stage.targets().iter().map(|t| t.name()).collect())
                    .collect();
                println!("  {} targets: {matrix:?}", pipeline.name());
            }
            return Ok(());
        }
        let secrets = load_secrets(secrets_path)?;
        let all_targets = pipelines
            .iter()
            .flat_map(|p| p.stages())
            .flat_map(|s| s.targets())
            .map(Arc::as_ref);
        self.runner
            .pull_images(token, &image_union(all_targets))
            .await?;
        let execution_name = names::execution_name();
        for pipeline in &pipelines {
            info!(execution = %execution_name, pipeline = %pipeline.name(), "executing pipeline");
            for (index, stage) in pipeline.stages().iter().enumerate() {
                info!(pipeline = %pipeline.name(), stage = index, "executing stage");
                let stage_prefix = format!("{execution_name}-{}-stage{index}", pipeline.name());
                let runner = Arc::clone(&self.runner);
                run_stage(stage.targets(), concurrent, |target| {
                    let runner = Arc::clone(&runner);
                    let token = token.clone();
                    let execution = format!("{stage_prefix}-{}", target.name());
                    let source = source_path.to_path_buf();
                    let secrets = secrets.clone();
                    async move {
                        runner
                            .run_target(&token, &execution, &source, &secrets, &target)
                            .await
                    }
                })
                .await?;
            }
        }
        Ok(())
    }
}

fn load_secrets(secrets_path: Option<&Path>) -> Result<Vec<String>> {
    match secrets_path {
        None => Ok(Vec::new()),
        Some(path) => secrets::from_file(path).map_err(|e| {
            Error::Config(format!(
                "error reading secrets file {}: {e}",
                path.display()
            ))
        }),
    }
}

/// The deduplicated union of images across the given targets.
fn image_union<'a>(targets: impl Iterator<Item = &'a Target>) -> Vec<String> {
    let mut images = BTreeSet::new();
    for target in targets {
        for container in target.containers() {
            images.insert(container.image.clone());
        }
    }
    images.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;

    const CONFIG: &str = r#"
targets:
  lint:
    containers:
      - name: lint
        image: alpine:latest
        command: echo ok
  test:
    containers:
      - name: test
        image: alpine:latest
        command: echo ok
  package:
    containers:
      - name: package
        image: golang:1.12
pipelines:
  ci:
    stages:
      - targets:
          - lint
          - test
      - targets:
          - package
"#;

    #[derive(Default)]
    struct MockRunner {
        executions: Mutex<Vec<String>>,
        pulled: Mutex<Vec<String>>,
        fail_target: Option<String>,
    }

    #[async_trait]
    impl TargetRunner for MockRunner {
        async fn run_target(
            &self,
            _token: &CancellationToken,
            execution_name: &str,
            _source_path: &Path,
            _secrets: &[String],
            target: &Target,
        ) -> Result<()> {
            self.executions
                .lock()
                .unwrap()
                .push(execution_name.to_string());
            if self.fail_target.as_deref() == Some(target.name()) {
                return Err(Error::TargetFailed {
                    target: target.name().to_string(),
                    code: 7,
                });
            }
            Ok(())
        }

        async fn pull_images(
            &self,
            _token: &CancellationToken,
            images: &[String],
        ) -> Result<()> {
            self.pulled.lock().unwrap().extend(images.iter().cloned());
            Ok(())
        }
    }

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn targets_run_as_one_synthetic_stage() {
        let runner = Arc::new(MockRunner::default());
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        executor
            .run_targets(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["lint".to_string(), "test".to_string()],
                false,
                false,
            )
            .await
            .unwrap();
        let executions = runner.executions.lock().unwrap().clone();
        assert_eq!(executions.len(), 2);
        // Both targets share the invocation's execution name.
        let prefix = executions[0]
            .strip_suffix("-lint")
            .expect("first execution is the lint target");
        assert_eq!(executions[1], format!("{prefix}-test"));
    }

    #[tokio::test]
    async fn images_are_prefetched_once_each() {
        let runner = Arc::new(MockRunner::default());
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        executor
            .run_pipelines(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["ci".to_string()],
                false,
                true,
            )
            .await
            .unwrap();
        let pulled = runner.pulled.lock().unwrap().clone();
        assert_eq!(
            pulled,
            vec!["alpine:latest".to_string(), "golang:1.12".to_string()]
        );
    }

    #[tokio::test]
    async fn pipeline_execution_names_embed_the_stage() {
        let runner = Arc::new(MockRunner::default());
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        executor
            .run_pipelines(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["ci".to_string()],
                false,
                false,
            )
            .await
            .unwrap();
        let executions = runner.executions.lock().unwrap().clone();
        assert_eq!(executions.len(), 3);
        assert!(executions[0].contains("-ci-stage0-lint"));
        assert!(executions[1].contains("-ci-stage0-test"));
        assert!(executions[2].contains("-ci-stage1-package"));
    }

    #[tokio::test]
    async fn a_failing_stage_stops_the_pipeline() {
        let runner = Arc::new(MockRunner {
            fail_target: Some("lint".to_string()),
            ..Default::default()
        });
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        let err = executor
            .run_pipelines(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["ci".to_string()],
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetFailed { code: 7, .. }));
        let executions = runner.executions.lock().unwrap().clone();
        // Stage 0 failed serially at its first target; stage 1 never ran.
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn debug_only_touches_nothing() {
        let runner = Arc::new(MockRunner::default());
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        executor
            .run_targets(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["lint".to_string()],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(runner.executions.lock().unwrap().is_empty());
        assert!(runner.pulled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let runner = Arc::new(MockRunner::default());
        let executor = LocalExecutor::new(Arc::clone(&runner) as Arc<dyn TargetRunner>);
        let file = config_file();
        let err = executor
            .run_targets(
                &CancellationToken::new(),
                file.path(),
                None,
                Path::new("."),
                &["nope".to_string()],
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
