//! Stage scheduling: fan a stage's targets out and join the results.

use std::future::Future;
use std::sync::Arc;

use drake_core::{Error, Result, Target};
use tracing::debug;

/// Run the targets of one stage.
///
/// In serial mode targets run in order and the first error returns
/// immediately, leaving the rest unstarted. In concurrent mode every
/// target is launched, in source order, as an independent task; the
/// stage returns only once every task has returned, and failures never
/// cancel sibling targets. Errors are aggregated: none is success, one
/// is returned as-is, several become a `MultiError`.
pub async fn run_stage<F, Fut>(targets: &[Arc<Target>], concurrent: bool, mut run: F) -> Result<()>
where
    F: FnMut(Arc<Target>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if !concurrent {
        for target in targets {
            run(Arc::clone(target)).await?;
        }
        return Ok(());
    }

    let mut handles = Vec::with_capacity(targets.len());
    for target in targets {
        debug!(target = %target.name(), "launching target");
        handles.push((
            target.name().to_string(),
            tokio::spawn(run(Arc::clone(target))),
        ));
    }
    let mut errors = Vec::new();
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(err),
            Err(err) => {
                errors.push(Error::engine(format!("task for target \"{name}\" failed"), err));
            }
        }
    }
    match Error::aggregate(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
