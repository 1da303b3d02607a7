//! Check notifications for cluster builds.
//!
//! The actual client to the code-hosting provider lives outside the
//! engine; the executor only needs a seam to report target progress
//! through.

use async_trait::async_trait;
use tracing::info;

use drake_core::{Event, Result};

/// Final disposition of a target, reported with the completed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for Conclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reports per-target check runs to the event's provider.
#[async_trait]
pub trait CheckNotifier: Send + Sync {
    /// Report that a target has started. An error here aborts the
    /// target before any pod is created.
    async fn check_started(&self, event: &Event, name: &str) -> Result<()>;

    /// Report a target's conclusion. Best-effort: callers log failures
    /// and keep the target's own outcome.
    async fn check_completed(&self, event: &Event, name: &str, conclusion: Conclusion)
        -> Result<()>;
}

/// Notifier that records checks in the worker log only.
pub struct LogNotifier;

#[async_trait]
impl CheckNotifier for LogNotifier {
    async fn check_started(&self, event: &Event, name: &str) -> Result<()> {
        info!(build = %event.build_id, check = %name, "check in_progress");
        Ok(())
    }

    async fn check_completed(
        &self,
        event: &Event,
        name: &str,
        conclusion: Conclusion,
    ) -> Result<()> {
        info!(build = %event.build_id, check = %name, conclusion = %conclusion, "check completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conclusions_render_as_provider_strings() {
        assert_eq!(Conclusion::Success.as_str(), "success");
        assert_eq!(Conclusion::Failure.as_str(), "failure");
        assert_eq!(Conclusion::Cancelled.as_str(), "cancelled");
        assert_eq!(Conclusion::TimedOut.as_str(), "timed_out");
    }
}
