//! Repository events handled by the cluster executor.

use serde::Deserialize;
use uuid::Uuid;

use crate::Result;

/// A repository event delivered to one build of the cluster executor.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique identifier for the build.
    pub build_id: String,
    /// Identifier of the worker instance handling the build.
    pub worker_id: String,
    /// Event type, e.g. `push` or `check_suite:requested`.
    pub event_type: String,
    /// Name of the event provider, e.g. `github`.
    pub provider: String,
    /// VCS revision details.
    pub revision: Revision,
    /// Raw payload from the original trigger.
    pub payload: Vec<u8>,
}

/// VCS revision details carried by an event.
#[derive(Debug, Clone, Default)]
pub struct Revision {
    /// The VCS commit id.
    pub commit: String,
    /// The full VCS reference, e.g. `refs/heads/master`.
    pub git_ref: String,
}

/// The (branch, tag) pair extracted from a triggering event, used as the
/// input to pipeline selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerRef {
    pub branch: String,
    pub tag: String,
}

#[derive(Debug, Deserialize)]
struct CheckSuiteEvent {
    body: CheckSuiteBody,
}

#[derive(Debug, Deserialize)]
struct CheckSuiteBody {
    check_suite: CheckSuite,
}

#[derive(Debug, Deserialize)]
struct CheckSuite {
    head_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
}

impl Event {
    /// An event with defaults applied; callers override whatever their
    /// environment actually provides.
    pub fn with_defaults() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            build_id: id.clone(),
            worker_id: format!("unknown-{id}"),
            event_type: "ping".to_string(),
            provider: "unknown".to_string(),
            revision: Revision::default(),
            payload: Vec::new(),
        }
    }

    /// Interpret this event as a trigger for pipeline selection.
    ///
    /// Only two event shapes start builds: check suite requests, whose
    /// `head_branch` names the branch (null stands for a pull request and
    /// yields the empty branch), and pushes of new tags. Everything else
    /// returns `None`: nothing to execute.
    pub fn trigger_ref(&self) -> Result<Option<TriggerRef>> {
        match self.event_type.as_str() {
            "check_suite:requested" | "check_suite:rerequested" => {
                let cse: CheckSuiteEvent = serde_json::from_slice(&self.payload)?;
                Ok(Some(TriggerRef {
                    branch: cse.body.check_suite.head_branch.unwrap_or_default(),
                    tag: String::new(),
                }))
            }
            "push" => {
                let pe: PushEvent = serde_json::from_slice(&self.payload)?;
                match pe.git_ref.strip_prefix("refs/tags/") {
                    Some(tag) => Ok(Some(TriggerRef {
                        branch: String::new(),
                        tag: tag.to_string(),
                    })),
                    None => {
                        tracing::info!(
                            git_ref = %pe.git_ref,
                            "push event was not for a new tag, nothing to execute"
                        );
                        Ok(None)
                    }
                }
            }
            other => {
                tracing::info!(event_type = %other, "nothing to execute");
                Ok(None)
            }
        }
    }

    /// The environment passed to every container of every matching
    /// pipeline of this build.
    pub fn pipeline_environment(&self, trigger: &TriggerRef) -> Vec<String> {
        vec![
            format!("DRAKE_SHA1={}", self.revision.commit),
            format!("DRAKE_BRANCH={}", trigger.branch),
            format!("DRAKE_TAG={}", trigger.tag),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(event_type: &str, payload: &str) -> Event {
        Event {
            event_type: event_type.to_string(),
            payload: payload.as_bytes().to_vec(),
            ..Event::with_defaults()
        }
    }

    #[test]
    fn check_suite_with_branch_extracts_it() {
        let ev = event(
            "check_suite:requested",
            r#"{"body": {"check_suite": {"head_branch": "master"}}}"#,
        );
        assert_eq!(
            ev.trigger_ref().unwrap().unwrap(),
            TriggerRef {
                branch: "master".to_string(),
                tag: String::new(),
            }
        );
    }

    #[test]
    fn check_suite_with_null_branch_yields_empty_branch() {
        let ev = event(
            "check_suite:rerequested",
            r#"{"body": {"check_suite": {"head_branch": null}}}"#,
        );
        assert_eq!(ev.trigger_ref().unwrap().unwrap(), TriggerRef::default());
    }

    #[test]
    fn tag_push_extracts_the_tag() {
        let ev = event("push", r#"{"ref": "refs/tags/v1.2.3"}"#);
        assert_eq!(
            ev.trigger_ref().unwrap().unwrap(),
            TriggerRef {
                branch: String::new(),
                tag: "v1.2.3".to_string(),
            }
        );
    }

    #[test]
    fn branch_push_is_a_no_op() {
        let ev = event("push", r#"{"ref": "refs/heads/master"}"#);
        assert!(ev.trigger_ref().unwrap().is_none());
    }

    #[test]
    fn unknown_event_type_is_a_no_op() {
        let ev = event("ping", "{}");
        assert!(ev.trigger_ref().unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let ev = event("push", "not json");
        assert!(ev.trigger_ref().is_err());
    }

    #[test]
    fn pipeline_environment_carries_revision_and_trigger() {
        let mut ev = event("push", r#"{"ref": "refs/tags/v2.0.0"}"#);
        ev.revision.commit = "abc123".to_string();
        let trigger = ev.trigger_ref().unwrap().unwrap();
        let env = ev.pipeline_environment(&trigger);
        assert_eq!(
            env,
            vec![
                "DRAKE_SHA1=abc123".to_string(),
                "DRAKE_BRANCH=".to_string(),
                "DRAKE_TAG=v2.0.0".to_string(),
            ]
        );
    }
}
