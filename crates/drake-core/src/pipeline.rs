//! Pipelines, stages, and the selection criteria that gate them.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::target::Target;

/// An ordered list of stages gated by selection criteria.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    criteria: Option<Criteria>,
    stages: Vec<Stage>,
}

/// A set of targets intended to run concurrently.
#[derive(Debug, Clone)]
pub struct Stage {
    targets: Vec<Arc<Target>>,
}

impl Stage {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, criteria: Option<Criteria>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            criteria,
            stages,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Decide whether this pipeline applies to the given (branch, tag)
    /// pair. A pipeline without criteria matches everything.
    pub fn matches(&self, branch: &str, tag: &str) -> Result<bool, SelectorError> {
        match &self.criteria {
            None => Ok(true),
            Some(criteria) => criteria.matches(branch, tag),
        }
    }
}

/// Rule set that determines, from (branch, tag), whether a pipeline
/// applies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    /// A manual-only pipeline never matches an automatic trigger.
    #[serde(default)]
    pub manual_only: bool,
    #[serde(default)]
    pub branches: Option<RefSelector>,
    #[serde(default)]
    pub tags: Option<RefSelector>,
}

/// Whitelist/blacklist of refs. A value delimited by `/` is a regular
/// expression; anything else matches by literal equality.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefSelector {
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Criteria {
    pub fn matches(&self, branch: &str, tag: &str) -> Result<bool, SelectorError> {
        if self.manual_only {
            return Ok(false);
        }
        // A non-empty tag is matched purely on the basis of the tag, so
        // "" is not a valid tag. "" is a valid branch: it stands for a
        // pull request or an otherwise indeterminate ref.
        if !tag.is_empty() {
            return match &self.tags {
                None => Ok(false),
                Some(selector) => selector.matches(tag),
            };
        }
        match &self.branches {
            None => Ok(false),
            Some(selector) => selector.matches(branch),
        }
    }
}

impl RefSelector {
    fn matches(&self, wanted: &str) -> Result<bool, SelectorError> {
        // An empty whitelist is implicitly all-inclusive.
        let mut in_whitelist = self.only.is_empty();
        for candidate in &self.only {
            if ref_match(wanted, candidate)? {
                in_whitelist = true;
                break;
            }
        }
        let mut in_blacklist = false;
        for candidate in &self.ignore {
            if ref_match(wanted, candidate)? {
                in_blacklist = true;
                break;
            }
        }
        Ok(in_whitelist && !in_blacklist)
    }
}

fn ref_match(wanted: &str, value_or_pattern: &str) -> Result<bool, SelectorError> {
    if let Some(pattern) = value_or_pattern
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
    {
        let regex = Regex::new(pattern).map_err(|source| SelectorError {
            pattern: value_or_pattern.to_string(),
            source,
        })?;
        return Ok(regex.is_match(wanted));
    }
    Ok(wanted == value_or_pattern)
}

/// A ref pattern in the selection criteria failed to compile.
#[derive(Debug, Error)]
#[error("error compiling regular expression {pattern}: {source}")]
pub struct SelectorError {
    pattern: String,
    #[source]
    source: regex::Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn pipeline(criteria: Option<Criteria>) -> Pipeline {
        Pipeline::new("ci", criteria, vec![])
    }

    fn branch_selector(only: &[&str], ignore: &[&str]) -> Option<Criteria> {
        Some(Criteria {
            branches: Some(RefSelector {
                only: only.iter().map(|s| s.to_string()).collect(),
                ignore: ignore.iter().map(|s| s.to_string()).collect(),
            }),
            ..Default::default()
        })
    }

    #[test]
    fn no_criteria_matches_everything() {
        let pl = pipeline(None);
        assert!(pl.matches("", "").unwrap());
        assert!(pl.matches("master", "").unwrap());
        assert!(pl.matches("", "v0.0.1").unwrap());
    }

    #[test]
    fn manual_only_never_matches() {
        let pl = pipeline(Some(Criteria {
            manual_only: true,
            branches: Some(RefSelector::default()),
            tags: Some(RefSelector::default()),
        }));
        assert!(!pl.matches("", "").unwrap());
        assert!(!pl.matches("master", "").unwrap());
        assert!(!pl.matches("", "v0.0.1").unwrap());
    }

    #[test]
    fn branch_blacklist_matches_pull_requests() {
        // Blacklist only: empty whitelist passes everything not ignored.
        let pl = pipeline(branch_selector(&[], &["master"]));
        // Looks like a PR
        assert!(pl.matches("", "").unwrap());
        // Looks like a merge to master
        assert!(!pl.matches("master", "").unwrap());
        // Looks like a release: no tag selector, so no match
        assert!(!pl.matches("", "v0.0.1").unwrap());
    }

    #[test]
    fn branch_whitelist_matches_that_branch_only() {
        let pl = pipeline(branch_selector(&["master"], &[]));
        assert!(!pl.matches("", "").unwrap());
        assert!(pl.matches("master", "").unwrap());
        assert!(!pl.matches("", "v0.0.1").unwrap());
    }

    #[test]
    fn tag_whitelist_matches_release_tags() {
        let pl = pipeline(Some(Criteria {
            tags: Some(RefSelector {
                only: vec![r"/v[0-9]+(\.[0-9]+)*(\-.+)?/".to_string()],
                ignore: vec![],
            }),
            ..Default::default()
        }));
        assert!(!pl.matches("", "").unwrap());
        assert!(!pl.matches("master", "").unwrap());
        assert!(pl.matches("", "v0.0.1").unwrap());
        assert!(pl.matches("", "v1.2.3-rc.1").unwrap());
        assert!(!pl.matches("", "latest").unwrap());
    }

    #[test]
    fn literal_refs_do_not_match_as_patterns() {
        let pl = pipeline(branch_selector(&["release-.*"], &[]));
        assert!(!pl.matches("release-1", "").unwrap());
        assert!(pl.matches("release-.*", "").unwrap());
    }

    #[test]
    fn invalid_pattern_propagates_an_error() {
        let pl = pipeline(branch_selector(&["/(/"], &[]));
        let err = pl.matches("master", "").unwrap_err();
        assert!(err.to_string().contains("/(/"));
    }

    #[test]
    fn matching_is_pure() {
        let pl = pipeline(branch_selector(&["master"], &[]));
        for _ in 0..3 {
            assert!(pl.matches("master", "").unwrap());
            assert!(!pl.matches("develop", "").unwrap());
        }
    }

    #[test]
    fn criteria_deserializes_selector_shape() {
        let yaml = r#"
manualOnly: false
branches:
  only:
    - master
  ignore:
    - /wip-.*/
tags: {}
"#;
        let criteria: Criteria = serde_yaml::from_str(yaml).unwrap();
        assert!(!criteria.manual_only);
        let branches = criteria.branches.unwrap();
        assert_eq!(branches.only, vec!["master"]);
        assert_eq!(branches.ignore, vec!["/wip-.*/"]);
        assert!(criteria.tags.unwrap().only.is_empty());
    }

    #[test]
    fn stage_exposes_its_targets_in_order() {
        let stage = Stage::new(vec![
            Arc::new(Target::new("lint", vec![])),
            Arc::new(Target::new("test", vec![])),
        ]);
        let names: Vec<_> = stage.targets().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["lint", "test"]);
    }
}
