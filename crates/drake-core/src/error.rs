//! Error types for Drake.

use thiserror::Error;

use crate::pipeline::SelectorError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("target \"{target}\" failed with non-zero exit code {code}")]
    TargetFailed { target: String, code: i64 },

    #[error("timed out waiting for pod \"{pod}\" to complete")]
    TimedOut { pod: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Engine(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("error parsing event payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl Error {
    /// Wrap an engine-side failure with the operation and resource it hit.
    pub fn engine(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Engine(format!("{}: {}", context.into(), err))
    }

    /// Collapse the errors collected from a set of concurrent peers.
    ///
    /// Zero errors is success, one error is returned as-is, and more than
    /// one become a [`MultiError`]. Nested `MultiError`s are flattened so
    /// that re-aggregation preserves the set of messages.
    pub fn aggregate(errors: Vec<Error>) -> Option<Error> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Error::Multi(multi) => flat.extend(multi.errors),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Multi(MultiError { errors: flat })),
        }
    }
}

/// Aggregate of failures from targets or pipelines that ran as peers.
#[derive(Debug, Error)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors encountered:", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "\n{}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_success() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_of_one_returns_it_unwrapped() {
        let err = Error::aggregate(vec![Error::Cancelled]).unwrap();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn aggregate_of_many_builds_a_multi_error() {
        let err = Error::aggregate(vec![
            Error::TargetFailed {
                target: "lint".to_string(),
                code: 1,
            },
            Error::Cancelled,
        ])
        .unwrap();
        let Error::Multi(multi) = err else {
            panic!("expected MultiError");
        };
        assert_eq!(multi.errors().len(), 2);
        let rendered = multi.to_string();
        assert!(rendered.starts_with("2 errors encountered:"));
        assert!(rendered.contains("target \"lint\" failed with non-zero exit code 1"));
        assert!(rendered.contains("cancelled"));
    }

    #[test]
    fn reaggregating_a_multi_error_preserves_its_messages() {
        let first = Error::aggregate(vec![
            Error::Cancelled,
            Error::TimedOut {
                pod: "it-stage0-db".to_string(),
            },
        ])
        .unwrap();
        let before = first.to_string();
        let again = Error::aggregate(vec![first]).unwrap();
        assert_eq!(again.to_string(), before);
    }

    #[test]
    fn aggregate_flattens_nested_multi_errors() {
        let inner = Error::aggregate(vec![Error::Cancelled, Error::Cancelled]).unwrap();
        let outer = Error::aggregate(vec![
            inner,
            Error::TargetFailed {
                target: "test".to_string(),
                code: 7,
            },
        ])
        .unwrap();
        let Error::Multi(multi) = outer else {
            panic!("expected MultiError");
        };
        assert_eq!(multi.errors().len(), 3);
        assert!(multi.errors().iter().all(|e| !matches!(e, Error::Multi(_))));
    }
}
