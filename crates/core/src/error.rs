//! Error taxonomy and the requeue outcome.

use std::time::Duration;

/// Failures talking to the desired-state store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("api: {0}")]
    Api(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster {0} not found")]
    RootNotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("transformer {transformer}: {message}")]
    Transform { transformer: &'static str, message: String },
    #[error("dependency graph: {0}")]
    Graph(String),
    #[error("sidecar: {0}")]
    Ops(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn transform(transformer: &'static str, message: impl Into<String>) -> Self {
        Self::Transform { transformer, message: message.into() }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a reconciliation pass ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Everything staged was applied; wait for the next change or resync.
    Settled,
    /// Work is in flight (data clone, member change); look again after `after`.
    RequeueAfter { after: Duration, reason: String },
}

impl Outcome {
    pub fn requeue(after: Duration, reason: impl Into<String>) -> Self {
        Self::RequeueAfter { after, reason: reason.into() }
    }

    /// Combine two outcomes: any requeue wins, the earliest one when both ask.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Settled, o) | (o, Outcome::Settled) => o,
            (a @ Outcome::RequeueAfter { after: x, .. }, b @ Outcome::RequeueAfter { after: y, .. }) => {
                if y < x { b } else { a }
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Outcome::Settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_earliest_requeue() {
        let a = Outcome::requeue(Duration::from_secs(10), "clone");
        let b = Outcome::requeue(Duration::from_secs(3), "join");
        assert_eq!(a.clone().merge(b.clone()), b);
        assert_eq!(Outcome::Settled.merge(a.clone()), a);
        assert!(Outcome::Settled.merge(Outcome::Settled).is_settled());
    }

    #[test]
    fn conflict_classifier_sees_through_store_errors() {
        let e: Error = StoreError::Conflict("rv".into()).into();
        assert!(e.is_conflict());
        assert!(!Error::Validation("x".into()).is_conflict());
    }
}
