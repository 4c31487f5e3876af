use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Failure classes that drive the retry policy. Only `TransientIo` is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Unreadable image, malformed event, nothing extractable.
    InvalidInput,
    /// Recognition engine, queue, store or network hiccup.
    TransientIo,
    /// Attempt budget used up.
    Exhausted,
}

/// Pipeline stage where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Event,
    Fetch,
    Decode,
    Normalize,
    Classify,
    Extract,
    Persist,
    Publish,
    WebhookDelivery,
}

/// Error carried across the worker boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} at {stage}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl ToString) -> Self {
        Self {
            kind,
            stage,
            message: message.to_string(),
        }
    }

    pub fn invalid_input(stage: Stage, message: impl ToString) -> Self {
        Self::new(ErrorKind::InvalidInput, stage, message)
    }

    pub fn transient(stage: Stage, message: impl ToString) -> Self {
        Self::new(ErrorKind::TransientIo, stage, message)
    }

    pub fn exhausted(stage: Stage, message: impl ToString) -> Self {
        Self::new(ErrorKind::Exhausted, stage, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::TransientIo
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
