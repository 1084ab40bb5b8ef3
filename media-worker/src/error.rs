//! The processor-boundary error type. Every processor converts whatever it
//! catches into a `ProcessorError` carrying enough structure to build the
//! `result` object a terminal `patchStatus(failed, ...)` sends, one error
//! enum per crate boundary.

use serde_json::{json, Value};
use thiserror::Error;

use worker_common::job::ValidationError;

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// A required field was missing or out of range. Surfaces before the
    /// `running` transition; the job ends `failed` without side effects.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A collaborator call failed in a way the processor treats as fatal
    /// (LLM call, ComfyUI submission, upload the processor can't proceed
    /// without, subprocess failure, ...).
    #[error("{message}")]
    Collaborator { message: String, stack: Option<String> },
}

impl ProcessorError {
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Collaborator {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    /// Whether this error should skip the `running` transition (payload
    /// validation errors happen-before `running`; everything else happens
    /// during or after it).
    pub fn is_pre_running(&self) -> bool {
        matches!(self, ProcessorError::Validation(_))
    }

    /// The `{message, stack}` result object a terminal `failed` patch carries.
    pub fn to_result_json(&self) -> Value {
        match self {
            ProcessorError::Validation(e) => json!({ "message": e.to_string() }),
            ProcessorError::Collaborator { message, stack } => {
                json!({ "message": message, "stack": stack })
            }
        }
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(err: reqwest::Error) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<worker_common::retry::RetryError> for ProcessorError {
    fn from(err: worker_common::retry::RetryError) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<worker_common::status::StatusError> for ProcessorError {
    fn from(err: worker_common::status::StatusError) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<worker_common::objectstore::ObjectStoreError> for ProcessorError {
    fn from(err: worker_common::objectstore::ObjectStoreError) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<comfy_client::ComfyError> for ProcessorError {
    fn from(err: comfy_client::ComfyError) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<ffmpeg_runner::FfmpegError> for ProcessorError {
    fn from(err: ffmpeg_runner::FfmpegError) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(err: std::io::Error) -> Self {
        ProcessorError::collaborator(err.to_string())
    }
}
