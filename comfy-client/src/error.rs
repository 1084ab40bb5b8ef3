use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComfyError {
    #[error("ComfyUI unreachable at {0}")]
    Unreachable(String),
    #[error("http {status} from ComfyUI: {body}")]
    Http { status: u16, body: String },
    #[error("ComfyUI submit response did not contain a prompt id")]
    MissingPromptId,
    #[error("polling /history/{0} timed out after the configured attempt budget")]
    Timeout(String),
    #[error("ComfyUI job failed: {0}")]
    JobFailed(String),
    #[error("no output asset found in the completed history entry")]
    NoAssetFound,
    #[error("failed to download output asset from {0}: {1}")]
    Download(String, reqwest::Error),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
