//! Client for ComfyUI's HTTP API: submits a workflow, polls `/history`
//! until the job reaches a terminal state, and downloads the produced asset.

mod client;
mod error;
mod history;
mod types;

pub use client::{ComfyClient, ComfyClientConfig};
pub use error::ComfyError;
pub use history::{derive_status, locate_asset, resolve_history_entry, JobOutcome};
pub use types::{AssetBias, AssetRef, PromptOutcome};
