//! The four job processors. Each owns exactly one job for the
//! duration of processing and shares the broker connection, object store,
//! and chat/ComfyUI/FFmpeg collaborators with the others via `ProcessorContext`.

pub mod content_generation;
pub mod image_generation;
mod kohya;
pub mod lora_training;
pub mod video_generation;

use std::sync::Arc;
use std::time::Duration;

use comfy_client::ComfyClient;
use graph_workflow::ComfyWorkflow;
use worker_common::objectstore::ObjectStore;
use worker_common::progress::ProgressThrottler;
use worker_common::retry::ChatClient;
use worker_common::status::StatusReporter;

use crate::config::Config;

/// Shared, cheaply-cloneable collaborators handed to every processor
/// invocation. None of these are job-specific; job-specific state (temp
/// dirs, progress throttlers) is constructed per call.
#[derive(Clone)]
pub struct ProcessorContext {
    pub status: StatusReporter,
    pub object_store: ObjectStore,
    pub chat: ChatClient,
    pub comfy: Arc<ComfyClient>,
    pub config: Arc<Config>,
    /// The shared base workflow payload from `COMFYUI_VIDEO_WORKFLOW_JSON`,
    /// parsed once at startup. Video-generation clones it per job so
    /// concurrent jobs never share mutation (see DESIGN.md).
    pub video_base_workflow: Arc<ComfyWorkflow>,
}

/// Default progress-throttle window: at most one status patch per job per second.
pub const PROGRESS_WINDOW: Duration = Duration::from_millis(1000);

impl ProcessorContext {
    pub fn progress_throttler(&self, job_id: &str) -> ProgressThrottler {
        ProgressThrottler::new(self.status.clone(), job_id.to_string(), PROGRESS_WINDOW)
    }
}
