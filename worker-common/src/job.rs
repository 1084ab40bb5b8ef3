//! Data model shared by every processor: the job envelope, payload variants,
//! progress events, and produced artifacts.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of one of the broker's durable queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    ContentGeneration,
    LoraTraining,
    VideoGeneration,
    ImageGeneration,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ContentGeneration => "content-generation",
            QueueName::LoraTraining => "lora-training",
            QueueName::VideoGeneration => "video-generation",
            QueueName::ImageGeneration => "image-generation",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status on the control-plane state machine: `pending -> running -> {succeeded|failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Stage of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStage {
    Initializing,
    FetchingDataset,
    Running,
    Uploading,
    Completed,
    Failed,
}

/// Which subprocess stream a progress message originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// A single progress event for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: ProgressStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

impl Progress {
    pub fn stage(stage: ProgressStage) -> Self {
        Self {
            stage,
            message: None,
            step: None,
            total_steps: None,
            percent: None,
            source: None,
            logs: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: LogSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// A produced output stored in the object store and surfaced via a time-limited URL.
///
/// Invariant: `key` begins with `"<queue>/<job_id>/"` so artifacts for a job are
/// co-located and listable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub key: String,
    pub url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// The envelope a processor receives from the broker.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// The broker's own identifier, distinct from `job_id`.
    pub broker_id: String,
    /// The control-plane identifier, if one was assigned at enqueue time.
    pub job_id: Option<String>,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub attempt: u32,
}

impl JobRecord {
    /// The identifier to use when namespacing object-store keys: the control-plane
    /// `job_id` if present, else the broker's own id.
    pub fn id_or_broker_id(&self) -> &str {
        self.job_id.as_deref().unwrap_or(&self.broker_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentGenerationPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u32>,
}

impl ContentGenerationPayload {
    pub fn persona(&self) -> Option<&str> {
        self.persona
            .as_deref()
            .or(self.persona_text.as_deref())
    }

    pub fn context(&self) -> String {
        self.context
            .clone()
            .or_else(|| self.theme.clone())
            .unwrap_or_else(|| "general social post".to_string())
    }

    pub fn duration_sec(&self) -> u32 {
        self.duration_sec.unwrap_or(15)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraTrainingPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<LoraTrainingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    #[serde(default)]
    pub kohya_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraTrainingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kohya_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrained_model_name_or_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGenerationPayload {
    pub caption: String,
    pub script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGenerationPayload {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub checkpoint: String,
    pub influencer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub loras: Vec<LoraSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraSpec {
    pub path: String,
    #[serde(default)]
    pub strength_model: Option<f64>,
    #[serde(default)]
    pub strength_clip: Option<f64>,
}

/// Tagged union of the per-queue payload shapes: each queue's loose,
/// optional-field record is modeled as its own explicit variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "kebab-case")]
pub enum JobPayload {
    ContentGeneration(ContentGenerationPayload),
    LoraTraining(Box<LoraTrainingPayload>),
    VideoGeneration(VideoGenerationPayload),
    ImageGeneration(Box<ImageGenerationPayload>),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ContentGeneration(_) => QueueName::ContentGeneration,
            JobPayload::LoraTraining(_) => QueueName::LoraTraining,
            JobPayload::VideoGeneration(_) => QueueName::VideoGeneration,
            JobPayload::ImageGeneration(_) => QueueName::ImageGeneration,
        }
    }
}

/// A field-pathed validation error, e.g. `field = "loras[0].path"`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}
