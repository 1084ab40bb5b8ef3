//! Typed configuration for the `media-worker` binary, read from the
//! environment-style variables enumerated in the worker's operating
//! contract. Follows the `envconfig`-derived `Config` pattern used by
//! `embedding-worker::config::Config` and `hook-api::config::Config`.

use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // -- LLM chat provider --------------------------------------
    #[envconfig(from = "OPENROUTER_API_KEY")]
    pub openrouter_api_key: String,
    #[envconfig(from = "OPENROUTER_BASE_URL", default = "https://openrouter.ai/api/v1")]
    pub openrouter_base_url: String,
    #[envconfig(from = "OPENROUTER_MODEL", default = "openai/gpt-4o-mini")]
    pub openrouter_model: String,
    #[envconfig(from = "OPENROUTER_MAX_RETRIES", default = "3")]
    pub openrouter_max_retries: u32,
    #[envconfig(from = "OPENROUTER_TIMEOUT_MS", default = "60000")]
    pub openrouter_timeout_ms: u64,
    #[envconfig(from = "OPENROUTER_BACKOFF_BASE_MS", default = "250")]
    pub openrouter_backoff_base_ms: u64,
    #[envconfig(from = "OPENROUTER_BACKOFF_JITTER_MS", default = "100")]
    pub openrouter_backoff_jitter_ms: u64,

    // -- Object store -------------------------------------------
    pub s3_endpoint: Option<String>,
    #[envconfig(from = "AWS_REGION", default = "us-east-1")]
    pub aws_region: String,
    #[envconfig(from = "S3_KEY")]
    pub s3_key: String,
    #[envconfig(from = "S3_SECRET")]
    pub s3_secret: String,
    #[envconfig(from = "S3_BUCKET")]
    pub s3_bucket: String,

    // -- Control plane -------------------------------------------
    #[envconfig(from = "API_BASE_URL")]
    pub api_base_url: String,

    // -- Broker wiring. The in-process broker doesn't need these to run;
    // they're accepted so the binary's environment contract matches a
    // production deployment fronted by a durable Redis/BullMQ-compatible
    // backend (see DESIGN.md).
    #[envconfig(from = "REDIS_HOST", default = "localhost")]
    pub redis_host: String,
    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub redis_port: u16,
    #[envconfig(from = "BULL_PREFIX", default = "")]
    pub bull_prefix: String,

    // -- ComfyUI client -------------------------------------------
    #[envconfig(from = "COMFYUI_API_URL")]
    pub comfyui_api_url: String,
    #[envconfig(from = "COMFYUI_CLIENT_ID", default = "influencerai-worker")]
    pub comfyui_client_id: String,
    #[envconfig(from = "COMFYUI_TIMEOUT_MS", default = "120000")]
    pub comfyui_timeout_ms: u64,
    #[envconfig(from = "COMFYUI_POLL_INTERVAL_MS", default = "5000")]
    pub comfyui_poll_interval_ms: u64,
    #[envconfig(from = "COMFYUI_MAX_POLL_ATTEMPTS", default = "120")]
    pub comfyui_max_poll_attempts: u32,
    /// JSON-encoded base workflow payload merged into every video-gen submission.
    pub comfyui_video_workflow_json: Option<String>,
    #[envconfig(from = "COMFYUI_LORAS_DIR", default = "/app/ComfyUI/models/loras")]
    pub comfyui_loras_dir: String,

    // -- FFmpeg runner --------------------------------------------
    #[envconfig(from = "FFMPEG_PATH", default = "ffmpeg")]
    pub ffmpeg_path: String,
    #[envconfig(from = "FFMPEG_ASPECT_RATIO", default = "9:16")]
    pub ffmpeg_aspect_ratio: String,
    #[envconfig(from = "FFMPEG_AUDIO_FILTER", default = "loudnorm=I=-16:TP=-1.5:LRA=11")]
    pub ffmpeg_audio_filter: String,
    #[envconfig(from = "FFMPEG_VIDEO_PRESET", default = "medium")]
    pub ffmpeg_video_preset: String,

    // -- Monitoring endpoint --------------------------------------
    #[envconfig(from = "WORKER_METRICS_PREFIX", default = "influencerai_worker_")]
    pub metrics_prefix: String,
    #[envconfig(from = "BULL_BOARD_HOST", default = "0.0.0.0")]
    pub bull_board_host: String,
    #[envconfig(from = "BULL_BOARD_PORT", default = "3030")]
    pub bull_board_port: u16,
    pub bull_board_user: Option<String>,
    pub bull_board_password: Option<String>,

    // -- Failure alerter ------------------------------------------
    pub alert_webhook_url: Option<String>,
    #[envconfig(from = "ALERT_FAILURE_THRESHOLD", default = "3")]
    pub alert_failure_threshold: u32,

    // -- Queue wiring, see DESIGN.md for the defaults chosen below ------
    /// Whether the `image-generation` queue is wired alongside the other three.
    #[envconfig(from = "IMAGE_GENERATION_ENABLED", default = "true")]
    pub image_generation_enabled: bool,
    /// Per-queue concurrent job cap; the source sets neither explicitly.
    #[envconfig(from = "MAX_CONCURRENT_JOBS_PER_QUEUE", default = "1")]
    pub max_concurrent_jobs_per_queue: usize,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    pub fn bull_board_bind(&self) -> String {
        format!("{}:{}", self.bull_board_host, self.bull_board_port)
    }

    pub fn openrouter_timeout(&self) -> Duration {
        Duration::from_millis(self.openrouter_timeout_ms)
    }

    pub fn comfyui_timeout(&self) -> Duration {
        Duration::from_millis(self.comfyui_timeout_ms)
    }

    pub fn comfyui_poll_interval(&self) -> Duration {
        Duration::from_millis(self.comfyui_poll_interval_ms)
    }
}
