//! Video-generation processor: validates payload, drives the ComfyUI
//! client and the FFmpeg runner, uploads the final video.

use serde_json::json;

use comfy_client::AssetBias;
use ffmpeg_runner::FfmpegRequest;
use graph_workflow::ComfyWorkflow;
use worker_common::job::{JobPayload, JobRecord, JobStatus, ValidationError};
use worker_common::objectstore::BINARY_ASSET_TTL;
use worker_common::status::StatusPatch;

use crate::error::ProcessorError;
use crate::processors::ProcessorContext;

const DEFAULT_DURATION_SEC: u32 = 15;

pub async fn process(ctx: &ProcessorContext, job: &JobRecord) -> Result<(), ProcessorError> {
    let JobPayload::VideoGeneration(payload) = &job.payload else {
        unreachable!("dispatched only for video-generation payloads");
    };
    let job_id = job.id_or_broker_id().to_string();

    let caption = payload.caption.trim().to_string();
    let script = payload.script.trim().to_string();
    if caption.is_empty() {
        let err = ProcessorError::from(ValidationError::new("caption", "must not be empty"));
        return fail(ctx, &job_id, err).await;
    }
    if script.is_empty() {
        let err = ProcessorError::from(ValidationError::new("script", "must not be empty"));
        return fail(ctx, &job_id, err).await;
    }

    ctx.status.patch(&job_id, StatusPatch::status(JobStatus::Running)).await;

    let duration_sec = payload.duration_sec.unwrap_or(DEFAULT_DURATION_SEC);

    match run(ctx, job, &caption, &script, duration_sec).await {
        Ok(result) => {
            ctx.status
                .patch(&job_id, StatusPatch::status(JobStatus::Succeeded).with_result(result))
                .await;
            Ok(())
        }
        Err(err) => fail(ctx, &job_id, err).await,
    }
}

async fn fail(ctx: &ProcessorContext, job_id: &str, err: ProcessorError) -> Result<(), ProcessorError> {
    ctx.status
        .patch(job_id, StatusPatch::status(JobStatus::Failed).with_result(err.to_result_json()))
        .await;
    Err(err)
}

async fn run(
    ctx: &ProcessorContext,
    job: &JobRecord,
    caption: &str,
    script: &str,
    duration_sec: u32,
) -> Result<serde_json::Value, ProcessorError> {
    let job_id = job.id_or_broker_id().to_string();
    let payload = match &job.payload {
        JobPayload::VideoGeneration(p) => p,
        _ => unreachable!(),
    };

    let workflow: ComfyWorkflow = (*ctx.video_base_workflow).clone();

    let metadata = json!({
        "inputs": {
            "caption": caption,
            "script": script,
            "persona": payload.persona,
            "personaText": payload.persona,
            "context": payload.context,
            "durationSec": duration_sec,
        },
        "extra_data": {
            "metadata": {
                "jobId": job.job_id,
                "queueJobId": job.broker_id,
                "caption": caption,
                "script": script,
                "persona": payload.persona,
                "context": payload.context,
                "durationSec": duration_sec,
            }
        }
    });

    let outcome = ctx
        .comfy
        .submit_and_wait(&workflow, metadata, AssetBias::Video)
        .await?;

    let temp_dir = tempfile::Builder::new()
        .prefix("media-worker-video-")
        .tempdir()
        .map_err(|e| ProcessorError::collaborator(format!("failed to create temp dir: {e}")))?;

    let raw_path = temp_dir.path().join("raw.mp4");
    let processed_path = temp_dir.path().join("processed.mp4");

    let process_result = process_video(ctx, &outcome.bytes, &raw_path, &processed_path).await;

    // Temp-directory removal happens after any other use of its contents,
    // on every exit path (success or error).
    let cleanup = tokio::fs::remove_dir_all(temp_dir.path()).await;
    if let Err(e) = cleanup {
        tracing::warn!(job_id, error = %e, "failed to remove temp dir");
    }

    let processed_bytes = process_result?;

    let mut result = json!({
        "comfyJobId": outcome.prompt_id,
        "caption": caption,
        "script": script,
        "context": payload.context,
        "persona": payload.persona,
        "durationSec": duration_sec,
    });

    // Best-effort: a failed upload logs and proceeds without a url.
    let key = format!("video-generation/{job_id}/final.mp4");
    if let Err(e) = ctx.object_store.put_binary(&key, processed_bytes, "video/mp4").await {
        tracing::warn!(job_id, error = %e, "failed to upload final video, proceeding without url");
    } else {
        result["videoKey"] = json!(key);
        match ctx.object_store.signed_get_url(&key, BINARY_ASSET_TTL).await {
            Ok(url) => result["videoUrl"] = json!(url),
            Err(e) => tracing::warn!(job_id, error = %e, "failed to sign final video url"),
        }
    }

    Ok(result)
}

async fn process_video(
    ctx: &ProcessorContext,
    raw_bytes: &[u8],
    raw_path: &std::path::Path,
    processed_path: &std::path::Path,
) -> Result<Vec<u8>, ProcessorError> {
    tokio::fs::write(raw_path, raw_bytes)
        .await
        .map_err(|e| ProcessorError::collaborator(format!("failed to write raw video: {e}")))?;

    ffmpeg_runner::run(&FfmpegRequest {
        input_path: raw_path.to_string_lossy().into_owned(),
        output_path: processed_path.to_string_lossy().into_owned(),
        aspect_ratio: ctx.config.ffmpeg_aspect_ratio.clone(),
        audio_filter: ctx.config.ffmpeg_audio_filter.clone(),
        preset: ctx.config.ffmpeg_video_preset.clone(),
        ffmpeg_path: ctx.config.ffmpeg_path.clone(),
    })
    .await?;

    tokio::fs::read(processed_path)
        .await
        .map_err(|e| ProcessorError::collaborator(format!("failed to read processed video: {e}")))
}
