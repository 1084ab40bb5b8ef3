//! LoRA-training processor: resolves dataset and config, runs the
//! kohya_ss subprocess, streams parsed progress, uploads the resulting
//! safetensors artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use worker_common::job::{
    Artifact, JobPayload, JobRecord, JobStatus, LoraTrainingConfig, LoraTrainingPayload, Progress,
    ProgressStage, ValidationError,
};
use worker_common::objectstore::BINARY_ASSET_TTL;
use worker_common::status::StatusPatch;

use crate::error::ProcessorError;
use crate::processors::kohya::{self, KohyaCommand};
use crate::processors::ProcessorContext;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

pub async fn process(ctx: &ProcessorContext, job: &JobRecord) -> Result<(), ProcessorError> {
    let JobPayload::LoraTraining(payload) = &job.payload else {
        unreachable!("dispatched only for lora-training payloads");
    };
    let job_id = job.id_or_broker_id().to_string();

    ctx.status.patch(&job_id, StatusPatch::status(JobStatus::Running)).await;

    match run(ctx, &job_id, payload).await {
        Ok(result) => {
            ctx.status
                .patch(&job_id, StatusPatch::status(JobStatus::Succeeded).with_result(result))
                .await;
            Ok(())
        }
        Err(err) => {
            let mut result = err.to_result_json();
            result["progress"] = json!({ "stage": "failed" });
            ctx.status
                .patch(&job_id, StatusPatch::status(JobStatus::Failed).with_result(result))
                .await;
            Err(err)
        }
    }
}

async fn run(
    ctx: &ProcessorContext,
    job_id: &str,
    payload: &LoraTrainingPayload,
) -> Result<serde_json::Value, ProcessorError> {
    let (dataset_path, config) = resolve_dataset_and_config(ctx, payload).await?;

    let output_dir = resolve_output_dir(payload, &config, job_id);
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|e| ProcessorError::collaborator(format!("failed to create output dir: {e}")))?;
    let output_dir_str = output_dir.to_string_lossy().into_owned();

    let command = kohya::build_kohya_command(&config, &payload.kohya_args, &dataset_path, &output_dir_str);

    if payload.dry_run {
        return Ok(json!({
            "progress": { "stage": "completed" },
            "command": command.program,
            "args": command.args,
            "cwd": command.cwd,
        }));
    }

    let timeout = payload
        .timeout_ms
        .or(config.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);

    let throttler = ctx.progress_throttler(job_id);
    throttler
        .schedule(Progress::stage(ProgressStage::Initializing).with_message("starting kohya_ss"))
        .await;

    let outcome = kohya::run(&command, timeout, &throttler).await.map_err(|e| {
        ProcessorError::collaborator(match e {
            kohya::KohyaError::Timeout => "kohya_ss subprocess timed out and was terminated".to_string(),
            other => other.to_string(),
        })
    })?;

    if outcome.exit_code != 0 {
        throttler.flush().await;
        return Err(ProcessorError::collaborator(format!(
            "kohya_ss exited with code {}",
            outcome.exit_code
        )));
    }

    let s3_prefix = payload
        .s3_prefix
        .clone()
        .unwrap_or_else(|| format!("lora-training/{job_id}/"));
    let artifacts = upload_artifacts(ctx, &output_dir, &s3_prefix).await?;

    throttler.flush().await;

    Ok(json!({
        "progress": {
            "stage": "completed",
            "percent": 100,
            "logs": outcome.logs,
        },
        "outputDir": output_dir_str,
        "artifacts": artifacts,
    }))
}

/// Resolve the dataset path and training config, each through its own
/// fallback chain. Config resolution intentionally runs *after* dataset
/// resolution so its final fallback (a bare config carrying only the
/// resolved dataset path) can reference it.
async fn resolve_dataset_and_config(
    ctx: &ProcessorContext,
    payload: &LoraTrainingPayload,
) -> Result<(String, LoraTrainingConfig), ProcessorError> {
    let provided_config = payload.config.clone();

    let dataset_path = if let Some(dataset) = &payload.dataset {
        dataset.clone()
    } else if let Some(path) = &payload.dataset_path {
        path.clone()
    } else if let Some(path) = provided_config.as_ref().and_then(|c| c.dataset_path.clone()) {
        path
    } else {
        let dataset_id = payload.dataset_id.as_deref().ok_or_else(|| {
            ValidationError::new(
                "datasetId",
                "no dataset provided: expected dataset, datasetPath, config.datasetPath, or datasetId",
            )
        })?;
        ctx.status.control_plane().get_dataset(dataset_id).await?.dataset_path
    };

    let config = if let Some(config) = provided_config {
        config
    } else if let Some(config_id) = &payload.config_id {
        ctx.status.control_plane().get_lora_config(config_id).await?.config
    } else {
        LoraTrainingConfig {
            dataset_path: Some(dataset_path.clone()),
            ..Default::default()
        }
    };

    Ok((dataset_path, config))
}

fn resolve_output_dir(payload: &LoraTrainingPayload, config: &LoraTrainingConfig, job_id: &str) -> PathBuf {
    let raw = config.output_path.clone().or_else(|| payload.output_dir.clone()).unwrap_or_else(|| {
        let name = payload.training_name.clone().unwrap_or_else(|| job_id.to_string());
        format!("data/loras/{name}")
    });

    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(path)
    }
}

async fn upload_artifacts(
    ctx: &ProcessorContext,
    output_dir: &Path,
    s3_prefix: &str,
) -> Result<Vec<Artifact>, ProcessorError> {
    let prefix = if s3_prefix.ends_with('/') {
        s3_prefix.to_string()
    } else {
        format!("{s3_prefix}/")
    };

    let mut artifacts = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|e| ProcessorError::collaborator(format!("failed to list output dir: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ProcessorError::collaborator(format!("failed to list output dir: {e}")))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ProcessorError::collaborator(format!("failed to read artifact {filename}: {e}")))?;

        let key = format!("{prefix}{filename}");
        ctx.object_store.put_binary(&key, bytes, "application/octet-stream").await?;
        let url = ctx.object_store.signed_get_url(&key, BINARY_ASSET_TTL).await?;

        artifacts.push(Artifact {
            key,
            url,
            filename,
            meta: None,
        });
    }

    Ok(artifacts)
}
