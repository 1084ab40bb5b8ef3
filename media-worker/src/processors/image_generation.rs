//! Image-generation processor: builds a ComfyUI graph with optional
//! LoRAs, drives the ComfyUI client, uploads the image, and creates an
//! asset record.
//!
//! Validation order matters: required-field and LoRA-existence checks run
//! *before* `patchStatus(running)` so a bad payload never transitions the
//! job into running.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use comfy_client::AssetBias;
use graph_workflow::{
    build_image_workflow, check_exists, resolve_lora_path, resolve_seed, validate_params,
    validate_structure, ImageGenParams, LoRAConfig, LoraParam,
};
use worker_common::job::{ImageGenerationPayload, JobPayload, JobRecord, JobStatus, ValidationError};
use worker_common::objectstore::BINARY_ASSET_TTL;
use worker_common::status::{CreateAssetRequest, StatusPatch};

use crate::error::ProcessorError;
use crate::processors::ProcessorContext;

/// Full-strength default applied when a LoRA entry omits one of the
/// strength fields (see DESIGN.md).
const DEFAULT_LORA_STRENGTH: f64 = 100.0;

pub async fn process(ctx: &ProcessorContext, job: &JobRecord) -> Result<(), ProcessorError> {
    let JobPayload::ImageGeneration(payload) = &job.payload else {
        unreachable!("dispatched only for image-generation payloads");
    };
    let job_id = job.id_or_broker_id().to_string();

    if let Err(err) = validate_payload(payload) {
        return fail(ctx, &job_id, err).await;
    }

    ctx.status.patch(&job_id, StatusPatch::status(JobStatus::Running)).await;

    match run(ctx, &job_id, payload).await {
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
    let result = match &err {
        ProcessorError::Validation(e) => json!({ "error": e.to_string() }),
        ProcessorError::Collaborator { message, .. } => json!({ "error": message }),
    };
    ctx.status
        .patch(job_id, StatusPatch::status(JobStatus::Failed).with_result(result))
        .await;
    Err(err)
}

/// Required-field and (when the dependency is locally available) LoRA
/// existence checks, run before the `running` transition.
fn validate_payload(payload: &ImageGenerationPayload) -> Result<(), ProcessorError> {
    if payload.prompt.trim().is_empty() {
        return Err(ValidationError::new("prompt", "must not be empty").into());
    }
    if payload.checkpoint.trim().is_empty() {
        return Err(ValidationError::new("checkpoint", "must not be empty").into());
    }
    if payload.influencer_id.trim().is_empty() {
        return Err(ValidationError::new("influencerId", "must not be empty").into());
    }

    let params = to_image_gen_params(payload);
    if let Err(errors) = validate_params(&params) {
        let first = errors.into_iter().next().expect("non-empty error list");
        return Err(ValidationError::new(first.field, first.message).into());
    }

    for (i, lora) in payload.loras.iter().enumerate() {
        let resolved = resolve_lora_path(&lora.path)
            .map_err(|e| ValidationError::new(format!("loras[{i}].path"), e.to_string()))?;
        if check_exists(&resolved).is_err() {
            return Err(ValidationError::new(
                format!("loras[{i}].path"),
                format!("lora file not found: {resolved}"),
            )
            .into());
        }
    }

    Ok(())
}

fn to_image_gen_params(payload: &ImageGenerationPayload) -> ImageGenParams {
    ImageGenParams {
        prompt: payload.prompt.clone(),
        negative_prompt: payload.negative_prompt.clone(),
        checkpoint: payload.checkpoint.clone(),
        width: payload.width,
        height: payload.height,
        steps: payload.steps,
        cfg: payload.cfg,
        seed: payload.seed,
        sampler: payload.sampler.clone(),
        scheduler: payload.scheduler.clone(),
        loras: payload
            .loras
            .iter()
            .map(|l| LoraParam {
                path: l.path.clone(),
                strength_model: l.strength_model.unwrap_or(DEFAULT_LORA_STRENGTH),
                strength_clip: l.strength_clip.unwrap_or(DEFAULT_LORA_STRENGTH),
            })
            .collect(),
    }
}

async fn run(
    ctx: &ProcessorContext,
    job_id: &str,
    payload: &ImageGenerationPayload,
) -> Result<serde_json::Value, ProcessorError> {
    let mut params = to_image_gen_params(payload);
    // Resolve the seed once, up front, so the value recorded in the asset's
    // metadata below is the exact seed the built workflow ends up using
    // (the builder would otherwise roll its own if this were left `None`).
    params.seed = Some(resolve_seed(params.seed));

    let loras: Vec<LoRAConfig> = params
        .loras
        .iter()
        .map(|l| LoRAConfig {
            path: resolve_lora_path(&l.path).expect("already validated"),
            strength_model: l.strength_model,
            strength_clip: l.strength_clip,
        })
        .collect();

    let workflow = build_image_workflow(&params, loras.clone());
    validate_structure(&workflow)
        .map_err(|e| ProcessorError::collaborator(format!("built an invalid workflow: {e:?}")))?;

    let metadata = json!({ "extra_data": { "metadata": { "jobId": job_id } } });

    let outcome = ctx
        .comfy
        .submit_and_wait(&workflow, metadata, AssetBias::Image)
        .await?;

    let seed = params.seed.expect("resolved above");
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis();
    let key = format!("{}/{}-{}.png", payload.influencer_id, unix_ms, seed);

    // Fatal in image-gen: an upload failure blocks completion.
    ctx.object_store
        .put_binary(&key, outcome.bytes, "image/png")
        .await?;
    let url = ctx.object_store.signed_get_url(&key, BINARY_ASSET_TTL).await?;

    let lora_used: Vec<String> = loras.iter().map(|l| l.path.clone()).collect();
    let meta = json!({
        "prompt": payload.prompt,
        "seed": seed,
        "cfgScale": params.cfg,
        "steps": params.steps,
        "loraUsed": lora_used,
        "width": params.width,
        "height": params.height,
        "checkpoint": payload.checkpoint,
        "negativePrompt": payload.negative_prompt,
        "sampler": payload.sampler,
        "scheduler": payload.scheduler,
    });

    // Best-effort: the asset record is a convenience, not a correctness gate.
    if let Err(e) = ctx
        .status
        .control_plane()
        .create_asset(CreateAssetRequest {
            job_id: job_id.to_string(),
            asset_type: "image".to_string(),
            url: url.clone(),
            meta: Some(meta.clone()),
        })
        .await
    {
        tracing::warn!(job_id, error = %e, "failed to create asset record");
    }

    Ok(json!({
        "jobId": job_id,
        "type": "image",
        "url": url,
        "meta": meta,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> ImageGenerationPayload {
        ImageGenerationPayload {
            prompt: "a cat".to_string(),
            negative_prompt: None,
            checkpoint: "sd_xl_base.safetensors".to_string(),
            influencer_id: "influencer-1".to_string(),
            width: None,
            height: None,
            steps: None,
            cfg: None,
            seed: None,
            sampler: None,
            scheduler: None,
            loras: Vec::new(),
        }
    }

    #[test]
    fn valid_payload_passes() {
        assert!(validate_payload(&base_payload()).is_ok());
    }

    #[test]
    fn empty_prompt_rejected_before_running() {
        let mut payload = base_payload();
        payload.prompt = "   ".to_string();
        let err = validate_payload(&payload).unwrap_err();
        assert!(matches!(err, ProcessorError::Validation(_)));
    }

    #[test]
    fn empty_influencer_id_rejected() {
        let mut payload = base_payload();
        payload.influencer_id = "".to_string();
        let err = validate_payload(&payload).unwrap_err();
        let ProcessorError::Validation(ve) = err else {
            panic!("expected validation error");
        };
        assert_eq!(ve.field, "influencerId");
    }

    #[test]
    fn out_of_range_cfg_surfaces_field_path() {
        let mut payload = base_payload();
        payload.cfg = Some(31.0);
        let err = validate_payload(&payload).unwrap_err();
        let ProcessorError::Validation(ve) = err else {
            panic!("expected validation error");
        };
        assert_eq!(ve.field, "cfg");
    }

    #[test]
    fn nonexistent_lora_path_rejected() {
        let mut payload = base_payload();
        payload.loras.push(worker_common::job::LoraSpec {
            path: "missing-lora.safetensors".to_string(),
            strength_model: None,
            strength_clip: None,
        });
        let err = validate_payload(&payload).unwrap_err();
        let ProcessorError::Validation(ve) = err else {
            panic!("expected validation error");
        };
        assert_eq!(ve.field, "loras[0].path");
    }
}
