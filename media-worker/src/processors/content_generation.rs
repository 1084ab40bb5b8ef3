//! Content-generation processor: LLM caption -> LLM script -> upload ->
//! spawn child video job.

use serde_json::json;

use worker_common::job::{ContentGenerationPayload, JobPayload, JobRecord, JobStatus};
use worker_common::objectstore::TEXT_ASSET_TTL;
use worker_common::retry::ChatMessage;
use worker_common::status::{CreateJobRequest, StatusPatch};

use crate::error::ProcessorError;
use crate::processors::ProcessorContext;

const CAPTION_SYSTEM_PROMPT: &str = "You generate concise, vivid social captions.";
const SCRIPT_SYSTEM_PROMPT: &str = "You write short timestamped scripts for short-form videos.";
const CHILD_JOB_PRIORITY: u8 = 5;

fn caption_user_prompt(persona: &str, context: &str) -> String {
    format!("Persona: {persona}\nContext/Theme: {context}")
}

fn script_user_prompt(caption: &str, duration_sec: u32) -> String {
    format!(
        "Write a short, timestamped video script of about {duration_sec} seconds for this caption:\n{caption}"
    )
}

/// Sums two optional usage counts, omitting the result entirely when
/// neither call reported usage rather than treating a missing field as 0.
fn merge_cost_tokens(caption_tokens: Option<u64>, script_tokens: Option<u64>) -> Option<u64> {
    match (caption_tokens, script_tokens) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

pub async fn process(ctx: &ProcessorContext, job: &JobRecord) -> Result<(), ProcessorError> {
    let JobPayload::ContentGeneration(payload) = &job.payload else {
        unreachable!("dispatched only for content-generation payloads");
    };
    let job_id = job.id_or_broker_id().to_string();

    ctx.status.patch(&job_id, StatusPatch::status(JobStatus::Running)).await;

    match run(ctx, &job_id, payload).await {
        Ok(()) => Ok(()),
        Err(err) => {
            ctx.status
                .patch(
                    &job_id,
                    StatusPatch::status(JobStatus::Failed).with_result(err.to_result_json()),
                )
                .await;
            Err(err)
        }
    }
}

async fn run(
    ctx: &ProcessorContext,
    job_id: &str,
    payload: &ContentGenerationPayload,
) -> Result<(), ProcessorError> {
    let persona = payload.persona().unwrap_or_default();
    let context = payload.context();
    let duration_sec = payload.duration_sec();

    let caption_result = ctx
        .chat
        .call_chat(&[
            ChatMessage::system(CAPTION_SYSTEM_PROMPT),
            ChatMessage::user(caption_user_prompt(persona, &context)),
        ])
        .await?;
    let caption = caption_result.content.trim().to_string();
    if caption.is_empty() {
        return Err(ProcessorError::collaborator(
            "Caption generation returned empty content",
        ));
    }

    let script_result = ctx
        .chat
        .call_chat(&[
            ChatMessage::system(SCRIPT_SYSTEM_PROMPT),
            ChatMessage::user(script_user_prompt(&caption, duration_sec)),
        ])
        .await?;
    let script = script_result.content.trim().to_string();
    if script.is_empty() {
        return Err(ProcessorError::collaborator(
            "Script generation returned empty content",
        ));
    }

    // costTokens is only reported when at least one call actually returned
    // usage data; absent a single usage field anywhere, the field is omitted
    // entirely rather than defaulting to a misleading 0.
    let caption_tokens = caption_result.usage.as_ref().and_then(|u| u.total_tokens);
    let script_tokens = script_result.usage.as_ref().and_then(|u| u.total_tokens);
    let cost_tokens = merge_cost_tokens(caption_tokens, script_tokens);

    // Best-effort: spawn the child video-generation job. Its failure must
    // not fail content generation.
    let child_job_id = match ctx
        .status
        .control_plane()
        .create_job(CreateJobRequest {
            job_type: "video-generation".to_string(),
            payload: json!({
                "parentJobId": job_id,
                "caption": caption,
                "script": script,
                "persona": payload.persona(),
                "context": context,
                "durationSec": duration_sec,
            }),
            priority: Some(CHILD_JOB_PRIORITY),
        })
        .await
    {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(job_id, error = %err, "failed to create child video-generation job");
            None
        }
    };

    // Best-effort: upload caption/script text assets.
    let prefix = format!("content-generation/{job_id}/");
    let caption_url = upload_text_asset(ctx, &format!("{prefix}caption.txt"), &caption).await;
    let script_url = upload_text_asset(ctx, &format!("{prefix}script.txt"), &script).await;

    let mut result = json!({
        "caption": caption,
        "script": script,
    });
    if let Some(url) = caption_url {
        result["captionUrl"] = json!(url);
    }
    if let Some(url) = script_url {
        result["scriptUrl"] = json!(url);
    }
    if let Some(id) = child_job_id {
        result["childJobId"] = json!(id);
    }

    let mut patch = StatusPatch::status(JobStatus::Succeeded).with_result(result);
    if let Some(cost_tokens) = cost_tokens {
        patch = patch.with_cost_tokens(cost_tokens);
    }
    ctx.status.patch(job_id, patch).await;

    Ok(())
}

async fn upload_text_asset(ctx: &ProcessorContext, key: &str, text: &str) -> Option<String> {
    if let Err(err) = ctx.object_store.put_text(key, text).await {
        tracing::warn!(key, error = %err, "failed to upload text asset, proceeding without url");
        return None;
    }
    match ctx.object_store.signed_get_url(key, TEXT_ASSET_TTL).await {
        Ok(url) => Some(url),
        Err(err) => {
            tracing::warn!(key, error = %err, "failed to sign text asset url, proceeding without url");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_prompt_includes_persona_and_context() {
        let prompt = caption_user_prompt("persona", "launch");
        assert!(prompt.contains("persona"));
        assert!(prompt.contains("launch"));
    }

    #[test]
    fn script_prompt_includes_caption_and_duration() {
        let prompt = script_user_prompt("caption one", 45);
        assert!(prompt.contains("caption one"));
        assert!(prompt.contains("45"));
    }

    #[test]
    fn cost_tokens_omitted_when_neither_call_reports_usage() {
        assert_eq!(merge_cost_tokens(None, None), None);
    }

    #[test]
    fn cost_tokens_sums_when_either_call_reports_usage() {
        assert_eq!(merge_cost_tokens(Some(10), None), Some(10));
        assert_eq!(merge_cost_tokens(None, Some(20)), Some(20));
        assert_eq!(merge_cost_tokens(Some(10), Some(20)), Some(30));
    }
}
