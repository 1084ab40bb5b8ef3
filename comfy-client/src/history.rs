//! Resolving a `/history/<promptId>` response into a status and, on
//! success, locating the produced output asset.
//!
//! ComfyUI's history payload shape is not fixed: the entry for a prompt may
//! sit at the document root, under a key equal to the prompt id, or nested
//! under one of several wrapper keys depending on deployment. This module
//! walks all of those shapes before giving up.

use serde_json::Value;

use crate::types::{looks_like_media_filename, AssetBias, AssetRef};

const WRAPPER_KEYS: &[&str] = &["history", "histories", "jobs", "prompts", "job"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

/// Find the history entry belonging to `prompt_id` within an arbitrarily
/// shaped `/history` response.
pub fn resolve_history_entry<'a>(response: &'a Value, prompt_id: &str) -> Option<&'a Value> {
    if let Some(obj) = response.as_object() {
        if let Some(entry) = obj.get(prompt_id) {
            return Some(entry);
        }
        for wrapper in WRAPPER_KEYS {
            if let Some(inner) = obj.get(*wrapper) {
                if let Some(entry) = inner.get(prompt_id) {
                    return Some(entry);
                }
            }
        }
        // The whole object might itself be the entry (root shape), when it
        // carries a `status` key directly.
        if obj.contains_key("status") || obj.contains_key("outputs") {
            return Some(response);
        }
    }
    None
}

/// Derive job status from a resolved history entry's `status` sub-object.
pub fn derive_status(entry: &Value) -> JobOutcome {
    let Some(status) = entry.get("status") else {
        return JobOutcome::Pending;
    };

    let status_str = status.get("status").and_then(Value::as_str).unwrap_or("");
    let completed = status.get("completed").and_then(Value::as_bool).unwrap_or(false);

    match status_str {
        "success" | "completed" => return JobOutcome::Succeeded,
        "error" | "failed" | "cancelled" => {
            let message = status
                .get("error")
                .or_else(|| status.get("err"))
                .or_else(|| status.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("ComfyUI job failed")
                .to_string();
            return JobOutcome::Failed(message);
        }
        _ => {}
    }

    if completed {
        return JobOutcome::Succeeded;
    }

    JobOutcome::Pending
}

/// Scan every output-array value in a completed history entry's `outputs`
/// object, returning the first asset matching the given bias:
/// video-generation prefers a `.mp4` filename; image-generation takes the
/// first filename-bearing entry. Both fall back to `type ∈ {video, output}`
/// or the presence of a `url`.
pub fn locate_asset(entry: &Value, bias: AssetBias) -> Option<AssetRef> {
    let outputs = entry.get("outputs")?.as_object()?;

    let mut candidates = Vec::new();
    for node_output in outputs.values() {
        let Some(node_output) = node_output.as_object() else {
            continue;
        };
        for value in node_output.values() {
            let Some(array) = value.as_array() else {
                continue;
            };
            for item in array {
                candidates.push(item);
            }
        }
    }

    if bias == AssetBias::Video {
        if let Some(hit) = candidates.iter().find(|item| {
            item.get("filename")
                .and_then(Value::as_str)
                .map(|f| f.ends_with(".mp4"))
                .unwrap_or(false)
        }) {
            return Some(asset_from_value(hit));
        }
    } else if let Some(hit) = candidates
        .iter()
        .find(|item| item.get("filename").and_then(Value::as_str).is_some())
    {
        return Some(asset_from_value(hit));
    }

    for item in &candidates {
        let type_match = item
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t == "video" || t == "output")
            .unwrap_or(false);
        let has_url = item.get("url").is_some();
        let media_filename = item
            .get("filename")
            .and_then(Value::as_str)
            .map(looks_like_media_filename)
            .unwrap_or(false);

        if type_match || has_url || media_filename {
            return Some(asset_from_value(item));
        }
    }

    None
}

fn asset_from_value(value: &Value) -> AssetRef {
    AssetRef {
        url: value.get("url").and_then(Value::as_str).map(str::to_string),
        filename: value.get("filename").and_then(Value::as_str).map(str::to_string),
        subfolder: value
            .get("subfolder")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        asset_type: value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_entry_nested_under_prompt_id_key() {
        let response = json!({ "job-123": { "status": { "status": "completed", "completed": true } } });
        let entry = resolve_history_entry(&response, "job-123").unwrap();
        assert_eq!(derive_status(entry), JobOutcome::Succeeded);
    }

    #[test]
    fn resolves_entry_nested_under_wrapper_key() {
        let response = json!({ "history": { "job-123": { "status": { "status": "running" } } } });
        let entry = resolve_history_entry(&response, "job-123").unwrap();
        assert_eq!(derive_status(entry), JobOutcome::Pending);
    }

    #[test]
    fn derives_failed_status_with_message() {
        let entry = json!({ "status": { "status": "error", "message": "boom" } });
        assert_eq!(derive_status(&entry), JobOutcome::Failed("boom".to_string()));
    }

    #[test]
    fn completed_flag_without_status_string_is_succeeded() {
        let entry = json!({ "status": { "completed": true } });
        assert_eq!(derive_status(&entry), JobOutcome::Succeeded);
    }

    #[test]
    fn locate_asset_video_bias_prefers_mp4() {
        let entry = json!({
            "outputs": {
                "9": {
                    "images": [{ "filename": "preview.png", "subfolder": "", "type": "temp" }],
                    "videos": [{ "filename": "result.mp4", "subfolder": "videos", "type": "video" }]
                }
            }
        });
        let asset = locate_asset(&entry, AssetBias::Video).unwrap();
        assert_eq!(asset.filename.as_deref(), Some("result.mp4"));
    }

    #[test]
    fn locate_asset_image_bias_takes_first_filename() {
        let entry = json!({
            "outputs": {
                "9": { "images": [{ "filename": "result.png", "subfolder": "", "type": "output" }] }
            }
        });
        let asset = locate_asset(&entry, AssetBias::Image).unwrap();
        assert_eq!(asset.filename.as_deref(), Some("result.png"));
    }

    #[test]
    fn locate_asset_returns_none_when_no_candidates_match() {
        let entry = json!({ "outputs": {} });
        assert!(locate_asset(&entry, AssetBias::Image).is_none());
    }
}
