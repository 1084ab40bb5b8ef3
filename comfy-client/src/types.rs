use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which media asset to prefer when a history entry lists several outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetBias {
    /// Video-generation: prefer entries whose filename ends in `.mp4`.
    Video,
    /// Image-generation: take the first entry that carries a filename.
    Image,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubmitRequest<'a> {
    pub client_id: &'a str,
    pub prompt: &'a Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubmitResponse {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl SubmitResponse {
    pub fn extracted_prompt_id(&self) -> Option<String> {
        self.prompt_id
            .clone()
            .or_else(|| self.id.clone())
            .or_else(|| self.job_id.clone())
    }
}

/// A located output asset within a completed history entry.
#[derive(Debug, Clone, Default)]
pub struct AssetRef {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub subfolder: String,
    pub asset_type: String,
}

/// The outcome of `submit_and_wait`.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub prompt_id: String,
    pub download_url: String,
    pub bytes: Vec<u8>,
}

const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".png", ".jpg", ".jpeg", ".webp", ".gif"];

pub(crate) fn looks_like_media_filename(filename: &str) -> bool {
    MEDIA_EXTENSIONS.iter().any(|ext| filename.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_media_extensions() {
        assert!(looks_like_media_filename("clip.mp4"));
        assert!(looks_like_media_filename("frame.png"));
        assert!(!looks_like_media_filename("manifest.json"));
    }

    #[test]
    fn extracted_prompt_id_prefers_prompt_id_field() {
        let resp = SubmitResponse {
            prompt_id: Some("p-1".to_string()),
            id: Some("i-1".to_string()),
            job_id: Some("j-1".to_string()),
        };
        assert_eq!(resp.extracted_prompt_id(), Some("p-1".to_string()));
    }

    #[test]
    fn extracted_prompt_id_falls_back_to_id_then_job_id() {
        let resp = SubmitResponse {
            prompt_id: None,
            id: None,
            job_id: Some("j-1".to_string()),
        };
        assert_eq!(resp.extracted_prompt_id(), Some("j-1".to_string()));

        let empty = SubmitResponse {
            prompt_id: None,
            id: None,
            job_id: None,
        };
        assert_eq!(empty.extracted_prompt_id(), None);
    }
}
