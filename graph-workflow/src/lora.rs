//! LoRA path resolution: normalizes user-supplied paths down to a
//! directory-relative form ComfyUI expects under `models/loras/`.

use std::env;

use thiserror::Error;

use crate::types::LORA_EXTENSIONS;

const DEFAULT_LORAS_DIR: &str = "/app/ComfyUI/models/loras";
const LORAS_MARKER: &str = "models/loras/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoraPathError {
    #[error("lora path must not be empty")]
    Empty,
    #[error("lora path {0:?} has no recognized extension (.safetensors, .pt, .ckpt)")]
    UnknownExtension(String),
    #[error("lora file not found at {0}")]
    NotFound(String),
}

/// Normalize a user-supplied LoRA path to its directory-relative form.
///
/// Relative paths only have their separators normalized to `/`. Absolute
/// paths (Unix `/...` or Windows `X:\...`) are reduced to the substring
/// after `models/loras/` when present (case-sensitive match), else to the
/// basename. Idempotent: `resolve(resolve(p)) == resolve(p)`.
pub fn resolve_lora_path(input: &str) -> Result<String, LoraPathError> {
    if input.is_empty() {
        return Err(LoraPathError::Empty);
    }

    let normalized = input.replace('\\', "/");

    if !is_absolute(&normalized) {
        return Ok(normalized);
    }

    if let Some(idx) = normalized.find(LORAS_MARKER) {
        return Ok(normalized[idx + LORAS_MARKER.len()..].to_string());
    }

    let basename = normalized.rsplit('/').next().unwrap_or(&normalized);
    Ok(basename.to_string())
}

fn is_absolute(normalized: &str) -> bool {
    if normalized.starts_with('/') {
        return true;
    }
    // Windows drive letter, e.g. "C:/...".
    let bytes = normalized.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Validate that a resolved path carries a recognized LoRA extension.
pub fn validate_extension(resolved: &str) -> Result<(), LoraPathError> {
    if LORA_EXTENSIONS.iter().any(|ext| resolved.ends_with(ext)) {
        Ok(())
    } else {
        Err(LoraPathError::UnknownExtension(resolved.to_string()))
    }
}

fn loras_dir() -> String {
    let dir = env::var("COMFYUI_LORAS_DIR").unwrap_or_else(|_| DEFAULT_LORAS_DIR.to_string());
    dir.trim_end_matches('/').to_string()
}

/// Optional existence check against `COMFYUI_LORAS_DIR` (default
/// `/app/ComfyUI/models/loras`). Not called by default validation paths —
/// callers opt in when they can assume the worker shares a filesystem with
/// ComfyUI.
pub fn check_exists(resolved: &str) -> Result<(), LoraPathError> {
    let full_path = format!("{}/{}", loras_dir(), resolved);
    if std::path::Path::new(&full_path).is_file() {
        Ok(())
    } else {
        Err(LoraPathError::NotFound(full_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_rejected() {
        assert_eq!(resolve_lora_path(""), Err(LoraPathError::Empty));
    }

    #[test]
    fn relative_path_only_normalizes_separators() {
        assert_eq!(
            resolve_lora_path("sub\\dir\\style.safetensors").unwrap(),
            "sub/dir/style.safetensors"
        );
    }

    #[test]
    fn unix_absolute_path_extracts_after_loras_marker() {
        assert_eq!(
            resolve_lora_path("/app/ComfyUI/models/loras/anime/style.safetensors").unwrap(),
            "anime/style.safetensors"
        );
    }

    #[test]
    fn windows_absolute_path_extracts_after_loras_marker() {
        assert_eq!(
            resolve_lora_path("C:\\ComfyUI\\models\\loras\\style.safetensors").unwrap(),
            "style.safetensors"
        );
    }

    #[test]
    fn absolute_path_without_marker_falls_back_to_basename() {
        assert_eq!(
            resolve_lora_path("/var/data/custom/style.safetensors").unwrap(),
            "style.safetensors"
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let once = resolve_lora_path("/app/ComfyUI/models/loras/anime/style.safetensors").unwrap();
        let twice = resolve_lora_path(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn extension_validation_accepts_known_extensions() {
        assert!(validate_extension("style.safetensors").is_ok());
        assert!(validate_extension("style.pt").is_ok());
        assert!(validate_extension("style.ckpt").is_ok());
    }

    #[test]
    fn extension_validation_rejects_unknown_extension() {
        assert!(matches!(
            validate_extension("style.bin"),
            Err(LoraPathError::UnknownExtension(_))
        ));
    }

    #[test]
    fn marker_match_is_case_sensitive() {
        // "Models/LoRAs/" does not match the lowercase marker, so this
        // absolute path without a lowercase marker falls back to basename.
        assert_eq!(
            resolve_lora_path("/app/ComfyUI/Models/LoRAs/style.safetensors").unwrap(),
            "style.safetensors"
        );
    }
}
