//! Builds, validates, and serializes ComfyUI-shaped workflow graphs for
//! image generation, and resolves LoRA file paths to their
//! directory-relative form.

pub mod builder;
pub mod lora;
pub mod types;
pub mod validate;

pub use builder::{build_image_workflow, resolve_seed};
pub use lora::{check_exists, resolve_lora_path, validate_extension, LoraPathError};
pub use types::{ComfyNode, ComfyWorkflow, InputValue, LoRAConfig};
pub use validate::{validate_params, validate_structure, FieldError, ImageGenParams, LoraParam, StructuralError};
