//! Parameter validation for image-generation requests, and structural
//! validation of built `ComfyWorkflow` graphs.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

use crate::lora::{resolve_lora_path, validate_extension};
use crate::types::{ComfyWorkflow, InputValue, MAX_LORAS};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Raw image-generation request parameters, as received before building a
/// workflow. Mirrors `ImageGenerationPayload` but is validated standalone so
/// `graph-workflow` has no dependency on `worker-common`.
#[derive(Debug, Clone)]
pub struct ImageGenParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub checkpoint: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub seed: Option<i64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub loras: Vec<LoraParam>,
}

#[derive(Debug, Clone)]
pub struct LoraParam {
    pub path: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

/// Validate `params`, accumulating every violation rather than stopping at
/// the first one, so callers can report the complete set of field errors.
pub fn validate_params(params: &ImageGenParams) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if params.prompt.trim().is_empty() {
        errors.push(FieldError::new("prompt", "must not be empty"));
    }
    if params.checkpoint.trim().is_empty() {
        errors.push(FieldError::new("checkpoint", "must not be empty"));
    }

    if let Some(cfg) = params.cfg {
        if !(1.0..=30.0).contains(&cfg) {
            errors.push(FieldError::new("cfg", "must be in [1, 30]"));
        }
    }
    if let Some(steps) = params.steps {
        if !(1..=150).contains(&steps) {
            errors.push(FieldError::new("steps", "must be in [1, 150]"));
        }
    }
    if let Some(width) = params.width {
        if !is_valid_dimension(width) {
            errors.push(FieldError::new(
                "width",
                "must be a multiple of 8 in [256, 2048]",
            ));
        }
    }
    if let Some(height) = params.height {
        if !is_valid_dimension(height) {
            errors.push(FieldError::new(
                "height",
                "must be a multiple of 8 in [256, 2048]",
            ));
        }
    }

    if params.loras.len() > MAX_LORAS {
        errors.push(FieldError::new(
            "loras",
            format!("at most {} LoRAs are allowed", MAX_LORAS),
        ));
    }

    for (i, lora) in params.loras.iter().enumerate() {
        if lora.path.trim().is_empty() {
            errors.push(FieldError::new(format!("loras[{i}].path"), "must not be empty"));
        } else {
            match resolve_lora_path(&lora.path).and_then(|resolved| {
                validate_extension(&resolved)?;
                Ok(())
            }) {
                Ok(()) => {}
                Err(e) => errors.push(FieldError::new(format!("loras[{i}].path"), e.to_string())),
            }
        }
        if !(0.0..=100.0).contains(&lora.strength_model) {
            errors.push(FieldError::new(
                format!("loras[{i}].strengthModel"),
                "must be in [0, 100]",
            ));
        }
        if !(0.0..=100.0).contains(&lora.strength_clip) {
            errors.push(FieldError::new(
                format!("loras[{i}].strengthClip"),
                "must be in [0, 100]",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_valid_dimension(value: u32) -> bool {
    (256..=2048).contains(&value) && value % 8 == 0
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("workflow has no nodes")]
    Empty,
    #[error("node {0}: unknown class_type {1:?}")]
    UnknownClassType(String, String),
    #[error("node {0} ({1}): missing required input {2:?}")]
    MissingInput(String, String, String),
    #[error("node {0}: input {1:?} references unknown node {2:?}")]
    DanglingConnection(String, String, String),
    #[error("node {0}: input {1:?} references output slot {2} on node {3}, which has only {4} outputs")]
    OutputSlotOutOfBounds(String, String, u32, String, u32),
    #[error("node {0}: input {1:?} type mismatch, expected {2} but {3} produces {4}")]
    TypeMismatch(String, String, String, String, String),
    #[error("graph contains a cycle")]
    Cycle,
    #[error("a SaveImage node is required when KSampler or VAEDecode is present")]
    MissingSaveImage,
}

struct NodeSpec {
    required_inputs: &'static [&'static str],
    output_count: u32,
    /// For each required input name, the upstream type it expects (used for
    /// the subset of known cross-node type pairs the validator checks).
    input_types: &'static [(&'static str, &'static str)],
}

fn node_spec(class_type: &str) -> Option<NodeSpec> {
    match class_type {
        "CheckpointLoaderSimple" => Some(NodeSpec {
            required_inputs: &["ckpt_name"],
            output_count: 3,
            input_types: &[],
        }),
        "LoraLoader" => Some(NodeSpec {
            required_inputs: &["lora_name", "strength_model", "strength_clip", "model", "clip"],
            output_count: 2,
            input_types: &[("model", "MODEL"), ("clip", "CLIP")],
        }),
        "CLIPTextEncode" => Some(NodeSpec {
            required_inputs: &["text", "clip"],
            output_count: 1,
            input_types: &[("clip", "CLIP")],
        }),
        "EmptyLatentImage" => Some(NodeSpec {
            required_inputs: &["width", "height", "batch_size"],
            output_count: 1,
            input_types: &[],
        }),
        "KSampler" => Some(NodeSpec {
            required_inputs: &[
                "seed",
                "steps",
                "cfg",
                "sampler_name",
                "scheduler",
                "denoise",
                "model",
                "positive",
                "negative",
                "latent_image",
            ],
            output_count: 1,
            input_types: &[
                ("model", "MODEL"),
                ("positive", "CONDITIONING"),
                ("negative", "CONDITIONING"),
                ("latent_image", "LATENT"),
            ],
        }),
        "VAEDecode" => Some(NodeSpec {
            required_inputs: &["samples", "vae"],
            output_count: 1,
            input_types: &[("samples", "LATENT")],
        }),
        "SaveImage" => Some(NodeSpec {
            required_inputs: &["filename_prefix", "images"],
            output_count: 0,
            input_types: &[("images", "IMAGE")],
        }),
        _ => None,
    }
}

/// The type produced at a specific output slot, for the subset of
/// (node, slot) pairs the type-compatibility check cares about.
/// `CheckpointLoaderSimple` and `LoraLoader` both have more than one
/// output (MODEL/CLIP[/VAE]), so the type depends on which slot a
/// connection actually references, not just the node's class_type.
fn node_output_type(class_type: &str, slot: u32) -> Option<&'static str> {
    match (class_type, slot) {
        ("CheckpointLoaderSimple", 0) => Some("MODEL"),
        ("CheckpointLoaderSimple", 1) => Some("CLIP"),
        ("CheckpointLoaderSimple", 2) => Some("VAE"),
        ("LoraLoader", 0) => Some("MODEL"),
        ("LoraLoader", 1) => Some("CLIP"),
        ("CLIPTextEncode", 0) => Some("CONDITIONING"),
        ("EmptyLatentImage", 0) => Some("LATENT"),
        ("KSampler", 0) => Some("LATENT"),
        ("VAEDecode", 0) => Some("IMAGE"),
        _ => None,
    }
}

/// Validate the full structural contract of a built workflow: known
/// class_types, required inputs present, connections resolve to existing
/// nodes and in-bounds output slots, no cycles, and a `SaveImage` whenever
/// `KSampler` or `VAEDecode` appears. Errors accumulate; all are returned.
pub fn validate_structure(workflow: &ComfyWorkflow) -> Result<(), Vec<StructuralError>> {
    let mut errors = Vec::new();

    if workflow.is_empty() {
        return Err(vec![StructuralError::Empty]);
    }

    let mut has_ksampler_or_vae_decode = false;
    let mut has_save_image = false;

    for (id, node) in workflow.iter() {
        let Some(spec) = node_spec(&node.class_type) else {
            errors.push(StructuralError::UnknownClassType(
                id.clone(),
                node.class_type.clone(),
            ));
            continue;
        };

        if node.class_type == "KSampler" || node.class_type == "VAEDecode" {
            has_ksampler_or_vae_decode = true;
        }
        if node.class_type == "SaveImage" {
            has_save_image = true;
        }

        for required in spec.required_inputs {
            if !node.inputs.contains_key(*required) {
                errors.push(StructuralError::MissingInput(
                    id.clone(),
                    node.class_type.clone(),
                    required.to_string(),
                ));
            }
        }

        for (input_name, value) in &node.inputs {
            let Some(conn) = value.as_connection() else {
                continue;
            };
            let Some(source) = workflow.get(&conn.0) else {
                errors.push(StructuralError::DanglingConnection(
                    id.clone(),
                    input_name.clone(),
                    conn.0.clone(),
                ));
                continue;
            };
            let Some(source_spec) = node_spec(&source.class_type) else {
                continue;
            };
            if conn.1 >= source_spec.output_count {
                errors.push(StructuralError::OutputSlotOutOfBounds(
                    id.clone(),
                    input_name.clone(),
                    conn.1,
                    conn.0.clone(),
                    source_spec.output_count,
                ));
                continue;
            }

            if let Some((_, expected_type)) =
                spec.input_types.iter().find(|(name, _)| name == input_name)
            {
                if let Some(actual_type) = node_output_type(&source.class_type, conn.1) {
                    if actual_type != *expected_type {
                        errors.push(StructuralError::TypeMismatch(
                            id.clone(),
                            input_name.clone(),
                            expected_type.to_string(),
                            conn.0.clone(),
                            actual_type.to_string(),
                        ));
                    }
                }
            }
        }
    }

    if has_ksampler_or_vae_decode && !has_save_image {
        errors.push(StructuralError::MissingSaveImage);
    }

    if let Some(cycle_err) = detect_cycle(workflow) {
        errors.push(cycle_err);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn detect_cycle(workflow: &ComfyWorkflow) -> Option<StructuralError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: std::collections::HashMap<&str, Mark> = workflow
        .iter()
        .map(|(id, _)| (id.as_str(), Mark::Unvisited))
        .collect();

    fn visit<'a>(
        id: &'a str,
        workflow: &'a ComfyWorkflow,
        marks: &mut std::collections::HashMap<&'a str, Mark>,
        stack: &mut VecDeque<&'a str>,
        visited_set: &mut HashSet<&'a str>,
    ) -> bool {
        match marks.get(id) {
            Some(Mark::InProgress) => return true,
            Some(Mark::Done) => return false,
            _ => {}
        }
        marks.insert(id, Mark::InProgress);
        stack.push_back(id);
        visited_set.insert(id);

        if let Some(node) = workflow.get(id) {
            for value in node.inputs.values() {
                if let Some(conn) = value.as_connection() {
                    if workflow.get(&conn.0).is_some() && visit(&conn.0, workflow, marks, stack, visited_set) {
                        return true;
                    }
                }
            }
        }

        marks.insert(id, Mark::Done);
        stack.pop_back();
        false
    }

    let ids: Vec<&str> = workflow.iter().map(|(id, _)| id.as_str()).collect();
    for id in ids {
        let mut stack = VecDeque::new();
        let mut visited_set = HashSet::new();
        if visit(id, workflow, &mut marks, &mut stack, &mut visited_set) {
            return Some(StructuralError::Cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_image_workflow;

    fn base_params() -> ImageGenParams {
        ImageGenParams {
            prompt: "a cat".into(),
            negative_prompt: None,
            checkpoint: "sd_xl_base.safetensors".into(),
            width: None,
            height: None,
            steps: None,
            cfg: None,
            seed: Some(42),
            sampler: None,
            scheduler: None,
            loras: vec![],
        }
    }

    #[test]
    fn empty_prompt_rejected() {
        let mut params = base_params();
        params.prompt = "".into();
        let errors = validate_params(&params).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "prompt"));
    }

    #[test]
    fn cfg_30_accepted_31_rejected() {
        let mut params = base_params();
        params.cfg = Some(30.0);
        assert!(validate_params(&params).is_ok());

        params.cfg = Some(31.0);
        let errors = validate_params(&params).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "cfg"));
    }

    #[test]
    fn steps_1_accepted_0_rejected() {
        let mut params = base_params();
        params.steps = Some(1);
        assert!(validate_params(&params).is_ok());

        params.steps = Some(0);
        let errors = validate_params(&params).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "steps"));
    }

    #[test]
    fn five_loras_accepted_six_rejected() {
        let mut params = base_params();
        params.loras = (0..5)
            .map(|i| LoraParam {
                path: format!("style-{i}.safetensors"),
                strength_model: 50.0,
                strength_clip: 50.0,
            })
            .collect();
        assert!(validate_params(&params).is_ok());

        params.loras.push(LoraParam {
            path: "style-6.safetensors".into(),
            strength_model: 50.0,
            strength_clip: 50.0,
        });
        let errors = validate_params(&params).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "loras"));
    }

    #[test]
    fn empty_lora_path_rejected_with_field_path() {
        let mut params = base_params();
        params.loras = vec![LoraParam {
            path: "".into(),
            strength_model: 50.0,
            strength_clip: 50.0,
        }];
        let errors = validate_params(&params).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "loras[0].path"));
    }

    #[test]
    fn builder_output_always_passes_structural_validation() {
        let workflow = build_image_workflow(&base_params(), vec![]);
        assert!(validate_structure(&workflow).is_ok());
    }

    #[test]
    fn builder_output_with_loras_passes_structural_validation() {
        let loras = vec![
            crate::types::LoRAConfig {
                path: "a.safetensors".into(),
                strength_model: 80.0,
                strength_clip: 80.0,
            },
            crate::types::LoRAConfig {
                path: "b.safetensors".into(),
                strength_model: 60.0,
                strength_clip: 60.0,
            },
        ];
        let workflow = build_image_workflow(&base_params(), loras);
        assert!(validate_structure(&workflow).is_ok());
    }

    #[test]
    fn missing_save_image_is_rejected_when_ksampler_present() {
        let mut workflow = build_image_workflow(&base_params(), vec![]);
        workflow.0.remove("9");
        let errors = validate_structure(&workflow).unwrap_err();
        assert!(errors.contains(&StructuralError::MissingSaveImage));
    }

    #[test]
    fn dangling_connection_is_rejected() {
        let mut workflow = build_image_workflow(&base_params(), vec![]);
        let node = workflow.0.get_mut("8").unwrap();
        node.inputs
            .insert("samples".into(), InputValue::connection("999", 0));
        let errors = validate_structure(&workflow).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, StructuralError::DanglingConnection(_, _, target) if target == "999")));
    }

    #[test]
    fn self_loop_is_detected_as_a_cycle() {
        let mut workflow = build_image_workflow(&base_params(), vec![]);
        let node = workflow.0.get_mut("3").unwrap();
        node.inputs.insert("model".into(), InputValue::connection("3", 0));
        let errors = validate_structure(&workflow).unwrap_err();
        assert!(errors.contains(&StructuralError::Cycle));
    }

    #[test]
    fn unknown_class_type_is_rejected() {
        let mut workflow = ComfyWorkflow::new();
        workflow.insert(
            "1",
            crate::types::ComfyNode {
                class_type: "NotARealNode".into(),
                inputs: Default::default(),
            },
        );
        let errors = validate_structure(&workflow).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, StructuralError::UnknownClassType(_, ct) if ct == "NotARealNode")));
    }
}
