//! Builds a ComfyUI-shaped image-generation workflow from validated
//! parameters, with fixed node ids and LoRA-loader chaining.

use rand::Rng;

use crate::types::{ComfyNode, ComfyWorkflow, InputValue, LoRAConfig};
use crate::validate::ImageGenParams;

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 512;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG: f64 = 7.0;
pub const DEFAULT_SAMPLER: &str = "euler";
pub const DEFAULT_SCHEDULER: &str = "normal";
pub const DEFAULT_BATCH: u32 = 1;
pub const DEFAULT_DENOISE: f64 = 1.0;

const NODE_CHECKPOINT_LOADER: &str = "4";
const NODE_EMPTY_LATENT: &str = "5";
const NODE_POSITIVE_ENCODE: &str = "6";
const NODE_NEGATIVE_ENCODE: &str = "7";
const NODE_KSAMPLER: &str = "3";
const NODE_VAE_DECODE: &str = "8";
const NODE_SAVE_IMAGE: &str = "9";
const FIRST_LORA_NODE_ID: u32 = 10;

fn random_seed() -> i64 {
    rand::thread_rng().gen_range(1..=i32::MAX as i64)
}

/// Resolve the seed that will end up in the built workflow: `params.seed` if
/// set, else a freshly rolled random one. Callers that need to know the
/// actual seed used (e.g. to record it in an asset's metadata) should call
/// this once and feed the result back into `params.seed` before building,
/// rather than re-deriving a default separately.
pub fn resolve_seed(seed: Option<i64>) -> i64 {
    seed.unwrap_or_else(random_seed)
}

/// Build the fixed-topology image-generation workflow. `loras` have already
/// been through parameter validation and path resolution by the caller;
/// this function only wires the graph.
pub fn build_image_workflow(params: &ImageGenParams, loras: Vec<LoRAConfig>) -> ComfyWorkflow {
    let mut workflow = ComfyWorkflow::new();

    let width = params.width.unwrap_or(DEFAULT_WIDTH);
    let height = params.height.unwrap_or(DEFAULT_HEIGHT);
    let steps = params.steps.unwrap_or(DEFAULT_STEPS);
    let cfg = params.cfg.unwrap_or(DEFAULT_CFG);
    let sampler = params.sampler.clone().unwrap_or_else(|| DEFAULT_SAMPLER.to_string());
    let scheduler = params.scheduler.clone().unwrap_or_else(|| DEFAULT_SCHEDULER.to_string());
    let seed = resolve_seed(params.seed);

    workflow.insert(
        NODE_CHECKPOINT_LOADER,
        ComfyNode {
            class_type: "CheckpointLoaderSimple".into(),
            inputs: [("ckpt_name".to_string(), InputValue::str(params.checkpoint.clone()))]
                .into_iter()
                .collect(),
        },
    );

    workflow.insert(
        NODE_EMPTY_LATENT,
        ComfyNode {
            class_type: "EmptyLatentImage".into(),
            inputs: [
                ("width".to_string(), InputValue::num(width as f64)),
                ("height".to_string(), InputValue::num(height as f64)),
                ("batch_size".to_string(), InputValue::num(DEFAULT_BATCH as f64)),
            ]
            .into_iter()
            .collect(),
        },
    );

    // Chain LoRA loaders: each subsequent loader's model/clip inputs
    // reference the previous loader's outputs (or the checkpoint loader for
    // the first one). The last loader (if any) feeds the text encoders and
    // KSampler; otherwise the checkpoint loader feeds them directly.
    let mut model_source = (NODE_CHECKPOINT_LOADER.to_string(), 0u32);
    let mut clip_source = (NODE_CHECKPOINT_LOADER.to_string(), 1u32);

    for (i, lora) in loras.iter().enumerate() {
        let node_id = (FIRST_LORA_NODE_ID + i as u32).to_string();
        workflow.insert(
            node_id.clone(),
            ComfyNode {
                class_type: "LoraLoader".into(),
                inputs: [
                    ("lora_name".to_string(), InputValue::str(lora.path.clone())),
                    (
                        "strength_model".to_string(),
                        InputValue::num(lora.strength_model),
                    ),
                    ("strength_clip".to_string(), InputValue::num(lora.strength_clip)),
                    (
                        "model".to_string(),
                        InputValue::connection(model_source.0.clone(), model_source.1),
                    ),
                    (
                        "clip".to_string(),
                        InputValue::connection(clip_source.0.clone(), clip_source.1),
                    ),
                ]
                .into_iter()
                .collect(),
            },
        );
        model_source = (node_id.clone(), 0);
        clip_source = (node_id, 1);
    }

    workflow.insert(
        NODE_POSITIVE_ENCODE,
        ComfyNode {
            class_type: "CLIPTextEncode".into(),
            inputs: [
                ("text".to_string(), InputValue::str(params.prompt.clone())),
                (
                    "clip".to_string(),
                    InputValue::connection(clip_source.0.clone(), clip_source.1),
                ),
            ]
            .into_iter()
            .collect(),
        },
    );

    workflow.insert(
        NODE_NEGATIVE_ENCODE,
        ComfyNode {
            class_type: "CLIPTextEncode".into(),
            inputs: [
                (
                    "text".to_string(),
                    InputValue::str(params.negative_prompt.clone().unwrap_or_default()),
                ),
                (
                    "clip".to_string(),
                    InputValue::connection(clip_source.0, clip_source.1),
                ),
            ]
            .into_iter()
            .collect(),
        },
    );

    workflow.insert(
        NODE_KSAMPLER,
        ComfyNode {
            class_type: "KSampler".into(),
            inputs: [
                ("seed".to_string(), InputValue::num(seed as f64)),
                ("steps".to_string(), InputValue::num(steps as f64)),
                ("cfg".to_string(), InputValue::num(cfg)),
                ("sampler_name".to_string(), InputValue::str(sampler)),
                ("scheduler".to_string(), InputValue::str(scheduler)),
                ("denoise".to_string(), InputValue::num(DEFAULT_DENOISE)),
                (
                    "model".to_string(),
                    InputValue::connection(model_source.0, model_source.1),
                ),
                (
                    "positive".to_string(),
                    InputValue::connection(NODE_POSITIVE_ENCODE, 0),
                ),
                (
                    "negative".to_string(),
                    InputValue::connection(NODE_NEGATIVE_ENCODE, 0),
                ),
                (
                    "latent_image".to_string(),
                    InputValue::connection(NODE_EMPTY_LATENT, 0),
                ),
            ]
            .into_iter()
            .collect(),
        },
    );

    workflow.insert(
        NODE_VAE_DECODE,
        ComfyNode {
            class_type: "VAEDecode".into(),
            inputs: [
                ("samples".to_string(), InputValue::connection(NODE_KSAMPLER, 0)),
                ("vae".to_string(), InputValue::connection(NODE_CHECKPOINT_LOADER, 2)),
            ]
            .into_iter()
            .collect(),
        },
    );

    workflow.insert(
        NODE_SAVE_IMAGE,
        ComfyNode {
            class_type: "SaveImage".into(),
            inputs: [
                (
                    "filename_prefix".to_string(),
                    InputValue::str("image-generation".to_string()),
                ),
                ("images".to_string(), InputValue::connection(NODE_VAE_DECODE, 0)),
            ]
            .into_iter()
            .collect(),
        },
    );

    workflow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{validate_params, ImageGenParams};

    fn params_with_seed(seed: i64) -> ImageGenParams {
        ImageGenParams {
            prompt: "a cat wearing sunglasses".into(),
            negative_prompt: Some("blurry".into()),
            checkpoint: "sd_xl_base.safetensors".into(),
            width: None,
            height: None,
            steps: None,
            cfg: None,
            seed: Some(seed),
            sampler: None,
            scheduler: None,
            loras: vec![],
        }
    }

    #[test]
    fn serialization_is_stable_for_fixed_seed() {
        let params = params_with_seed(7);
        validate_params(&params).unwrap();

        let a = build_image_workflow(&params, vec![]).serialize();
        let b = build_image_workflow(&params, vec![]).serialize();
        assert_eq!(a, b);
    }

    #[test]
    fn lora_chain_follows_input_order() {
        let params = params_with_seed(7);
        let loras = vec![
            LoRAConfig {
                path: "first.safetensors".into(),
                strength_model: 80.0,
                strength_clip: 80.0,
            },
            LoRAConfig {
                path: "second.safetensors".into(),
                strength_model: 40.0,
                strength_clip: 40.0,
            },
        ];
        let workflow = build_image_workflow(&params, loras);

        let first = workflow.get("10").unwrap();
        assert_eq!(
            first.inputs.get("model").unwrap().as_connection().unwrap().0,
            "4"
        );

        let second = workflow.get("11").unwrap();
        assert_eq!(
            second.inputs.get("model").unwrap().as_connection().unwrap().0,
            "10"
        );

        let ksampler = workflow.get("3").unwrap();
        assert_eq!(
            ksampler.inputs.get("model").unwrap().as_connection().unwrap().0,
            "11"
        );
    }

    #[test]
    fn no_loras_wires_checkpoint_loader_directly() {
        let params = params_with_seed(7);
        let workflow = build_image_workflow(&params, vec![]);
        let ksampler = workflow.get("3").unwrap();
        assert_eq!(
            ksampler.inputs.get("model").unwrap().as_connection().unwrap().0,
            NODE_CHECKPOINT_LOADER
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let params = params_with_seed(7);
        let workflow = build_image_workflow(&params, vec![]);
        let latent = workflow.get("5").unwrap();
        assert_eq!(
            latent.inputs.get("width").unwrap(),
            &InputValue::num(DEFAULT_WIDTH as f64)
        );
        let ksampler = workflow.get("3").unwrap();
        assert_eq!(ksampler.inputs.get("cfg").unwrap(), &InputValue::num(DEFAULT_CFG));
    }
}
