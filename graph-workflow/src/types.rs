//! The ComfyUI-shaped DAG: a mapping from node id to `{ class_type, inputs }`,
//! where each input is either a literal or a `[sourceNodeId, outputSlot]`
//! connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A reference to another node's output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRef(pub String, pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// An input value: either a literal or a connection to another node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Connection(ConnectionRef),
    Literal(LiteralValue),
}

impl InputValue {
    pub fn str(value: impl Into<String>) -> Self {
        InputValue::Literal(LiteralValue::Str(value.into()))
    }

    pub fn num(value: f64) -> Self {
        InputValue::Literal(LiteralValue::Num(value))
    }

    pub fn connection(node_id: impl Into<String>, slot: u32) -> Self {
        InputValue::Connection(ConnectionRef(node_id.into(), slot))
    }

    pub fn as_connection(&self) -> Option<&ConnectionRef> {
        match self {
            InputValue::Connection(c) => Some(c),
            InputValue::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyNode {
    pub class_type: String,
    pub inputs: BTreeMap<String, InputValue>,
}

/// A workflow graph keyed by node id. Uses a `BTreeMap` rather than a
/// `HashMap` so two builds with the same node ids serialize identically
/// (node ids are always decimal strings, so lexicographic key order is
/// stable and reproducible across runs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComfyWorkflow(pub BTreeMap<String, ComfyNode>);

impl ComfyWorkflow {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, id: impl Into<String>, node: ComfyNode) {
        self.0.insert(id.into(), node);
    }

    pub fn get(&self, id: &str) -> Option<&ComfyNode> {
        self.0.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ComfyNode)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("ComfyWorkflow is always serializable")
    }
}

/// A LoRA layer applied on top of a base checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    pub path: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

pub const LORA_EXTENSIONS: &[&str] = &[".safetensors", ".pt", ".ckpt"];
pub const MAX_LORAS: usize = 5;
