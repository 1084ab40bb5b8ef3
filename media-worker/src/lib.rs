//! The `media-worker` binary crate: typed configuration, the processor-
//! boundary error type, the four job processors, and the supervisor that
//! wires them to the broker.

pub mod config;
pub mod error;
pub mod processors;
pub mod supervisor;
