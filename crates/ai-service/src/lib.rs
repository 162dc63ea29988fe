pub mod client;

pub use client::{AiClient, GenerationOutput, GenerationRequest, LlmError, TextGenerator};
