//! Shared wire types for the orchestration layer: chat messages, tool calls,
//! and the OpenAI-compatible request/response/streaming shapes that flow
//! between the orchestration server, the agent loop, and the inference
//! subprocess.

pub mod error;
pub mod message;
pub mod training;
pub mod wire;

pub use error::AgentError;
pub use message::{Message, Role, ToolCall, ToolCallFunction};
pub use training::{TrainingRun, TrainingStatus};
pub use wire::{ChatRequest, ChatResponse, Choice, MessageDelta, StreamChoice, StreamChunk, Usage};
