//! Wire types shared by the orchestrator and the protocol handlers

pub mod chunk;
pub mod message;
pub mod request;

pub use chunk::{FinishReason, TokenChunk};
pub use message::{ChatMessage, Role};
pub use request::{GenerationRequest, KvCacheOptions, PromptSource, RequestError};
