//! LLM inference
//!
//! Model sessions, prompt cache reuse and the generation state machine, on
//! top of a [`ModelBackend`]. [`llama::LlamaCppBackend`] is the production
//! backend.

pub mod backend;
pub mod cache;
pub mod generation;
pub mod llama;
pub mod model;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{BackendError, ModelBackend, ModelMetadata, TokenId};
pub use cache::{CacheError, CacheManager};
pub use generation::{GenerationError, GenerationState, GenerationSummary, Generator};
pub use llama::{LlamaCppBackend, LlamaSettings};
pub use model::{validate_gguf, ModelError, GGUF_MAGIC};
pub use session::{LoadError, SessionManager};
