//! kvstream library
//!
//! Inference session orchestration: model sessions, prompt-cache reuse,
//! streaming generation and the connection surface on top.

pub mod error;
pub mod inference;
pub mod server;
pub mod storage;
pub mod types;
