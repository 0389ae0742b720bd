//! Request/response operations outside the streaming channel
//!
//! Model management and decode-cache persistence. Each operation answers
//! with exactly one response; failures become an [`ErrorResponse`] carrying
//! the error kind.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::inference::backend::{run_blocking, ModelBackend};
use crate::inference::session::{LoadOutcome, SessionManager};
use crate::storage::models::{list_local_models, ModelInfo};

/// An auxiliary operation, tagged by `op`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouteRequest {
    ListModels,
    LoadModel {
        identifier: String,
        #[serde(default)]
        adapter_path: Option<String>,
    },
    UnloadModel,
    CurrentModel,
    SaveCache {
        filename: String,
    },
    LoadCache {
        filename: String,
    },
    TrimCache {
        num_tokens: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLoadResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
}

/// Success without a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind,
            message: message.into(),
        }
    }
}

/// Any route answer, serialized without a wrapper
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RouteResponse {
    Cache(CacheResponse),
    ModelLoad(ModelLoadResponse),
    Status(StatusResponse),
    Models(Vec<ModelInfo>),
    CurrentModel(Option<ModelInfo>),
    Error(ErrorResponse),
}

impl RouteResponse {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        RouteResponse::Error(ErrorResponse::new(kind, message))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RouteResponse::Error(_))
    }
}

/// Route handlers over the shared session manager
pub struct Routes<B: ModelBackend> {
    sessions: Arc<SessionManager<B>>,
    scan_directories: Vec<PathBuf>,
}

impl<B: ModelBackend> Routes<B> {
    pub fn new(sessions: Arc<SessionManager<B>>, scan_directories: Vec<PathBuf>) -> Self {
        Self {
            sessions,
            scan_directories,
        }
    }

    pub async fn dispatch(&self, request: RouteRequest) -> RouteResponse {
        if !self.sessions.is_available() {
            // Clients poll the current model to probe the service
            if request == RouteRequest::CurrentModel {
                tracing::warn!("Current model requested but the model backend is not available");
                return RouteResponse::CurrentModel(None);
            }
            return RouteResponse::error(
                ErrorKind::BackendUnavailable,
                "Model backend not available.",
            );
        }

        match request {
            RouteRequest::ListModels => self.list_models().await,
            RouteRequest::LoadModel {
                identifier,
                adapter_path,
            } => self.load_model(&identifier, adapter_path.as_deref()).await,
            RouteRequest::UnloadModel => self.unload_model().await,
            RouteRequest::CurrentModel => {
                RouteResponse::CurrentModel(self.sessions.current_info().await)
            }
            RouteRequest::SaveCache { filename } => self.save_cache(&filename).await,
            RouteRequest::LoadCache { filename } => self.load_cache(&filename).await,
            RouteRequest::TrimCache { num_tokens } => self.trim_cache(num_tokens).await,
        }
    }

    async fn list_models(&self) -> RouteResponse {
        tracing::info!("Request received: list local models");
        let loaded = self.sessions.loaded_pair().await;
        let directories = self.scan_directories.clone();

        let scanned = run_blocking(move || {
            let loaded = loaded
                .as_ref()
                .map(|(identifier, adapter)| (identifier.as_str(), adapter.as_deref()));
            list_local_models(&directories, loaded)
        })
        .await;

        match scanned {
            Ok(models) => RouteResponse::Models(models),
            Err(e) => {
                tracing::error!("Failed to list local models: {}", e);
                RouteResponse::error(e.kind(), format!("Failed to list models: {e}"))
            }
        }
    }

    async fn load_model(&self, identifier: &str, adapter_path: Option<&str>) -> RouteResponse {
        tracing::info!(
            "Request received: load model '{}' (adapter: {:?})",
            identifier,
            adapter_path
        );
        match self.sessions.load(identifier, adapter_path).await {
            Ok(outcome) => {
                let message = match outcome {
                    LoadOutcome::AlreadyLoaded => "Model already loaded.".to_string(),
                    LoadOutcome::Loaded => format!("Model '{identifier}' loaded successfully."),
                };
                RouteResponse::ModelLoad(ModelLoadResponse {
                    success: true,
                    message,
                    model_info: self.sessions.current_info().await,
                })
            }
            Err(e) => RouteResponse::error(e.kind(), e.to_string()),
        }
    }

    async fn unload_model(&self) -> RouteResponse {
        let Some(identifier) = self.sessions.identifier().await else {
            return RouteResponse::Status(StatusResponse {
                success: true,
                message: "No model currently loaded.".to_string(),
            });
        };
        match self.sessions.unload().await {
            Ok(()) => RouteResponse::Status(StatusResponse {
                success: true,
                message: format!("Model '{identifier}' unloaded successfully."),
            }),
            Err(e) => RouteResponse::error(e.kind(), e.to_string()),
        }
    }

    async fn save_cache(&self, filename: &str) -> RouteResponse {
        tracing::info!("Request to save decode cache to file: {}", filename);
        match self.sessions.save_cache(filename).await {
            Ok((path, cache_size)) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| filename.to_string());
                RouteResponse::Cache(CacheResponse {
                    success: true,
                    message: format!("Cache saved to {name}."),
                    cache_size: Some(cache_size),
                })
            }
            Err(e) => RouteResponse::error(e.kind(), format!("Failed to save cache: {e}")),
        }
    }

    async fn load_cache(&self, filename: &str) -> RouteResponse {
        tracing::info!("Request to load decode cache from file: {}", filename);
        match self.sessions.load_cache(filename).await {
            Ok(cache_size) => RouteResponse::Cache(CacheResponse {
                success: true,
                message: format!("Cache loaded from {filename}."),
                cache_size: Some(cache_size),
            }),
            Err(e) => RouteResponse::error(e.kind(), format!("Failed to load cache: {e}")),
        }
    }

    async fn trim_cache(&self, num_tokens: usize) -> RouteResponse {
        tracing::info!("Request to trim {} tokens from decode cache", num_tokens);
        match self.sessions.trim_cache(num_tokens).await {
            Ok(cache_size) => RouteResponse::Cache(CacheResponse {
                success: true,
                message: format!("Trimmed {num_tokens} tokens."),
                cache_size: Some(cache_size),
            }),
            Err(e) => RouteResponse::error(e.kind(), format!("Failed to trim cache: {e}")),
        }
    }
}
