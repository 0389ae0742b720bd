//! Network surface
//!
//! Every connection carries one operation. The first message decides which:
//! an object with an `op` other than `generate` is an auxiliary route and
//! gets one response; anything else is a generation request and gets a
//! chunk stream.

pub mod routes;
pub mod stream;
pub mod transport;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::inference::backend::ModelBackend;
use crate::inference::generation::Generator;

pub use routes::{ErrorResponse, RouteRequest, RouteResponse, Routes};
pub use transport::{ChannelTransport, TcpTransport, Transport, TransportError};

/// What the first message on a connection asks for
#[derive(Debug, PartialEq)]
enum Operation {
    /// Payload to validate as a generation request
    Generate(String),
    Route(RouteRequest),
    Invalid(String),
}

fn classify(payload: &str) -> Operation {
    // Non-objects go down the generation path, which reports the schema error
    let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(payload) else {
        return Operation::Generate(payload.to_string());
    };

    match object.remove("op") {
        None => Operation::Generate(payload.to_string()),
        Some(Value::String(op)) if op == "generate" => {
            Operation::Generate(Value::Object(object).to_string())
        }
        Some(op) => {
            object.insert("op".to_string(), op);
            match serde_json::from_value::<RouteRequest>(Value::Object(object)) {
                Ok(request) => Operation::Route(request),
                Err(e) => Operation::Invalid(format!("Invalid request: {e}")),
            }
        }
    }
}

/// Connection handler shared by every accepted connection
pub struct Server<B: ModelBackend> {
    generator: Generator<B>,
    routes: Routes<B>,
}

impl<B: ModelBackend> Server<B> {
    pub fn new(generator: Generator<B>, scan_directories: Vec<PathBuf>) -> Self {
        let routes = Routes::new(generator.sessions().clone(), scan_directories);
        Self { generator, routes }
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    /// Serve the single operation carried by `transport`, then close it
    pub async fn handle_connection<T>(&self, transport: &mut T) -> Result<(), TransportError>
    where
        T: Transport + ?Sized,
    {
        let payload = match transport.recv().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!("Connection closed before a request arrived");
                stream::close(transport).await;
                return Ok(());
            }
            Err(e) => {
                stream::close(transport).await;
                return Err(e);
            }
        };

        let response = match classify(&payload) {
            Operation::Generate(request) => {
                return stream::serve_payload(&request, transport, &self.generator).await;
            }
            Operation::Route(request) => self.routes.dispatch(request).await,
            Operation::Invalid(message) => {
                tracing::warn!("{}", message);
                RouteResponse::Error(ErrorResponse::new(ErrorKind::InvalidRequest, message))
            }
        };

        let result = match serde_json::to_string(&response) {
            Ok(message) => transport.send(&message).await,
            Err(e) => Err(e.into()),
        };
        stream::close(transport).await;
        result
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let server = self.clone();
                    let span = tracing::info_span!("connection", id = %Uuid::new_v4(), %peer);
                    tokio::spawn(
                        async move {
                            tracing::debug!("Connection accepted");
                            let mut transport = TcpTransport::new(stream);
                            if let Err(e) = server.handle_connection(&mut transport).await {
                                tracing::debug!("Connection ended with error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::session::SessionManager;
    use crate::inference::testing::ScriptedBackend;
    use crate::storage::models::ModelInfo;
    use crate::storage::settings::GenerationSection;
    use crate::types::TokenChunk;
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn server(dir: &TempDir) -> Server<ScriptedBackend> {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(ScriptedBackend::new()),
            dir.path().join("caches"),
        ));
        sessions.load("main", None).await.unwrap();
        Server::new(
            Generator::new(sessions, GenerationSection::default()),
            vec![dir.path().join("models")],
        )
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(r#"{"prompt": "hi"}"#),
            Operation::Generate(r#"{"prompt": "hi"}"#.to_string())
        );
        assert_eq!(
            classify(r#"{"op": "generate", "prompt": "hi"}"#),
            Operation::Generate(r#"{"prompt":"hi"}"#.to_string())
        );
        assert_eq!(
            classify(r#"{"op": "unload_model"}"#),
            Operation::Route(RouteRequest::UnloadModel)
        );
        assert!(matches!(classify(r#"{"op": "reboot"}"#), Operation::Invalid(_)));
        assert_eq!(classify("[1, 2]"), Operation::Generate("[1, 2]".to_string()));
    }

    #[tokio::test]
    async fn test_route_over_channel() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let (mut client, mut end) = ChannelTransport::pair(8);

        client.send(r#"{"op": "current_model"}"#).await.unwrap();
        server.handle_connection(&mut end).await.unwrap();

        let reply = client.recv().await.unwrap().unwrap();
        let info: ModelInfo = serde_json::from_str(&reply).unwrap();
        assert_eq!(info.id, "main");
        assert_eq!(client.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_op_is_invalid_request() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let (mut client, mut end) = ChannelTransport::pair(8);

        client.send(r#"{"op": "trim_cache"}"#).await.unwrap();
        server.handle_connection(&mut end).await.unwrap();

        let reply: ErrorResponse =
            serde_json::from_str(&client.recv().await.unwrap().unwrap()).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_generate_over_tcp() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(server(&dir).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let serving = tokio::spawn(server.clone().serve(listener, async {
            let _ = shutdown_rx.await;
        }));

        let mut client = TcpTransport::new(TcpStream::connect(addr).await.unwrap());
        client
            .send(r#"{"op": "generate", "prompt": "1 2 3", "max_tokens": 3}"#)
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(line) = client.recv().await.unwrap() {
            chunks.push(serde_json::from_str::<TokenChunk>(&line).unwrap());
        }

        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_finished);
        assert_eq!(chunks.iter().filter(|c| c.is_finished).count(), 1);

        shutdown_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
