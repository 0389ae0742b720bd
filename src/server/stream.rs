//! Streaming generation handler
//!
//! Reads one request payload from a connection, runs it through the
//! [`Generator`] and forwards every chunk in order. The connection is closed
//! on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::inference::backend::ModelBackend;
use crate::inference::generation::{GenerationError, Generator};
use crate::server::transport::{Transport, TransportError};
use crate::types::{GenerationRequest, TokenChunk};

/// Chunks buffered between the generator and the connection
pub const CHUNK_BUFFER: usize = 64;

/// Read exactly one request from `transport` and stream its generation
pub async fn handle_stream<B, T>(transport: &mut T, generator: &Generator<B>) -> Result<(), TransportError>
where
    B: ModelBackend,
    T: Transport + ?Sized,
{
    match transport.recv().await {
        Ok(Some(payload)) => serve_payload(&payload, transport, generator).await,
        Ok(None) => {
            tracing::debug!("Connection closed before a request arrived");
            close(transport).await;
            Ok(())
        }
        Err(e) => {
            close(transport).await;
            Err(e)
        }
    }
}

/// Stream the generation for a payload that was already read from `transport`
pub async fn serve_payload<B, T>(
    payload: &str,
    transport: &mut T,
    generator: &Generator<B>,
) -> Result<(), TransportError>
where
    B: ModelBackend,
    T: Transport + ?Sized,
{
    let result = stream_generation(payload, transport, generator).await;
    close(transport).await;
    result
}

pub(crate) async fn close<T: Transport + ?Sized>(transport: &mut T) {
    if let Err(e) = transport.close().await {
        tracing::debug!("Error closing connection: {}", e);
    }
}

async fn send_chunk<T: Transport + ?Sized>(transport: &mut T, chunk: &TokenChunk) -> Result<(), TransportError> {
    let message = serde_json::to_string(chunk)?;
    transport.send(&message).await
}

async fn stream_generation<B, T>(
    payload: &str,
    transport: &mut T,
    generator: &Generator<B>,
) -> Result<(), TransportError>
where
    B: ModelBackend,
    T: Transport + ?Sized,
{
    let request = match GenerationRequest::from_json(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected generation request: {}", e);
            return send_chunk(transport, &TokenChunk::error(e.to_string())).await;
        }
    };

    let sessions = generator.sessions();
    if !sessions.is_available() {
        let error = GenerationError::BackendUnavailable;
        return send_chunk(transport, &TokenChunk::error(error.to_string())).await;
    }
    if !sessions.is_loaded().await {
        let error = GenerationError::NoModelLoaded;
        return send_chunk(transport, &TokenChunk::error(error.to_string())).await;
    }

    let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
    let stop = Arc::new(AtomicBool::new(false));
    let generation = generator.generate(request, tx, stop.clone());
    tokio::pin!(generation);

    let mut finished = false;
    let mut peer_open = true;
    let mut delivering = true;
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            summary = &mut generation, if !finished => {
                finished = true;
                tracing::debug!(
                    "Generation ended in {:?} ({} tokens)",
                    summary.state,
                    summary.generated_tokens
                );
            }
            chunk = rx.recv() => {
                // Closed once the generator is done and everything was forwarded
                let Some(chunk) = chunk else { break };
                if !delivering {
                    continue;
                }
                if let Err(e) = send_chunk(transport, &chunk).await {
                    tracing::warn!("Failed to send chunk, cancelling generation: {}", e);
                    stop.store(true, Ordering::SeqCst);
                    delivering = false;
                    outcome = Err(e);
                }
            }
            inbound = transport.recv(), if peer_open => match inbound {
                Ok(Some(_)) => tracing::debug!("Ignoring message received during generation"),
                // Half-closed: the client may still be reading
                Ok(None) => {
                    tracing::debug!("Client finished sending");
                    peer_open = false;
                }
                Err(e) => {
                    tracing::info!("Client disconnected ({}), cancelling generation", e);
                    stop.store(true, Ordering::SeqCst);
                    peer_open = false;
                    delivering = false;
                }
            },
        }
    }

    if !finished {
        generation.await;
    }
    outcome
}
