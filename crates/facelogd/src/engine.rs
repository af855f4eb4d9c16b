//! Dedicated OS thread owning the ONNX sessions.
//!
//! Inference is blocking and the sessions need `&mut`, so the async side
//! talks to the thread through a channel and awaits a oneshot reply.

use async_trait::async_trait;
use facelog_core::{EmbedError, Embedding, EmbeddingSource};
use facelog_vision::{FacePipeline, PipelineError, RecognizerError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

type EmbedReply = oneshot::Sender<Result<Option<Embedding>, EmbedError>>;

struct EmbedRequest {
    image: Vec<u8>,
    reply: EmbedReply,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EmbedRequest>,
}

#[async_trait]
impl EmbeddingSource for EngineHandle {
    async fn embed(&self, image: Vec<u8>) -> Result<Option<Embedding>, EmbedError> {
        let closed = || EmbedError::Backend("engine thread exited".into());
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmbedRequest { image, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

/// Run `backend` on its own thread, serving one request at a time.
pub fn spawn_engine<F>(mut backend: F) -> Result<EngineHandle, EngineError>
where
    F: FnMut(&[u8]) -> Result<Option<Embedding>, EmbedError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EmbedRequest>(4);

    std::thread::Builder::new()
        .name("facelog-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = backend(&req.image);
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

/// Adapt a loaded [`FacePipeline`] to the engine's backend signature.
pub fn pipeline_backend(
    mut pipeline: FacePipeline,
) -> impl FnMut(&[u8]) -> Result<Option<Embedding>, EmbedError> + Send + 'static {
    move |image: &[u8]| pipeline.embed_image(image).map_err(embed_error)
}

fn embed_error(err: PipelineError) -> EmbedError {
    match err {
        PipelineError::Decode(e) => EmbedError::InvalidImage(e.to_string()),
        PipelineError::Recognizer(RecognizerError::InvalidEmbedding(v)) => EmbedError::InvalidVector(v),
        other => EmbedError::Backend(other.to_string()),
    }
}
