//! Contracts for the collaborators the pipeline calls out to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::RagError;

/// Where and how to reach a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Endpoint URL, or `"local"` for an on-device model.
    pub endpoint: String,
    pub credential: String,
    pub model_id: String,
}

/// Receives streaming chunks for one model call.
///
/// Borrowed by the collaborator for the duration of the call only, so no chunk
/// can arrive after the call has returned its terminal result.
pub struct ChunkSink<'a> {
    forward: Box<dyn Fn(String) -> bool + Send + Sync + 'a>,
}

impl<'a> ChunkSink<'a> {
    /// `forward` returns false once nobody is listening any more.
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(String) -> bool + Send + Sync + 'a,
    {
        Self {
            forward: Box::new(forward),
        }
    }

    /// Returns false once nobody is listening any more.
    pub fn send(&self, chunk: impl Into<String>) -> bool {
        (self.forward)(chunk.into())
    }
}

impl ChunkSink<'static> {
    pub fn from_channel(tx: mpsc::UnboundedSender<String>) -> Self {
        ChunkSink::new(move |chunk| tx.send(chunk).is_ok())
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        ChunkSink::new(|_| true)
    }
}

/// Model-calling collaborator.
///
/// Emits zero or more chunks through `sink`, then returns exactly one terminal
/// result: the full text, or an error message.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Display name of the provider serving `endpoint`.
    fn provider_name(&self, endpoint: &str) -> String;

    async fn call(
        &self,
        params: &ConnectionParams,
        prompt: &str,
        sink: &ChunkSink<'_>,
    ) -> anyhow::Result<String>;
}

/// Retrieval collaborator: raw text relevant to `query` from a knowledge base.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, knowledge_base: &str, query: &str) -> Result<String, RagError>;
}

/// A stage label plus free-form detail. Purely observational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    pub detail: String,
}

impl Progress {
    pub fn new(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}
