use anyhow::Result;
use localrag_core::RagError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A loaded model owned by a [`crate::ResourceManager`].
pub trait ManagedModel: Send + 'static {
    /// Bring the model into a usable state after loading.
    fn initialize(&mut self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Release native memory. Must be safe to call more than once.
    fn cleanup(&mut self);
}

/// Backing store that turns a key (usually a path) into a model.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: ManagedModel;

    /// Whether `key` refers to an existing backing artifact.
    fn exists(&self, key: &str) -> bool {
        Path::new(key).exists()
    }

    fn load(&self, key: &str) -> Result<Self::Model>;
}

/// Models that score (query, document) pairs.
pub trait Reranker: ManagedModel {
    fn score(&mut self, query: &str, document: &str) -> Result<f32>;
}

/// Models that generate text token by token.
pub trait TextGenerator: ManagedModel {
    /// Calls `on_token` for every decoded piece; generation stops early when it
    /// returns false. Returns the full text produced.
    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str) -> bool)
        -> Result<String>;
}

/// Input to an exclusive operation, validated before any work is scheduled.
pub trait ExclusiveInput {
    fn validate(&self) -> Result<(), RagError>;
}

/// A query plus a batch of items to process against it.
#[derive(Debug, Clone, Default)]
pub struct BatchInput {
    pub query: String,
    pub batch: Vec<String>,
}

impl BatchInput {
    pub fn new(query: impl Into<String>, batch: Vec<String>) -> Self {
        Self {
            query: query.into(),
            batch,
        }
    }
}

impl ExclusiveInput for BatchInput {
    fn validate(&self) -> Result<(), RagError> {
        if self.query.trim().is_empty() {
            return Err(RagError::invalid_input("query empty"));
        }
        if self.batch.is_empty() {
            return Err(RagError::invalid_input("batch empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    pub prompt: String,
}

impl ExclusiveInput for PromptInput {
    fn validate(&self) -> Result<(), RagError> {
        if self.prompt.trim().is_empty() {
            return Err(RagError::invalid_input("prompt empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Position of the document in the submitted batch
    pub index: usize,
    pub document: String,
    pub score: f32,
}
