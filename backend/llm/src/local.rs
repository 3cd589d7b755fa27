use anyhow::Result;
use async_trait::async_trait;
use localrag_core::{ChunkSink, ConnectionParams, ModelCaller};
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::ModelCatalog;
use crate::manager::ResourceManager;
use crate::model::{ModelLoader, TextGenerator};

/// Answers prompts with an on-device model held by a [`ResourceManager`].
///
/// `model_id` is resolved against the catalog; every generated token is
/// forwarded as a stream chunk.
pub struct LocalModelCaller<L: ModelLoader> {
    manager: Arc<ResourceManager<L>>,
    catalog: ModelCatalog,
}

impl<L> LocalModelCaller<L>
where
    L: ModelLoader,
    L::Model: TextGenerator,
{
    pub fn new(manager: Arc<ResourceManager<L>>, catalog: ModelCatalog) -> Self {
        Self { manager, catalog }
    }

    pub fn manager(&self) -> &Arc<ResourceManager<L>> {
        &self.manager
    }
}

#[async_trait]
impl<L> ModelCaller for LocalModelCaller<L>
where
    L: ModelLoader,
    L::Model: TextGenerator,
{
    fn provider_name(&self, _endpoint: &str) -> String {
        "Local model".to_string()
    }

    async fn call(
        &self,
        params: &ConnectionParams,
        prompt: &str,
        sink: &ChunkSink<'_>,
    ) -> Result<String> {
        let path = self.catalog.model_dir(&params.model_id);
        info!("Calling local model: {}", path.display());

        let mut handle = self.manager.generate(&path.to_string_lossy(), prompt);
        while let Some(token) = handle.next_update().await {
            if !sink.send(token) {
                debug!("Chunk receiver closed, stopping local generation");
                // Generation notices on its next token.
                handle.close_updates();
                break;
            }
        }
        Ok(handle.finish().await?)
    }
}
