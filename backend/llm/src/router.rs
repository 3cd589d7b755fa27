use anyhow::Result;
use async_trait::async_trait;
use localrag_core::error::stage;
use localrag_core::{ChunkSink, ConnectionParams, ModelCaller, RagError};
use std::sync::Arc;
use tracing::debug;

use crate::providers::{ApiType, ProviderRegistry};
use crate::streaming::StreamingClient;

/// Sends each call to the local model or to the remote HTTP API, based on the
/// endpoint.
pub struct ModelRouter {
    registry: ProviderRegistry,
    http: StreamingClient,
    local: Option<Arc<dyn ModelCaller>>,
}

impl ModelRouter {
    pub fn new(http: StreamingClient) -> Self {
        Self {
            registry: ProviderRegistry::default(),
            http,
            local: None,
        }
    }

    pub fn with_local(mut self, local: Arc<dyn ModelCaller>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}

#[async_trait]
impl ModelCaller for ModelRouter {
    fn provider_name(&self, endpoint: &str) -> String {
        self.registry.display_name(endpoint)
    }

    async fn call(
        &self,
        params: &ConnectionParams,
        prompt: &str,
        sink: &ChunkSink<'_>,
    ) -> Result<String> {
        match ApiType::detect(&params.endpoint) {
            ApiType::Local => {
                debug!("Routing to local model: {}", params.model_id);
                match &self.local {
                    Some(local) => local.call(params, prompt, sink).await,
                    None => Err(RagError::stage(
                        stage::LOCAL_MODEL,
                        "no local model runtime is configured",
                    )
                    .into()),
                }
            }
            api_type => {
                debug!("Routing to remote API ({:?}): {}", api_type, params.endpoint);
                self.http
                    .stream(
                        &params.endpoint,
                        &params.credential,
                        &params.model_id,
                        prompt,
                        sink,
                    )
                    .await
            }
        }
    }
}
