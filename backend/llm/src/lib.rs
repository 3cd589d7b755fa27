//! Model-side building blocks: the single-slot resource manager, local model
//! catalog, and the remote provider client.

pub mod catalog;
pub mod eviction;
pub mod local;
pub mod manager;
pub mod model;
pub mod providers;
pub mod router;
pub mod streaming;

pub use catalog::{ModelCatalog, ModelInfo, ModelStatus};
pub use eviction::{EvictionPolicy, LEGACY_IDLE_TIMEOUT};
pub use local::LocalModelCaller;
pub use manager::{ExclusiveContext, LoadListener, LoadedModel, ManagerOptions, ResourceManager};
pub use model::{
    BatchInput, ExclusiveInput, ManagedModel, ModelLoader, PromptInput, RerankResult, Reranker,
    TextGenerator,
};
pub use providers::{ApiType, ProviderInfo, ProviderRegistry};
pub use router::ModelRouter;
pub use streaming::StreamingClient;
