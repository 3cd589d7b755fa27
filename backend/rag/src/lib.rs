//! Retrieval-augmented query pipeline on top of the model collaborators.

pub mod orchestrator;
pub mod prompt;
pub mod retriever;

pub use orchestrator::{
    drive_callback, QueryRequest, QueryUpdate, RagQueryCallback, RagQueryManager,
};
pub use prompt::build_prompt;
pub use retriever::DirectoryRetriever;
