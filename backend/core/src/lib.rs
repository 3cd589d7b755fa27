pub mod collab;
pub mod config;
pub mod error;
pub mod stop;
pub mod task;

pub use collab::{ChunkSink, ConnectionParams, ModelCaller, Progress, Retriever};
pub use config::RagConfig;
pub use error::RagError;
pub use stop::{Module, StopSignal};
pub use task::{pending, task, Completer, Outcome, Pending, TaskHandle, TaskReporter};
