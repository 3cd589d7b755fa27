//! Cooperative stop flag shared by every long-running operation.
//!
//! Stopping is advisory: nothing is preempted. Work polls the flag at its own
//! checkpoints and bails out with [`RagError::StoppedByUser`] when it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::RagError;

/// Components that historically had their own "is stopped" query.
///
/// All of them read the same flag; there is no per-module state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    LocalLlm,
    Embedding,
    Reranker,
    Tokenizer,
}

impl Module {
    pub const ALL: [Module; 4] = [
        Module::LocalLlm,
        Module::Embedding,
        Module::Reranker,
        Module::Tokenizer,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "LocalLLM" => Some(Module::LocalLlm),
            "Embedding" => Some(Module::Embedding),
            "Reranker" => Some(Module::Reranker),
            "Tokenizer" => Some(Module::Tokenizer),
            _ => None,
        }
    }
}

/// Handle to a stop flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

static GLOBAL: OnceLock<StopSignal> = OnceLock::new();

impl StopSignal {
    /// Create an independent flag, initially clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide flag.
    pub fn global() -> StopSignal {
        GLOBAL.get_or_init(StopSignal::new).clone()
    }

    pub fn set_stop(&self, stop: bool) {
        self.flag.store(stop, Ordering::SeqCst);
        if stop {
            debug!("Global stop flag set to true");
        } else {
            debug!("Global stop flag reset to false");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.set_stop(false);
    }

    /// Fails with [`RagError::StoppedByUser`] when a stop was requested.
    pub fn checkpoint(&self) -> Result<(), RagError> {
        if self.is_stop_requested() {
            Err(RagError::StoppedByUser)
        } else {
            Ok(())
        }
    }

    pub fn is_module_stopped(&self, _module: Module) -> bool {
        self.is_stop_requested()
    }

    /// Unknown module names count as stopped.
    pub fn is_module_stopped_by_name(&self, name: &str) -> bool {
        match Module::from_name(name) {
            Some(module) => self.is_module_stopped(module),
            None => true,
        }
    }

    pub fn all_modules_stopped(&self) -> bool {
        Module::ALL.iter().all(|m| self.is_module_stopped(*m))
    }
}
