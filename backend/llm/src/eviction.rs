use std::time::Duration;

/// Idle timeout the app used before auto-unload was switched off.
/// Kept for reference; nothing enables it by default.
pub const LEGACY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// When an idle model is unloaded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Keep the model until it is replaced, unloaded or the manager shuts down.
    #[default]
    Disabled,
    /// Unload once the model has been idle (not busy, not accessed) this long.
    IdleTimeout(Duration),
}

impl EvictionPolicy {
    pub fn from_idle_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => EvictionPolicy::IdleTimeout(timeout),
            None => EvictionPolicy::Disabled,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self {
            EvictionPolicy::Disabled => None,
            EvictionPolicy::IdleTimeout(timeout) => Some(*timeout),
        }
    }
}
