//! Engine configuration.

/// Knobs fixed when an [`Engine`](crate::Engine) is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Read back every float op output and fail with
    /// [`Error::NonFinite`](crate::Error::NonFinite) on NaN. Slow; meant for tests.
    pub debug: bool,
    /// Record ops while a gradient computation is running. Turning this off
    /// makes every `gradients` call fail with a missing gradient.
    pub record_gradients: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            debug: false,
            record_gradients: true,
        }
    }
}

impl EngineConfig {
    pub fn debug() -> Self {
        EngineConfig {
            debug: true,
            ..Self::default()
        }
    }
}
