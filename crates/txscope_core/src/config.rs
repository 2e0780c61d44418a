//! Scope configuration.

/// Configuration for a [`crate::Scope`].
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    /// Name of the scope. Defaults to the connection source's name.
    pub name: Option<String>,

    /// Maximum number of connections the identity cache remembers.
    pub identity_cache_capacity: usize,

    /// Whether transactions capture a backtrace when they are created.
    ///
    /// The trace is only logged when a transaction is forcibly closed.
    /// Capturing honors `RUST_BACKTRACE`.
    pub capture_creation_trace: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            name: None,
            identity_cache_capacity: 1024,
            capture_creation_trace: true,
        }
    }
}

impl ScopeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scope name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the identity cache capacity.
    #[must_use]
    pub const fn identity_cache_capacity(mut self, capacity: usize) -> Self {
        self.identity_cache_capacity = capacity;
        self
    }

    /// Sets whether to capture creation traces.
    #[must_use]
    pub const fn capture_creation_trace(mut self, value: bool) -> Self {
        self.capture_creation_trace = value;
        self
    }
}
