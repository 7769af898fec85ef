//! Engine Configuration
//!
//! Tunables for one evaluation unit. Defaults are safe for tests; the
//! embedding layer overrides them per deployment.

/// Configuration for IR evaluation
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum optimizer fixed-point iterations
    pub max_optimizer_iterations: usize,
    /// Generated-method size threshold (instructions) before the builder
    /// splits a body into helper methods
    pub split_threshold: usize,
    /// Force the interpreter even for compilable IR (debugging aid)
    pub interpret_only: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_optimizer_iterations: 10,
            split_threshold: 1024,
            interpret_only: false,
        }
    }
}

impl EngineOptions {
    /// Create options with the default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the optimizer fixed-point iteration bound
    pub fn with_max_optimizer_iterations(mut self, n: usize) -> Self {
        self.max_optimizer_iterations = n;
        self
    }

    /// Set the method-splitting threshold
    pub fn with_split_threshold(mut self, n: usize) -> Self {
        self.split_threshold = n;
        self
    }

    /// Route every evaluation through the interpreter
    pub fn interpret_only(mut self) -> Self {
        self.interpret_only = true;
        self
    }
}
