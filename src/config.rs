//! Engine configuration.

/// What happens to the rest of the engine when a handler or request fails.
///
/// Requests that return [`RequestError::Unhandled`](crate::RequestError::Unhandled)
/// are fatal under every policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and drop the failed unit; siblings keep running.
    #[default]
    Isolate,

    /// Record the first failure, cancel everything in flight, and interrupt
    /// the engine.
    CancelAll,
}

/// Configuration for an [`Engine`](crate::Engine).
///
/// Pass to [`EngineBuilder::config`](crate::EngineBuilder::config).
///
/// # Examples
///
/// ```
/// use empress::{EngineConfig, FailurePolicy};
///
/// let config = EngineConfig::default()
///     .with_name("checkout")
///     .with_failure_policy(FailurePolicy::CancelAll);
/// assert_eq!(config.name, "checkout");
///
/// let defaults = EngineConfig::default();
/// assert_eq!(defaults.name, "engine");
/// assert_eq!(defaults.failure_policy, FailurePolicy::Isolate);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name attached to every handler and request span.
    ///
    /// Default: `"engine"`.
    pub name: String,

    /// Reaction to handler and request failures.
    ///
    /// Default: [`FailurePolicy::Isolate`].
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "engine".to_owned(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Set the engine name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}
