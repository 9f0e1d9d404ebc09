//! Session configuration.

use crate::query::MergeStrategy;
use entiq_transport::ServiceEndpoint;

/// What happens to a batch when the server rejects part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Any entity error leaves every entity of the batch untouched.
    #[default]
    AllOrNothing,
    /// When the server commits and reports errors in one successful
    /// response, entities not named by an error are committed.
    PartialCommit,
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service the session talks to.
    pub endpoint: ServiceEndpoint,
    /// Default merge strategy for queries.
    pub merge_strategy: MergeStrategy,
    /// Handling of partially rejected saves.
    pub save_policy: SavePolicy,
    /// Number of change notifications kept for polling.
    pub change_history: usize,
}

impl SessionConfig {
    /// Creates a configuration for the given endpoint.
    pub fn new(endpoint: ServiceEndpoint) -> Self {
        Self {
            endpoint,
            merge_strategy: MergeStrategy::default(),
            save_policy: SavePolicy::default(),
            change_history: 1024,
        }
    }

    /// Creates a configuration for a service name with default settings.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self::new(ServiceEndpoint::new(service_name))
    }

    /// Sets the default merge strategy.
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Sets the save policy.
    pub fn with_save_policy(mut self, policy: SavePolicy) -> Self {
        self.save_policy = policy;
        self
    }

    /// Sets the change history size.
    pub fn with_change_history(mut self, size: usize) -> Self {
        self.change_history = size;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_service("api/")
    }
}
