//! Healing resolver: the execution policy applied to every node.

use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::config::HealingConfig;
use crate::failsafe::RetryPolicy;

use super::{Dependencies, Neuron};

/// Turns node references into values.
///
/// Cheap to clone; in-flight evaluations carry their own copy so that
/// dependencies heal under the same policy as the node that asked for them.
#[derive(Debug, Clone)]
pub struct Resolver {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl Resolver {
    /// Create a resolver from an explicit retry policy
    #[must_use]
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
        }
    }

    /// Create a resolver from configuration
    #[must_use]
    pub fn from_config(config: &HealingConfig) -> Self {
        Self::new(RetryPolicy::new(config), config.attempt_timeout)
    }

    /// Retry policy between attempts
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upper bound of a single evaluation
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Resolve a node, healing on retryable failures
    ///
    /// # Errors
    ///
    /// Returns the node's last error once attempts are exhausted, or the
    /// first non-retryable error.
    pub async fn resolve<I, O>(&self, node: &Arc<Neuron<I, O>>) -> Result<O>
    where
        I: Send + 'static,
        O: Clone + Send + Sync + 'static,
    {
        node.get_with_healing(self).await
    }

    /// Resolve a node with a single attempt
    ///
    /// # Errors
    ///
    /// Returns the attempt's error unchanged.
    pub async fn resolve_once<I, O>(&self, node: &Arc<Neuron<I, O>>) -> Result<O>
    where
        I: Send + 'static,
        O: Clone + Send + Sync + 'static,
    {
        node.get(self).await
    }

    /// Resolve a node on behalf of another evaluation.
    ///
    /// The node heals on its own; a failure that survives its healing is
    /// reported as `Error::Dependency` so the caller does not retry it again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Dependency` wrapping the node's final error.
    pub async fn require<I, O>(&self, node: &Arc<Neuron<I, O>>) -> Result<O>
    where
        I: Send + 'static,
        O: Clone + Send + Sync + 'static,
    {
        Dependencies::resolve(node, self).await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::from_config(&HealingConfig::default())
    }
}
