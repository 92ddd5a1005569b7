//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::partition::RemainderPolicy;

/// Configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Label attached to log events.
    pub label: String,
    /// Where the `N % S` leftover elements go.
    pub remainder_policy: RemainderPolicy,
    /// Record every acquisition in the engine's resource tracker.
    pub track_resources: bool,
    /// Check parameter vectors against the device limits before acquiring.
    pub enforce_device_limits: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            label: "streamgrid".to_string(),
            remainder_policy: RemainderPolicy::FoldIntoLast,
            track_resources: true,
            enforce_device_limits: true,
        }
    }
}

impl EngineConfig {
    /// Creates a minimal configuration (no resource tracking).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            track_resources: false,
            ..Self::default()
        }
    }

    /// Creates a configuration that issues the remainder as its own chunk.
    #[must_use]
    pub fn trailing_remainder() -> Self {
        Self {
            remainder_policy: RemainderPolicy::TrailingChunk,
            ..Self::default()
        }
    }

    /// Starts a builder from the defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a minimal configuration builder.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: EngineConfig::minimal(),
        }
    }

    /// Sets the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    /// Sets the remainder policy.
    #[must_use]
    pub fn with_remainder_policy(mut self, policy: RemainderPolicy) -> Self {
        self.config.remainder_policy = policy;
        self
    }

    /// Enables or disables resource tracking.
    #[must_use]
    pub fn with_resource_tracking(mut self, enabled: bool) -> Self {
        self.config.track_resources = enabled;
        self
    }

    /// Enables or disables device-limit checks.
    #[must_use]
    pub fn with_device_limits(mut self, enforce: bool) -> Self {
        self.config.enforce_device_limits = enforce;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
