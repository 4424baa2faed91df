//! Node configuration.
//!
//! Settings can come from a JSON file, from command-line flags, or both;
//! flags win. Every field has a default, so an empty object is a valid file:
//!
//! ```json
//! {"retry_interval_ms": 500, "rpc_timeout_ms": 1000, "exclude_sender": true}
//! ```

use std::path::Path;
use std::time::Duration;

use clap::Args;
use glomer_broadcast::DisseminationConfig;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Upper bound on the RPC timeout.
pub const MAX_RPC_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Delay between failed origin delivery attempts, in milliseconds.
    pub retry_interval_ms: u64,
    /// How long an RPC waits for its reply, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Skip the peer a value came from when relaying it.
    pub exclude_sender: bool,
    /// Relay forwards as RPCs rather than fire-and-forget sends.
    pub relay_expects_reply: bool,
    /// Send client broadcasts to every other node, not just topology
    /// neighbors.
    pub origin_targets_all_nodes: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            rpc_timeout_ms: 1000,
            exclude_sender: true,
            relay_expects_reply: true,
            origin_targets_all_nodes: true,
        }
    }
}

/// Command-line overrides layered over a loaded [`NodeConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct ConfigOverrides {
    /// Delay between failed origin delivery attempts, in milliseconds
    #[arg(long, env = "GLOMER_RETRY_INTERVAL_MS")]
    pub retry_interval_ms: Option<u64>,

    /// How long an RPC waits for its reply, in milliseconds
    #[arg(long, env = "GLOMER_RPC_TIMEOUT_MS")]
    pub rpc_timeout_ms: Option<u64>,

    /// Also relay values back to the peer they came from
    #[arg(long)]
    pub include_sender: bool,

    /// Relay forwards without waiting for an acknowledgement
    #[arg(long)]
    pub fire_and_forget_relay: bool,

    /// Send client broadcasts only to topology neighbors
    #[arg(long)]
    pub origin_follows_topology: bool,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, NodeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Applies command-line overrides and validates the result.
    ///
    /// Unset options and flags leave the loaded values alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged configuration fails validation.
    pub fn apply_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self, NodeError> {
        if let Some(retry_interval_ms) = overrides.retry_interval_ms {
            self.retry_interval_ms = retry_interval_ms;
        }
        if let Some(rpc_timeout_ms) = overrides.rpc_timeout_ms {
            self.rpc_timeout_ms = rpc_timeout_ms;
        }
        if overrides.include_sender {
            self.exclude_sender = false;
        }
        if overrides.fire_and_forget_relay {
            self.relay_expects_reply = false;
        }
        if overrides.origin_follows_topology {
            self.origin_targets_all_nodes = false;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.retry_interval_ms == 0 {
            return Err(NodeError::Config(
                "retry_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.rpc_timeout_ms == 0 {
            return Err(NodeError::Config(
                "rpc_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.rpc_timeout_ms > MAX_RPC_TIMEOUT_MS {
            return Err(NodeError::Config(format!(
                "rpc_timeout_ms cannot exceed {MAX_RPC_TIMEOUT_MS}"
            )));
        }

        Ok(())
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub const fn dissemination(&self) -> DisseminationConfig {
        DisseminationConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            exclude_sender: self.exclude_sender,
            relay_expects_reply: self.relay_expects_reply,
            origin_targets_all_nodes: self.origin_targets_all_nodes,
        }
    }

    /// How long an RPC waits for its reply.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
