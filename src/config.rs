use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::cluster::types::NodeRole;

/// Command line of the `table-node` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "table-node", about = "Node of a sharded parameter-table cluster")]
pub struct NodeArgs {
    /// Address the node's HTTP server listens on.
    #[arg(long)]
    pub bind: SocketAddr,

    #[arg(long, value_enum, default_value_t = NodeRole::TableServer)]
    pub role: NodeRole,

    /// Coordinator address; required for workers and table servers.
    #[arg(long)]
    pub coordinator: Option<SocketAddr>,

    /// Registrations the coordinator waits for before assigning shards.
    #[arg(long, default_value_t = 2)]
    pub expect: usize,

    #[arg(long, default_value_t = 4)]
    pub shards: usize,

    /// Bytes of queued remote writes that trigger a flush. 0 flushes every write.
    #[arg(long, default_value_t = 0)]
    pub flush_threshold: usize,

    /// Keys touched by the worker workload.
    #[arg(long, default_value_t = 1000)]
    pub keys: i32,

    #[arg(long, default_value_t = 1)]
    pub iterations: usize,

    /// Length of the parameter vector stored under every key.
    #[arg(long, default_value_t = 16)]
    pub dim: usize,

    #[arg(long, default_value_t = tracing::Level::INFO)]
    pub log_level: tracing::Level,

    #[arg(long, default_value_t = 500)]
    pub request_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub request_attempts: usize,
}

impl NodeArgs {
    pub fn validate(&self) -> Result<()> {
        if self.role != NodeRole::Coordinator && self.coordinator.is_none() {
            anyhow::bail!("--coordinator is required for role {:?}", self.role);
        }
        if self.role == NodeRole::Coordinator && self.expect == 0 {
            anyhow::bail!("--expect must be at least 1");
        }
        if self.shards == 0 {
            anyhow::bail!("--shards must be at least 1");
        }
        if self.keys <= 0 {
            anyhow::bail!("--keys must be positive");
        }
        if self.request_attempts == 0 {
            anyhow::bail!("--request-attempts must be at least 1");
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            attempts: self.request_attempts,
            ..TransportConfig::default()
        }
    }
}

/// Timeouts and retry policy of the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to every backoff.
    pub max_jitter_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            attempts: 3,
            initial_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_millis(1200),
            max_jitter_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = NodeArgs::parse_from([
            "table-node",
            "--bind",
            "127.0.0.1:7000",
            "--coordinator",
            "127.0.0.1:6999",
        ]);

        assert_eq!(args.role, NodeRole::TableServer);
        assert_eq!(args.shards, 4);
        assert_eq!(args.flush_threshold, 0);
        assert_eq!(args.log_level, tracing::Level::INFO);
        assert!(args.validate().is_ok());

        let config = args.transport_config();
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert_eq!(config.attempts, 3);
    }

    #[test]
    fn test_parse_coordinator_role() {
        let args = NodeArgs::parse_from([
            "table-node",
            "--bind",
            "127.0.0.1:7000",
            "--role",
            "coordinator",
            "--expect",
            "3",
            "--log-level",
            "debug",
        ]);

        assert_eq!(args.role, NodeRole::Coordinator);
        assert_eq!(args.expect, 3);
        assert_eq!(args.log_level, tracing::Level::DEBUG);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_worker_requires_coordinator() {
        let args =
            NodeArgs::parse_from(["table-node", "--bind", "127.0.0.1:7000", "--role", "worker"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let args = NodeArgs::parse_from([
            "table-node",
            "--bind",
            "127.0.0.1:7000",
            "--role",
            "coordinator",
            "--shards",
            "0",
        ]);
        assert!(args.validate().is_err());
    }
}
