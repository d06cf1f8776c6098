//! Engine construction parameters and runtime tunables.

use std::{str::FromStr, time::Duration};

use bytesize::ByteSize;
use log::warn;

/// RPC port used when the local server name carries none (or an unparsable one).
pub const DEFAULT_RPC_PORT: u16 = 12345;

/// Protocol assumed for a metadata URI written without `proto://`.
pub const DEFAULT_METADATA_PROTOCOL: &str = "etcd";

pub const DEFAULT_SLICE_SIZE: u64 = 64 * 1024;
pub const DEFAULT_WORKERS_PER_TRANSPORT: usize = 2;
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_BATCHES: usize = 1024;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1 << 16;

const ENV_SLICE_SIZE: &str = "SEGFLOW_SLICE_SIZE";
const ENV_WORKERS: &str = "SEGFLOW_WORKERS_PER_TRANSPORT";
const ENV_TRANSFER_TIMEOUT_MS: &str = "SEGFLOW_TRANSFER_TIMEOUT_MS";
const ENV_CONNECT_TIMEOUT_MS: &str = "SEGFLOW_CONNECT_TIMEOUT_MS";
const ENV_MAX_BATCHES: &str = "SEGFLOW_MAX_BATCHES";
const ENV_MAX_BATCH_SIZE: &str = "SEGFLOW_MAX_BATCH_SIZE";

/// Reachable identity of the local engine, derived from `local_server_name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Full name as given; also the name of the local segment.
    pub server_name: String,
    pub host: String,
    pub rpc_port: u16,
}

impl LocalIdentity {
    /// Splits `host[:port]` (or `[v6]:port`). A missing or unparsable port
    /// falls back to [`DEFAULT_RPC_PORT`].
    pub fn parse(local_server_name: &str) -> Self {
        let server_name = local_server_name.trim().to_string();
        let (host, port) = split_host_port(&server_name);
        let rpc_port = port
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_RPC_PORT);
        Self {
            host: host.to_string(),
            server_name,
            rpc_port,
        }
    }
}

fn split_host_port(name: &str) -> (&str, Option<&str>) {
    if let Some(stripped) = name.strip_prefix('[') {
        return match stripped.split_once(']') {
            Some((host, rest)) => (host, rest.strip_prefix(':')),
            None => (name, None),
        };
    }

    match name.split_once(':') {
        // A bare IPv6 literal has several colons and no port.
        Some((_, rest)) if rest.contains(':') => (name, None),
        Some((host, port)) => (host, Some(port)),
        None => (name, None),
    }
}

/// `proto://domain` address of the discovery service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataUri {
    pub protocol: String,
    pub domain: String,
}

impl MetadataUri {
    pub fn parse(uri: &str) -> Self {
        let uri = uri.trim();
        match uri.split_once("://") {
            Some((protocol, domain)) => Self {
                protocol: protocol.to_ascii_lowercase(),
                domain: domain.to_string(),
            },
            None => Self {
                protocol: DEFAULT_METADATA_PROTOCOL.to_string(),
                domain: uri.to_string(),
            },
        }
    }
}

/// Backend-specific parameters for one transport. During engine creation an
/// entry with empty `params` is skipped rather than installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub name: String,
    pub params: String,
}

impl TransportConfig {
    pub fn new(name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
        }
    }

    /// RDMA transport configured by a serialized NIC priority matrix.
    pub fn rdma(nic_priority_matrix: impl Into<String>) -> Self {
        Self::new("rdma", nic_priority_matrix)
    }

    pub fn tcp(params: impl Into<String>) -> Self {
        Self::new("tcp", params)
    }

    pub fn local() -> Self {
        Self::new("local", "{}")
    }

    pub fn is_enabled(&self) -> bool {
        !self.params.trim().is_empty()
    }
}

/// Runtime tunables shared by every transport of one engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Requests are split into slices of at most this many bytes.
    pub slice_size: u64,
    pub workers_per_transport: usize,
    /// Budget for one request, measured from submission.
    pub transfer_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_batches: usize,
    pub max_batch_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
            workers_per_transport: DEFAULT_WORKERS_PER_TRANSPORT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_batches: DEFAULT_MAX_BATCHES,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by `SEGFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_parsed::<ByteSize>(ENV_SLICE_SIZE) {
            config.slice_size = size.as_u64();
        }
        if let Some(workers) = env_parsed::<usize>(ENV_WORKERS) {
            config.workers_per_transport = workers;
        }
        if let Some(ms) = env_parsed::<u64>(ENV_TRANSFER_TIMEOUT_MS) {
            config.transfer_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parsed::<u64>(ENV_CONNECT_TIMEOUT_MS) {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = env_parsed::<usize>(ENV_MAX_BATCHES) {
            config.max_batches = max;
        }
        if let Some(max) = env_parsed::<usize>(ENV_MAX_BATCH_SIZE) {
            config.max_batch_size = max;
        }
        config.sanitized()
    }

    /// Replaces zero values, which would stall the engine, with defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.slice_size == 0 {
            warn!("slice_size must be non-zero, using {}", defaults.slice_size);
            self.slice_size = defaults.slice_size;
        }
        if self.workers_per_transport == 0 {
            warn!(
                "workers_per_transport must be non-zero, using {}",
                defaults.workers_per_transport
            );
            self.workers_per_transport = defaults.workers_per_transport;
        }
        if self.max_batches == 0 {
            self.max_batches = defaults.max_batches;
        }
        if self.max_batch_size == 0 {
            self.max_batch_size = defaults.max_batch_size;
        }
        self
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    let raw = read_env(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid {name}=`{raw}`");
            None
        }
    }
}

/// Everything needed to construct a [`crate::TransferEngine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub local_server_name: String,
    pub metadata_uri: String,
    pub transports: Vec<TransportConfig>,
    pub tuning: TransferConfig,
}

impl EngineConfig {
    pub fn new(local_server_name: impl Into<String>, metadata_uri: impl Into<String>) -> Self {
        Self {
            local_server_name: local_server_name.into(),
            metadata_uri: metadata_uri.into(),
            transports: Vec::new(),
            tuning: TransferConfig::from_env(),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_tuning(mut self, tuning: TransferConfig) -> Self {
        self.tuning = tuning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_RPC_PORT, LocalIdentity, MetadataUri, TransferConfig, TransportConfig};

    #[test]
    fn identity_with_explicit_port() {
        let identity = LocalIdentity::parse("10.0.0.1:9000");
        assert_eq!(identity.host, "10.0.0.1");
        assert_eq!(identity.rpc_port, 9000);
        assert_eq!(identity.server_name, "10.0.0.1:9000");
    }

    #[test]
    fn identity_without_port_uses_default() {
        let identity = LocalIdentity::parse("10.0.0.1");
        assert_eq!(identity.host, "10.0.0.1");
        assert_eq!(identity.rpc_port, DEFAULT_RPC_PORT);
    }

    #[test]
    fn identity_with_garbage_port_uses_default() {
        let identity = LocalIdentity::parse("node-a:http");
        assert_eq!(identity.host, "node-a");
        assert_eq!(identity.rpc_port, DEFAULT_RPC_PORT);

        let identity = LocalIdentity::parse("node-a:99999");
        assert_eq!(identity.rpc_port, DEFAULT_RPC_PORT);
    }

    #[test]
    fn identity_ipv6_forms() {
        let identity = LocalIdentity::parse("[fe80::1]:7000");
        assert_eq!(identity.host, "fe80::1");
        assert_eq!(identity.rpc_port, 7000);

        let identity = LocalIdentity::parse("fe80::1");
        assert_eq!(identity.host, "fe80::1");
        assert_eq!(identity.rpc_port, DEFAULT_RPC_PORT);
    }

    #[test]
    fn metadata_uri_defaults_to_etcd() {
        assert_eq!(
            MetadataUri::parse("etcd://meta"),
            MetadataUri {
                protocol: "etcd".to_string(),
                domain: "meta".to_string()
            }
        );
        assert_eq!(MetadataUri::parse("10.0.0.2:2379").protocol, "etcd");
        assert_eq!(MetadataUri::parse("memory://cluster-a").domain, "cluster-a");
    }

    #[test]
    fn empty_transport_params_disable_install() {
        assert!(!TransportConfig::rdma("").is_enabled());
        assert!(!TransportConfig::rdma("   ").is_enabled());
        assert!(TransportConfig::local().is_enabled());
    }

    #[test]
    fn sanitized_replaces_zero_values() {
        let config = TransferConfig {
            slice_size: 0,
            workers_per_transport: 0,
            max_batches: 0,
            max_batch_size: 0,
            ..TransferConfig::default()
        }
        .sanitized();
        assert_eq!(config, TransferConfig::default());
    }
}
