//! Server configuration from `DRAUPNIR_*` environment variables

use draupnir_engine::whitelist::DEFAULT_CHAIN;
use draupnir_engine::{EngineConfig, PostgresConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::client_ip::{parse_cidrs, ClientIpConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBackendKind {
    Btrfs,
    Directory,
}

impl FromStr for SnapshotBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btrfs" => Ok(Self::Btrfs),
            "directory" => Ok(Self::Directory),
            other => Err(format!("unknown snapshot backend {other:?}, expected btrfs or directory")),
        }
    }
}

/// Firewall whitelisting of instance ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistConfig {
    pub enabled: bool,
    pub reconcile_interval: Duration,
    pub chain: String,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reconcile_interval: Duration::from_secs(60),
            chain: DEFAULT_CHAIN.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,
    pub shared_secret: String,
    pub snapshot_backend: SnapshotBackendKind,
    pub use_sudo: bool,
    pub postgres: PostgresConfig,
    pub engine: EngineConfig,
    pub whitelist: WhitelistConfig,
    pub client_ip: ClientIpConfig,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_address", &self.listen_address)
            .field("shared_secret", &"<redacted>")
            .field("snapshot_backend", &self.snapshot_backend)
            .field("use_sudo", &self.use_sudo)
            .field("postgres", &self.postgres)
            .field("engine", &self.engine)
            .field("whitelist", &self.whitelist)
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let shared_secret = get("DRAUPNIR_SHARED_SECRET").ok_or(ConfigError::Missing("DRAUPNIR_SHARED_SECRET"))?;
        let listen_address = parse_or(&get, "DRAUPNIR_LISTEN_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 8443)))?;
        let snapshot_backend = parse_or(&get, "DRAUPNIR_SNAPSHOT_BACKEND", SnapshotBackendKind::Btrfs)?;
        let use_sudo = parse_bool(&get, "DRAUPNIR_USE_SUDO")?;

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            data_path: get("DRAUPNIR_DATA_PATH").map(PathBuf::from).unwrap_or(defaults.data_path),
            min_port: parse_or(&get, "DRAUPNIR_MIN_INSTANCE_PORT", defaults.min_port)?,
            max_port: parse_or(&get, "DRAUPNIR_MAX_INSTANCE_PORT", defaults.max_port)?,
            public_hostname: get("DRAUPNIR_PUBLIC_HOSTNAME").unwrap_or(defaults.public_hostname),
            credential_validity_days: parse_or(
                &get,
                "DRAUPNIR_CREDENTIAL_VALIDITY_DAYS",
                defaults.credential_validity_days,
            )?,
            ca_common_name: defaults.ca_common_name,
        };
        if engine.min_port > engine.max_port {
            return Err(ConfigError::Invalid {
                var: "DRAUPNIR_MIN_INSTANCE_PORT",
                value: engine.min_port.to_string(),
                reason: format!("greater than DRAUPNIR_MAX_INSTANCE_PORT ({})", engine.max_port),
            });
        }
        if engine.credential_validity_days == 0 {
            return Err(ConfigError::Invalid {
                var: "DRAUPNIR_CREDENTIAL_VALIDITY_DAYS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let postgres = PostgresConfig {
            bin_dir: get("DRAUPNIR_PG_BIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PostgresConfig::default().bin_dir),
            use_sudo,
            ..PostgresConfig::default()
        };

        let whitelist = WhitelistConfig {
            enabled: parse_bool(&get, "DRAUPNIR_ENABLE_IP_WHITELISTING")?,
            reconcile_interval: Duration::from_secs(parse_or(
                &get,
                "DRAUPNIR_WHITELIST_RECONCILE_INTERVAL_SECS",
                60u64,
            )?),
            chain: get("DRAUPNIR_WHITELIST_CHAIN").unwrap_or_else(|| DEFAULT_CHAIN.to_string()),
        };
        if whitelist.reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "DRAUPNIR_WHITELIST_RECONCILE_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let trusted_proxies = match get("DRAUPNIR_TRUSTED_PROXY_CIDRS") {
            None => Vec::new(),
            Some(value) => parse_cidrs(&value).map_err(|reason| ConfigError::Invalid {
                var: "DRAUPNIR_TRUSTED_PROXY_CIDRS",
                value,
                reason,
            })?,
        };
        let client_ip = ClientIpConfig {
            use_x_forwarded_for: parse_bool(&get, "DRAUPNIR_USE_X_FORWARDED_FOR")?,
            trusted_proxies,
        };

        Ok(Self {
            listen_address,
            shared_secret,
            snapshot_backend,
            use_sudo,
            postgres,
            engine,
            whitelist,
            client_ip,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    match get(var).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no") => Ok(false),
        Some(value) => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}
