use std::fs;
use std::path::Path;
use std::time::Duration;

use mbus::Version;
use serde::Deserialize;

use crate::error::NetError;

/// Compression algorithms a V2 body may use. The discriminant is the wire id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionKind {
    #[default]
    None = 0,
    Bzip2 = 1,
}

impl CompressionKind {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Bzip2),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub kind: CompressionKind,
    pub level: u32,
    /// Bodies smaller than this are sent raw.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { kind: CompressionKind::None, level: 3, threshold: 64 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub identity: String,
    pub hostname: String,
    pub listen_port: u16,
    pub version: String,
    pub connections_per_target: usize,
    pub connection_expire_secs: u64,
    pub pool_sweep_interval_ms: u64,
    pub service_cache_capacity: usize,
    pub executor_threads: usize,
    pub compression: CompressionConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            identity: "mbus".into(),
            hostname: "localhost".into(),
            listen_port: 0,
            version: "8.0.0".into(),
            connections_per_target: 1,
            connection_expire_secs: 600,
            pool_sweep_interval_ms: 1000,
            service_cache_capacity: 4096,
            executor_threads: 4,
            compression: CompressionConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new<T: Into<String>>(identity: T) -> Self {
        Self { identity: identity.into(), ..Self::default() }
    }

    pub fn from_toml(input: &str) -> Result<Self, NetError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, NetError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.identity.trim().is_empty() {
            return Err(NetError::Config("identity must not be empty".into()));
        }
        self.parsed_version()?;
        if self.connections_per_target == 0 {
            return Err(NetError::Config("connections_per_target must be at least 1".into()));
        }
        if self.service_cache_capacity == 0 {
            return Err(NetError::Config("service_cache_capacity must be at least 1".into()));
        }
        if self.executor_threads == 0 {
            return Err(NetError::Config("executor_threads must be at least 1".into()));
        }
        if self.pool_sweep_interval_ms == 0 {
            return Err(NetError::Config("pool_sweep_interval_ms must be positive".into()));
        }
        if self.compression.level > 9 {
            return Err(NetError::Config(format!(
                "compression level {} is outside 0-9",
                self.compression.level
            )));
        }
        Ok(())
    }

    pub fn parsed_version(&self) -> Result<Version, NetError> {
        self.version.parse().map_err(|err: mbus::BusError| NetError::Config(err.to_string()))
    }

    pub fn connection_expire(&self) -> Duration {
        Duration::from_secs(self.connection_expire_secs)
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pool_sweep_interval_ms)
    }

    pub fn set_identity<T: Into<String>>(&mut self, identity: T) {
        self.identity = identity.into();
    }

    pub fn set_hostname<T: Into<String>>(&mut self, hostname: T) {
        self.hostname = hostname.into();
    }

    pub fn set_listen_port(&mut self, port: u16) {
        self.listen_port = port;
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version.to_string();
    }

    pub fn set_connections_per_target(&mut self, count: usize) {
        self.connections_per_target = count;
    }

    pub fn set_connection_expire_secs(&mut self, secs: u64) {
        self.connection_expire_secs = secs;
    }

    pub fn set_pool_sweep_interval_ms(&mut self, millis: u64) {
        self.pool_sweep_interval_ms = millis;
    }

    pub fn set_service_cache_capacity(&mut self, capacity: usize) {
        self.service_cache_capacity = capacity;
    }

    pub fn set_executor_threads(&mut self, threads: usize) {
        self.executor_threads = threads;
    }

    pub fn set_compression(&mut self, compression: CompressionConfig) {
        self.compression = compression;
    }
}
