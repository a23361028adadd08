//! Cluster daemon configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file,
//! then `VMGRID_`-prefixed environment variables (for example
//! `VMGRID_NODE_NAME=hv1.example.com`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::types::local_hostname;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "VMGRID_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    // ── Node identity ───────────────────────────────────────────
    /// FQDN of this node.
    pub node_name: String,
    /// Mesh IP of this node.
    pub node_mesh_ip: String,
    pub node_is_hypervisor: bool,
    pub node_is_network_node: bool,

    // ── Store ───────────────────────────────────────────────────
    /// Directory holding the shared store database.
    pub data_dir: PathBuf,

    // ── Scheduler ───────────────────────────────────────────────
    /// How long the scheduler caches node metrics, in seconds.
    pub scheduler_cache_timeout: u64,
    /// vCPUs per physical CPU.
    pub cpu_overcommit_ratio: f64,
    /// Instance memory per unit of physical memory when shared pages are merged.
    pub ram_overcommit_ratio: f64,
    /// RAM reserved for the operating system, in GB.
    pub ram_system_reservation: f64,
    /// Disk space left free on every node, in GB.
    pub minimum_free_disk: u64,
    /// Nodes with more waiting work items than this are not scheduled onto.
    pub max_queue_waiting: u64,
    /// Upper bound on a single node's metrics read, in milliseconds.
    pub metrics_fetch_timeout_ms: u64,
    /// Mesh IP of the node which egresses all traffic.
    pub network_node_ip: String,

    // ── Locks ───────────────────────────────────────────────────
    /// Seconds of waiting after which a lock acquisition is reported as slow.
    pub slow_lock_threshold: f64,
    pub lock_poll_interval_ms: u64,
    /// Default lease for a held lock, in seconds.
    pub lock_ttl: u64,
    /// Default acquisition timeout, in seconds.
    pub lock_timeout: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_name: local_hostname(),
            node_mesh_ip: String::new(),
            node_is_hypervisor: false,
            node_is_network_node: false,
            data_dir: PathBuf::from("/srv/vmgrid"),
            scheduler_cache_timeout: 5,
            cpu_overcommit_ratio: 16.0,
            ram_overcommit_ratio: 3.0,
            ram_system_reservation: 5.0,
            minimum_free_disk: 20,
            max_queue_waiting: 20,
            metrics_fetch_timeout_ms: 2000,
            network_node_ip: String::new(),
            slow_lock_threshold: 5.0,
            lock_poll_interval_ms: 1000,
            lock_ttl: 60,
            lock_timeout: 10,
        }
    }
}

impl GridConfig {
    /// Build the layered figment without extracting it.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(GridConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load defaults, the optional file, and environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config: GridConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults (no environment).
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = Figment::from(Serialized::defaults(GridConfig::default()))
            .merge(Toml::string(content))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name must not be empty");
        }
        if self.cpu_overcommit_ratio <= 0.0 {
            anyhow::bail!(
                "cpu_overcommit_ratio must be positive, got {}",
                self.cpu_overcommit_ratio
            );
        }
        if self.ram_overcommit_ratio <= 0.0 {
            anyhow::bail!(
                "ram_overcommit_ratio must be positive, got {}",
                self.ram_overcommit_ratio
            );
        }
        if self.lock_poll_interval_ms == 0 {
            anyhow::bail!("lock_poll_interval_ms must be at least 1");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the store database inside `data_dir`.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("vmgrid.redb")
    }

    pub fn scheduler_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler_cache_timeout)
    }

    pub fn metrics_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_fetch_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn slow_lock_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.slow_lock_threshold.max(0.0))
    }
}
