//! Bucket node configuration.
//!
//! Loads settings from `bucket.toml` with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g., `BUCKET_RPC_URLS`, `BUCKET_P2P_PORT`)
//! 2. TOML file (`bucket.toml` by default)
//! 3. Built-in defaults
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `chain` | RPC endpoints, staking account, block interval |
//! | `storage` | Workspace root, space quota, staking key path |
//! | `network` | P2P port, relay URL |
//! | `proof` | Proof service URL, per-file budget, filler file geometry |
//! | `tuning` | Fetch timeout, loop restart delay, pending reconciliation |
//!
//! # Example
//!
//! ```toml
//! [chain]
//! rpc_urls = ["http://127.0.0.1:9944", "http://backup:9944"]
//!
//! [storage]
//! workspace = "/var/lib/bucket"
//! use_space_gib = 500
//!
//! [network]
//! p2p_port = 4001
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Read an env var, parse it, and apply it to `target`. Logs a warning on parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using default"
            ),
        }
    }
}

/// Read an env var, trim whitespace, and set an `Option<String>` field (skips empty values).
fn env_trimmed_opt(var: &str, target: &mut Option<String>) {
    if let Ok(val) = std::env::var(var) {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            *target = Some(trimmed.to_string());
        }
    }
}

/// Read a comma separated env var into a list (skips empty items).
fn env_list(var: &str, target: &mut Vec<String>) {
    if let Ok(val) = std::env::var(var) {
        let items: Vec<String> = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !items.is_empty() {
            *target = items;
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BucketConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub proof: ProofConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    /// Chain gateway endpoints, tried in order.
    #[serde(default = "default_rpc_urls")]
    pub rpc_urls: Vec<String>,
    /// Accept invalid TLS certificates (local development only).
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
}

fn default_rpc_urls() -> Vec<String> {
    vec!["http://127.0.0.1:9944".to_string()]
}

fn default_block_interval_secs() -> u64 {
    common::BLOCK_INTERVAL_SECS
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_urls: default_rpc_urls(),
            insecure_tls: false,
            block_interval_secs: default_block_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Space the node may fill, in GiB.
    #[serde(default = "default_use_space_gib")]
    pub use_space_gib: u64,
    /// Staking key file. Defaults to `<workspace>/staking.key`.
    #[serde(default)]
    pub keypair_path: Option<PathBuf>,
}

fn default_workspace() -> PathBuf {
    PathBuf::from("data/bucket")
}

fn default_use_space_gib() -> u64 {
    2000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            use_space_gib: default_use_space_gib(),
            keypair_path: None,
        }
    }
}

impl StorageConfig {
    pub fn quota_bytes(&self) -> u64 {
        self.use_space_gib.saturating_mul(common::SIZE_1GIB)
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.keypair_path
            .clone()
            .unwrap_or_else(|| self.workspace.join("staking.key"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default)]
    pub relay_url: Option<String>,
}

fn default_p2p_port() -> u16 {
    4001
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            relay_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProofConfig {
    #[serde(default = "default_proof_service_url")]
    pub service_url: String,
    /// Budget for one file's proof fragment.
    #[serde(default = "default_fragment_timeout_secs")]
    pub fragment_timeout_secs: u64,
    /// Size of requested filler files.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: u64,
    /// Blocks per filler file.
    #[serde(default = "default_block_count")]
    pub block_count: u32,
}

fn default_proof_service_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

fn default_fragment_timeout_secs() -> u64 {
    60
}

fn default_fragment_size() -> u64 {
    common::FRAGMENT_SIZE
}

fn default_block_count() -> u32 {
    common::BLOCK_NUMBER
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            service_url: default_proof_service_url(),
            fragment_timeout_secs: default_fragment_timeout_secs(),
            fragment_size: default_fragment_size(),
            block_count: default_block_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TuningConfig {
    /// Overall budget for a worker to deliver both data and tag.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Delay before a terminated loop is restarted.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// Re-query pending submissions each acquisition cycle.
    #[serde(default = "default_reconcile_pending")]
    pub reconcile_pending: bool,
}

fn default_fetch_timeout_secs() -> u64 {
    300
}

fn default_restart_delay_secs() -> u64 {
    common::BLOCK_INTERVAL_SECS
}

fn default_reconcile_pending() -> bool {
    true
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            reconcile_pending: default_reconcile_pending(),
        }
    }
}

impl BucketConfig {
    /// Load configuration from a TOML file (if present) and apply env overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = path.unwrap_or("bucket.toml");

        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {}", config_path))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", config_path))?
        } else {
            warn!(config_path = %config_path, "No config file found, using defaults/env vars");
            BucketConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_list("BUCKET_RPC_URLS", &mut self.chain.rpc_urls);
        env_parse("BUCKET_BLOCK_INTERVAL_SECS", &mut self.chain.block_interval_secs);

        env_parse("BUCKET_WORKSPACE", &mut self.storage.workspace);
        env_parse("BUCKET_USE_SPACE_GIB", &mut self.storage.use_space_gib);

        env_parse("BUCKET_P2P_PORT", &mut self.network.p2p_port);
        env_trimmed_opt("BUCKET_RELAY_URL", &mut self.network.relay_url);

        env_parse("BUCKET_PROOF_SERVICE_URL", &mut self.proof.service_url);
        env_parse(
            "BUCKET_FRAGMENT_TIMEOUT_SECS",
            &mut self.proof.fragment_timeout_secs,
        );

        env_parse("BUCKET_FETCH_TIMEOUT_SECS", &mut self.tuning.fetch_timeout_secs);
        env_parse("BUCKET_RECONCILE_PENDING", &mut self.tuning.reconcile_pending);
    }

    /// Reject configurations the node cannot run with.
    ///
    /// Creates the workspace directory if it does not exist yet.
    pub fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.iter().all(|u| u.trim().is_empty()) {
            anyhow::bail!("chain.rpc_urls must contain at least one endpoint");
        }
        if self.network.p2p_port < 1024 {
            anyhow::bail!(
                "network.p2p_port {} is reserved, use 1024..=65535",
                self.network.p2p_port
            );
        }
        if self.storage.use_space_gib == 0 {
            anyhow::bail!("storage.use_space_gib must be greater than zero");
        }
        if self.chain.block_interval_secs == 0 {
            anyhow::bail!("chain.block_interval_secs must be greater than zero");
        }
        if self.proof.block_count == 0 {
            anyhow::bail!("proof.block_count must be greater than zero");
        }

        let ws = &self.storage.workspace;
        if ws.exists() {
            if !ws.is_dir() {
                anyhow::bail!("storage.workspace {} is not a directory", ws.display());
            }
        } else {
            std::fs::create_dir_all(ws)
                .with_context(|| format!("Failed to create workspace {}", ws.display()))?;
        }
        Ok(())
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.chain.block_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.fetch_timeout_secs)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.proof.fragment_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.tuning.restart_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> BucketConfig {
        BucketConfig {
            storage: StorageConfig {
                workspace: dir.join("ws"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = BucketConfig::default();
        assert_eq!(config.chain.block_interval_secs, 6);
        assert_eq!(config.tuning.fetch_timeout_secs, 300);
        assert_eq!(config.proof.fragment_timeout_secs, 60);
        assert_eq!(config.proof.block_count, 1024);
        assert_eq!(config.storage.quota_bytes(), 2000 * common::SIZE_1GIB);
        assert!(config.tuning.reconcile_pending);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: BucketConfig = toml::from_str(
            r#"
            [chain]
            rpc_urls = ["http://a", "http://b"]

            [storage]
            use_space_gib = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.chain.rpc_urls.len(), 2);
        assert_eq!(config.storage.use_space_gib, 10);
        assert_eq!(config.network.p2p_port, 4001);
    }

    #[test]
    fn test_validate_creates_workspace() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        config.validate().unwrap();
        assert!(dir.path().join("ws").is_dir());
        assert_eq!(
            config.storage.keypair_path(),
            dir.path().join("ws").join("staking.key")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempdir().unwrap();

        let mut config = config_in(dir.path());
        config.chain.rpc_urls = vec![];
        assert!(config.validate().is_err());

        let mut config = config_in(dir.path());
        config.network.p2p_port = 80;
        assert!(config.validate().is_err());

        let mut config = config_in(dir.path());
        config.storage.use_space_gib = 0;
        assert!(config.validate().is_err());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let mut config = config_in(dir.path());
        config.storage.workspace = file;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_parse_invalid_leaves_default() {
        let mut val: u16 = 42;
        unsafe { std::env::set_var("_BTEST_PARSE_INV", "not_a_number") };
        env_parse("_BTEST_PARSE_INV", &mut val);
        assert_eq!(val, 42);
        unsafe { std::env::remove_var("_BTEST_PARSE_INV") };
    }

    #[test]
    fn env_list_splits_and_trims() {
        let mut val = vec!["old".to_string()];
        unsafe { std::env::set_var("_BTEST_LIST", " http://a , ,http://b ") };
        env_list("_BTEST_LIST", &mut val);
        assert_eq!(val, vec!["http://a", "http://b"]);

        unsafe { std::env::set_var("_BTEST_LIST", " , ") };
        env_list("_BTEST_LIST", &mut val);
        assert_eq!(val, vec!["http://a", "http://b"]);
        unsafe { std::env::remove_var("_BTEST_LIST") };
    }

    #[test]
    fn env_trimmed_opt_skips_empty() {
        let mut val: Option<String> = None;
        unsafe { std::env::set_var("_BTEST_TRIM", "   ") };
        env_trimmed_opt("_BTEST_TRIM", &mut val);
        assert_eq!(val, None);
        unsafe { std::env::remove_var("_BTEST_TRIM") };
    }
}
