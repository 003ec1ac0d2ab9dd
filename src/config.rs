//! Audit configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file
//! (`--config` / `ITEMS_AUDIT_CONFIG`), then environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Polygon Aavegotchi diamond. Holds equipped wearables in custody.
pub const AAVEGOTCHI_DIAMOND: &str = "0x86935F11C86623deC8a25696E1C19a8659CbF95d";

/// Satsuma-hosted core subgraph. `{key}` is replaced with `SUBGRAPH_KEY`.
pub const DEFAULT_SUBGRAPH_URL_TEMPLATE: &str =
    "https://subgraph.satsuma-prod.com/{key}/aavegotchi/aavegotchi-core-matic/version/matic-add-owners-to-wearables-6/api";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub endpoints: EndpointConfig,
    pub paths: PathConfig,
    pub pacing: PacingConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// JSON-RPC endpoint
    pub rpc_url: Option<String>,
    /// Indexing service access key
    pub subgraph_key: Option<String>,
    /// Subgraph URL template, `{key}` is substituted
    pub subgraph_url: String,
    /// Address holding equipped items on behalf of gotchis
    pub custody_address: String,
    /// Request timeout for both RPC and subgraph calls
    pub http_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            subgraph_key: None,
            subgraph_url: DEFAULT_SUBGRAPH_URL_TEMPLATE.to_string(),
            custody_address: AAVEGOTCHI_DIAMOND.to_string(),
            http_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub catalog: PathBuf,
    /// Candidate snapshot locations, first existing one wins
    pub snapshots: Vec<PathBuf>,
    /// Snapshots older than this are treated as stale
    pub snapshot_max_age_hours: Option<u64>,
    pub report: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("data/itemTypes.json"),
            snapshots: vec![
                PathBuf::from("metadata/aavegotchiMetadata.json"),
                PathBuf::from("lib/aavegotchiMetadata.json"),
                PathBuf::from("../aavegotchiMetadata.json"),
            ],
            snapshot_max_age_hours: None,
            report: PathBuf::from("item-errors.json"),
        }
    }
}

impl PathConfig {
    pub fn snapshot_max_age(&self) -> Option<Duration> {
        self.snapshot_max_age_hours
            .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
    }
}

/// Scheduler pacing, tuned to stay under the subgraph rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub batch_size: usize,
    pub item_delay_ms: u64,
    pub batch_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_delay_ms: 1000,
            batch_delay_ms: 5000,
        }
    }
}

impl PacingConfig {
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Gotchis per contract call
    pub batch_size: usize,
    /// Attempts per batch before the run aborts
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Universe is 1..=total_gotchis
    pub total_gotchis: u32,
    pub output_dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 3,
            retry_delay_ms: 5000,
            total_gotchis: 25_000,
            output_dir: PathBuf::from("metadata"),
        }
    }
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join("aavegotchiMetadata.json")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.output_dir.join("fetch_progress.json")
    }
}

/// Endpoints the reconciliation run cannot start without.
#[derive(Debug, Clone)]
pub struct ReconcileEndpoints {
    pub rpc_url: String,
    pub subgraph_url: String,
}

impl AuditConfig {
    /// Load defaults, the optional TOML file, then the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ITEMS_AUDIT_CONFIG").ok().map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse TOML config")
    }

    /// Overlay values from an env-like lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("RPC_URL") {
            self.endpoints.rpc_url = Some(v);
        }
        if let Some(v) = get("SUBGRAPH_KEY") {
            self.endpoints.subgraph_key = Some(v);
        }
        if let Some(v) = get("SUBGRAPH_URL") {
            self.endpoints.subgraph_url = v;
        }
        if let Some(v) = get("CUSTODY_ADDRESS") {
            self.endpoints.custody_address = v;
        }
        if let Some(v) = get("HTTP_TIMEOUT_SECS") {
            self.endpoints.http_timeout_secs = parse_env("HTTP_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("ITEM_CATALOG_PATH") {
            self.paths.catalog = PathBuf::from(v);
        }
        if let Some(v) = get("SNAPSHOT_PATHS") {
            self.paths.snapshots = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(v) = get("SNAPSHOT_MAX_AGE_HOURS") {
            self.paths.snapshot_max_age_hours = Some(parse_env("SNAPSHOT_MAX_AGE_HOURS", &v)?);
        }
        if let Some(v) = get("REPORT_PATH") {
            self.paths.report = PathBuf::from(v);
        }

        if let Some(v) = get("CHECK_BATCH_SIZE") {
            self.pacing.batch_size = parse_env("CHECK_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("CHECK_ITEM_DELAY_MS") {
            self.pacing.item_delay_ms = parse_env("CHECK_ITEM_DELAY_MS", &v)?;
        }
        if let Some(v) = get("CHECK_BATCH_DELAY_MS") {
            self.pacing.batch_delay_ms = parse_env("CHECK_BATCH_DELAY_MS", &v)?;
        }

        if let Some(v) = get("FETCH_BATCH_SIZE") {
            self.fetch.batch_size = parse_env("FETCH_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("FETCH_MAX_RETRIES") {
            self.fetch.max_retries = parse_env("FETCH_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("FETCH_RETRY_DELAY_MS") {
            self.fetch.retry_delay_ms = parse_env("FETCH_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("FETCH_TOTAL_GOTCHIS") {
            self.fetch.total_gotchis = parse_env("FETCH_TOTAL_GOTCHIS", &v)?;
        }
        if let Some(v) = get("FETCH_OUTPUT_DIR") {
            self.fetch.output_dir = PathBuf::from(v);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pacing.batch_size == 0 {
            anyhow::bail!("pacing.batch_size must be greater than zero");
        }
        if self.fetch.batch_size == 0 {
            anyhow::bail!("fetch.batch_size must be greater than zero");
        }
        if self.fetch.max_retries == 0 {
            anyhow::bail!("fetch.max_retries must be at least 1");
        }
        Ok(())
    }

    /// Both endpoints are required before any reconciliation work begins.
    pub fn reconcile_endpoints(&self) -> Result<ReconcileEndpoints> {
        let rpc_url = self
            .endpoints
            .rpc_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("RPC_URL environment variable is not set"))?;

        let template = &self.endpoints.subgraph_url;
        let subgraph_url = if template.contains("{key}") {
            let key = self
                .endpoints
                .subgraph_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("SUBGRAPH_KEY environment variable is not set"))?;
            template.replace("{key}", key)
        } else {
            template.clone()
        };

        Ok(ReconcileEndpoints {
            rpc_url,
            subgraph_url,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoints.http_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}={:?} is invalid: {}", key, value, e))
}
