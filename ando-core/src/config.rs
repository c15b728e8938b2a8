use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level log search configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSearchConfig {
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub addr: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Admin API key for authentication (optional).
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Elasticsearch,
    Memory,
}

/// Log index connection and scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_backend")]
    pub backend: IndexBackend,
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,
    /// Indices are monthly: `<prefix>-YYYY-MM`.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Per round-trip deadline for page fetches and scroll batches.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_scroll_batch_size")]
    pub scroll_batch_size: u64,
    #[serde(default = "default_scroll_keep_alive")]
    pub scroll_keep_alive_secs: u64,
    /// Largest `offset + length` a page request may reach.
    #[serde(default = "default_max_result_window")]
    pub max_result_window: u64,
}

/// Request defaults and caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default = "default_interval")]
    pub default_interval: String,
    #[serde(default = "default_page_length")]
    pub default_page_length: u64,
    #[serde(default = "default_max_page_length")]
    pub max_page_length: u64,
    /// Longest `start_at..=end_at` span, in days.
    #[serde(default = "default_max_range_days")]
    pub max_range_days: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// When false, no prometheus counters are updated.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_admin_addr() -> String { "0.0.0.0:9180".into() }
fn default_true() -> bool { true }
fn default_backend() -> IndexBackend { IndexBackend::Memory }
fn default_urls() -> Vec<String> { vec!["http://127.0.0.1:9200".into()] }
fn default_index_prefix() -> String { "ando-logs".into() }
fn default_timeout() -> u64 { 10_000 }
fn default_scroll_batch_size() -> u64 { 500 }
fn default_scroll_keep_alive() -> u64 { 600 }
fn default_max_result_window() -> u64 { 10_000 }
fn default_timezone() -> String { "UTC".into() }
fn default_interval() -> String { "day".into() }
fn default_page_length() -> u64 { 50 }
fn default_max_page_length() -> u64 { 1000 }
fn default_max_range_days() -> u64 { 3660 }
fn default_metrics_path() -> String { "/metrics".into() }

// ── Impls ─────────────────────────────────────────────────────

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: default_admin_addr(),
            enabled: true,
            api_key: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            urls: default_urls(),
            index_prefix: default_index_prefix(),
            username: None,
            password: None,
            timeout_ms: default_timeout(),
            scroll_batch_size: default_scroll_batch_size(),
            scroll_keep_alive_secs: default_scroll_keep_alive(),
            max_result_window: default_max_result_window(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            default_interval: default_interval(),
            default_page_length: default_page_length(),
            max_page_length: default_max_page_length(),
            max_range_days: default_max_range_days(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metrics_path(),
        }
    }
}

impl LogSearchConfig {
    /// Load configuration from YAML file + env overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: LogSearchConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("ANDO_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index.scroll_batch_size == 0 {
            anyhow::bail!("index.scroll_batch_size must be greater than zero");
        }
        if self.search.max_page_length == 0 {
            anyhow::bail!("search.max_page_length must be greater than zero");
        }
        if self.search.max_range_days == 0 {
            anyhow::bail!("search.max_range_days must be greater than zero");
        }
        if self.search.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!("search.default_timezone {:?} is not a known timezone", self.search.default_timezone);
        }
        if self.search.default_interval.parse::<crate::request::Interval>().is_err() {
            anyhow::bail!("search.default_interval {:?} is not a known interval", self.search.default_interval);
        }
        if self.index.backend == IndexBackend::Elasticsearch && self.index.urls.is_empty() {
            anyhow::bail!("index.urls must list at least one Elasticsearch node");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── Default values ────────────────────────────────────────────

    #[test]
    fn default_admin_config_has_expected_values() {
        let cfg = AdminConfig::default();
        assert_eq!(cfg.addr, "0.0.0.0:9180");
        assert!(cfg.enabled);
        assert!(cfg.api_key.is_none());
    }

    #[test]
    fn default_index_config_values() {
        let cfg = IndexConfig::default();
        assert_eq!(cfg.backend, IndexBackend::Memory);
        assert_eq!(cfg.index_prefix, "ando-logs");
        assert_eq!(cfg.scroll_batch_size, 500);
        assert_eq!(cfg.scroll_keep_alive_secs, 600);
        assert_eq!(cfg.max_result_window, 10_000);
    }

    #[test]
    fn default_search_config_values() {
        let cfg = SearchConfig::default();
        assert_eq!(cfg.default_timezone, "UTC");
        assert_eq!(cfg.default_interval, "day");
        assert_eq!(cfg.default_page_length, 50);
        assert_eq!(cfg.max_page_length, 1000);
        assert_eq!(cfg.max_range_days, 3660);
    }

    #[test]
    fn default_config_validates() {
        LogSearchConfig::default().validate().unwrap();
    }

    #[test]
    fn index_backend_serializes_to_lowercase() {
        let json = serde_json::to_string(&IndexBackend::Elasticsearch).unwrap();
        assert_eq!(json, "\"elasticsearch\"");
    }

    // ── LogSearchConfig::load() ───────────────────────────────────

    #[test]
    fn load_from_valid_yaml_overrides_defaults() {
        let yaml = r#"
index:
  backend: elasticsearch
  urls:
    - "http://es-1:9200"
    - "http://es-2:9200"
  scroll_batch_size: 250
search:
  default_timezone: "America/Denver"
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "{yaml}").unwrap();
        let cfg = LogSearchConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.index.backend, IndexBackend::Elasticsearch);
        assert_eq!(cfg.index.urls.len(), 2);
        assert_eq!(cfg.index.scroll_batch_size, 250);
        assert_eq!(cfg.search.default_timezone, "America/Denver");
        // Defaults still apply for unspecified fields
        assert_eq!(cfg.index.timeout_ms, 10_000);
        assert_eq!(cfg.admin.addr, "0.0.0.0:9180");
    }

    #[test]
    fn load_rejects_unknown_default_timezone() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "search:\n  default_timezone: \"Nowhere/City\"\n").unwrap();
        assert!(LogSearchConfig::load(tmpfile.path()).is_err());
    }

    #[test]
    fn load_rejects_zero_batch_size() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "index:\n  scroll_batch_size: 0\n").unwrap();
        assert!(LogSearchConfig::load(tmpfile.path()).is_err());
    }
}
