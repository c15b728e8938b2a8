// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Ando Log Search: gateway request log search and CSV export
//
//  Index:     Elasticsearch (monthly indices) or in-memory
//  Admin API: axum on the tokio runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use ando_admin::search::LogSearch;
use ando_admin::server::AdminState;
use ando_core::config::{IndexBackend, LogSearchConfig};
use ando_observability::metrics::SearchMetrics;
use ando_store::index::LogIndex;
use ando_store::{ElasticsearchIndex, MemoryIndex};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ando-logs", version, about = "Ando Log Search: gateway log search and export")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ando/ando-logs.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON-lines file of log records loaded into the in-memory index.
    /// Ignored with the Elasticsearch backend.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Ando Log Search starting");

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        LogSearchConfig::load(&cli.config)?
    } else {
        info!("No config file found, using defaults");
        let config = LogSearchConfig::default();
        config.validate()?;
        config
    };

    // ── Metrics ──
    let metrics = Arc::new(SearchMetrics::new(config.observability.prometheus.enabled)?);

    // ── Log index ──
    let index = open_index(&config, cli.seed.as_deref())?;
    let search = LogSearch::new(index, config.index.clone(), metrics.clone());
    info!(backend = search.backend(), "Log index ready");

    let admin_config = config.admin.clone();
    let admin_state = Arc::new(AdminState {
        search,
        config,
        metrics,
    });

    // ── Serve until SIGINT ──
    tokio::select! {
        result = ando_admin::server::start_admin(admin_config, admin_state) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Admin API failed");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Ando Log Search stopped");
    Ok(())
}

fn open_index(config: &LogSearchConfig, seed: Option<&Path>) -> anyhow::Result<Arc<dyn LogIndex>> {
    match config.index.backend {
        IndexBackend::Elasticsearch => {
            if seed.is_some() {
                warn!("--seed is ignored with the elasticsearch backend");
            }
            info!(nodes = config.index.urls.len(), prefix = %config.index.index_prefix, "Using Elasticsearch");
            Ok(Arc::new(ElasticsearchIndex::new(&config.index)?))
        }
        IndexBackend::Memory => {
            let index = MemoryIndex::new();
            if let Some(path) = seed {
                let text = std::fs::read_to_string(path)?;
                index.extend(ando_store::memory::parse_json_lines(&text)?);
                info!(path = %path.display(), records = index.len(), "Seeded in-memory index");
            }
            Ok(Arc::new(index))
        }
    }
}
