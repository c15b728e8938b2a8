use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Search metrics, gated behind `enabled`.
///
/// When disabled no registry exists and every recording call returns
/// immediately.
pub struct SearchMetrics {
    enabled: bool,
    registry: Option<Registry>,
    pub searches_total: Option<IntCounterVec>,
    pub search_duration: Option<HistogramVec>,
    pub export_rows_total: Option<IntCounter>,
    pub active_exports: Option<IntGauge>,
}

impl SearchMetrics {
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self {
                enabled: false,
                registry: None,
                searches_total: None,
                search_duration: None,
                export_rows_total: None,
                active_exports: None,
            });
        }

        let registry = Registry::new();

        let searches_total = IntCounterVec::new(
            Opts::new("log_searches_total", "Log searches by mode and response status")
                .namespace("ando"),
            &["mode", "status"],
        )?;

        let search_duration = HistogramVec::new(
            HistogramOpts::new("log_search_duration_seconds", "Time spent in the log index")
                .namespace("ando")
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
            &["mode"],
        )?;

        let export_rows_total = IntCounter::with_opts(
            Opts::new("log_export_rows_total", "Rows streamed by CSV exports").namespace("ando"),
        )?;

        let active_exports = IntGauge::with_opts(
            Opts::new("log_active_exports", "Exports currently streaming").namespace("ando"),
        )?;

        registry.register(Box::new(searches_total.clone()))?;
        registry.register(Box::new(search_duration.clone()))?;
        registry.register(Box::new(export_rows_total.clone()))?;
        registry.register(Box::new(active_exports.clone()))?;

        Ok(Self {
            enabled: true,
            registry: Some(registry),
            searches_total: Some(searches_total),
            search_duration: Some(search_duration),
            export_rows_total: Some(export_rows_total),
            active_exports: Some(active_exports),
        })
    }

    /// Count a finished search (no-op when disabled).
    #[inline]
    pub fn record_search(&self, mode: &str, status: u16, duration_secs: f64) {
        if !self.enabled {
            return;
        }
        if let Some(ref counter) = self.searches_total {
            let mut buf = itoa::Buffer::new();
            counter.with_label_values(&[mode, buf.format(status)]).inc();
        }
        if let Some(ref hist) = self.search_duration {
            hist.with_label_values(&[mode]).observe(duration_secs);
        }
    }

    #[inline]
    pub fn add_export_rows(&self, rows: u64) {
        if let Some(ref counter) = self.export_rows_total {
            counter.inc_by(rows);
        }
    }

    pub fn export_started(&self) {
        if let Some(ref gauge) = self.active_exports {
            gauge.inc();
        }
    }

    pub fn export_finished(&self) {
        if let Some(ref gauge) = self.active_exports {
            gauge.dec();
        }
    }

    /// Render prometheus text exposition format.
    pub fn render(&self) -> String {
        if let Some(ref registry) = self.registry {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&registry.gather(), &mut buffer).unwrap_or(());
            String::from_utf8(buffer).unwrap_or_default()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
