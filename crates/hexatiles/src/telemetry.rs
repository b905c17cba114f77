use anyhow::Context;
use hexpipe::BuildReport;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::path::Path;

/// Prometheus collectors describing a single build run.
///
/// Rendered once at the end of the run and written to a file.
pub struct BuildMetrics {
    registry: Registry,
    pub rows_total: IntCounter,
    pub features_emitted_total: IntCounter,
    /// Dropped rows by reason.
    pub rows_dropped_total: IntCounterVec,
    pub quantize_changes_total: IntCounter,
    pub ndjson_bytes: IntGauge,
    pub pmtiles_bytes: IntGauge,
    pub processing_seconds: Gauge,
    pub tiling_seconds: Gauge,
    pub build_seconds: Gauge,
}

impl BuildMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("hexatiles".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            rows_total: reg!(IntCounter::new("rows_total", "Rows read from the input")?),
            features_emitted_total: reg!(IntCounter::new(
                "features_emitted_total",
                "Polygon features written to the feature stream"
            )?),
            rows_dropped_total: reg!(IntCounterVec::new(
                Opts::new("rows_dropped_total", "Rows dropped, by reason"),
                &["reason"]
            )?),
            quantize_changes_total: reg!(IntCounter::new(
                "quantize_changes_total",
                "Property values changed by quantization"
            )?),
            ndjson_bytes: reg!(IntGauge::new(
                "ndjson_bytes",
                "Size of the intermediate feature stream"
            )?),
            pmtiles_bytes: reg!(IntGauge::new(
                "pmtiles_bytes",
                "Size of the published archive"
            )?),
            processing_seconds: reg!(Gauge::new(
                "processing_seconds",
                "Wall time of the row pipeline"
            )?),
            tiling_seconds: reg!(Gauge::new(
                "tiling_seconds",
                "Wall time of tile building and conversion"
            )?),
            build_seconds: reg!(Gauge::new("build_seconds", "Wall time of the whole build")?),
            registry,
        })
    }

    pub fn observe(&self, report: &BuildReport) {
        let m = &report.metrics;
        self.rows_total.inc_by(m.total_rows);
        self.features_emitted_total.inc_by(m.emitted_features);
        for (reason, count) in [
            ("invalid_cell", m.dropped.invalid_cell),
            ("resolution_filter", m.dropped.resolution_filter),
            ("property_cap", m.dropped.property_cap),
            ("other", m.dropped.other),
        ] {
            self.rows_dropped_total.with_label_values(&[reason]).inc_by(count);
        }
        self.quantize_changes_total.inc_by(m.quantize_changes);
        self.ndjson_bytes.set(saturating_i64(report.artifacts.ndjson_bytes));
        self.pmtiles_bytes.set(saturating_i64(report.artifacts.pmtiles_bytes));
        self.processing_seconds.set(m.processing_seconds);
        self.tiling_seconds.set(report.tiling.tiling_seconds);
        self.build_seconds.set(report.duration_seconds);
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics buffer is not valid UTF-8")
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let text = self.encode()?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
