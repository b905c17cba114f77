use crate::error::PipelineError;
use crate::metrics::RunMetrics;
use crate::props::DefaultPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const REPORT_FILE_NAME: &str = "report.json";

/// The effective build configuration, after defaults and zoom derivation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub keep_ndjson: bool,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub min_zoom_derived: bool,
    pub max_zoom_derived: bool,
    pub min_resolution: Option<u8>,
    pub max_resolution: Option<u8>,
    pub quantize_spec: String,
    pub props_keep: Vec<String>,
    pub props_drop: Vec<String>,
    pub props_default: DefaultPolicy,
    pub workers: usize,
    pub simplify: bool,
    pub property_byte_cap: usize,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Artifacts {
    /// Present only when the feature stream was kept.
    pub ndjson_path: Option<PathBuf>,
    pub ndjson_bytes: u64,
    pub mbtiles_bytes: u64,
    pub pmtiles_path: Option<PathBuf>,
    pub pmtiles_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TilingInfo {
    pub command: Vec<String>,
    pub builder_output: String,
    pub convert_output: String,
    pub archive_info: Option<serde_json::Value>,
    pub tiling_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub tool_version: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub config: ReportConfig,
    pub metrics: RunMetrics,
    pub artifacts: Artifacts,
    pub tiling: TilingInfo,
}

impl BuildReport {
    pub fn dropped_rows(&self) -> u64 {
        self.metrics.dropped.total()
    }

    pub fn to_json_pretty(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|source| PipelineError::Serialization {
            what: "build report",
            source,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<(), PipelineError> {
        let mut text = self.to_json_pretty()?;
        text.push('\n');
        std::fs::write(path, text).map_err(|e| PipelineError::io("write", path, e))
    }
}
