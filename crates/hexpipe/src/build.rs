// hexatiles/crates/hexpipe/src/build.rs
//! End-to-end build: Parquet → NDJSON → tile archive → published archive.

use crate::cancel::CancelSignal;
use crate::decoder::{DecoderOptions, ParquetDecoder, DEFAULT_BATCH_SIZE};
use crate::error::{CollaboratorError, PipelineError};
use crate::metrics::derive_zoom_range;
use crate::pipeline::{default_workers, run_pipeline, PipelineConfig, DEFAULT_PROPERTY_BYTE_CAP};
use crate::props::{DefaultPolicy, FilterSpec, QuantizeRules};
use crate::report::{Artifacts, BuildReport, ReportConfig, TilingInfo, REPORT_FILE_NAME};
use crate::sink::NdjsonSink;
use crate::tiler::{TileEngine, TileOptions};
use crate::worker::SYSTEM_FIELDS;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const NDJSON_FILE_NAME: &str = "xyz.ndjson";
pub const MBTILES_FILE_NAME: &str = "tiles.mbtiles";
pub const LAYER_NAME: &str = "h3";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub input: PathBuf,
    /// Published archive path; intermediates and the report land next to it.
    pub output: PathBuf,
    pub keep_ndjson: bool,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub min_resolution: Option<u8>,
    pub max_resolution: Option<u8>,
    pub props_keep: Vec<String>,
    pub props_drop: Vec<String>,
    pub props_default: DefaultPolicy,
    /// Quantize directives, e.g. `float=0.01,int=1`.
    pub quantize: String,
    pub simplify: bool,
    /// Worker count; `None` uses the available parallelism.
    pub workers: Option<usize>,
    pub property_byte_cap: usize,
    pub batch_size: usize,
    pub metadata: BTreeMap<String, String>,
}

impl BuildOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            keep_ndjson: false,
            min_zoom: None,
            max_zoom: None,
            min_resolution: None,
            max_resolution: None,
            props_keep: Vec::new(),
            props_drop: Vec::new(),
            props_default: DefaultPolicy::default(),
            quantize: String::new(),
            simplify: false,
            workers: None,
            property_byte_cap: DEFAULT_PROPERTY_BYTE_CAP,
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: BTreeMap::new(),
        }
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, PipelineError> {
        if let (Some(min), Some(max)) = (self.min_resolution, self.max_resolution) {
            if min > max {
                return Err(PipelineError::Config(format!(
                    "min resolution {min} is greater than max resolution {max}"
                )));
            }
        }
        Ok(PipelineConfig {
            workers: self.workers.filter(|w| *w > 0).unwrap_or_else(default_workers),
            filter: FilterSpec::new(&self.props_keep, &self.props_drop, self.props_default)?,
            quantize: QuantizeRules::parse(&self.quantize)?,
            min_resolution: self.min_resolution,
            max_resolution: self.max_resolution,
            property_byte_cap: self.property_byte_cap,
        })
    }
}

/// Runs the full build and writes `report.json` next to the output.
///
/// Any failure aborts the build; the intermediate feature stream of a failed
/// run is removed.
pub async fn run_build<E: TileEngine + ?Sized>(
    opts: &BuildOptions,
    engine: &E,
    cancel: &CancelSignal,
) -> Result<BuildReport, PipelineError> {
    let started_at = Utc::now();
    let started = Instant::now();

    let pipeline_config = opts.pipeline_config()?;
    let workers = pipeline_config.workers;
    let attributes = tile_attributes(&pipeline_config.filter);

    let input = absolute(&opts.input)?;
    let output = absolute(&opts.output)?;
    if !input.is_file() {
        return Err(PipelineError::Config(format!(
            "input file {} does not exist",
            input.display()
        )));
    }
    let out_dir = output
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PipelineError::Config(format!("invalid output path {}", output.display())))?;
    fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io("create", &out_dir, e))?;

    let ndjson_path = out_dir.join(NDJSON_FILE_NAME);
    let mbtiles_path = out_dir.join(MBTILES_FILE_NAME);
    for stale in [&output, &mbtiles_path, &ndjson_path] {
        remove_if_exists(stale)?;
    }

    engine.check_available()?;

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        workers,
        "Starting build"
    );

    let decoder = ParquetDecoder::open(
        &input,
        DecoderOptions {
            batch_size: opts.batch_size,
        },
    )?;
    let mut sink = NdjsonSink::create(&ndjson_path)?;
    let summary = match run_pipeline(decoder, &mut sink, pipeline_config, cancel).await {
        Ok(summary) => summary,
        Err(e) => {
            drop(sink);
            discard(&ndjson_path);
            return Err(e);
        }
    };
    drop(sink);
    let mut metrics = summary.metrics;

    let mut artifacts = Artifacts {
        ndjson_bytes: file_size(&ndjson_path),
        ..Default::default()
    };

    let zoom = derive_zoom_range(opts.min_zoom, opts.max_zoom, metrics.max_resolution_seen);
    let tile_opts = TileOptions {
        min_zoom: zoom.min_zoom,
        max_zoom: zoom.max_zoom,
        simplify: opts.simplify,
        sort_key: LAYER_NAME.into(),
        layer_name: LAYER_NAME.into(),
        threads: workers,
        attributes,
        metadata: opts.metadata.clone(),
    };

    let mut tiling = TilingInfo::default();
    let tiling_started = Instant::now();

    let built = engine
        .build_archive(&ndjson_path, &mbtiles_path, &tile_opts, cancel)
        .await;
    let built = match built {
        Ok(built) => built,
        Err(e) => {
            discard(&ndjson_path);
            return Err(tool_failed("build", e));
        }
    };
    tiling.command = built.args;
    tiling.builder_output = built.output;
    artifacts.mbtiles_bytes = file_size(&mbtiles_path);

    match engine.convert_archive(&mbtiles_path, &output, cancel).await {
        Ok(text) => tiling.convert_output = text,
        Err(e) => {
            discard(&ndjson_path);
            discard(&mbtiles_path);
            return Err(tool_failed("convert", e));
        }
    }
    tiling.tiling_seconds = tiling_started.elapsed().as_secs_f64();
    artifacts.pmtiles_path = Some(output.clone());
    artifacts.pmtiles_bytes = file_size(&output);

    match engine.describe_archive(&output, cancel).await {
        Ok(info) => tiling.archive_info = Some(info),
        Err(e) => {
            tracing::warn!(error = %e, "Could not describe published archive");
            metrics.add_warning(format!("pmtiles info: {e}"));
        }
    }

    if opts.keep_ndjson {
        artifacts.ndjson_path = Some(ndjson_path.clone());
    } else {
        discard(&ndjson_path);
    }
    discard(&mbtiles_path);

    let report = BuildReport {
        tool_version: env!("CARGO_PKG_VERSION"),
        started_at,
        finished_at: Utc::now(),
        duration_seconds: started.elapsed().as_secs_f64(),
        config: ReportConfig {
            input_path: input,
            output_path: output,
            keep_ndjson: opts.keep_ndjson,
            min_zoom: zoom.min_zoom,
            max_zoom: zoom.max_zoom,
            min_zoom_derived: zoom.min_derived,
            max_zoom_derived: zoom.max_derived,
            min_resolution: opts.min_resolution,
            max_resolution: opts.max_resolution,
            quantize_spec: opts.quantize.clone(),
            props_keep: opts.props_keep.clone(),
            props_drop: opts.props_drop.clone(),
            props_default: opts.props_default,
            workers,
            simplify: opts.simplify,
            property_byte_cap: opts.property_byte_cap,
            metadata: opts.metadata.clone(),
        },
        metrics,
        artifacts,
        tiling,
    };

    report.write_json(&out_dir.join(REPORT_FILE_NAME))?;

    tracing::info!(
        emitted = report.metrics.emitted_features,
        dropped = report.dropped_rows(),
        pmtiles_bytes = report.artifacts.pmtiles_bytes,
        duration_seconds = report.duration_seconds,
        "Build complete"
    );
    Ok(report)
}

/// Attribute list handed to the tile builder: empty (keep everything) unless
/// an allow-list is configured, in which case the system fields come first.
pub fn tile_attributes(filter: &FilterSpec) -> Vec<String> {
    let keys = filter.attribute_keys();
    if keys.is_empty() {
        return Vec::new();
    }
    SYSTEM_FIELDS
        .iter()
        .map(|f| f.to_string())
        .chain(
            keys.iter()
                .filter(|k| !SYSTEM_FIELDS.contains(&k.as_str()))
                .cloned(),
        )
        .collect()
}

fn tool_failed(stage: &'static str, err: CollaboratorError) -> PipelineError {
    match err.output() {
        Some(output) => tracing::error!(stage, error = %err, output, "Tile tool failed"),
        None => tracing::error!(stage, error = %err, "Tile tool failed"),
    }
    err.into()
}

fn absolute(path: &Path) -> Result<PathBuf, PipelineError> {
    if path.as_os_str().is_empty() {
        return Err(PipelineError::Config("empty path".into()));
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| PipelineError::io("resolve", path, e))?;
    Ok(cwd.join(path))
}

fn remove_if_exists(path: &Path) -> Result<(), PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io("remove", path, e)),
    }
}

/// Best-effort cleanup of an intermediate file.
fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        tracing::warn!(error = %e, "Failed to remove intermediate file");
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::write_sample;
    use crate::tiler::TileBuildOutput;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Stands in for the external tools: copies files around and records calls.
    #[derive(Default)]
    struct FakeEngine {
        fail_describe: bool,
        fail_build: bool,
        seen: Mutex<Vec<TileOptions>>,
        features_at_build: Mutex<usize>,
    }

    #[async_trait]
    impl TileEngine for FakeEngine {
        async fn build_archive(
            &self,
            features: &Path,
            archive: &Path,
            opts: &TileOptions,
            _cancel: &CancelSignal,
        ) -> Result<TileBuildOutput, CollaboratorError> {
            self.seen.lock().unwrap().push(opts.clone());
            let text = fs::read_to_string(features).unwrap();
            *self.features_at_build.lock().unwrap() = text.lines().count();
            if self.fail_build {
                return Err(CollaboratorError::Failed {
                    tool: "tippecanoe",
                    status: "exit status: 1".into(),
                    output: "boom".into(),
                });
            }
            fs::write(archive, b"mbtiles").unwrap();
            Ok(TileBuildOutput {
                output: "built".into(),
                args: vec!["fake-tippecanoe".into()],
            })
        }

        async fn convert_archive(
            &self,
            archive: &Path,
            published: &Path,
            _cancel: &CancelSignal,
        ) -> Result<String, CollaboratorError> {
            fs::copy(archive, published).unwrap();
            Ok("converted".into())
        }

        async fn describe_archive(
            &self,
            _published: &Path,
            _cancel: &CancelSignal,
        ) -> Result<serde_json::Value, CollaboratorError> {
            if self.fail_describe {
                return Err(CollaboratorError::Failed {
                    tool: "pmtiles",
                    status: "exit status: 2".into(),
                    output: "unreadable".into(),
                });
            }
            Ok(json!({"tile_type": "mvt"}))
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.parquet");
        write_sample(&input, 2, 8).unwrap();
        let output = dir.path().join("dist/out.pmtiles");
        (dir, input, output)
    }

    #[tokio::test]
    async fn builds_archive_and_report() {
        let (_dir, input, output) = fixture();
        let mut opts = BuildOptions::new(&input, &output);
        opts.workers = Some(3);
        opts.props_keep = vec!["score".into(), "h3".into()];
        opts.metadata.insert("name".into(), "Demo".into());
        let engine = FakeEngine::default();

        let report = run_build(&opts, &engine, &CancelSignal::new()).await.unwrap();

        let out_dir = output.parent().unwrap();
        assert!(output.is_file());
        assert!(!out_dir.join(NDJSON_FILE_NAME).exists());
        assert!(!out_dir.join(MBTILES_FILE_NAME).exists());
        assert!(out_dir.join(REPORT_FILE_NAME).is_file());

        assert_eq!(report.metrics.total_rows, 19);
        assert_eq!(report.metrics.emitted_features, 19);
        assert_eq!(*engine.features_at_build.lock().unwrap(), 19);
        assert_eq!((report.config.min_zoom, report.config.max_zoom), (0, 12));
        assert!(report.config.max_zoom_derived);
        assert_eq!(report.tiling.archive_info, Some(json!({"tile_type": "mvt"})));
        assert_eq!(report.tiling.command, ["fake-tippecanoe"]);
        assert!(report.artifacts.ndjson_bytes > 0);
        assert_eq!(report.artifacts.pmtiles_bytes, 7);
        assert_eq!(report.artifacts.ndjson_path, None);

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen[0].attributes, ["h3", "resolution", "score"]);
        assert_eq!(seen[0].threads, 3);
        assert_eq!(seen[0].metadata["name"], "Demo");

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join(REPORT_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(written["metrics"]["emitted_features"], 19);
        assert_eq!(written["config"]["props_default"], "keep_all");
    }

    #[tokio::test]
    async fn keeps_ndjson_and_downgrades_describe_failure() {
        let (_dir, input, output) = fixture();
        let mut opts = BuildOptions::new(&input, &output);
        opts.keep_ndjson = true;
        opts.max_zoom = Some(9);
        let engine = FakeEngine {
            fail_describe: true,
            ..Default::default()
        };

        let report = run_build(&opts, &engine, &CancelSignal::new()).await.unwrap();
        let ndjson = output.parent().unwrap().join(NDJSON_FILE_NAME);
        assert_eq!(report.artifacts.ndjson_path.as_deref(), Some(ndjson.as_path()));
        assert_eq!(fs::read_to_string(&ndjson).unwrap().lines().count(), 19);
        assert_eq!(report.config.max_zoom, 9);
        assert!(!report.config.max_zoom_derived);
        assert!(report.tiling.archive_info.is_none());
        assert!(report
            .metrics
            .warnings
            .iter()
            .any(|w| w.starts_with("pmtiles info:")));
        assert!(engine.seen.lock().unwrap()[0].attributes.is_empty());
    }

    #[tokio::test]
    async fn failed_tile_build_removes_intermediates() {
        let (_dir, input, output) = fixture();
        let opts = BuildOptions::new(&input, &output);
        let engine = FakeEngine {
            fail_build: true,
            ..Default::default()
        };

        let err = run_build(&opts, &engine, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Collaborator(CollaboratorError::Failed { .. })
        ));
        let out_dir = output.parent().unwrap();
        assert!(!out_dir.join(NDJSON_FILE_NAME).exists());
        assert!(!out_dir.join(REPORT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn rejects_bad_options_before_touching_files() {
        let (_dir, input, output) = fixture();
        let mut opts = BuildOptions::new(&input, &output);
        opts.quantize = "float=-1".into();
        let err = run_build(&opts, &FakeEngine::default(), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let mut opts = BuildOptions::new(input.with_extension("missing"), &output);
        opts.min_resolution = Some(3);
        let err = run_build(&opts, &FakeEngine::default(), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(!output.parent().unwrap().exists());
    }

    #[test]
    fn attributes_follow_allow_list() {
        let filter =
            FilterSpec::new(["b", "resolution", "a"], Vec::<String>::new(), DefaultPolicy::KeepNone)
                .unwrap();
        assert_eq!(tile_attributes(&filter), ["h3", "resolution", "b", "a"]);
        assert!(tile_attributes(&FilterSpec::default()).is_empty());
    }
}
