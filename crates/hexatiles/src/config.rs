use clap::{Args, Parser, Subcommand, ValueEnum};
use hexpipe::decoder::DEFAULT_BATCH_SIZE;
use hexpipe::pipeline::DEFAULT_PROPERTY_BYTE_CAP;
use hexpipe::schema::DEFAULT_SCHEMA_SAMPLE;
use hexpipe::validate::ValidateOptions;
use hexpipe::{BuildOptions, DefaultPolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `hexatiles` - Turns H3-indexed Parquet into vector tile archives.
///
/// Rows are converted to hexagon polygons, streamed through `tippecanoe` and
/// published as a single PMTiles file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a PMTiles archive from a Parquet file.
    Build(BuildArgs),
    /// Check H3 cells and resolutions without writing anything.
    Validate(ValidateArgs),
    /// Survey property types over the first rows of a file.
    Schema(SchemaArgs),
    /// Print the metadata of a PMTiles archive as JSON.
    Inspect(InspectArgs),
    /// Write a small synthetic Parquet dataset.
    Sample(SampleArgs),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PropsDefault {
    /// Keep every property not matched by a drop pattern.
    #[default]
    KeepAll,
    /// Keep only the properties listed in `--props`.
    KeepNone,
}

impl From<PropsDefault> for DefaultPolicy {
    fn from(value: PropsDefault) -> Self {
        match value {
            PropsDefault::KeepAll => DefaultPolicy::KeepAll,
            PropsDefault::KeepNone => DefaultPolicy::KeepNone,
        }
    }
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Input Parquet file with an H3 column.
    #[arg(long = "in", env = "HEXATILES_INPUT")]
    pub input: PathBuf,

    /// Output PMTiles path. `report.json` and intermediates are written next to it.
    #[arg(long = "out", env = "HEXATILES_OUTPUT", default_value = "dist/h3.pmtiles")]
    pub output: PathBuf,

    /// Keep the intermediate `xyz.ndjson` feature stream.
    #[arg(long, env = "HEXATILES_KEEP_NDJSON")]
    pub keep_ndjson: bool,

    /// Minimum zoom. Defaults to 0.
    #[arg(long = "minzoom", env = "HEXATILES_MINZOOM")]
    pub min_zoom: Option<u8>,

    /// Maximum zoom. Derived from the finest resolution seen when unset.
    #[arg(long = "maxzoom", env = "HEXATILES_MAXZOOM")]
    pub max_zoom: Option<u8>,

    /// Drop rows whose cell resolution is below this value.
    #[arg(long, env = "HEXATILES_MIN_RES", value_parser = clap::value_parser!(u8).range(0..=15))]
    pub min_res: Option<u8>,

    /// Drop rows whose cell resolution is above this value.
    #[arg(long, env = "HEXATILES_MAX_RES", value_parser = clap::value_parser!(u8).range(0..=15))]
    pub max_res: Option<u8>,

    /// Properties to keep, separated by `,` or `;`.
    #[arg(long, env = "HEXATILES_PROPS", default_value = "")]
    pub props: String,

    /// Glob patterns of properties to drop, separated by `,` or `;`.
    #[arg(long, env = "HEXATILES_PROPS_DROP", default_value = "")]
    pub props_drop: String,

    /// What to keep when `--props` is empty.
    #[arg(long, env = "HEXATILES_PROPS_DEFAULT", value_enum, default_value_t = PropsDefault::KeepAll)]
    pub props_default: PropsDefault,

    /// Quantization directives, e.g. `float=0.01,int=1,score=0.5`.
    #[arg(long, env = "HEXATILES_QUANTIZE", default_value = "")]
    pub quantize: String,

    /// Let tippecanoe simplify polygon edges.
    #[arg(long, env = "HEXATILES_SIMPLIFY")]
    pub simplify: bool,

    /// Worker count for the pipeline and thread hint for tippecanoe.
    #[arg(long, env = "HEXATILES_THREADS")]
    pub threads: Option<usize>,

    /// Drop rows whose serialized properties exceed this many bytes (0 disables).
    #[arg(long, env = "HEXATILES_PROPERTY_CAP", default_value_t = DEFAULT_PROPERTY_BYTE_CAP)]
    pub property_cap: usize,

    /// Parquet read batch size.
    #[arg(long, env = "HEXATILES_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Path to the tippecanoe binary. Falls back to `TIPPECANOE_PATH`, then `PATH`.
    #[arg(long)]
    pub tippecanoe_bin: Option<PathBuf>,

    /// Path to the pmtiles binary. Falls back to `PMTILES_PATH`, then `PATH`.
    #[arg(long)]
    pub pmtiles_bin: Option<PathBuf>,

    /// Tileset name.
    #[arg(long, env = "HEXATILES_NAME")]
    pub name: Option<String>,

    /// Tileset description.
    #[arg(long, env = "HEXATILES_DESCRIPTION")]
    pub description: Option<String>,

    /// Tileset attribution.
    #[arg(long, env = "HEXATILES_ATTRIBUTION")]
    pub attribution: Option<String>,

    /// Tileset version string.
    #[arg(long, env = "HEXATILES_TILESET_VERSION")]
    pub tileset_version: Option<String>,

    /// Write the run's Prometheus metrics in text format to this file.
    #[arg(long, env = "HEXATILES_METRICS_OUT")]
    pub metrics_out: Option<PathBuf>,
}

impl BuildArgs {
    pub fn to_options(&self) -> BuildOptions {
        let mut metadata = BTreeMap::new();
        let entries = [
            ("name", &self.name),
            ("description", &self.description),
            ("attribution", &self.attribution),
            ("version", &self.tileset_version),
        ];
        for (key, value) in entries {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                metadata.insert(key.to_string(), v.to_string());
            }
        }

        BuildOptions {
            keep_ndjson: self.keep_ndjson,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            min_resolution: self.min_res,
            max_resolution: self.max_res,
            props_keep: split_list(&self.props),
            props_drop: split_list(&self.props_drop),
            props_default: self.props_default.into(),
            quantize: self.quantize.clone(),
            simplify: self.simplify,
            workers: self.threads,
            property_byte_cap: self.property_cap,
            batch_size: self.batch_size,
            metadata,
            ..BuildOptions::new(&self.input, &self.output)
        }
    }
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Input Parquet files.
    #[arg(long = "in", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=15))]
    pub min_res: Option<u8>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=15))]
    pub max_res: Option<u8>,

    /// Number of invalid rows to show per file.
    #[arg(long, default_value_t = 5)]
    pub sample: usize,
}

impl ValidateArgs {
    pub fn to_options(&self) -> ValidateOptions {
        ValidateOptions {
            min_resolution: self.min_res,
            max_resolution: self.max_res,
            sample_limit: self.sample,
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(long = "in")]
    pub input: PathBuf,

    /// Rows to sample.
    #[arg(long, default_value_t = DEFAULT_SCHEMA_SAMPLE)]
    pub sample: usize,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// PMTiles archive to describe.
    #[arg(long = "in")]
    pub input: PathBuf,

    #[arg(long)]
    pub pmtiles_bin: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SampleArgs {
    #[arg(long = "out", default_value = "dist/sample.parquet")]
    pub output: PathBuf,

    /// Grid-disk rings around the sample centre.
    #[arg(long, default_value_t = 5)]
    pub count: u32,

    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(0..=15))]
    pub resolution: u8,
}

/// Splits a `,`/`;` separated list, dropping blank entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
