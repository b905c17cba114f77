// hexatiles/crates/hexpipe/src/tiler.rs
//! Tile building and publishing.
//!
//! [`TileEngine`] is the seam between the pipeline and whatever turns the
//! feature stream into tiles. [`CliTileEngine`] drives the `tippecanoe` and
//! `pmtiles` command-line tools as child processes.

use crate::cancel::CancelSignal;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub const TIPPECANOE: &str = "tippecanoe";
pub const PMTILES: &str = "pmtiles";
pub const TIPPECANOE_PATH_ENV: &str = "TIPPECANOE_PATH";
pub const PMTILES_PATH_ENV: &str = "PMTILES_PATH";
pub const TIPPECANOE_THREADS_ENV: &str = "TIPPECANOE_MAX_THREADS";

/// Metadata keys forwarded to the tile builder.
const METADATA_FLAGS: [&str; 4] = ["name", "description", "attribution", "version"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileOptions {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub simplify: bool,
    pub sort_key: String,
    pub layer_name: String,
    /// Thread hint for the builder; 0 lets it decide.
    pub threads: usize,
    pub attributes: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            min_zoom: 0,
            max_zoom: 12,
            simplify: false,
            sort_key: "h3".into(),
            layer_name: "h3".into(),
            threads: 0,
            attributes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileBuildOutput {
    /// Combined stdout and stderr of the builder.
    pub output: String,
    /// The exact invocation, program first.
    pub args: Vec<String>,
}

#[async_trait]
pub trait TileEngine: Send + Sync {
    /// Fails early when a required tool is unavailable.
    fn check_available(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn build_archive(
        &self,
        features: &Path,
        archive: &Path,
        opts: &TileOptions,
        cancel: &CancelSignal,
    ) -> Result<TileBuildOutput, CollaboratorError>;

    /// Converts the intermediate archive into the published format.
    async fn convert_archive(
        &self,
        archive: &Path,
        published: &Path,
        cancel: &CancelSignal,
    ) -> Result<String, CollaboratorError>;

    async fn describe_archive(
        &self,
        published: &Path,
        cancel: &CancelSignal,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Runs `tippecanoe` and `pmtiles` as child processes.
#[derive(Debug, Clone, Default)]
pub struct CliTileEngine {
    tippecanoe: Option<PathBuf>,
    pmtiles: Option<PathBuf>,
}

impl CliTileEngine {
    /// Explicit paths take precedence over the `*_PATH` environment
    /// variables, which take precedence over `PATH`.
    pub fn new(tippecanoe: Option<PathBuf>, pmtiles: Option<PathBuf>) -> Self {
        Self { tippecanoe, pmtiles }
    }

    pub fn tippecanoe_path(&self) -> Result<PathBuf, CollaboratorError> {
        resolve_tool(TIPPECANOE, self.tippecanoe.as_deref(), TIPPECANOE_PATH_ENV)
    }

    pub fn pmtiles_path(&self) -> Result<PathBuf, CollaboratorError> {
        resolve_tool(PMTILES, self.pmtiles.as_deref(), PMTILES_PATH_ENV)
    }
}

#[async_trait]
impl TileEngine for CliTileEngine {
    fn check_available(&self) -> Result<(), CollaboratorError> {
        self.tippecanoe_path()?;
        self.pmtiles_path()?;
        Ok(())
    }

    async fn build_archive(
        &self,
        features: &Path,
        archive: &Path,
        opts: &TileOptions,
        cancel: &CancelSignal,
    ) -> Result<TileBuildOutput, CollaboratorError> {
        let program = self.tippecanoe_path()?;
        let args = tippecanoe_args(features, archive, opts);
        let envs: Vec<(String, String)> = if opts.threads > 0 {
            vec![(TIPPECANOE_THREADS_ENV.to_owned(), opts.threads.to_string())]
        } else {
            Vec::new()
        };

        let output = run_tool(TIPPECANOE, &program, &args, &envs, cancel).await?;

        let mut invocation = Vec::with_capacity(args.len() + 1);
        invocation.push(program.display().to_string());
        invocation.extend(args);
        Ok(TileBuildOutput {
            output: output.combined(),
            args: invocation,
        })
    }

    async fn convert_archive(
        &self,
        archive: &Path,
        published: &Path,
        cancel: &CancelSignal,
    ) -> Result<String, CollaboratorError> {
        let program = self.pmtiles_path()?;
        let args = vec![
            "convert".to_owned(),
            archive.display().to_string(),
            published.display().to_string(),
        ];
        let output = run_tool(PMTILES, &program, &args, &[], cancel).await?;
        Ok(output.combined())
    }

    async fn describe_archive(
        &self,
        published: &Path,
        cancel: &CancelSignal,
    ) -> Result<serde_json::Value, CollaboratorError> {
        let program = self.pmtiles_path()?;
        let args = vec![
            "info".to_owned(),
            "--json".to_owned(),
            published.display().to_string(),
        ];
        let output = run_tool(PMTILES, &program, &args, &[], cancel).await?;
        serde_json::from_str(output.stdout.trim()).map_err(|source| {
            CollaboratorError::MalformedResponse {
                tool: PMTILES,
                output: output.combined(),
                source,
            }
        })
    }
}

/// Builds the tippecanoe argument list (without the program name).
pub fn tippecanoe_args(features: &Path, archive: &Path, opts: &TileOptions) -> Vec<String> {
    let non_blank = |s: &str, fallback: &str| {
        if s.trim().is_empty() {
            fallback.to_owned()
        } else {
            s.to_owned()
        }
    };

    let mut args: Vec<String> = vec![
        "-o".into(),
        archive.display().to_string(),
        "--force".into(),
        "--layer".into(),
        non_blank(&opts.layer_name, "h3"),
        "--drop-densest-as-needed".into(),
        "--extend-zooms-if-still-dropping".into(),
        "--coalesce-densest-as-needed".into(),
        "--no-feature-limit".into(),
        "--no-tile-size-limit".into(),
        "--sort-by".into(),
        non_blank(&opts.sort_key, "h3"),
    ];

    if !opts.simplify {
        args.push("--no-line-simplification".into());
    }

    args.push("--minimum-zoom".into());
    args.push(opts.min_zoom.to_string());
    args.push("--maximum-zoom".into());
    args.push(opts.max_zoom.to_string());

    if !opts.attributes.is_empty() {
        args.push("--attributes".into());
        args.push(opts.attributes.join(","));
    }

    for (key, value) in &opts.metadata {
        let key = key.to_ascii_lowercase();
        if value.trim().is_empty() || !METADATA_FLAGS.contains(&key.as_str()) {
            continue;
        }
        args.push(format!("--{key}"));
        args.push(value.clone());
    }

    args.push(features.display().to_string());
    args
}

fn resolve_tool(
    tool: &'static str,
    explicit: Option<&Path>,
    env_var: &str,
) -> Result<PathBuf, CollaboratorError> {
    let candidate = explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            std::env::var_os(env_var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(tool));

    find_executable(&candidate).ok_or_else(|| CollaboratorError::NotFound {
        tool,
        candidate: candidate.display().to_string(),
    })
}

/// A bare name is searched on `PATH`; anything with a directory part is
/// checked as given.
fn find_executable(candidate: &Path) -> Option<PathBuf> {
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(candidate))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

struct ToolOutput {
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        text.push_str(&self.stderr);
        text
    }
}

async fn run_tool(
    tool: &'static str,
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cancel: &CancelSignal,
) -> Result<ToolOutput, CollaboratorError> {
    tracing::info!(tool, program = %program.display(), args = ?args, "Running external tool");

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|source| CollaboratorError::Spawn { tool, source })?;

    // Dropping the pending wait drops the child, which kills it.
    let output = tokio::select! {
        out = child.wait_with_output() => out.map_err(|source| CollaboratorError::Spawn { tool, source })?,
        _ = cancel.cancelled() => {
            tracing::warn!(tool, "External tool cancelled");
            return Err(CollaboratorError::Cancelled { tool });
        }
    };

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !output.status.success() {
        tracing::error!(tool, status = %output.status, "External tool failed");
        return Err(CollaboratorError::Failed {
            tool,
            status: output.status.to_string(),
            output: result.combined(),
        });
    }

    tracing::debug!(tool, "External tool finished");
    Ok(result)
}
