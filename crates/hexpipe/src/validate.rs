//! Sequential input check: cell validity and resolution spread, no output.

use crate::cell::resolve_cell;
use crate::decoder::{DecoderOptions, ParquetDecoder, RowSource};
use crate::error::{CellError, DecodeError, PipelineError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub min_resolution: Option<u8>,
    pub max_resolution: Option<u8>,
    pub sample_limit: usize,
    pub batch_size: usize,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            min_resolution: None,
            max_resolution: None,
            sample_limit: 10,
            batch_size: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidSample {
    pub seq: u64,
    pub cell: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub path: Option<PathBuf>,
    pub total_rows: u64,
    pub valid_rows: u64,
    pub invalid_cells: u64,
    pub resolution_filtered: u64,
    pub resolution_histogram: BTreeMap<u8, u64>,
    pub invalid_samples: Vec<InvalidSample>,
    pub min_resolution_seen: Option<u8>,
    pub max_resolution_seen: Option<u8>,
    pub duration_seconds: f64,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_cells == 0
    }
}

pub fn validate_source<S: RowSource + ?Sized>(
    source: &mut S,
    opts: &ValidateOptions,
) -> Result<ValidationReport, DecodeError> {
    let started = Instant::now();
    let mut report = ValidationReport {
        path: None,
        total_rows: 0,
        valid_rows: 0,
        invalid_cells: 0,
        resolution_filtered: 0,
        resolution_histogram: BTreeMap::new(),
        invalid_samples: Vec::new(),
        min_resolution_seen: None,
        max_resolution_seen: None,
        duration_seconds: 0.0,
    };

    while let Some(row) = source.next_row()? {
        report.total_rows += 1;

        let cell = match resolve_cell(&row.columns) {
            Ok(cell) => cell,
            Err(err) => {
                report.invalid_cells += 1;
                if report.invalid_samples.len() < opts.sample_limit {
                    report.invalid_samples.push(InvalidSample {
                        seq: row.seq,
                        cell: match &err {
                            CellError::MissingCellColumn => "-".to_owned(),
                            CellError::InvalidCell { value, .. } => value.clone(),
                        },
                        message: err.to_string(),
                    });
                }
                continue;
            }
        };

        let res = cell.resolution();
        let below = opts.min_resolution.is_some_and(|min| res < min);
        let above = opts.max_resolution.is_some_and(|max| res > max);
        if below || above {
            report.resolution_filtered += 1;
            continue;
        }

        report.valid_rows += 1;
        *report.resolution_histogram.entry(res).or_default() += 1;
        report.min_resolution_seen = Some(report.min_resolution_seen.map_or(res, |m| m.min(res)));
        report.max_resolution_seen = Some(report.max_resolution_seen.map_or(res, |m| m.max(res)));
    }

    report.duration_seconds = started.elapsed().as_secs_f64();
    Ok(report)
}

pub fn validate_file<P: AsRef<Path>>(
    path: P,
    opts: &ValidateOptions,
) -> Result<ValidationReport, PipelineError> {
    let path = path.as_ref();
    let mut decoder = ParquetDecoder::open(
        path,
        DecoderOptions {
            batch_size: opts.batch_size,
        },
    )?;
    let mut report = validate_source(&mut decoder, opts)?;
    report.path = Some(path.to_path_buf());

    tracing::info!(
        path = %path.display(),
        total_rows = report.total_rows,
        valid_rows = report.valid_rows,
        invalid_cells = report.invalid_cells,
        resolution_filtered = report.resolution_filtered,
        "Validated input"
    );
    Ok(report)
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            writeln!(f, "{}", path.display())?;
        }
        writeln!(
            f,
            "  rows: {} valid: {} invalid: {} filtered: {}",
            self.total_rows, self.valid_rows, self.invalid_cells, self.resolution_filtered
        )?;
        if let (Some(min), Some(max)) = (self.min_resolution_seen, self.max_resolution_seen) {
            writeln!(f, "  resolutions: r{min} -> r{max}")?;
        }
        writeln!(f, "  duration: {:.3}s", self.duration_seconds)?;

        if self.invalid_cells > 0 {
            writeln!(f, "  invalid samples:")?;
            for sample in &self.invalid_samples {
                writeln!(f, "    row {} ({}): {}", sample.seq, sample.cell, sample.message)?;
            }
            let shown = self.invalid_samples.len() as u64;
            if shown < self.invalid_cells {
                writeln!(f, "    ... {} more", self.invalid_cells - shown)?;
            }
        }
        Ok(())
    }
}
