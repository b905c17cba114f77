//! Property-type survey over the first rows of an input.

use crate::cell::{is_cell_column, resolve_cell};
use crate::decoder::{DecoderOptions, ParquetDecoder, RowSource};
use crate::error::{DecodeError, PipelineError};
use crate::value::PropertyValue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_SCHEMA_SAMPLE: usize = 5000;
const EXAMPLE_MAX_CHARS: usize = 48;
const INVALID_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySummary {
    /// Type of the first value seen.
    pub type_name: &'static str,
    pub mixed: bool,
    pub samples: u64,
    pub example: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaReport {
    pub path: Option<PathBuf>,
    pub total_rows: Option<u64>,
    pub sampled_rows: u64,
    pub sample_limit: usize,
    pub invalid_rows: u64,
    pub invalid_samples: Vec<String>,
    pub properties: BTreeMap<String, PropertySummary>,
    pub resolution_histogram: BTreeMap<u8, u64>,
}

pub fn survey_source<S: RowSource + ?Sized>(
    source: &mut S,
    sample_limit: usize,
) -> Result<SchemaReport, DecodeError> {
    let mut report = SchemaReport {
        path: None,
        total_rows: source.total_rows(),
        sampled_rows: 0,
        sample_limit,
        invalid_rows: 0,
        invalid_samples: Vec::new(),
        properties: BTreeMap::new(),
        resolution_histogram: BTreeMap::new(),
    };

    while (report.sampled_rows as usize) < sample_limit {
        let Some(row) = source.next_row()? else { break };
        report.sampled_rows += 1;

        match resolve_cell(&row.columns) {
            Ok(cell) => {
                *report.resolution_histogram.entry(cell.resolution()).or_default() += 1;
            }
            Err(err) => {
                report.invalid_rows += 1;
                if report.invalid_samples.len() < INVALID_SAMPLE_LIMIT {
                    report.invalid_samples.push(err.to_string());
                }
                continue;
            }
        }

        for (name, raw) in row.columns.iter().filter(|(name, _)| !is_cell_column(name)) {
            let value = raw.to_property();
            let type_name = value.type_name();
            let summary = report
                .properties
                .entry(name.clone())
                .or_insert_with(|| PropertySummary {
                    type_name,
                    mixed: false,
                    samples: 0,
                    example: None,
                });
            if summary.type_name != type_name {
                summary.mixed = true;
            }
            summary.samples += 1;
            if summary.example.is_none() && value != PropertyValue::Null {
                summary.example = Some(format_example(&value));
            }
        }
    }

    Ok(report)
}

pub fn survey_file<P: AsRef<Path>>(path: P, sample_limit: usize) -> Result<SchemaReport, PipelineError> {
    let path = path.as_ref();
    let mut decoder = ParquetDecoder::open(
        path,
        DecoderOptions {
            batch_size: sample_limit.clamp(1, 4096),
        },
    )?;
    let mut report = survey_source(&mut decoder, sample_limit)?;
    report.path = Some(path.to_path_buf());
    Ok(report)
}

fn format_example(value: &PropertyValue) -> String {
    let truncate = |s: &str| -> String {
        if s.chars().count() > EXAMPLE_MAX_CHARS {
            let head: String = s.chars().take(EXAMPLE_MAX_CHARS - 3).collect();
            format!("{head}...")
        } else {
            s.to_owned()
        }
    };
    match value {
        PropertyValue::String(s) => format!("{:?}", truncate(s)),
        other => truncate(&other.to_string()),
    }
}

impl fmt::Display for SchemaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            writeln!(f, "{}", path.display())?;
        }
        match self.total_rows {
            Some(total) => writeln!(f, "  total rows: {total}")?,
            None => writeln!(f, "  total rows: unknown")?,
        }
        writeln!(
            f,
            "  sampled rows: {} (limit {})",
            self.sampled_rows, self.sample_limit
        )?;
        writeln!(f, "  invalid rows: {}", self.invalid_rows)?;
        if !self.invalid_samples.is_empty() {
            writeln!(f, "  invalid samples:")?;
            for sample in &self.invalid_samples {
                writeln!(f, "    {sample}")?;
            }
            let shown = self.invalid_samples.len() as u64;
            if self.invalid_rows > shown {
                writeln!(f, "    ... {} more", self.invalid_rows - shown)?;
            }
        }

        if self.properties.is_empty() {
            writeln!(f, "  properties: none")?;
        } else {
            writeln!(f, "  properties:")?;
            for (name, info) in &self.properties {
                let mixed = if info.mixed { " (mixed)" } else { "" };
                writeln!(
                    f,
                    "    {name}: {}{mixed} ({} samples, example {})",
                    info.type_name,
                    info.samples,
                    info.example.as_deref().unwrap_or("n/a")
                )?;
            }
        }

        if !self.resolution_histogram.is_empty() {
            writeln!(f, "  resolutions:")?;
            for (res, count) in &self.resolution_histogram {
                writeln!(f, "    r{res}: {count}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MemorySource;
    use crate::value::RawValue;

    const CELL: &str = "8928308280fffff";

    fn source() -> MemorySource {
        let long = "y".repeat(100);
        MemorySource::new(vec![
            BTreeMap::from([
                ("h3".to_string(), RawValue::from(CELL)),
                ("score".to_string(), RawValue::Null),
                ("label".to_string(), RawValue::from(long.as_str())),
            ]),
            BTreeMap::from([
                ("h3".to_string(), RawValue::from(CELL)),
                ("score".to_string(), RawValue::Float(0.5)),
                ("label".to_string(), RawValue::from("short")),
            ]),
            BTreeMap::from([("h3".to_string(), RawValue::from("bogus"))]),
            BTreeMap::from([
                ("h3".to_string(), RawValue::from(CELL)),
                ("score".to_string(), RawValue::Float(0.7)),
            ]),
        ])
    }

    #[test]
    fn summarizes_types_examples_and_invalid_rows() {
        let report = survey_source(&mut source(), 100).unwrap();
        assert_eq!(report.total_rows, Some(4));
        assert_eq!(report.sampled_rows, 4);
        assert_eq!(report.invalid_rows, 1);
        assert_eq!(report.resolution_histogram, BTreeMap::from([(9, 3)]));
        assert!(!report.properties.contains_key("h3"));

        let score = &report.properties["score"];
        assert_eq!(score.type_name, "null");
        assert!(score.mixed);
        assert_eq!(score.samples, 3);
        assert_eq!(score.example.as_deref(), Some("0.5"));

        let label = &report.properties["label"];
        assert!(!label.mixed);
        let example = label.example.as_deref().unwrap();
        assert!(example.ends_with("...\""));
        assert_eq!(example.chars().count(), EXAMPLE_MAX_CHARS + 2);
    }

    #[test]
    fn stops_at_the_sample_limit() {
        let report = survey_source(&mut source(), 2).unwrap();
        assert_eq!(report.sampled_rows, 2);
        assert_eq!(report.invalid_rows, 0);
        let text = report.to_string();
        assert!(text.contains("sampled rows: 2 (limit 2)"));
        assert!(text.contains("label: string (2 samples"));
        assert!(text.contains("r9: 2"));
    }
}
