//! Run statistics, accumulated in release order by the reassembly loop.

use crate::worker::{DropReason, DroppedRow, Outcome, ProcessingResult};
use serde::Serialize;
use std::collections::BTreeMap;

pub const INVALID_SAMPLE_LIMIT: usize = 10;
pub const PROPERTY_WARNING_LIMIT: usize = 20;
/// A resolution spread at least this wide is reported as mixed.
pub const MIXED_RESOLUTION_SPREAD: u8 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub invalid_cell: u64,
    pub resolution_filter: u64,
    pub property_cap: u64,
    pub other: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.invalid_cell + self.resolution_filter + self.property_cap + self.other
    }

    fn bump(&mut self, reason: DropReason) {
        match reason {
            DropReason::InvalidCell => self.invalid_cell += 1,
            DropReason::ResolutionFilter => self.resolution_filter += 1,
            DropReason::PropertyCap => self.property_cap += 1,
            DropReason::Other => self.other += 1,
        }
    }
}

/// A list that keeps the first `limit` entries and counts the rest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleList<T> {
    pub items: Vec<T>,
    pub overflow: u64,
    #[serde(skip)]
    limit: usize,
}

impl<T> SampleList<T> {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            overflow: 0,
            limit,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.limit {
            self.items.push(item);
        } else {
            self.overflow += 1;
        }
    }

    /// Entries offered, kept or not.
    pub fn total(&self) -> u64 {
        self.items.len() as u64 + self.overflow
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyWarning {
    pub seq: u64,
    pub cell: String,
    pub property_count: usize,
    pub property_bytes: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub total_rows: u64,
    pub emitted_features: u64,
    pub dropped: DropCounts,
    pub resolution_histogram: BTreeMap<u8, u64>,
    pub min_resolution_seen: Option<u8>,
    pub max_resolution_seen: Option<u8>,
    pub quantize_changes: u64,
    pub quantize_total_abs_error: f64,
    pub quantize_field_errors: BTreeMap<String, f64>,
    pub invalid_samples: SampleList<String>,
    pub property_warnings: SampleList<PropertyWarning>,
    pub warnings: Vec<String>,
    pub sink_records: u64,
    pub sink_bytes: u64,
    pub processing_seconds: f64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            total_rows: 0,
            emitted_features: 0,
            dropped: DropCounts::default(),
            resolution_histogram: BTreeMap::new(),
            min_resolution_seen: None,
            max_resolution_seen: None,
            quantize_changes: 0,
            quantize_total_abs_error: 0.0,
            quantize_field_errors: BTreeMap::new(),
            invalid_samples: SampleList::with_limit(INVALID_SAMPLE_LIMIT),
            property_warnings: SampleList::with_limit(PROPERTY_WARNING_LIMIT),
            warnings: Vec::new(),
            sink_records: 0,
            sink_bytes: 0,
            processing_seconds: 0.0,
        }
    }
}

impl RunMetrics {
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    fn observe_resolution(&mut self, res: u8) {
        *self.resolution_histogram.entry(res).or_default() += 1;
        self.min_resolution_seen = Some(self.min_resolution_seen.map_or(res, |m| m.min(res)));
        self.max_resolution_seen = Some(self.max_resolution_seen.map_or(res, |m| m.max(res)));
    }
}

/// Folds released results into [`RunMetrics`]. Owned by a single task.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    metrics: RunMetrics,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for one row. Must be called exactly once per row, in order.
    pub fn record(&mut self, result: &ProcessingResult) {
        let m = &mut self.metrics;
        m.total_rows += 1;

        match &result.outcome {
            Outcome::Emitted {
                feature,
                resolution,
                property_bytes,
                property_count,
                quantize,
            } => {
                m.emitted_features += 1;
                m.observe_resolution(*resolution);

                if quantize.changes > 0 {
                    m.quantize_changes += quantize.changes;
                    m.quantize_total_abs_error += quantize.total_abs_error;
                    for (key, err) in &quantize.field_errors {
                        *m.quantize_field_errors.entry(key.clone()).or_default() += err;
                    }
                }

                if result.exceeds_soft_limits() {
                    m.property_warnings.push(PropertyWarning {
                        seq: result.seq,
                        cell: feature.id.clone(),
                        property_count: *property_count,
                        property_bytes: *property_bytes,
                        message: format!(
                            "large property payload ({property_count} props, {property_bytes} bytes)"
                        ),
                    });
                }
            }
            Outcome::Dropped(dropped) => {
                m.dropped.bump(dropped.reason);
                match dropped.reason {
                    DropReason::InvalidCell => {
                        m.invalid_samples.push(invalid_sample(result.seq, dropped));
                    }
                    DropReason::PropertyCap => {
                        if let Some(res) = dropped.resolution {
                            m.observe_resolution(res);
                        }
                        m.property_warnings.push(PropertyWarning {
                            seq: result.seq,
                            cell: dropped.cell.clone().unwrap_or_default(),
                            property_count: dropped.property_count,
                            property_bytes: dropped.property_bytes,
                            message: format!(
                                "dropped: {}",
                                dropped.detail.as_deref().unwrap_or("property payload exceeds cap")
                            ),
                        });
                    }
                    DropReason::ResolutionFilter | DropReason::Other => {}
                }
            }
        }
    }

    /// Adds the summary warnings and returns the final metrics.
    pub fn finish(self) -> RunMetrics {
        let mut m = self.metrics;

        if let (Some(min), Some(max)) = (m.min_resolution_seen, m.max_resolution_seen) {
            if max - min >= MIXED_RESOLUTION_SPREAD {
                m.add_warning(format!("mixed H3 resolutions detected: r{min}-r{max}"));
            }
        }

        if !m.invalid_samples.items.is_empty() {
            let mut msg = format!(
                "invalid H3 cells encountered: {}",
                m.invalid_samples.items.join("; ")
            );
            let shown = m.invalid_samples.items.len() as u64;
            if m.dropped.invalid_cell > shown {
                msg.push_str(&format!(" (and {} more)", m.dropped.invalid_cell - shown));
            }
            m.add_warning(msg);
        }

        let total_warnings = m.property_warnings.total();
        if total_warnings > PROPERTY_WARNING_LIMIT as u64 {
            m.add_warning(format!("property warnings truncated ({total_warnings} total)"));
        }

        m
    }
}

fn invalid_sample(seq: u64, dropped: &DroppedRow) -> String {
    let detail = dropped.detail.as_deref().unwrap_or("invalid H3 cell");
    match dropped.cell.as_deref() {
        Some(cell) => format!("row {seq} ({cell}): {detail}"),
        None => format!("row {seq}: {detail}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoomRange {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub min_derived: bool,
    pub max_derived: bool,
}

pub const DEFAULT_MAX_ZOOM: u8 = 12;
pub const MAX_DERIVED_ZOOM: u8 = 15;

/// Picks the tile zoom range. Unset bounds are derived: min from 0, max
/// from two levels above the finest resolution seen, kept within 12..=15.
/// A max below min is raised to min.
pub fn derive_zoom_range(
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
    max_res_seen: Option<u8>,
) -> ZoomRange {
    let min = min_zoom.unwrap_or(0);
    let mut max = max_zoom.unwrap_or_else(|| {
        max_res_seen.map_or(DEFAULT_MAX_ZOOM, |res| {
            res.saturating_add(2).clamp(DEFAULT_MAX_ZOOM, MAX_DERIVED_ZOOM)
        })
    });
    if max < min {
        max = min;
    }

    ZoomRange {
        min_zoom: min,
        max_zoom: max,
        min_derived: min_zoom.is_none(),
        max_derived: max_zoom.is_none(),
    }
}
