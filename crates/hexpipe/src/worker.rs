//! Per-row processing: cell → filter/quantize → cap → polygon.
//!
//! [`process_row`] is pure with respect to shared state; every per-row
//! condition is folded into the returned [`ProcessingResult`]. Only failures
//! that make the whole run meaningless come back as `Err`.

use crate::cell::{is_cell_column, resolve_cell};
use crate::decoder::Row;
use crate::error::PipelineError;
use crate::geometry::build_polygon;
use crate::props::{normalize, FilterSpec, QuantizeRules, QuantizeStats};
use crate::sink::Feature;
use crate::value::{PropertyBag, PropertyValue};
use serde::Serialize;

/// More properties than this on one feature raises a warning.
pub const SOFT_PROPERTY_COUNT: usize = 15;
/// A property payload larger than this raises a warning.
pub const SOFT_PROPERTY_BYTES: usize = 20 * 1024;

/// Fields injected into every feature; they bypass filtering and quantization.
pub const SYSTEM_FIELDS: [&str; 2] = ["h3", "resolution"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    InvalidCell,
    ResolutionFilter,
    PropertyCap,
    Other,
}

/// Everything the reassembly side needs to know about a dropped row.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedRow {
    pub reason: DropReason,
    /// Cell literal (raw text for invalid cells, canonical form otherwise).
    pub cell: Option<String>,
    /// Set when the cell was valid.
    pub resolution: Option<u8>,
    pub detail: Option<String>,
    pub property_bytes: usize,
    pub property_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Emitted {
        feature: Feature,
        resolution: u8,
        property_bytes: usize,
        property_count: usize,
        quantize: QuantizeStats,
    },
    Dropped(DroppedRow),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub seq: u64,
    pub outcome: Outcome,
}

impl ProcessingResult {
    pub fn is_emitted(&self) -> bool {
        matches!(self.outcome, Outcome::Emitted { .. })
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match &self.outcome {
            Outcome::Emitted { .. } => None,
            Outcome::Dropped(d) => Some(d.reason),
        }
    }

    /// Whether the payload crossed the soft size/count thresholds.
    pub fn exceeds_soft_limits(&self) -> bool {
        match &self.outcome {
            Outcome::Emitted {
                property_bytes,
                property_count,
                ..
            } => *property_count > SOFT_PROPERTY_COUNT || *property_bytes > SOFT_PROPERTY_BYTES,
            Outcome::Dropped(_) => false,
        }
    }
}

/// Read-only configuration shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct RowContext {
    pub filter: FilterSpec,
    pub quantize: QuantizeRules,
    pub min_resolution: Option<u8>,
    pub max_resolution: Option<u8>,
    /// Maximum serialized property size in bytes; 0 disables the cap.
    pub property_byte_cap: usize,
}

impl RowContext {
    fn accepts_resolution(&self, res: u8) -> bool {
        self.min_resolution.map_or(true, |min| res >= min)
            && self.max_resolution.map_or(true, |max| res <= max)
    }
}

pub fn process_row(row: Row, ctx: &RowContext) -> Result<ProcessingResult, PipelineError> {
    let Row { seq, columns } = row;
    let dropped = |d: DroppedRow| ProcessingResult {
        seq,
        outcome: Outcome::Dropped(d),
    };

    let cell = match resolve_cell(&columns) {
        Ok(cell) => cell,
        Err(err) => {
            let literal = err.value();
            return Ok(dropped(DroppedRow {
                reason: DropReason::InvalidCell,
                cell: (!literal.is_empty()).then(|| literal.to_owned()),
                resolution: None,
                detail: Some(err.to_string()),
                property_bytes: 0,
                property_count: 0,
            }));
        }
    };

    let id = cell.canonical();
    let resolution = cell.resolution();

    if !ctx.accepts_resolution(resolution) {
        return Ok(dropped(DroppedRow {
            reason: DropReason::ResolutionFilter,
            cell: Some(id),
            resolution: Some(resolution),
            detail: Some(format!("resolution {resolution} outside configured range")),
            property_bytes: 0,
            property_count: 0,
        }));
    }

    let raw_props: PropertyBag = columns
        .iter()
        .filter(|(name, _)| !is_cell_column(name))
        .map(|(name, value)| (name.clone(), value.to_property()))
        .collect();

    let (mut properties, quantize) = normalize(raw_props, &ctx.filter, &ctx.quantize);
    properties.insert(SYSTEM_FIELDS[0].to_owned(), PropertyValue::String(id.clone()));
    properties.insert(
        SYSTEM_FIELDS[1].to_owned(),
        PropertyValue::Int(i64::from(resolution)),
    );

    let property_bytes = serde_json::to_vec(&properties)
        .map_err(|source| PipelineError::Serialization {
            what: "properties",
            source,
        })?
        .len();
    let property_count = properties.len();

    if ctx.property_byte_cap > 0 && property_bytes > ctx.property_byte_cap {
        return Ok(dropped(DroppedRow {
            reason: DropReason::PropertyCap,
            cell: Some(id),
            resolution: Some(resolution),
            detail: Some(format!(
                "property payload {property_bytes} bytes exceeds cap {} bytes",
                ctx.property_byte_cap
            )),
            property_bytes,
            property_count,
        }));
    }

    let polygon = match build_polygon(cell) {
        Ok(polygon) => polygon,
        Err(err) => {
            return Ok(dropped(DroppedRow {
                reason: DropReason::Other,
                cell: Some(id),
                resolution: Some(resolution),
                detail: Some(err.to_string()),
                property_bytes,
                property_count,
            }))
        }
    };

    Ok(ProcessingResult {
        seq,
        outcome: Outcome::Emitted {
            feature: Feature {
                id,
                ring: polygon.ring,
                properties,
                bbox: polygon.bbox,
            },
            resolution,
            property_bytes,
            property_count,
            quantize,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::DefaultPolicy;
    use crate::value::RawValue;
    use std::collections::BTreeMap;

    const CELL_HEX: &str = "8928308280fffff";

    fn row(seq: u64, pairs: Vec<(&str, RawValue)>) -> Row {
        Row {
            seq,
            columns: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    fn emitted(result: &ProcessingResult) -> (&Feature, usize) {
        match &result.outcome {
            Outcome::Emitted {
                feature,
                property_count,
                ..
            } => (feature, *property_count),
            Outcome::Dropped(d) => panic!("expected emit, got {d:?}"),
        }
    }

    #[test]
    fn emits_feature_with_system_fields() {
        let ctx = RowContext {
            quantize: QuantizeRules::parse("float=0.1,int=100").unwrap(),
            ..Default::default()
        };
        let result = process_row(
            row(
                3,
                vec![
                    ("h3", RawValue::from(CELL_HEX)),
                    ("score", RawValue::Float(0.44)),
                    ("resolution", RawValue::from("user value")),
                ],
            ),
            &ctx,
        )
        .unwrap();

        assert_eq!(result.seq, 3);
        let (feature, count) = emitted(&result);
        assert_eq!(feature.id, CELL_HEX);
        assert_eq!(count, 3);
        assert_eq!(
            feature.properties["h3"],
            PropertyValue::String(CELL_HEX.into())
        );
        // Injected after quantization: int=100 would otherwise zero it.
        assert_eq!(feature.properties["resolution"], PropertyValue::Int(9));
        assert!(!feature.properties.contains_key("H3"));
        match feature.properties["score"] {
            PropertyValue::Float(v) => assert!((v - 0.4).abs() < 1e-9),
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(feature.ring.first(), feature.ring.last());
    }

    #[test]
    fn invalid_cell_detail_names_the_literal() {
        let result = process_row(
            row(1, vec![("h3", RawValue::from("zzzznotacell"))]),
            &RowContext::default(),
        )
        .unwrap();
        match result.outcome {
            Outcome::Dropped(d) => {
                assert_eq!(d.reason, DropReason::InvalidCell);
                assert_eq!(d.cell.as_deref(), Some("zzzznotacell"));
                assert!(d.detail.unwrap().contains("zzzznotacell"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_cell_column_is_an_invalid_cell_drop() {
        let result = process_row(
            row(1, vec![("score", RawValue::Float(1.0))]),
            &RowContext::default(),
        )
        .unwrap();
        assert_eq!(result.drop_reason(), Some(DropReason::InvalidCell));
    }

    #[test]
    fn resolution_bounds_are_inclusive() {
        let r = |min, max| RowContext {
            min_resolution: min,
            max_resolution: max,
            ..Default::default()
        };
        let input = || row(1, vec![("h3", RawValue::from(CELL_HEX))]);

        assert!(process_row(input(), &r(Some(9), Some(9))).unwrap().is_emitted());
        assert_eq!(
            process_row(input(), &r(Some(10), None)).unwrap().drop_reason(),
            Some(DropReason::ResolutionFilter)
        );
        assert_eq!(
            process_row(input(), &r(None, Some(8))).unwrap().drop_reason(),
            Some(DropReason::ResolutionFilter)
        );
    }

    #[test]
    fn property_cap_applies_after_filtering() {
        let big = "x".repeat(500);
        let input = || {
            row(
                1,
                vec![
                    ("h3", RawValue::from(CELL_HEX)),
                    ("blob", RawValue::from(big.as_str())),
                    ("keep", RawValue::Int(1)),
                ],
            )
        };

        let capped = RowContext {
            property_byte_cap: 256,
            ..Default::default()
        };
        match process_row(input(), &capped).unwrap().outcome {
            Outcome::Dropped(d) => {
                assert_eq!(d.reason, DropReason::PropertyCap);
                assert!(d.property_bytes > 256);
                assert_eq!(d.property_count, 4);
                assert_eq!(d.resolution, Some(9));
            }
            other => panic!("unexpected {other:?}"),
        }

        let filtered = RowContext {
            filter: FilterSpec::new(["keep"], Vec::<String>::new(), DefaultPolicy::KeepAll)
                .unwrap(),
            property_byte_cap: 256,
            ..Default::default()
        };
        let result = process_row(input(), &filtered).unwrap();
        let (feature, count) = emitted(&result);
        assert_eq!(count, 3);
        assert_eq!(
            feature.properties.keys().collect::<Vec<_>>(),
            ["h3", "keep", "resolution"]
        );
    }

    #[test]
    fn flags_wide_payloads_without_dropping() {
        let mut columns: BTreeMap<String, RawValue> = (0..20)
            .map(|i| (format!("p{i:02}"), RawValue::Int(i)))
            .collect();
        columns.insert("h3".into(), RawValue::from(CELL_HEX));
        let result = process_row(Row { seq: 1, columns }, &RowContext::default()).unwrap();
        assert!(result.is_emitted());
        assert!(result.exceeds_soft_limits());
    }
}
