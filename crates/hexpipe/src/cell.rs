//! Locating and parsing the H3 cell column of a row.

use crate::error::CellError;
use crate::value::RawValue;
use h3o::CellIndex;
use std::collections::BTreeMap;

/// Column names recognised as the cell identifier (compared case-insensitively).
pub const CELL_COLUMN_ALIASES: &[&str] = &[
    "h3",
    "h3_id",
    "h3id",
    "h3index",
    "h3_index",
    "cell",
    "cell_id",
    "cell_index",
];

/// A validated H3 cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(CellIndex);

impl CellId {
    pub fn index(self) -> CellIndex {
        self.0
    }

    pub fn raw(self) -> u64 {
        u64::from(self.0)
    }

    pub fn resolution(self) -> u8 {
        u8::from(self.0.resolution())
    }

    /// Lowercase hexadecimal form, e.g. `8928308280fffff`.
    pub fn canonical(self) -> String {
        self.0.to_string()
    }
}

impl From<CellIndex> for CellId {
    fn from(index: CellIndex) -> Self {
        CellId(index)
    }
}

impl TryFrom<u64> for CellId {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        CellIndex::try_from(value)
            .map(CellId)
            .map_err(|e| CellError::invalid(value.to_string(), e.to_string()))
    }
}

pub fn is_cell_column(name: &str) -> bool {
    CELL_COLUMN_ALIASES
        .iter()
        .any(|alias| name.eq_ignore_ascii_case(alias))
}

/// Finds the first alias column (in lexicographic column order) that carries
/// a value and parses it. Null or blank alias columns are skipped.
pub fn resolve_cell(columns: &BTreeMap<String, RawValue>) -> Result<CellId, CellError> {
    for (name, value) in columns.iter().filter(|(name, _)| is_cell_column(name)) {
        match parse_cell_value(value) {
            Ok(Some(cell)) => return Ok(cell),
            Ok(None) => continue,
            Err(CellError::InvalidCell { value, reason }) => {
                return Err(CellError::invalid(value, format!("column {name}: {reason}")))
            }
            Err(other) => return Err(other),
        }
    }

    Err(CellError::MissingCellColumn)
}

/// Parses a single cell value. `Ok(None)` means the value is empty.
///
/// Text is tried as hexadecimal first (an optional `0x` prefix forces hex),
/// then as decimal. Negative numbers and floats are rejected.
pub fn parse_cell_value(value: &RawValue) -> Result<Option<CellId>, CellError> {
    match value {
        RawValue::Null => Ok(None),
        RawValue::Str(s) => parse_cell_text(s),
        RawValue::Bytes(b) => parse_cell_text(&String::from_utf8_lossy(b)),
        RawValue::Int(i) if *i < 0 => Err(CellError::invalid(i.to_string(), "negative integer")),
        RawValue::Int(i) => CellId::try_from(*i as u64).map(Some),
        RawValue::UInt(u) => CellId::try_from(*u).map(Some),
        RawValue::Float(f) => Err(CellError::invalid(
            f.to_string(),
            "floating point values cannot encode a cell index",
        )),
        RawValue::Bool(b) => Err(CellError::invalid(b.to_string(), "unsupported cell encoding")),
    }
}

fn parse_cell_text(text: &str) -> Result<Option<CellId>, CellError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('-') {
        return Err(CellError::invalid(trimmed, "negative value"));
    }

    let prefixed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"));
    let hex_value = u64::from_str_radix(prefixed.unwrap_or(trimmed), 16).ok();

    if let Some(cell) = hex_value.and_then(|v| CellIndex::try_from(v).ok()) {
        return Ok(Some(CellId(cell)));
    }

    if prefixed.is_none() {
        if let Ok(decimal) = trimmed.parse::<u64>() {
            return CellIndex::try_from(decimal)
                .map(|cell| Some(CellId(cell)))
                .map_err(|e| CellError::invalid(trimmed, e.to_string()));
        }
    }

    match hex_value {
        Some(v) => Err(CellError::invalid(
            trimmed,
            format!("{v:#x} is not a valid H3 cell index"),
        )),
        None => Err(CellError::invalid(
            trimmed,
            "not a hexadecimal or decimal integer",
        )),
    }
}
