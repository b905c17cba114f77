//! Synthetic input: a disk of cells around Boston Common.

use crate::error::PipelineError;
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use h3o::{CellIndex, LatLng, Resolution};
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

pub const SAMPLE_CENTER: (f64, f64) = (42.355, -71.065);

/// Cells within `rings` steps of the sample centre, in grid-disk order.
pub fn sample_cells(rings: u32, resolution: u8) -> Result<Vec<CellIndex>, PipelineError> {
    let resolution = Resolution::try_from(resolution)
        .map_err(|e| PipelineError::Config(format!("sample resolution: {e}")))?;
    let (lat, lng) = SAMPLE_CENTER;
    let center = LatLng::new(lat, lng)
        .map_err(|e| PipelineError::Config(format!("sample centre: {e}")))?
        .to_cell(resolution);
    Ok(center.grid_disk(rings))
}

/// Writes the sample dataset (`h3`, `score`, `category`) and returns the row count.
pub fn write_sample<P: AsRef<Path>>(
    path: P,
    rings: u32,
    resolution: u8,
) -> Result<usize, PipelineError> {
    let path = path.as_ref();
    let cells = sample_cells(rings, resolution)?;

    let ids: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
    let scores: Vec<f64> = (0..cells.len()).map(|i| (i % 10) as f64 * 0.1).collect();
    let categories: Vec<&str> = (0..cells.len())
        .map(|i| if i % 2 == 1 { "test" } else { "demo" })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        Field::new("h3", DataType::Utf8, false),
        Field::new("score", DataType::Float64, false),
        Field::new("category", DataType::Utf8, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(Float64Array::from(scores)),
        Arc::new(StringArray::from(categories)),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| PipelineError::Internal(format!("sample batch: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io("create", parent, e))?;
    }
    let file = File::create(path).map_err(|e| PipelineError::io("create", path, e))?;
    let mut writer =
        ArrowWriter::try_new(file, schema, None).map_err(PipelineError::ParquetWrite)?;
    writer.write(&batch).map_err(PipelineError::ParquetWrite)?;
    writer.close().map_err(PipelineError::ParquetWrite)?;

    tracing::info!(
        path = %path.display(),
        rows = cells.len(),
        resolution,
        rings,
        "Wrote sample dataset"
    );
    Ok(cells.len())
}
