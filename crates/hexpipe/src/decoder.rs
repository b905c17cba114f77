//! Streaming Parquet decoder.
//!
//! Rows are pulled one at a time, but the underlying reader fetches whole
//! Arrow record batches of `batch_size` rows; at most one decoded batch is
//! held in memory. The decoder is not shareable: exactly one task drives it.

use crate::error::DecodeError;
use crate::value::RawValue;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use arrow_array::{cast::AsArray, types::*, Array, ArrayRef, RecordBatch};
use arrow_schema::DataType;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::path::Path;

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// One decoded source row. `seq` starts at 1 and is contiguous per run.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub seq: u64,
    pub columns: BTreeMap<String, RawValue>,
}

/// Sequential producer of rows. `Ok(None)` marks the end of the stream.
pub trait RowSource: Send + 'static {
    fn next_row(&mut self) -> Result<Option<Row>, DecodeError>;

    /// Total row count when known up front (e.g. from a file footer).
    fn total_rows(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    pub batch_size: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

pub struct ParquetDecoder {
    reader: ParquetRecordBatchReader,
    columns: Vec<String>,
    total_rows: u64,
    buffer: VecDeque<Row>,
    next_seq: u64,
}

impl ParquetDecoder {
    /// Opens `path` and reads the footer. Fails on unreadable or corrupt input.
    pub fn open<P: AsRef<Path>>(path: P, opts: DecoderOptions) -> Result<Self, DecodeError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| DecodeError::Open {
            path: path.clone(),
            source,
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let total_rows = builder.metadata().file_metadata().num_rows().max(0) as u64;
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();

        let reader = builder.with_batch_size(opts.batch_size.max(1)).build()?;

        tracing::debug!(
            path = %path.display(),
            total_rows,
            batch_size = opts.batch_size,
            "Opened parquet source"
        );

        Ok(Self {
            reader,
            columns,
            total_rows,
            buffer: VecDeque::new(),
            next_seq: 1,
        })
    }

    /// Column names from the file schema, in schema order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Pulls the next record batch into the buffer. Returns `false` at EOF.
    fn fill_buffer(&mut self) -> Result<bool, DecodeError> {
        let Some(batch) = self.reader.next() else {
            return Ok(false);
        };
        let batch = batch?;
        let rows = batch_to_rows(&batch, self.next_seq)?;
        self.next_seq += rows.len() as u64;
        self.buffer.extend(rows);
        Ok(true)
    }
}

impl RowSource for ParquetDecoder {
    fn next_row(&mut self) -> Result<Option<Row>, DecodeError> {
        while self.buffer.is_empty() {
            if !self.fill_buffer()? {
                return Ok(None);
            }
        }
        Ok(self.buffer.pop_front())
    }

    fn total_rows(&self) -> Option<u64> {
        Some(self.total_rows)
    }
}

/// Converts a record batch column-by-column into rows numbered from `first_seq`.
fn batch_to_rows(batch: &RecordBatch, first_seq: u64) -> Result<Vec<Row>, DecodeError> {
    let schema = batch.schema();
    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|i| Row {
            seq: first_seq + i as u64,
            columns: BTreeMap::new(),
        })
        .collect();

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        for (idx, row) in rows.iter_mut().enumerate() {
            row.columns
                .insert(field.name().clone(), raw_value_at(array, idx)?);
        }
    }

    Ok(rows)
}

fn raw_value_at(array: &ArrayRef, idx: usize) -> Result<RawValue, DecodeError> {
    if array.is_null(idx) {
        return Ok(RawValue::Null);
    }

    let value = match array.data_type() {
        DataType::Boolean => RawValue::Bool(array.as_boolean().value(idx)),

        DataType::Int8 => RawValue::Int(array.as_primitive::<Int8Type>().value(idx) as i64),
        DataType::Int16 => RawValue::Int(array.as_primitive::<Int16Type>().value(idx) as i64),
        DataType::Int32 => RawValue::Int(array.as_primitive::<Int32Type>().value(idx) as i64),
        DataType::Int64 => RawValue::Int(array.as_primitive::<Int64Type>().value(idx)),

        DataType::UInt8 => RawValue::UInt(array.as_primitive::<UInt8Type>().value(idx) as u64),
        DataType::UInt16 => RawValue::UInt(array.as_primitive::<UInt16Type>().value(idx) as u64),
        DataType::UInt32 => RawValue::UInt(array.as_primitive::<UInt32Type>().value(idx) as u64),
        DataType::UInt64 => RawValue::UInt(array.as_primitive::<UInt64Type>().value(idx)),

        DataType::Float16 => {
            RawValue::Float(array.as_primitive::<Float16Type>().value(idx).to_f64())
        }
        DataType::Float32 => {
            RawValue::Float(array.as_primitive::<Float32Type>().value(idx) as f64)
        }
        DataType::Float64 => RawValue::Float(array.as_primitive::<Float64Type>().value(idx)),

        DataType::Utf8 => RawValue::Str(array.as_string::<i32>().value(idx).to_owned()),
        DataType::LargeUtf8 => RawValue::Str(array.as_string::<i64>().value(idx).to_owned()),
        DataType::Binary => RawValue::Bytes(array.as_binary::<i32>().value(idx).to_vec()),
        DataType::LargeBinary => RawValue::Bytes(array.as_binary::<i64>().value(idx).to_vec()),

        // Dictionaries, temporals, decimals, nested types: keep their display form.
        _ => {
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
            RawValue::Str(formatter.value(idx).to_string())
        }
    };

    Ok(value)
}

/// In-memory row source, numbering rows from 1 in the given order.
pub struct MemorySource {
    rows: std::vec::IntoIter<BTreeMap<String, RawValue>>,
    total: u64,
    next_seq: u64,
}

impl MemorySource {
    pub fn new(rows: Vec<BTreeMap<String, RawValue>>) -> Self {
        let total = rows.len() as u64;
        Self {
            rows: rows.into_iter(),
            total,
            next_seq: 1,
        }
    }
}

impl RowSource for MemorySource {
    fn next_row(&mut self) -> Result<Option<Row>, DecodeError> {
        Ok(self.rows.next().map(|columns| {
            let seq = self.next_seq;
            self.next_seq += 1;
            Row { seq, columns }
        }))
    }

    fn total_rows(&self) -> Option<u64> {
        Some(self.total)
    }
}
