use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use hexpipe::decoder::{DecoderOptions, ParquetDecoder};
use hexpipe::sample::{sample_cells, write_sample};
use hexpipe::{run_pipeline, CancelSignal, NdjsonSink, PipelineConfig};
use parquet::arrow::ArrowWriter;
use serde_json::Value;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

fn read_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn sample_file_streams_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sample.parquet");
    let rows = write_sample(&input, 3, 8).unwrap();
    assert_eq!(rows, 37);

    let decoder = ParquetDecoder::open(&input, DecoderOptions { batch_size: 5 }).unwrap();
    let out = dir.path().join("xyz.ndjson");
    let mut sink = NdjsonSink::create(&out).unwrap();
    let config = PipelineConfig {
        workers: 4,
        ..Default::default()
    };

    let summary = run_pipeline(decoder, &mut sink, config, &CancelSignal::new())
        .await
        .unwrap();
    drop(sink);

    assert_eq!(summary.metrics.total_rows, 37);
    assert_eq!(summary.metrics.emitted_features, 37);
    assert_eq!(summary.metrics.resolution_histogram.get(&8), Some(&37));

    let expected: Vec<String> = sample_cells(3, 8)
        .unwrap()
        .iter()
        .map(|c| c.to_string())
        .collect();
    let lines = read_lines(&out);
    let ids: Vec<&str> = lines.iter().map(|f| f["id"].as_str().unwrap()).collect();
    assert_eq!(ids, expected);

    let first = &lines[0];
    assert_eq!(first["geometry"]["type"], "Polygon");
    assert_eq!(first["properties"]["resolution"], 8);
    assert_eq!(first["properties"]["category"], "demo");
    let ring = first["geometry"]["coordinates"][0].as_array().unwrap();
    assert_eq!(ring.first(), ring.last());
}

#[tokio::test]
async fn decimal_cells_and_bad_rows_from_parquet() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("mixed.parquet");

    let cell = sample_cells(0, 9).unwrap()[0];
    let schema = Arc::new(Schema::new(vec![
        Field::new("H3_Index", DataType::Utf8, true),
        Field::new("pop", DataType::Int64, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![
            Some(u64::from(cell).to_string()),
            Some("zzzznotacell".to_string()),
            None,
        ])),
        Arc::new(Int64Array::from(vec![Some(10), Some(20), None])),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    let mut writer = ArrowWriter::try_new(File::create(&input).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let decoder = ParquetDecoder::open(&input, DecoderOptions::default()).unwrap();
    let out = dir.path().join("out.ndjson");
    let mut sink = NdjsonSink::create(&out).unwrap();
    let summary = run_pipeline(decoder, &mut sink, PipelineConfig::default(), &CancelSignal::new())
        .await
        .unwrap();
    drop(sink);

    let metrics = summary.metrics;
    assert_eq!(metrics.total_rows, 3);
    assert_eq!(metrics.emitted_features, 1);
    assert_eq!(metrics.dropped.invalid_cell, 2);
    assert!(metrics
        .invalid_samples
        .items
        .iter()
        .any(|s| s.contains("zzzznotacell")));

    let lines = read_lines(&out);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["id"], cell.to_string());
    assert_eq!(lines[0]["properties"]["pop"], 10);
    assert!(lines[0]["properties"].get("H3_Index").is_none());
}
