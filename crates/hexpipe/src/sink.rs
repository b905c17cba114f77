//! Newline-delimited GeoJSON output.

use crate::error::PipelineError;
use crate::geometry::BBox;
use crate::value::PropertyBag;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// A polygon feature ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Canonical cell string.
    pub id: String,
    pub ring: Vec<[f64; 2]>,
    pub properties: PropertyBag,
    pub bbox: BBox,
}

#[derive(Serialize)]
struct GeoJsonFeature<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    geometry: GeoJsonPolygon<'a>,
    properties: &'a PropertyBag,
    bbox: [f64; 4],
}

#[derive(Serialize)]
struct GeoJsonPolygon<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: [&'a [[f64; 2]]; 1],
}

impl Feature {
    /// Serializes the feature as a single-line GeoJSON object.
    pub fn to_json_line(&self) -> Result<Vec<u8>, PipelineError> {
        let doc = GeoJsonFeature {
            kind: "Feature",
            id: &self.id,
            geometry: GeoJsonPolygon {
                kind: "Polygon",
                coordinates: [self.ring.as_slice()],
            },
            properties: &self.properties,
            bbox: self.bbox.to_array(),
        };
        let mut line = serde_json::to_vec(&doc).map_err(|source| PipelineError::Serialization {
            what: "feature",
            source,
        })?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Ordered consumer of emitted features. Driven by a single task.
pub trait FeatureSink: Send {
    fn write_feature(&mut self, feature: &Feature) -> Result<(), PipelineError>;

    /// Flushes buffered output. Must be called once after the last feature.
    fn finish(&mut self) -> Result<(), PipelineError>;

    fn records(&self) -> u64;

    fn bytes(&self) -> u64;
}

pub struct NdjsonSink<W: Write> {
    out: BufWriter<W>,
    records: u64,
    bytes: u64,
}

impl NdjsonSink<File> {
    /// Creates (or truncates) `path`, creating parent directories as needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(PipelineError::SinkWrite)?;
        }
        let file = File::create(path).map_err(PipelineError::SinkWrite)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> NdjsonSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: BufWriter::new(inner),
            records: 0,
            bytes: 0,
        }
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, PipelineError> {
        self.out
            .into_inner()
            .map_err(|e| PipelineError::SinkWrite(e.into_error()))
    }
}

impl<W: Write + Send> FeatureSink for NdjsonSink<W> {
    fn write_feature(&mut self, feature: &Feature) -> Result<(), PipelineError> {
        let line = feature.to_json_line()?;
        self.out.write_all(&line).map_err(PipelineError::SinkWrite)?;
        self.records += 1;
        self.bytes += line.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.out.flush().map_err(PipelineError::SinkWrite)
    }

    fn records(&self) -> u64 {
        self.records
    }

    fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PropertyValue;
    use serde_json::{json, Value};

    fn square() -> Feature {
        Feature {
            id: "8928308280fffff".into(),
            ring: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]],
            properties: PropertyBag::from([
                ("resolution".to_string(), PropertyValue::Int(9)),
                ("h3".to_string(), PropertyValue::String("8928308280fffff".into())),
            ]),
            bbox: BBox {
                min_lng: 0.0,
                min_lat: 0.0,
                max_lng: 1.0,
                max_lat: 1.0,
            },
        }
    }

    #[test]
    fn writes_one_geojson_feature_per_line() {
        let mut sink = NdjsonSink::new(Vec::new());
        sink.write_feature(&square()).unwrap();
        sink.write_feature(&square()).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.records(), 2);
        let bytes = sink.bytes();

        let out = sink.into_inner().unwrap();
        assert_eq!(out.len() as u64, bytes);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            parsed,
            json!({
                "type": "Feature",
                "id": "8928308280fffff",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
                },
                "properties": {"h3": "8928308280fffff", "resolution": 9},
                "bbox": [0.0, 0.0, 1.0, 1.0]
            })
        );
        // Properties are written in key order.
        assert!(lines[0].find("\"h3\"").unwrap() < lines[0].find("\"resolution\"").unwrap());
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.ndjson");
        let mut sink = NdjsonSink::create(&path).unwrap();
        sink.write_feature(&square()).unwrap();
        sink.finish().unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn write_failures_surface_as_sink_errors() {
        let mut sink = NdjsonSink::new(BrokenPipe);
        // BufWriter may absorb the first write; flushing must fail.
        let result = sink.write_feature(&square()).and_then(|_| sink.finish());
        assert!(matches!(result, Err(PipelineError::SinkWrite(_))));
    }
}
