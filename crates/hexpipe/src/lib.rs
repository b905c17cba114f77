//! Streams H3-indexed Parquet rows into GeoJSON polygon features and hands
//! them to an external tile builder.
//!
//! The core is [`pipeline::run_pipeline`]: a single decoder feeds a pool of
//! workers and results are released in input order. [`build::run_build`]
//! wraps it with the tile tools and writes a [`report::BuildReport`].

pub mod build;
pub mod cancel;
pub mod cell;
pub mod decoder;
pub mod error;
pub mod geometry;
pub mod metrics;
pub mod pipeline;
pub mod props;
pub mod report;
pub mod sample;
pub mod schema;
pub mod sink;
pub mod tiler;
pub mod validate;
pub mod value;
pub mod worker;

pub use build::{run_build, BuildOptions};
pub use cancel::CancelSignal;
pub use cell::CellId;
pub use decoder::{DecoderOptions, ParquetDecoder, RowSource};
pub use error::{CellError, CollaboratorError, DecodeError, PipelineError};
pub use metrics::RunMetrics;
pub use pipeline::{run_pipeline, PipelineConfig, PipelineSummary};
pub use props::{DefaultPolicy, FilterSpec, QuantizeRules};
pub use report::BuildReport;
pub use sink::{FeatureSink, NdjsonSink};
pub use tiler::{CliTileEngine, TileEngine, TileOptions};
pub use value::{PropertyBag, PropertyValue, RawValue};
