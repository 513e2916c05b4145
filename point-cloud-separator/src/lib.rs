//! Separates large point clouds into one point list per building footprint.
//!
//! Points are streamed from XYZ text or LAS/LAZ files by a pool of ingestion
//! workers, classified against footprint polygons through a bucketed spatial
//! grid, accumulated in memory per footprint and flushed to disk in bounded
//! batches by a single flush controller.

pub mod bounds;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod flush;
pub mod footprint;
pub mod geojson;
pub mod grid;
pub mod ingest;
pub mod input;
pub mod logging;
pub mod pipeline;
pub mod point;
pub mod progress;
pub mod reader;
pub mod registry;
pub mod store;
pub mod writer;

pub use catalog::{CatalogEntry, CatalogIndex, FootprintCatalog};
pub use config::SeparatorConfig;
pub use error::{Result, SeparatorError};
pub use footprint::{Footprint, FootprintId};
pub use pipeline::{PointSeparator, RunSummary, separate};
pub use point::Point;
pub use registry::FootprintRegistry;
pub use store::{AccumulationStore, LatePointPolicy};
