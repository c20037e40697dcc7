//! LONLAT: classifies every point of a 0.1-degree lon/lat grid region.
//!
//! - Each grid point is tested against three ordered polygon layers (water,
//!   countries, states/provinces) and a city index keyed by rounded position.
//! - Water wins outright; land points get country, state and city.
//! - Within a layer the first containing polygon, in source order, wins.
//! - Records are written to a [`RecordStore`] in batches of
//!   [`FLUSH_THRESHOLD`]; rejected records are replaced by blank placeholders
//!   and their keys appended to an [`ErrorLog`].
//! - Progress is reported through an optional [`Notifier`].
//!
//! Row keys look like `lon-12.3lat45.0` and are derived from integer tenths,
//! so they are exact for every point of the grid.

pub mod catalog;
pub mod classify;
pub mod driver;
pub mod grid;
pub mod progress;
pub mod writer;

pub use catalog::{Catalog, CatalogError, CatalogPaths, CityIndex, Feature, FeatureLayer, LayerSchema};
pub use classify::{ClassificationRecord, Classifier, BLANK};
pub use driver::{Driver, RunSummary};
pub use grid::{GridPoint, GridRegion, PointKey, RegionError};
pub use progress::{Notifier, NotifyError, Progress, ProgressReporter, DEFAULT_REPORT_EVERY};
pub use writer::{BatchWriter, ErrorLog, RecordStore, StoreError, WriteOutcome, WriterStats, FLUSH_THRESHOLD};
