//! Reference geometry: water bodies, countries, states/provinces and cities.
//!
//! Everything here is loaded once and read-only for the rest of the run.
//! Polygon layers keep their source order because classification is
//! first-match-wins in that order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use geo::{BoundingRect, Contains, MultiPolygon, Point, Rect};
use rstar::{RTree, RTreeObject, AABB};
use shapefile::dbase::{FieldValue, Record};
use shapefile::{Reader, Shape};
use thiserror::Error;
use tracing::{debug, info};

use crate::classify::BLANK;
use crate::grid::{GridPoint, PointKey};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read shapefile {}: {source}", .path.display())]
    Shapefile {
        path: PathBuf,
        #[source]
        source: shapefile::Error,
    },

    #[error("{}: shape #{index} is a {shape}, expected {expected}", .path.display())]
    UnexpectedShape {
        path: PathBuf,
        index: usize,
        shape: String,
        expected: &'static str,
    },

    #[error("{}: cannot convert shape #{index}: {reason}", .path.display())]
    Geometry {
        path: PathBuf,
        index: usize,
        reason: String,
    },
}

/// Which attribute columns a polygon layer is labelled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSchema {
    pub label_field: &'static str,
    /// Country attribution carried by the layer itself (state data only).
    pub admin_field: Option<&'static str>,
}

impl LayerSchema {
    pub const WATER: Self = Self {
        label_field: "name",
        admin_field: None,
    };

    pub const COUNTRY: Self = Self {
        label_field: "ADMIN",
        admin_field: None,
    };

    pub const STATE: Self = Self {
        label_field: "name",
        admin_field: Some("admin"),
    };
}

/// Attribute column holding a city's name in the populated places dataset.
pub const CITY_LABEL_FIELD: &str = "name";

/// A labelled polygon feature.
#[derive(Debug, Clone)]
pub struct Feature {
    name: String,
    admin: Option<String>,
    geometry: MultiPolygon<f64>,
    bbox: Option<Rect<f64>>,
}

impl Feature {
    pub fn new(name: impl Into<String>, geometry: impl Into<MultiPolygon<f64>>) -> Self {
        let geometry = geometry.into();
        let bbox = geometry.bounding_rect();
        let name = name.into();

        Self {
            name: if name.trim().is_empty() { BLANK.to_owned() } else { name },
            admin: None,
            geometry,
            bbox,
        }
    }

    pub fn with_admin(mut self, admin: impl Into<String>) -> Self {
        let admin = admin.into();
        self.admin = (!admin.trim().is_empty()).then_some(admin);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn admin(&self) -> Option<&str> {
        self.admin.as_deref()
    }

    pub fn bbox(&self) -> Option<Rect<f64>> {
        self.bbox
    }

    #[inline]
    pub fn contains(&self, point: &Point<f64>) -> bool {
        self.geometry.contains(point)
    }
}

#[derive(Clone)]
struct FeatureBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for FeatureBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// An ordered polygon layer with an optional bounding-box index.
#[derive(Default)]
pub struct FeatureLayer {
    features: Vec<Feature>,
    index: Option<RTree<FeatureBox>>,
}

impl FeatureLayer {
    pub fn from_features(features: Vec<Feature>) -> Self {
        Self {
            features,
            index: None,
        }
    }

    /// Reads every polygon of a shapefile, in file order.
    pub fn load(path: impl AsRef<Path>, schema: LayerSchema) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let started = Instant::now();
        let mut reader = Reader::from_path(path).map_err(shapefile_error(path))?;
        let mut features = Vec::new();

        for (index, result) in reader.iter_shapes_and_records().enumerate() {
            let (shape, record) = result.map_err(shapefile_error(path))?;

            let geometry = match shape {
                Shape::NullShape => {
                    debug!(path = %path.display(), index, "Skipping null shape");
                    continue;
                }
                Shape::Polygon(_) | Shape::PolygonM(_) | Shape::PolygonZ(_) => {
                    polygon_shape_to_geo(shape).map_err(|reason| CatalogError::Geometry {
                        path: path.to_path_buf(),
                        index,
                        reason,
                    })?
                }
                other => {
                    return Err(CatalogError::UnexpectedShape {
                        path: path.to_path_buf(),
                        index,
                        shape: format!("{:?}", other.shapetype()),
                        expected: "polygon",
                    })
                }
            };

            let name = text_field(&record, schema.label_field).unwrap_or_default();
            let mut feature = Feature::new(name, geometry);
            if let Some(admin) = schema.admin_field.and_then(|f| text_field(&record, f)) {
                feature = feature.with_admin(admin);
            }
            features.push(feature);
        }

        info!(
            path = %path.display(),
            features = features.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded polygon layer"
        );

        Ok(Self::from_features(features))
    }

    /// Builds the bounding-box index used to skip features that cannot match.
    pub fn with_spatial_index(mut self) -> Self {
        let boxes: Vec<FeatureBox> = self
            .features
            .iter()
            .enumerate()
            .filter_map(|(idx, feature)| {
                feature.bbox.map(|r| FeatureBox {
                    idx,
                    env: AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
                })
            })
            .collect();

        self.index = Some(RTree::bulk_load(boxes));
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// First feature, in load order, whose geometry contains `point`.
    pub fn first_containing(&self, point: &Point<f64>) -> Option<&Feature> {
        match &self.index {
            None => self.features.iter().find(|f| f.contains(point)),
            Some(tree) => {
                let mut candidates: Vec<usize> = tree
                    .locate_in_envelope_intersecting(&AABB::from_point([point.x(), point.y()]))
                    .map(|fb| fb.idx)
                    .collect();

                // The tree yields in arbitrary order; load order decides ties.
                candidates.sort_unstable();
                candidates
                    .into_iter()
                    .map(|idx| &self.features[idx])
                    .find(|f| f.contains(point))
            }
        }
    }
}

/// City names keyed by the grid point nearest to each city.
#[derive(Debug, Default, Clone)]
pub struct CityIndex {
    by_key: HashMap<PointKey, String>,
}

impl CityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later cities replace earlier ones that snap to the same key.
    pub fn insert(&mut self, lon: f64, lat: f64, name: impl Into<String>) {
        let key = GridPoint::nearest(lon, lat).key();
        self.by_key.insert(key, name.into());
    }

    /// Exact key lookup; there is no nearest-neighbour fallback.
    pub fn get(&self, key: &PointKey) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let started = Instant::now();
        let mut reader = Reader::from_path(path).map_err(shapefile_error(path))?;
        let mut index = Self::new();
        let mut seen = 0usize;

        for (i, result) in reader.iter_shapes_and_records().enumerate() {
            let (shape, record) = result.map_err(shapefile_error(path))?;

            let (lon, lat) = match shape {
                Shape::Point(p) => (p.x, p.y),
                Shape::PointM(p) => (p.x, p.y),
                Shape::PointZ(p) => (p.x, p.y),
                Shape::NullShape => continue,
                other => {
                    return Err(CatalogError::UnexpectedShape {
                        path: path.to_path_buf(),
                        index: i,
                        shape: format!("{:?}", other.shapetype()),
                        expected: "point",
                    })
                }
            };

            seen += 1;
            let name = text_field(&record, CITY_LABEL_FIELD).unwrap_or_else(|| BLANK.to_owned());
            index.insert(lon, lat, name);
        }

        info!(
            path = %path.display(),
            cities = seen,
            keys = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded city index"
        );

        Ok(index)
    }
}

impl<S: Into<String>> FromIterator<(f64, f64, S)> for CityIndex {
    fn from_iter<I: IntoIterator<Item = (f64, f64, S)>>(iter: I) -> Self {
        let mut index = Self::new();
        for (lon, lat, name) in iter {
            index.insert(lon, lat, name);
        }
        index
    }
}

/// Locations of the four reference datasets.
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub water: PathBuf,
    pub countries: PathBuf,
    pub states: PathBuf,
    pub cities: PathBuf,
}

/// All reference data needed to classify a grid point.
#[derive(Default)]
pub struct Catalog {
    pub water: FeatureLayer,
    pub countries: FeatureLayer,
    pub states: FeatureLayer,
    pub cities: CityIndex,
}

impl Catalog {
    pub fn load(paths: &CatalogPaths, spatial_index: bool) -> Result<Self, CatalogError> {
        let catalog = Self {
            water: FeatureLayer::load(&paths.water, LayerSchema::WATER)?,
            countries: FeatureLayer::load(&paths.countries, LayerSchema::COUNTRY)?,
            states: FeatureLayer::load(&paths.states, LayerSchema::STATE)?,
            cities: CityIndex::load(&paths.cities)?,
        };

        Ok(if spatial_index {
            catalog.with_spatial_index()
        } else {
            catalog
        })
    }

    /// Indexes all three polygon layers. Results are unchanged.
    pub fn with_spatial_index(self) -> Self {
        Self {
            water: self.water.with_spatial_index(),
            countries: self.countries.with_spatial_index(),
            states: self.states.with_spatial_index(),
            cities: self.cities,
        }
    }
}

fn shapefile_error(path: &Path) -> impl Fn(shapefile::Error) -> CatalogError + '_ {
    move |source| CatalogError::Shapefile {
        path: path.to_path_buf(),
        source,
    }
}

fn polygon_shape_to_geo(shape: Shape) -> Result<MultiPolygon<f64>, String> {
    match geo::Geometry::<f64>::try_from(shape).map_err(|e| e.to_string())? {
        geo::Geometry::MultiPolygon(mp) => Ok(mp),
        geo::Geometry::Polygon(p) => Ok(MultiPolygon(vec![p])),
        other => Err(format!("polygon converted to unexpected geometry {other:?}")),
    }
}

/// Reads a text attribute, tolerating upper/lower case column names.
fn text_field(record: &Record, field: &str) -> Option<String> {
    let value = record
        .get(field)
        .or_else(|| record.get(&field.to_ascii_uppercase()))
        .or_else(|| record.get(&field.to_ascii_lowercase()))?;

    match value {
        FieldValue::Character(Some(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_owned())
        }
        _ => None,
    }
}
