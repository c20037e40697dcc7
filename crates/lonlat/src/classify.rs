use geo::Point;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::grid::{GridPoint, PointKey};

/// Stored for any field that was not found or does not apply.
pub const BLANK: &str = " ";

/// The classification of one grid point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationRecord {
    pub lonlat: PointKey,
    pub water: String,
    pub country: String,
    pub state: String,
    pub city: String,
}

impl ClassificationRecord {
    /// A record with every field blank.
    pub fn blank(lonlat: PointKey) -> Self {
        Self {
            lonlat,
            water: BLANK.to_owned(),
            country: BLANK.to_owned(),
            state: BLANK.to_owned(),
            city: BLANK.to_owned(),
        }
    }

    /// Same key, every field blank. Written in place of a rejected record.
    pub fn placeholder(&self) -> Self {
        Self::blank(self.lonlat.clone())
    }

    /// Whether every data field is blank, as in a placeholder.
    pub fn is_blank(&self) -> bool {
        self.fields().iter().all(|(_, value)| *value == BLANK)
    }

    pub fn is_water(&self) -> bool {
        self.water != BLANK
    }

    /// `(name, value)` pairs of the data fields, in storage order.
    pub fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("water", &self.water),
            ("country", &self.country),
            ("state", &self.state),
            ("city", &self.city),
        ]
    }
}

/// Looks grid points up against a [`Catalog`].
pub struct Classifier<'a> {
    catalog: &'a Catalog,
}

impl<'a> Classifier<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Classifies one grid point.
    ///
    /// Water is checked first and, when it matches, the land lookups are
    /// skipped entirely. Within each layer the first containing feature in
    /// load order wins. A state's own country attribution fills in the country
    /// only when the country layer found nothing.
    pub fn classify(&self, point: GridPoint) -> ClassificationRecord {
        let mut record = ClassificationRecord::blank(point.key());
        let geo_point = Point::new(point.lon(), point.lat());

        if let Some(water) = self.catalog.water.first_containing(&geo_point) {
            record.water = water.name().to_owned();
            return record;
        }

        let country = self.catalog.countries.first_containing(&geo_point);
        if let Some(country) = country {
            record.country = country.name().to_owned();
        }

        if let Some(state) = self.catalog.states.first_containing(&geo_point) {
            record.state = state.name().to_owned();
            if country.is_none() {
                if let Some(admin) = state.admin() {
                    record.country = admin.to_owned();
                }
            }
        }

        if let Some(city) = self.catalog.cities.get(&record.lonlat) {
            record.city = city.to_owned();
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CityIndex, Feature, FeatureLayer};
    use geo::{coord, Rect};

    fn square(name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> Feature {
        Feature::new(name, Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }).to_polygon())
    }

    fn catalog() -> Catalog {
        Catalog {
            water: FeatureLayer::from_features(vec![square("Gulf", 10.0, 10.0, 20.0, 20.0)]),
            countries: FeatureLayer::from_features(vec![
                square("Atlantis", -5.0, -5.0, 5.0, 5.0),
                square("Shadowed", -5.0, -5.0, 5.0, 5.0),
            ]),
            states: FeatureLayer::from_features(vec![
                square("Coastal", -5.0, -5.0, 0.0, 5.0).with_admin("Ignored"),
                square("Frontier", 5.0, -5.0, 8.0, 5.0).with_admin("Borderland"),
                square("Island", 12.0, 12.0, 13.0, 13.0).with_admin("Under water"),
            ]),
            cities: [(-1.0, 1.0, "Port"), (12.5, 12.5, "Sunken")].into_iter().collect(),
        }
    }

    #[test]
    fn land_point_fills_every_field() {
        let catalog = catalog();
        let r = Classifier::new(&catalog).classify(GridPoint::new(-10, 10));

        assert_eq!(r.lonlat.as_str(), "lon-1.0lat1.0");
        assert_eq!(r.water, BLANK);
        assert_eq!(r.country, "Atlantis");
        assert_eq!(r.state, "Coastal");
        assert_eq!(r.city, "Port");
    }

    #[test]
    fn water_short_circuits_land_lookups() {
        let catalog = catalog();
        let r = Classifier::new(&catalog).classify(GridPoint::new(125, 125));

        assert_eq!(r.water, "Gulf");
        assert_eq!(r.country, BLANK);
        assert_eq!(r.state, BLANK);
        assert_eq!(r.city, BLANK);
    }

    #[test]
    fn state_admin_backfills_missing_country() {
        let catalog = catalog();
        let r = Classifier::new(&catalog).classify(GridPoint::new(60, 0));

        assert_eq!(r.country, "Borderland");
        assert_eq!(r.state, "Frontier");
    }

    #[test]
    fn city_lookup_is_exact_key_only() {
        let catalog = Catalog {
            cities: CityIndex::from_iter([(3.0, 3.0, "Town")]),
            ..Default::default()
        };
        let classifier = Classifier::new(&catalog);

        assert_eq!(classifier.classify(GridPoint::new(30, 30)).city, "Town");
        assert_eq!(classifier.classify(GridPoint::new(31, 30)).city, BLANK);
        assert_eq!(classifier.classify(GridPoint::new(30, 29)).city, BLANK);
    }

    #[test]
    fn outside_everything_is_blank() {
        let catalog = catalog();
        let r = Classifier::new(&catalog).classify(GridPoint::new(-500, -500));
        assert_eq!(r, ClassificationRecord::blank(GridPoint::new(-500, -500).key()));
        assert!(r.is_blank());
        assert!(!Classifier::new(&catalog).classify(GridPoint::new(-10, 10)).is_blank());
    }
}
