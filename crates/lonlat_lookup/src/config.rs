use clap::Parser;
use lonlat::{CatalogPaths, GridRegion, RegionError, DEFAULT_REPORT_EVERY};
use std::path::PathBuf;

/// `lonlat_lookup` - Builds the lon/lat lookup table for one grid region.
///
/// Every 0.1 degree grid point in `[LON_START, LON_END) x [LAT_START, LAT_END)`
/// is classified as water, or as country / state / city, against Natural Earth
/// shapefiles, and written to a DynamoDB table. Run several processes over
/// disjoint regions to cover the globe faster.
///
/// Example: `lonlat_lookup -- -1800 1800 -900 0 i01p01`
#[derive(Parser, Debug, Clone)]
#[command(name = "lonlat_lookup", version, about, long_about = None)]
pub struct Config {
    /// First longitude, in tenths of a degree (inclusive).
    #[arg(allow_negative_numbers = true)]
    pub lon_start_x10: i32,

    /// Last longitude, in tenths of a degree (exclusive).
    #[arg(allow_negative_numbers = true)]
    pub lon_end_x10: i32,

    /// First latitude, in tenths of a degree (inclusive).
    #[arg(allow_negative_numbers = true)]
    pub lat_start_x10: i32,

    /// Last latitude, in tenths of a degree (exclusive).
    #[arg(allow_negative_numbers = true)]
    pub lat_end_x10: i32,

    /// Label identifying this process in logs and notifications.
    pub process_label: String,

    /// The DynamoDB table receiving one item per grid point.
    #[arg(long, env = "LONLAT_TABLE", default_value = "LonLatLookup")]
    pub table: String,

    /// SNS topic for progress notifications. Notifications are off when unset.
    #[arg(long, env = "LONLAT_TOPIC_ARN")]
    pub topic_arn: Option<String>,

    /// AWS region override; otherwise the ambient AWS configuration decides.
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Report progress every N processed grid points.
    #[arg(long, default_value_t = DEFAULT_REPORT_EVERY, value_parser = clap::value_parser!(u64).range(1..))]
    pub report_every: u64,

    /// Marine polygons, labelled by `name`.
    #[arg(long, env = "LONLAT_WATER_SHP", default_value = "ne_50m_geography_marine_polys.shp")]
    pub water_shp: PathBuf,

    /// Country polygons, labelled by `ADMIN`.
    #[arg(long, env = "LONLAT_COUNTRY_SHP", default_value = "ne_10m_admin_0_countries.shp")]
    pub country_shp: PathBuf,

    /// State/province polygons, labelled by `name` with country in `admin`.
    #[arg(long, env = "LONLAT_STATE_SHP", default_value = "ne_10m_admin_1_states_provinces.shp")]
    pub state_shp: PathBuf,

    /// Populated place points, labelled by `name`.
    #[arg(long, env = "LONLAT_CITY_SHP", default_value = "ne_10m_populated_places_simple.shp")]
    pub city_shp: PathBuf,

    /// Keys of records that could only be stored as blank placeholders.
    #[arg(long, env = "LONLAT_ERROR_LOG", default_value = "lonlat_lookup_errors.log")]
    pub error_log: PathBuf,

    /// Write records as JSON lines to this file (`-` for stdout) instead of DynamoDB.
    #[arg(long)]
    pub jsonl: Option<PathBuf>,

    /// Scan every polygon of a layer instead of prefiltering by bounding box.
    #[arg(long, default_value_t = false)]
    pub no_spatial_index: bool,

    /// Bulk write attempts, with exponential backoff, before items DynamoDB
    /// keeps leaving unprocessed are given up on.
    #[arg(long, env = "LONLAT_MAX_WRITE_ATTEMPTS", default_value_t = 15, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_write_attempts: u32,

    /// Upper bound for each AWS request, in seconds.
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn grid_region(&self) -> Result<GridRegion, RegionError> {
        GridRegion::new(
            self.lon_start_x10,
            self.lon_end_x10,
            self.lat_start_x10,
            self.lat_end_x10,
        )
    }

    pub fn catalog_paths(&self) -> CatalogPaths {
        CatalogPaths {
            water: self.water_shp.clone(),
            countries: self.country_shp.clone(),
            states: self.state_shp.clone(),
            cities: self.city_shp.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_negative_positionals() {
        let cfg = Config::try_parse_from(["lonlat_lookup", "-1800", "1800", "-900", "0", "i01p01"]).unwrap();
        assert_eq!(cfg.lon_start_x10, -1800);
        assert_eq!(cfg.lat_end_x10, 0);
        assert_eq!(cfg.process_label, "i01p01");
        assert_eq!(cfg.report_every, DEFAULT_REPORT_EVERY);
        assert_eq!(cfg.max_write_attempts, 15);
        assert_eq!(cfg.grid_region().unwrap().total(), 3600 * 900);
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert!(Config::try_parse_from(["lonlat_lookup"]).is_err());
        assert!(Config::try_parse_from(["lonlat_lookup", "0", "1", "0", "1"]).is_err());
    }

    #[test]
    fn zero_report_interval_is_rejected() {
        let res = Config::try_parse_from(["lonlat_lookup", "0", "1", "0", "1", "p", "--report-every", "0"]);
        assert!(res.is_err());
    }

    #[test]
    fn inverted_region_is_rejected() {
        let cfg = Config::try_parse_from(["lonlat_lookup", "10", "0", "0", "1", "p"]).unwrap();
        assert!(cfg.grid_region().is_err());
    }
}
