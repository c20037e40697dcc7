//! Grid points, regions and their string keys.
//!
//! Coordinates are carried as integer tenths of a degree so that keys are
//! exact and never depend on floating point formatting.

use std::fmt;

use thiserror::Error;

/// Longitude bounds in tenths of a degree.
pub const LON_MIN_X10: i32 = -1800;
pub const LON_MAX_X10: i32 = 1800;

/// Latitude bounds in tenths of a degree.
pub const LAT_MIN_X10: i32 = -900;
pub const LAT_MAX_X10: i32 = 900;

/// A grid point at 0.1 degree resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPoint {
    pub lon_x10: i32,
    pub lat_x10: i32,
}

impl GridPoint {
    #[inline]
    pub fn new(lon_x10: i32, lat_x10: i32) -> Self {
        Self { lon_x10, lat_x10 }
    }

    /// Snaps decimal degrees to the nearest grid point.
    ///
    /// Halfway values round to the even tenth.
    #[inline]
    pub fn nearest(lon: f64, lat: f64) -> Self {
        Self {
            lon_x10: (lon * 10.0).round_ties_even() as i32,
            lat_x10: (lat * 10.0).round_ties_even() as i32,
        }
    }

    #[inline]
    pub fn lon(&self) -> f64 {
        tenths_to_degrees(self.lon_x10)
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        tenths_to_degrees(self.lat_x10)
    }

    pub fn key(&self) -> PointKey {
        PointKey(format!(
            "lon{}lat{}",
            TenthsDisplay(self.lon_x10),
            TenthsDisplay(self.lat_x10)
        ))
    }
}

#[inline]
fn tenths_to_degrees(value: i32) -> f64 {
    if value == 0 {
        0.0
    } else {
        value as f64 / 10.0
    }
}

/// Renders tenths as `[-]whole.tenth`, without a sign on zero.
struct TenthsDisplay(i32);

impl fmt::Display for TenthsDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{sign}{}.{}", abs / 10, abs % 10)
    }
}

/// Primary key of an output row, e.g. `lon-12.3lat45.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct PointKey(String);

impl PointKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("longitude range {start}..{end} must lie within -1800..1800")]
    LonOutOfRange { start: i32, end: i32 },

    #[error("latitude range {start}..{end} must lie within -900..900")]
    LatOutOfRange { start: i32, end: i32 },

    #[error("range start {start} is greater than its end {end}")]
    Inverted { start: i32, end: i32 },
}

/// Half-open rectangle of grid points: `[lon_start, lon_end) x [lat_start, lat_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRegion {
    lon_start: i32,
    lon_end: i32,
    lat_start: i32,
    lat_end: i32,
}

impl GridRegion {
    pub fn new(lon_start: i32, lon_end: i32, lat_start: i32, lat_end: i32) -> Result<Self, RegionError> {
        for (start, end) in [(lon_start, lon_end), (lat_start, lat_end)] {
            if start > end {
                return Err(RegionError::Inverted { start, end });
            }
        }
        if lon_start < LON_MIN_X10 || lon_end > LON_MAX_X10 {
            return Err(RegionError::LonOutOfRange { start: lon_start, end: lon_end });
        }
        if lat_start < LAT_MIN_X10 || lat_end > LAT_MAX_X10 {
            return Err(RegionError::LatOutOfRange { start: lat_start, end: lat_end });
        }

        Ok(Self {
            lon_start,
            lon_end,
            lat_start,
            lat_end,
        })
    }

    pub fn lon_range(&self) -> std::ops::Range<i32> {
        self.lon_start..self.lon_end
    }

    pub fn lat_range(&self) -> std::ops::Range<i32> {
        self.lat_start..self.lat_end
    }

    pub fn width(&self) -> u64 {
        (self.lon_end - self.lon_start) as u64
    }

    pub fn height(&self) -> u64 {
        (self.lat_end - self.lat_start) as u64
    }

    /// Number of grid points in the region.
    pub fn total(&self) -> u64 {
        self.width() * self.height()
    }

    /// Points in processing order: longitude outer, latitude inner.
    pub fn points(&self) -> impl Iterator<Item = GridPoint> {
        let lats = self.lat_range();
        self.lon_range()
            .flat_map(move |lon| lats.clone().map(move |lat| GridPoint::new(lon, lat)))
    }
}

impl fmt::Display for GridRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lon: {}->{}, Lat:{}->{}",
            self.lon_start, self.lon_end, self.lat_start, self.lat_end
        )
    }
}
