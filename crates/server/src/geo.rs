//! Radius prefilter for the nearby feed.
//!
//! The radius is turned into a latitude/longitude box using a flat `1° ≈ 111,320 m` for both
//! axes. This is an approximation: the box over-includes at its corners (up to ~27% more area
//! than the disk it stands for) and the longitude span is not widened away from the equator,
//! so the box gets narrower in meters toward the poles. It is good enough for the 200-1000 m
//! radii the feed offers.
//!
//! Latitudes are clamped at the poles. A box that crosses the antimeridian wraps around, and is
//! then stored with `lon_min > lon_max`.

use crate::error::StoreError;

pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Feed radii the server accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Distance {
    Near,
    #[default]
    Walkable,
    Neighborhood,
}

impl Distance {
    pub fn meters(self) -> u32 {
        match self {
            Distance::Near => 200,
            Distance::Walkable => 500,
            Distance::Neighborhood => 1000,
        }
    }
}

impl TryFrom<u32> for Distance {
    type Error = StoreError;

    fn try_from(meters: u32) -> Result<Self, Self::Error> {
        match meters {
            200 => Ok(Distance::Near),
            500 => Ok(Distance::Walkable),
            1000 => Ok(Distance::Neighborhood),
            other => Err(StoreError::validation(format!(
                "distance must be one of 200, 500 or 1000, got {other}"
            ))),
        }
    }
}

pub fn check_coordinates(lat: f64, lon: f64) -> Result<(), StoreError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(StoreError::validation("coordinates out of range"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn around(lat: f64, lon: f64, radius_meters: f64) -> Result<Self, StoreError> {
        check_coordinates(lat, lon)?;
        if !radius_meters.is_finite() || radius_meters < 0.0 {
            return Err(StoreError::validation("radius must be a positive distance"));
        }

        let delta = radius_meters / METERS_PER_DEGREE;
        Ok(Self {
            lat_min: (lat - delta).max(-90.0),
            lat_max: (lat + delta).min(90.0),
            lon_min: wrap_longitude(lon - delta),
            lon_max: wrap_longitude(lon + delta),
        })
    }

    pub fn for_distance(lat: f64, lon: f64, distance: Distance) -> Result<Self, StoreError> {
        Self::around(lat, lon, f64::from(distance.meters()))
    }

    /// Whether the box crosses the antimeridian.
    pub fn wraps(&self) -> bool {
        self.lon_min > self.lon_max
    }

    /// Inclusive on every edge, matching the SQL filter.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let lon_inside = if self.wraps() {
            lon >= self.lon_min || lon <= self.lon_max
        } else {
            (self.lon_min..=self.lon_max).contains(&lon)
        };
        (self.lat_min..=self.lat_max).contains(&lat) && lon_inside
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if lon < -180.0 {
        lon + 360.0
    } else if lon > 180.0 {
        lon - 360.0
    } else {
        lon
    }
}
