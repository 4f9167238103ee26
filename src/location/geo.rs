//! Coordinates and great-circle distance.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::DecimalString;
use crate::error::LocationError;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A device position, kept in the decimal form it was captured in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
  pub latitude: DecimalString,
  pub longitude: DecimalString,
}

impl Position {
  /// Parse a `latitude`/`longitude` pair, checking both are in range.
  pub fn parse(latitude: &str, longitude: &str) -> Result<Self, LocationError> {
    let lat = DecimalString::parse(latitude).ok_or_else(|| LocationError::InvalidCoordinate(latitude.to_string()))?;
    let lon =
      DecimalString::parse(longitude).ok_or_else(|| LocationError::InvalidCoordinate(longitude.to_string()))?;

    if !(-90.0..=90.0).contains(&lat.to_f64()) {
      return Err(LocationError::InvalidCoordinate(latitude.to_string()));
    }
    if !(-180.0..=180.0).contains(&lon.to_f64()) {
      return Err(LocationError::InvalidCoordinate(longitude.to_string()));
    }

    Ok(Self {
      latitude: lat,
      longitude: lon,
    })
  }

  /// Haversine distance to `other` in meters.
  pub fn distance_to(&self, other: &Position) -> f64 {
    haversine_meters(
      (self.latitude.to_f64(), self.longitude.to_f64()),
      (other.latitude.to_f64(), other.longitude.to_f64()),
    )
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {})", self.latitude, self.longitude)
  }
}

/// Great-circle distance in meters between two `(lat, lon)` points in degrees.
pub fn haversine_meters((lat1, lon1): (f64, f64), (lat2, lon2): (f64, f64)) -> f64 {
  let d_lat = (lat2 - lat1).to_radians();
  let d_lon = (lon2 - lon1).to_radians();

  let a = (d_lat / 2.0).sin().powi(2) + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
  let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

  EARTH_RADIUS_METERS * c
}

/// Outcome of comparing a new sample to the last reported one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Displacement {
  /// Nothing reported yet, or moved at least the threshold
  Reportable { distance_m: Option<f64> },
  /// Moved less than the threshold
  Skipped { distance_m: f64 },
}

/// Decide whether `current` is worth reporting given the last reported position.
pub fn classify(last_reported: Option<&Position>, current: &Position, min_displacement_m: f64) -> Displacement {
  match last_reported {
    None => Displacement::Reportable { distance_m: None },
    Some(last) => {
      let distance_m = last.distance_to(current);
      if distance_m >= min_displacement_m {
        Displacement::Reportable {
          distance_m: Some(distance_m),
        }
      } else {
        Displacement::Skipped { distance_m }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pos(lat: &str, lon: &str) -> Position {
    Position::parse(lat, lon).unwrap()
  }

  #[test]
  fn test_haversine_known_distance() {
    // One degree of latitude is about 111.2 km
    let d = haversine_meters((0.0, 0.0), (1.0, 0.0));
    assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    assert_eq!(haversine_meters((1.2136, -77.2811), (1.2136, -77.2811)), 0.0);
  }

  #[test]
  fn test_small_move_is_skipped() {
    let first = pos("1.2136", "-77.2811");
    let second = pos("1.21361", "-77.28111");

    match classify(Some(&first), &second, 10.0) {
      Displacement::Skipped { distance_m } => assert!(distance_m < 2.0, "got {distance_m}"),
      other => panic!("expected skip, got {other:?}"),
    }
  }

  #[test]
  fn test_large_move_is_reportable() {
    let first = pos("1.2136", "-77.2811");
    let far = pos("1.2146", "-77.2821");

    match classify(Some(&first), &far, 10.0) {
      Displacement::Reportable { distance_m: Some(d) } => assert!(d > 100.0, "got {d}"),
      other => panic!("expected report, got {other:?}"),
    }
  }

  #[test]
  fn test_first_sample_always_reportable() {
    assert_eq!(
      classify(None, &pos("1.0", "-77.0"), 10.0),
      Displacement::Reportable { distance_m: None }
    );
  }

  #[test]
  fn test_parse_rejects_out_of_range() {
    assert!(matches!(
      Position::parse("91", "0"),
      Err(LocationError::InvalidCoordinate(_))
    ));
    assert!(matches!(
      Position::parse("0", "-180.5"),
      Err(LocationError::InvalidCoordinate(_))
    ));
    assert!(Position::parse("abc", "0").is_err());
    assert_eq!(pos("1.211903872", "-77.0").latitude.as_str(), "1.211903872");
  }
}
