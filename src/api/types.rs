//! Serde types matching the pets backend.
//!
//! Field names follow the backend contract (Spanish, fixed by the server);
//! Rust-side names are renamed where that reads better.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::ApiError;

// ============================================================================
// Decimal values
// ============================================================================

/// A decimal number kept in its original textual form.
///
/// Coordinates and weights travel as strings so that every digit captured is
/// sent back unchanged; no float round-trip is involved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecimalString(String);

impl DecimalString {
  /// Validate and wrap a decimal literal such as `"-77.2811"`.
  pub fn parse(text: &str) -> Option<Self> {
    let text = text.trim();
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int_part, frac_part) = match unsigned.split_once('.') {
      Some((i, f)) => (i, f),
      None => (unsigned, ""),
    };

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if int_part.is_empty() && frac_part.is_empty() {
      return None;
    }
    if !all_digits(int_part) || !all_digits(frac_part) {
      return None;
    }

    Some(Self(text.to_string()))
  }

  /// Shortest text that reads back as exactly `value`.
  pub fn from_f64(value: f64) -> Option<Self> {
    value.is_finite().then(|| Self(value.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn to_f64(&self) -> f64 {
    // Validated on construction, so parsing cannot fail.
    self.0.parse().unwrap_or(f64::NAN)
  }
}

impl fmt::Display for DecimalString {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(&self.0)
  }
}

impl Serialize for DecimalString {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for DecimalString {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct DecimalVisitor;

    impl de::Visitor<'_> for DecimalVisitor {
      type Value = DecimalString;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal number or decimal string")
      }

      fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        DecimalString::parse(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
      }

      fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        DecimalString::from_f64(v).ok_or_else(|| E::invalid_value(de::Unexpected::Float(v), &self))
      }

      fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(DecimalString(v.to_string()))
      }

      fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(DecimalString(v.to_string()))
      }
    }

    deserializer.deserialize_any(DecimalVisitor)
  }
}

// ============================================================================
// Response envelopes
// ============================================================================

/// Some endpoints answer `{"message": ..., "data": T}`, others plain `T`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MaybeWrapped<T> {
  Wrapped { data: T },
  Bare(T),
}

impl<T> MaybeWrapped<T> {
  pub fn into_inner(self) -> T {
    match self {
      MaybeWrapped::Wrapped { data } => data,
      MaybeWrapped::Bare(data) => data,
    }
  }
}

// ============================================================================
// Pets
// ============================================================================

/// Latest known fix embedded in pet responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFix {
  pub id: i64,
  pub latitude: DecimalString,
  pub longitude: DecimalString,
  pub created_at: DateTime<Utc>,
}

/// A pet (`mascota`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pet {
  pub id: i64,
  pub nombre: String,
  pub especie: String,
  pub raza: String,
  pub edad: i32,
  pub peso: DecimalString,
  /// Base64-encoded photo
  #[serde(default)]
  pub imagen: Option<String>,
  #[serde(rename = "dueño")]
  pub owner_id: i64,
  #[serde(default)]
  pub fecha_nacimiento: Option<NaiveDate>,
  #[serde(default)]
  pub fecha_creacion: Option<String>,
  #[serde(rename = "dueño_info", default)]
  pub owner_info: Option<serde_json::Value>,
  #[serde(rename = "ultima_ubicacion", default)]
  pub last_fix: Option<LastFix>,
}

/// Payload for creating or updating a pet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PetDraft {
  pub nombre: String,
  pub especie: String,
  pub raza: String,
  pub edad: i32,
  pub peso: DecimalString,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub imagen: Option<String>,
  #[serde(rename = "dueño")]
  pub owner_id: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fecha_nacimiento: Option<NaiveDate>,
}

impl PetDraft {
  pub fn validate(&self) -> Result<(), ApiError> {
    require("nombre", &self.nombre)?;
    require("especie", &self.especie)?;
    require("raza", &self.raza)?;
    if self.edad < 0 {
      return Err(ApiError::Validation("edad must not be negative".into()));
    }
    if self.peso.to_f64() <= 0.0 {
      return Err(ApiError::Validation("peso must be positive".into()));
    }
    if self.owner_id <= 0 {
      return Err(ApiError::Validation("dueño is required".into()));
    }
    Ok(())
  }
}

// ============================================================================
// Owners
// ============================================================================

/// Pet summary nested in owner responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetSummary {
  pub id: i64,
  pub nombre: String,
  #[serde(default)]
  pub especie: String,
  #[serde(default)]
  pub raza: String,
  #[serde(default)]
  pub imagen: Option<String>,
  #[serde(default)]
  pub fecha_nacimiento: Option<NaiveDate>,
}

/// A pet owner (`dueño`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
  pub id: i64,
  pub nombre: String,
  pub apellido: String,
  pub email: String,
  pub telefono: String,
  pub direccion: String,
  pub ciudad: String,
  #[serde(default)]
  pub fecha_creacion: Option<String>,
  #[serde(default)]
  pub mascotas: Vec<PetSummary>,
}

impl Owner {
  pub fn full_name(&self) -> String {
    format!("{} {}", self.nombre, self.apellido)
  }
}

/// Payload for creating or updating an owner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerDraft {
  pub nombre: String,
  pub apellido: String,
  pub email: String,
  pub telefono: String,
  pub direccion: String,
  pub ciudad: String,
}

impl OwnerDraft {
  pub fn validate(&self) -> Result<(), ApiError> {
    require("nombre", &self.nombre)?;
    require("apellido", &self.apellido)?;
    require("email", &self.email)?;
    require("telefono", &self.telefono)?;
    require("direccion", &self.direccion)?;
    require("ciudad", &self.ciudad)?;
    if !self.email.contains('@') {
      return Err(ApiError::Validation(format!(
        "email {:?} is not a valid address",
        self.email
      )));
    }
    Ok(())
  }
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
  if value.trim().is_empty() {
    return Err(ApiError::Validation(format!("{} is required", field)));
  }
  Ok(())
}

// ============================================================================
// Locations
// ============================================================================

/// One stored position of a pet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
  pub id: i64,
  #[serde(rename = "mascota")]
  pub pet_id: i64,
  pub latitude: DecimalString,
  pub longitude: DecimalString,
  pub created_at: DateTime<Utc>,
}

/// Body of `POST location/mobile/`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
  pub mascota: i64,
  pub latitud: DecimalString,
  pub longitud: DecimalString,
}
