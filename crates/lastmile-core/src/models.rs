//! Core data models for the route planner.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coordinates closer than this to zero are treated as the "(0,0) unknown"
/// sentinel some upstream systems emit instead of a missing value.
pub const COORD_EPSILON_DEG: f64 = 1e-4;

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are finite and far enough from the
    /// (0,0) sentinel to be a real position.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() > COORD_EPSILON_DEG
            && self.lon.abs() > COORD_EPSILON_DEG
    }
}

/// Canonical form of an AWB: uppercase, alphanumeric characters only.
///
/// All storage and comparisons use this form. An empty result means the
/// input was not a usable identifier.
pub fn canonical_awb(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// A shipment as received from upstream. Read-only input to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub awb: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub delivery_address: Option<String>,
    /// Opaque upstream payload; the classifier probes a known set of
    /// county/region fields inside it.
    #[serde(default)]
    pub raw_data: Option<Value>,
}

impl Shipment {
    /// The shipment's own coordinates, if present and valid.
    pub fn position(&self) -> Option<LatLon> {
        let (lat, lon) = (self.latitude?, self.longitude?);
        let pos = LatLon::new(lat, lon);
        pos.is_valid().then_some(pos)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// One-per-region daily route managed by the planner.
    #[default]
    County,
    /// Dispatcher-created route.
    Custom,
}

/// A planned delivery route for one calendar day.
///
/// `awbs` is the intended visit order; entries are canonical and unique
/// within the route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub kind: RouteKind,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub helper_name: Option<String>,
    #[serde(default)]
    pub vehicle_plate: Option<String>,
    #[serde(default)]
    pub awbs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    pub fn has_awb(&self, canonical: &str) -> bool {
        self.awbs.iter().any(|a| a == canonical)
    }

    /// Crew metadata presence, used when inheriting onto a new daily route.
    pub fn has_crew_metadata(&self) -> bool {
        self.driver_id.is_some()
            || self.driver_name.is_some()
            || self.helper_name.is_some()
            || self.vehicle_plate.is_some()
    }
}
