//! Road-network distance and geometry for an ordered stop sequence.
//!
//! The planner itself only ever uses great-circle distance; this
//! interface exists so consumers of a planned route can render its
//! actual driving polyline. Unavailability is a normal outcome.

use std::future::Future;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

use lastmile_core::models::LatLon;

/// A routed leg over the road network.
#[derive(Debug, Clone)]
pub struct RouteGeometry {
    /// GeoJSON LineString geometry as returned by the router.
    pub geometry: Value,
    pub distance_m: f64,
    pub duration_s: f64,
}

/// Road geometry provider for two or more waypoints in visit order.
/// `None` means unavailable; callers fall back to straight lines.
pub trait GeometryOracle: Send + Sync + 'static {
    fn route(&self, points: &[LatLon]) -> impl Future<Output = Option<RouteGeometry>> + Send;
}

/// OSRM HTTP backend for the geometry oracle.
pub struct OsrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build routing HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn fetch(&self, points: &[LatLon]) -> Result<RouteGeometry> {
        #[derive(Deserialize)]
        struct OsrmRoute {
            geometry: Value,
            distance: f64,
            duration: f64,
        }
        #[derive(Deserialize)]
        struct OsrmResponse {
            routes: Vec<OsrmRoute>,
        }

        // OSRM takes lon,lat pairs.
        let path: Vec<String> = points
            .iter()
            .map(|p| format!("{},{}", p.lon, p.lat))
            .collect();
        let url = format!(
            "{}/route/v1/driving/{}?overview=full&geometries=geojson",
            self.base_url.trim_end_matches('/'),
            path.join(";")
        );
        let response: OsrmResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let route = response
            .routes
            .into_iter()
            .next()
            .context("Router returned no routes")?;
        Ok(RouteGeometry {
            geometry: route.geometry,
            distance_m: route.distance,
            duration_s: route.duration,
        })
    }
}

impl GeometryOracle for OsrmClient {
    async fn route(&self, points: &[LatLon]) -> Option<RouteGeometry> {
        if points.len() < 2 {
            return None;
        }
        match self.fetch(points).await {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                debug!("Road geometry unavailable: {}", err);
                None
            }
        }
    }
}
