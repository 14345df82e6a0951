//! Planner configuration from environment.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub db_path: String,
    /// Minimum gap between outbound geocoder requests.
    pub geocode_min_delay: Duration,
    /// Per-request geocoder timeout.
    pub geocode_timeout: Duration,
    /// Cap on persisted geocode cache entries; oldest evicted first.
    pub geocode_max_entries: usize,
    /// Quiet window before dirty caches are flushed to storage.
    pub flush_debounce: Duration,
    /// Insertion-cost window within which allocation ties fall back to
    /// seed distance and route load.
    pub allocation_tie_km: f64,
    pub geocoder_url: String,
    pub osrm_url: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            db_path: "data/lastmile.db".to_string(),
            geocode_min_delay: Duration::from_millis(1100),
            geocode_timeout: Duration::from_millis(15_000),
            geocode_max_entries: 5000,
            flush_debounce: Duration::from_millis(250),
            allocation_tie_km: 0.25,
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            osrm_url: "https://router.project-osrm.org".to_string(),
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env::var("LASTMILE_DB").unwrap_or(defaults.db_path),
            geocode_min_delay: env_millis("LASTMILE_GEOCODE_MIN_DELAY_MS")
                .unwrap_or(defaults.geocode_min_delay),
            geocode_timeout: env_millis("LASTMILE_GEOCODE_TIMEOUT_MS")
                .unwrap_or(defaults.geocode_timeout),
            geocode_max_entries: env::var("LASTMILE_GEOCODE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.geocode_max_entries),
            flush_debounce: env_millis("LASTMILE_FLUSH_DEBOUNCE_MS")
                .unwrap_or(defaults.flush_debounce),
            allocation_tie_km: env::var("LASTMILE_ALLOCATION_TIE_KM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.allocation_tie_km),
            geocoder_url: env::var("LASTMILE_GEOCODER_URL").unwrap_or(defaults.geocoder_url),
            osrm_url: env::var("LASTMILE_OSRM_URL").unwrap_or(defaults.osrm_url),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}
