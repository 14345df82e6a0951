//! Warehouse origin: process-wide configuration with a compiled-in
//! default, persisted when the dispatcher moves the depot.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::warn;

use lastmile_core::models::LatLon;

use crate::storage::{KvStore, WAREHOUSE_ORIGIN_KEY};

pub const DEFAULT_ORIGIN_LAT: f64 = 46.5667;
pub const DEFAULT_ORIGIN_LON: f64 = 26.9167;
pub const DEFAULT_ORIGIN_LABEL: &str = "Depozit Bacau";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseOrigin {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
    pub ts: i64,
}

impl WarehouseOrigin {
    fn default_origin() -> Self {
        Self {
            lat: DEFAULT_ORIGIN_LAT,
            lon: DEFAULT_ORIGIN_LON,
            label: DEFAULT_ORIGIN_LABEL.to_string(),
            ts: 0,
        }
    }

    /// The origin as a coordinate, when it is a usable position.
    pub fn position(&self) -> Option<LatLon> {
        let pos = LatLon::new(self.lat, self.lon);
        pos.is_valid().then_some(pos)
    }
}

pub struct OriginStore<K: KvStore> {
    kv: Arc<K>,
    origin: OnceCell<std::sync::Mutex<WarehouseOrigin>>,
}

impl<K: KvStore> OriginStore<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            origin: OnceCell::new(),
        }
    }

    async fn cell(&self) -> &std::sync::Mutex<WarehouseOrigin> {
        self.origin
            .get_or_init(|| async {
                let loaded = match self.kv.get(WAREHOUSE_ORIGIN_KEY).await {
                    Ok(Some(json)) => match serde_json::from_str::<WarehouseOrigin>(&json) {
                        Ok(origin) => Some(origin),
                        Err(err) => {
                            warn!("Ignoring malformed warehouse origin: {}", err);
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(err) => {
                        warn!("Failed to load warehouse origin: {}", err);
                        None
                    }
                };
                std::sync::Mutex::new(loaded.unwrap_or_else(WarehouseOrigin::default_origin))
            })
            .await
    }

    pub async fn get(&self) -> WarehouseOrigin {
        let cell = self.cell().await;
        let guard = cell.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Replace the origin and persist it. Storage failure is swallowed;
    /// the in-memory origin still changes.
    pub async fn set(&self, lat: f64, lon: f64, label: &str) -> WarehouseOrigin {
        let origin = WarehouseOrigin {
            lat,
            lon,
            label: label.to_string(),
            ts: Utc::now().timestamp_millis(),
        };
        {
            let cell = self.cell().await;
            let mut guard = cell.lock().unwrap_or_else(|e| e.into_inner());
            *guard = origin.clone();
        }
        match serde_json::to_string(&origin) {
            Ok(json) => {
                if let Err(err) = self.kv.put(WAREHOUSE_ORIGIN_KEY, &json).await {
                    warn!("Failed to persist warehouse origin: {}", err);
                }
            }
            Err(err) => warn!("Failed to serialize warehouse origin: {}", err),
        }
        origin
    }
}
