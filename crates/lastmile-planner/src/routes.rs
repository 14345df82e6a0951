//! Durable route store.
//!
//! The full route list lives in memory behind a lock and is persisted
//! as one JSON blob under a single key; every write replaces the whole
//! list. Storage failures are logged and swallowed, the in-memory view
//! stays authoritative.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::warn;
use uuid::Uuid;

use lastmile_core::models::{canonical_awb, Route, RouteKind};
use lastmile_core::regions::{fold_text, region_by_name, REGION_GROUP};

use crate::storage::{KvStore, ROUTES_KEY};

/// Fields accepted when creating a route. Everything else is derived.
#[derive(Debug, Clone, Default)]
pub struct CreateRoute {
    pub name: String,
    pub county: Option<String>,
    pub kind: RouteKind,
    pub region: Option<String>,
    pub date: Option<NaiveDate>,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub helper_name: Option<String>,
    pub vehicle_plate: Option<String>,
}

/// Shallow patch for `update`: `None` leaves the field alone, `Some`
/// overwrites it (crew fields re-normalized, so `Some("")` clears).
#[derive(Debug, Clone, Default)]
pub struct RoutePatch {
    pub name: Option<String>,
    pub county: Option<String>,
    pub region: Option<String>,
    pub date: Option<NaiveDate>,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub helper_name: Option<String>,
    pub vehicle_plate: Option<String>,
}

pub struct RouteStore<K: KvStore> {
    kv: Arc<K>,
    routes: RwLock<Option<Vec<Route>>>,
}

/// Trimmed crew field; empty collapses to `None`.
fn norm_crew(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Refresh `updated_at`, keeping it strictly increasing for the route
/// even when the wall clock does not move between mutations.
fn touch(route: &mut Route) {
    let now = Utc::now();
    let floor = route.updated_at + ChronoDuration::milliseconds(1);
    route.updated_at = if now > floor { now } else { floor };
}

/// The closed-set region a route serves, inferred from its county or
/// its display name.
fn route_region(route: &Route) -> Option<&'static str> {
    if let Some(region) = route.county.as_deref().and_then(region_by_name) {
        return Some(region.name);
    }
    region_by_name(&route.name).map(|r| r.name)
}

impl<K: KvStore> RouteStore<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            routes: RwLock::new(None),
        }
    }

    async fn load_from_storage(&self) -> Vec<Route> {
        match self.kv.get(ROUTES_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<Route>>(&json) {
                Ok(routes) => routes,
                Err(err) => {
                    warn!("Discarding malformed route list: {}", err);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("Failed to load routes: {}", err);
                Vec::new()
            }
        }
    }

    /// Write guard over the loaded route list, loading it on first use.
    async fn routes_mut(
        &self,
    ) -> tokio::sync::RwLockMappedWriteGuard<'_, Vec<Route>> {
        let mut guard = self.routes.write().await;
        if guard.is_none() {
            *guard = Some(self.load_from_storage().await);
        }
        RwLockWriteGuard::map(guard, |slot| slot.get_or_insert_with(Vec::new))
    }

    /// Best-effort whole-list write. Failures leave memory authoritative.
    async fn persist(&self, routes: &[Route]) {
        match serde_json::to_string(routes) {
            Ok(json) => {
                if let Err(err) = self.kv.put(ROUTES_KEY, &json).await {
                    warn!("Failed to persist routes: {}", err);
                }
            }
            Err(err) => warn!("Failed to serialize routes: {}", err),
        }
    }

    /// All routes, most recently updated first.
    pub async fn list(&self) -> Vec<Route> {
        let routes = self.routes_mut().await;
        let mut out = routes.clone();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    pub async fn get(&self, id: &str) -> Option<Route> {
        let routes = self.routes_mut().await;
        routes.iter().find(|r| r.id == id).cloned()
    }

    pub async fn create(&self, fields: CreateRoute) -> Route {
        let now = Utc::now();
        let route = Route {
            id: Uuid::new_v4().to_string(),
            name: fields.name,
            county: fields.county,
            kind: fields.kind,
            region: fields.region,
            date: fields.date,
            driver_id: norm_crew(fields.driver_id),
            driver_name: norm_crew(fields.driver_name),
            helper_name: norm_crew(fields.helper_name),
            vehicle_plate: norm_crew(fields.vehicle_plate),
            awbs: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let mut routes = self.routes_mut().await;
        routes.push(route.clone());
        self.persist(&routes).await;
        route
    }

    pub async fn update(&self, id: &str, patch: RoutePatch) -> Option<Route> {
        let mut routes = self.routes_mut().await;
        let route = routes.iter_mut().find(|r| r.id == id)?;
        if let Some(name) = patch.name {
            route.name = name;
        }
        if let Some(county) = patch.county {
            route.county = Some(county);
        }
        if let Some(region) = patch.region {
            route.region = Some(region);
        }
        if let Some(date) = patch.date {
            route.date = Some(date);
        }
        if patch.driver_id.is_some() {
            route.driver_id = norm_crew(patch.driver_id);
        }
        if patch.driver_name.is_some() {
            route.driver_name = norm_crew(patch.driver_name);
        }
        if patch.helper_name.is_some() {
            route.helper_name = norm_crew(patch.helper_name);
        }
        if patch.vehicle_plate.is_some() {
            route.vehicle_plate = norm_crew(patch.vehicle_plate);
        }
        touch(route);
        let updated = route.clone();
        self.persist(&routes).await;
        Some(updated)
    }

    pub async fn delete(&self, id: &str) -> bool {
        let mut routes = self.routes_mut().await;
        let before = routes.len();
        routes.retain(|r| r.id != id);
        if routes.len() == before {
            return false;
        }
        self.persist(&routes).await;
        true
    }

    /// Append an AWB (canonicalized) if not already present. An empty
    /// identifier is a no-op returning the unchanged route.
    pub async fn add_awb(&self, id: &str, awb: &str) -> Option<Route> {
        let canonical = canonical_awb(awb);
        let mut routes = self.routes_mut().await;
        let route = routes.iter_mut().find(|r| r.id == id)?;
        if canonical.is_empty() || route.has_awb(&canonical) {
            return Some(route.clone());
        }
        route.awbs.push(canonical);
        touch(route);
        let updated = route.clone();
        self.persist(&routes).await;
        Some(updated)
    }

    /// Remove every occurrence of an AWB from the route.
    pub async fn remove_awb(&self, id: &str, awb: &str) -> Option<Route> {
        let canonical = canonical_awb(awb);
        let mut routes = self.routes_mut().await;
        let route = routes.iter_mut().find(|r| r.id == id)?;
        if canonical.is_empty() || !route.has_awb(&canonical) {
            return Some(route.clone());
        }
        route.awbs.retain(|a| a != &canonical);
        touch(route);
        let updated = route.clone();
        self.persist(&routes).await;
        Some(updated)
    }

    /// Replace the visit order with the canonicalized, de-duplicated
    /// input; empty entries are dropped.
    pub async fn set_order(&self, id: &str, awbs: &[String]) -> Option<Route> {
        let mut seen: Vec<String> = Vec::with_capacity(awbs.len());
        for raw in awbs {
            let canonical = canonical_awb(raw);
            if !canonical.is_empty() && !seen.contains(&canonical) {
                seen.push(canonical);
            }
        }
        let mut routes = self.routes_mut().await;
        let route = routes.iter_mut().find(|r| r.id == id)?;
        route.awbs = seen;
        touch(route);
        let updated = route.clone();
        self.persist(&routes).await;
        Some(updated)
    }

    /// Move an AWB onto the target route. With `scope_date`, the AWB is
    /// first removed from every other route planned for the same date,
    /// so it appears on at most one route per day. All modified routes
    /// are persisted in one write.
    pub async fn move_awb_to_route(
        &self,
        target_id: &str,
        awb: &str,
        scope_date: bool,
    ) -> Option<Route> {
        let canonical = canonical_awb(awb);
        if canonical.is_empty() {
            return None;
        }
        let mut routes = self.routes_mut().await;
        let target_date = {
            let target = routes.iter().find(|r| r.id == target_id)?;
            target.date
        };
        let mut changed = false;
        if scope_date {
            if let Some(date) = target_date {
                for route in routes.iter_mut() {
                    if route.id != target_id
                        && route.date == Some(date)
                        && route.has_awb(&canonical)
                    {
                        route.awbs.retain(|a| a != &canonical);
                        touch(route);
                        changed = true;
                    }
                }
            }
        }
        let updated = {
            // Checked above; the list cannot shrink between the two finds.
            let target = routes.iter_mut().find(|r| r.id == target_id)?;
            if !target.has_awb(&canonical) {
                target.awbs.push(canonical);
                touch(target);
                changed = true;
            }
            target.clone()
        };
        if changed {
            self.persist(&routes).await;
        }
        Some(updated)
    }

    /// First route containing the AWB, if any.
    pub async fn find_route_for_awb(&self, awb: &str) -> Option<Route> {
        let canonical = canonical_awb(awb);
        if canonical.is_empty() {
            return None;
        }
        let routes = self.routes_mut().await;
        routes.iter().find(|r| r.has_awb(&canonical)).cloned()
    }

    pub async fn list_for_date(&self, date: NaiveDate) -> Vec<Route> {
        let routes = self.routes_mut().await;
        routes
            .iter()
            .filter(|r| r.date == Some(date))
            .cloned()
            .collect()
    }

    /// Routes for `date` that serve one of the closed-set regions:
    /// county-kind routes, or routes tagged with the regional group,
    /// whose county or name resolves to a known region.
    pub async fn list_regional_routes_for_date(&self, date: NaiveDate) -> Vec<Route> {
        let group = fold_text(REGION_GROUP);
        let routes = self.routes_mut().await;
        routes
            .iter()
            .filter(|r| r.date == Some(date))
            .filter(|r| {
                r.kind == RouteKind::County
                    || r.region
                        .as_deref()
                        .map(|reg| fold_text(reg) == group)
                        .unwrap_or(false)
            })
            .filter(|r| route_region(r).is_some())
            .cloned()
            .collect()
    }

    /// Replace (or insert) each given route by id and persist once.
    /// Refreshes `updated_at` on every route passed in.
    pub async fn upsert_all(&self, updated: Vec<Route>) {
        if updated.is_empty() {
            return;
        }
        let mut routes = self.routes_mut().await;
        for mut route in updated {
            touch(&mut route);
            match routes.iter_mut().find(|r| r.id == route.id) {
                Some(slot) => *slot = route,
                None => routes.push(route),
            }
        }
        self.persist(&routes).await;
    }
}
