//! Daily allocation engine.
//!
//! One planning run ensures a route per region for the day, buckets
//! deliverable shipments by region, places coordinate-bearing shipments
//! on the route whose round trip grows the least, appends the rest, and
//! persists every touched route in one store write.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info};

use lastmile_core::models::{canonical_awb, LatLon, Route, RouteKind, Shipment};
use lastmile_core::optimize::{best_insertion_index, optimize_round_trip, OptimizeOptions, Stop};
use lastmile_core::regions::{
    classify_region, is_deliverable, region_by_name, Region, RegionClass, REGIONS, REGION_GROUP,
};
use lastmile_core::spatial::distance_km;

use crate::config::PlannerConfig;
use crate::geocode::{canonical_query, GeocodeCache, Geocoder};
use crate::routes::{CreateRoute, RoutePatch, RouteStore};
use crate::storage::KvStore;

/// One "generate daily routes" invocation.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub date: NaiveDate,
    pub shipments: Vec<Shipment>,
    pub default_driver_id: Option<String>,
}

/// Outcome counters plus the ensured route list. Counters always tell
/// the truth, even when nothing could be allocated.
#[derive(Debug, Clone)]
pub struct AllocationSummary {
    pub date: NaiveDate,
    pub created_routes: usize,
    pub allocated_awbs: usize,
    pub deliverable_total: usize,
    pub deliverable_in_region: usize,
    pub already_assigned: usize,
    pub missing_region: usize,
    pub outside_region: usize,
    pub routes: Vec<Route>,
}

struct RouteState {
    route: Route,
    region: &'static Region,
    /// Coordinate-bearing stops in (re)optimized visit order.
    stops: Vec<Stop>,
    /// AWBs allocated without coordinates this run.
    appended: Vec<String>,
    touched: bool,
}

fn route_region(route: &Route) -> Option<&'static Region> {
    route
        .county
        .as_deref()
        .and_then(region_by_name)
        .or_else(|| region_by_name(&route.name))
}

/// Plan the given day. The engine only reads the geocode cache; it
/// never triggers network lookups.
pub async fn plan_daily<K: KvStore, G: Geocoder>(
    store: &RouteStore<K>,
    cache: &GeocodeCache<K, G>,
    origin: Option<LatLon>,
    config: &PlannerConfig,
    request: PlanRequest,
) -> AllocationSummary {
    let date = request.date;
    let mut summary = AllocationSummary {
        date,
        created_routes: 0,
        allocated_awbs: 0,
        deliverable_total: 0,
        deliverable_in_region: 0,
        already_assigned: 0,
        missing_region: 0,
        outside_region: 0,
        routes: Vec::new(),
    };

    // 1. One route per region for the day, inheriting crew metadata
    // from the most recent prior route in the same region.
    let existing = store.list_regional_routes_for_date(date).await;
    let history = store.list().await;
    for region in REGIONS {
        let current = existing
            .iter()
            .find(|r| route_region(r).map(|x| x.name) == Some(region.name));
        let inherited = history
            .iter()
            .find(|r| {
                r.date != Some(date)
                    && r.has_crew_metadata()
                    && route_region(r).map(|x| x.name) == Some(region.name)
            })
            .cloned();
        match current {
            None => {
                let crew = inherited.as_ref();
                store
                    .create(CreateRoute {
                        name: region.name.to_string(),
                        county: Some(region.name.to_string()),
                        kind: RouteKind::County,
                        region: Some(REGION_GROUP.to_string()),
                        date: Some(date),
                        driver_id: crew
                            .and_then(|r| r.driver_id.clone())
                            .or_else(|| request.default_driver_id.clone()),
                        driver_name: crew.and_then(|r| r.driver_name.clone()),
                        helper_name: crew.and_then(|r| r.helper_name.clone()),
                        vehicle_plate: crew.and_then(|r| r.vehicle_plate.clone()),
                    })
                    .await;
                summary.created_routes += 1;
            }
            Some(route) => {
                // Fill blank crew fields only; never clobber what a
                // dispatcher already set.
                let crew = inherited.as_ref();
                let patch = RoutePatch {
                    driver_id: route.driver_id.is_none().then(|| {
                        crew.and_then(|r| r.driver_id.clone())
                            .or_else(|| request.default_driver_id.clone())
                    }).flatten(),
                    driver_name: route
                        .driver_name
                        .is_none()
                        .then(|| crew.and_then(|r| r.driver_name.clone()))
                        .flatten(),
                    helper_name: route
                        .helper_name
                        .is_none()
                        .then(|| crew.and_then(|r| r.helper_name.clone()))
                        .flatten(),
                    vehicle_plate: route
                        .vehicle_plate
                        .is_none()
                        .then(|| crew.and_then(|r| r.vehicle_plate.clone()))
                        .flatten(),
                    ..RoutePatch::default()
                };
                if patch.driver_id.is_some()
                    || patch.driver_name.is_some()
                    || patch.helper_name.is_some()
                    || patch.vehicle_plate.is_some()
                {
                    store.update(&route.id, patch).await;
                }
            }
        }
    }

    // 2. AWBs already on any route for the day, across all kinds.
    let mut assigned_today: HashSet<String> = store
        .list_for_date(date)
        .await
        .into_iter()
        .flat_map(|r| r.awbs)
        .collect();

    // 3. Resolve coordinates: the shipment's own, else the cached
    // geocode for its canonical address query.
    cache.ensure_loaded().await;
    let mut resolved: HashMap<String, LatLon> = HashMap::new();
    for shipment in &request.shipments {
        let awb = canonical_awb(&shipment.awb);
        if awb.is_empty() {
            continue;
        }
        let position = shipment.position().or_else(|| {
            canonical_query(shipment)
                .and_then(|q| cache.get_cached(&q))
                .and_then(|entry| entry.position())
        });
        if let Some(pos) = position {
            resolved.insert(awb, pos);
        }
    }

    // 4. Per-route state for every regional route on the day.
    let options = OptimizeOptions::default();
    let mut states: Vec<RouteState> = Vec::new();
    for route in store.list_regional_routes_for_date(date).await {
        let Some(region) = route_region(&route) else {
            continue;
        };
        let mut stops: Vec<Stop> = route
            .awbs
            .iter()
            .filter_map(|awb| {
                resolved.get(awb).map(|pos| Stop {
                    awb: awb.clone(),
                    pos: *pos,
                })
            })
            .collect();
        if let Some(origin) = origin {
            stops = optimize_round_trip(origin, stops, &options);
        }
        states.push(RouteState {
            route,
            region,
            stops,
            appended: Vec::new(),
            touched: false,
        });
    }

    // 5. Classify deliverable shipments into coordinate candidates and
    // per-region fallback buckets.
    let mut coord_candidates: Vec<(String, LatLon, &'static Region)> = Vec::new();
    let mut fallback: Vec<(String, &'static Region)> = Vec::new();
    for shipment in &request.shipments {
        let awb = canonical_awb(&shipment.awb);
        if awb.is_empty() || !is_deliverable(shipment) {
            continue;
        }
        summary.deliverable_total += 1;
        let region = match classify_region(shipment) {
            RegionClass::Matched(region) => region,
            RegionClass::NoCounty => {
                summary.missing_region += 1;
                continue;
            }
            RegionClass::Unmatched => {
                summary.outside_region += 1;
                continue;
            }
        };
        summary.deliverable_in_region += 1;
        if assigned_today.contains(&awb) {
            summary.already_assigned += 1;
            continue;
        }
        match (origin, resolved.get(&awb)) {
            (Some(_), Some(pos)) => coord_candidates.push((awb, *pos, region)),
            _ => fallback.push((awb, region)),
        }
    }

    // 6. Distance-first allocation: far stops placed first, each onto
    // the same-region route whose round trip grows the least. Near-ties
    // resolve by seed distance, then lighter load, then earliest route.
    if let Some(origin) = origin {
        coord_candidates.sort_by(|a, b| {
            let da = distance_km(origin, a.1);
            let db = distance_km(origin, b.1);
            db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
        });
        for (awb, pos, region) in coord_candidates {
            let mut best: Option<(usize, usize, f64, f64, usize)> = None;
            for (si, state) in states.iter().enumerate() {
                if state.region.name != region.name {
                    continue;
                }
                let (idx, delta) = best_insertion_index(origin, &state.stops, pos);
                let seed_dist = distance_km(pos, state.region.seed);
                let load = state.stops.len() + state.appended.len();
                let better = match &best {
                    None => true,
                    Some((_, _, best_delta, best_seed, best_load)) => {
                        if delta < best_delta - config.allocation_tie_km {
                            true
                        } else if (delta - best_delta).abs() <= config.allocation_tie_km {
                            seed_dist < *best_seed - f64::EPSILON
                                || ((seed_dist - best_seed).abs() <= f64::EPSILON
                                    && load < *best_load)
                        } else {
                            false
                        }
                    }
                };
                if better {
                    best = Some((si, idx, delta, seed_dist, load));
                }
            }
            let Some((si, idx, delta, _, _)) = best else {
                // Region route vanished mid-run; fall back to append.
                fallback.push((awb, region));
                continue;
            };
            debug!(
                "Inserting {} into {} at {} (+{:.3} km)",
                awb, states[si].route.name, idx, delta
            );
            states[si].stops.insert(
                idx,
                Stop {
                    awb: awb.clone(),
                    pos,
                },
            );
            states[si].touched = true;
            assigned_today.insert(awb);
            summary.allocated_awbs += 1;
        }
    }

    // 7. Region-only fallback for shipments without usable coordinates.
    for (awb, region) in fallback {
        let Some(state) = states
            .iter_mut()
            .find(|s| s.region.name == region.name)
        else {
            continue;
        };
        if state.appended.contains(&awb) {
            continue;
        }
        state.appended.push(awb.clone());
        state.touched = true;
        assigned_today.insert(awb);
        summary.allocated_awbs += 1;
    }

    // 8. Final order per touched route: optimized coordinate stops,
    // then appended AWBs, then anything previously present that neither
    // covers. One store write for everything.
    let mut changed: Vec<Route> = Vec::new();
    for state in &mut states {
        if !state.touched {
            continue;
        }
        if let Some(origin) = origin {
            state.stops = optimize_round_trip(origin, std::mem::take(&mut state.stops), &options);
        }
        let mut final_awbs: Vec<String> = Vec::new();
        for awb in state
            .stops
            .iter()
            .map(|s| s.awb.clone())
            .chain(state.appended.iter().cloned())
            .chain(state.route.awbs.iter().cloned())
        {
            if !final_awbs.contains(&awb) {
                final_awbs.push(awb);
            }
        }
        if final_awbs != state.route.awbs {
            state.route.awbs = final_awbs;
            changed.push(state.route.clone());
        }
    }
    if !changed.is_empty() {
        store.upsert_all(changed).await;
    }

    summary.routes = store.list_regional_routes_for_date(date).await;
    info!(
        "Planned {}: {} allocated, {} created routes, {} already assigned",
        date, summary.allocated_awbs, summary.created_routes, summary.already_assigned
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeEntry, GeocodeResult};
    use crate::storage::{MemoryKv, GEOCODE_CACHE_KEY};
    use anyhow::Result;
    use std::sync::Arc;

    /// The engine must never reach the network; this geocoder panics
    /// if it does.
    struct NoGeocoder;

    impl Geocoder for NoGeocoder {
        async fn lookup(&self, query: &str) -> Result<Option<GeocodeResult>> {
            panic!("unexpected network geocode for {query:?}");
        }
    }

    fn day() -> NaiveDate {
        "2026-08-30".parse().unwrap()
    }

    fn warehouse() -> LatLon {
        LatLon::new(46.5667, 26.9167)
    }

    fn shipment(awb: &str, lat: Option<f64>, lon: Option<f64>, county: &str) -> Shipment {
        Shipment {
            awb: awb.to_string(),
            status: "in curs de livrare".to_string(),
            county: Some(county.to_string()),
            locality: None,
            latitude: lat,
            longitude: lon,
            delivery_address: None,
            raw_data: None,
        }
    }

    async fn fixture() -> (
        Arc<MemoryKv>,
        RouteStore<MemoryKv>,
        GeocodeCache<MemoryKv, NoGeocoder>,
        PlannerConfig,
    ) {
        let kv = Arc::new(MemoryKv::new());
        let store = RouteStore::new(Arc::clone(&kv));
        let config = PlannerConfig::default();
        let cache = GeocodeCache::new(Arc::clone(&kv), NoGeocoder, &config);
        (kv, store, cache, config)
    }

    fn route_named<'a>(routes: &'a [Route], name: &str) -> &'a Route {
        routes
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no route named {name}"))
    }

    #[tokio::test]
    async fn allocates_by_region_and_orders_stops_from_warehouse() {
        let (_kv, store, cache, config) = fixture().await;
        let request = PlanRequest {
            date: day(),
            shipments: vec![
                shipment("X1", Some(46.57), Some(26.92), "Bacau"),
                shipment("X2", Some(47.16), Some(27.60), "Iași"),
                shipment("X3", Some(47.10), Some(27.55), "IASI"),
            ],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;

        assert_eq!(summary.created_routes, REGIONS.len());
        assert_eq!(summary.allocated_awbs, 3);
        assert_eq!(summary.deliverable_total, 3);
        assert_eq!(summary.deliverable_in_region, 3);
        assert_eq!(summary.missing_region, 0);
        assert_eq!(summary.outside_region, 0);
        assert_eq!(summary.already_assigned, 0);

        assert_eq!(route_named(&summary.routes, "Bacau").awbs, vec!["X1"]);
        // X3 is closer to the warehouse, so the Iasi tour visits it first.
        assert_eq!(route_named(&summary.routes, "Iasi").awbs, vec!["X3", "X2"]);
    }

    #[tokio::test]
    async fn unknown_county_is_counted_not_allocated() {
        let (_kv, store, cache, config) = fixture().await;
        let request = PlanRequest {
            date: day(),
            shipments: vec![shipment("X9", Some(45.0), Some(25.0), "Ilfov")],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.outside_region, 1);
        assert_eq!(summary.allocated_awbs, 0);
        assert!(summary.routes.iter().all(|r| r.awbs.is_empty()));
    }

    #[tokio::test]
    async fn cached_geocode_turns_a_shipment_into_a_coordinate_candidate() {
        let (kv, store, cache, config) = fixture().await;
        let entry = GeocodeEntry {
            lat: Some(46.4297),
            lon: Some(26.4343),
            display_name: Some("Comănești".to_string()),
            ts: 1,
        };
        let payload = serde_json::json!({ "Comanesti, Bacau, Romania": entry });
        kv.put(GEOCODE_CACHE_KEY, &payload.to_string()).await.unwrap();

        let mut x7 = shipment("X7", None, None, "Bacau");
        x7.locality = Some("Comanesti".to_string());
        let request = PlanRequest {
            date: day(),
            shipments: vec![x7],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.allocated_awbs, 1);
        assert_eq!(route_named(&summary.routes, "Bacau").awbs, vec!["X7"]);
    }

    #[tokio::test]
    async fn missing_coordinates_fall_back_to_region_append() {
        let (_kv, store, cache, config) = fixture().await;
        let mut x7 = shipment("X7", None, None, "Bacau");
        x7.locality = Some("Comanesti".to_string());
        let request = PlanRequest {
            date: day(),
            shipments: vec![x7],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.allocated_awbs, 1);
        assert_eq!(route_named(&summary.routes, "Bacau").awbs, vec!["X7"]);
    }

    #[tokio::test]
    async fn without_an_origin_everything_is_appended() {
        let (_kv, store, cache, config) = fixture().await;
        let request = PlanRequest {
            date: day(),
            shipments: vec![
                shipment("X1", Some(46.57), Some(26.92), "Bacau"),
                shipment("X2", None, None, "Bacau"),
            ],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, None, &config, request).await;
        assert_eq!(summary.allocated_awbs, 2);
        // Appended in input order, no distance pass.
        assert_eq!(route_named(&summary.routes, "Bacau").awbs, vec!["X1", "X2"]);
    }

    #[tokio::test]
    async fn rerun_with_same_inputs_allocates_nothing_new() {
        let (_kv, store, cache, config) = fixture().await;
        let request = PlanRequest {
            date: day(),
            shipments: vec![
                shipment("X1", Some(46.57), Some(26.92), "Bacau"),
                shipment("X2", Some(47.16), Some(27.60), "Iasi"),
            ],
            default_driver_id: None,
        };
        let first = plan_daily(&store, &cache, Some(warehouse()), &config, request.clone()).await;
        assert_eq!(first.allocated_awbs, 2);

        let second = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(second.created_routes, 0);
        assert_eq!(second.allocated_awbs, 0);
        assert_eq!(second.already_assigned, 2);
        for route in &first.routes {
            let after = route_named(&second.routes, &route.name);
            assert_eq!(after.awbs, route.awbs, "rerun must not reorder {}", route.name);
        }
    }

    #[tokio::test]
    async fn empty_shipment_list_still_ensures_routes() {
        let (_kv, store, cache, config) = fixture().await;
        let request = PlanRequest {
            date: day(),
            shipments: Vec::new(),
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.created_routes, REGIONS.len());
        assert_eq!(summary.deliverable_total, 0);
        assert_eq!(summary.allocated_awbs, 0);
        assert_eq!(summary.routes.len(), REGIONS.len());
    }

    #[tokio::test]
    async fn terminal_statuses_are_skipped_entirely() {
        let (_kv, store, cache, config) = fixture().await;
        let mut delivered = shipment("X5", Some(46.57), Some(26.92), "Bacau");
        delivered.status = "Livrat cu succes".to_string();
        let request = PlanRequest {
            date: day(),
            shipments: vec![delivered],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.deliverable_total, 0);
        assert_eq!(summary.allocated_awbs, 0);
    }

    #[tokio::test]
    async fn crew_metadata_is_inherited_from_prior_routes() {
        let (_kv, store, cache, config) = fixture().await;
        let yesterday: NaiveDate = "2026-08-29".parse().unwrap();
        store
            .create(CreateRoute {
                name: "Bacau".to_string(),
                county: Some("Bacau".to_string()),
                date: Some(yesterday),
                driver_name: Some("Ion".to_string()),
                vehicle_plate: Some("BC 10 AAA".to_string()),
                ..CreateRoute::default()
            })
            .await;

        let request = PlanRequest {
            date: day(),
            shipments: Vec::new(),
            default_driver_id: Some("drv-7".to_string()),
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        let bacau = route_named(&summary.routes, "Bacau");
        assert_eq!(bacau.driver_name.as_deref(), Some("Ion"));
        assert_eq!(bacau.vehicle_plate.as_deref(), Some("BC 10 AAA"));
        // No prior crew for Iasi; the default driver id applies.
        let iasi = route_named(&summary.routes, "Iasi");
        assert_eq!(iasi.driver_id.as_deref(), Some("drv-7"));
    }

    #[tokio::test]
    async fn shipments_without_region_text_are_counted_missing() {
        let (_kv, store, cache, config) = fixture().await;
        let mut no_county = shipment("X8", Some(46.6), Some(26.9), "x");
        no_county.county = None;
        let request = PlanRequest {
            date: day(),
            shipments: vec![no_county],
            default_driver_id: None,
        };
        let summary = plan_daily(&store, &cache, Some(warehouse()), &config, request).await;
        assert_eq!(summary.missing_region, 1);
        assert_eq!(summary.allocated_awbs, 0);
    }
}
