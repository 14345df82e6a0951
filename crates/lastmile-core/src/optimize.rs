//! Tour construction and improvement for a fixed-origin round trip.
//!
//! All functions are pure and total: degenerate inputs return
//! well-defined results and nothing here can fail.

use crate::models::LatLon;
use crate::spatial::{distance_km, round_trip_km};

/// A coordinate-bearing stop on a route, identified by its AWB.
#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub awb: String,
    pub pos: LatLon,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    /// Upper bound on full 2-opt passes.
    pub max_passes: usize,
    /// Minimum round-trip saving (km) for a segment reversal to count
    /// as an improvement.
    pub improve_eps_km: f64,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_passes: 2,
            improve_eps_km: 1e-6,
        }
    }
}

/// Cheapest-insertion position for `candidate` into the round trip
/// `origin -> stops[..] -> origin`.
///
/// Returns the insertion index and the resulting increase in total
/// length (km). Ties resolve to the smallest index. For an empty stop
/// list the cost is the full out-and-back detour.
pub fn best_insertion_index(origin: LatLon, stops: &[Stop], candidate: LatLon) -> (usize, f64) {
    if stops.is_empty() {
        return (0, 2.0 * distance_km(origin, candidate));
    }

    let mut best_index = 0;
    let mut best_delta = f64::INFINITY;
    for index in 0..=stops.len() {
        let prev = if index == 0 {
            origin
        } else {
            stops[index - 1].pos
        };
        let next = if index == stops.len() {
            origin
        } else {
            stops[index].pos
        };
        let delta =
            distance_km(prev, candidate) + distance_km(candidate, next) - distance_km(prev, next);
        if delta < best_delta {
            best_delta = delta;
            best_index = index;
        }
    }
    // Haversine satisfies the triangle inequality; clamp away the
    // float noise so callers can rely on delta >= 0.
    (best_index, best_delta.max(0.0))
}

/// Order `stops` for a short round trip from `origin`.
///
/// Seeds with nearest-neighbor, then improves with 2-opt keeping the
/// origin fixed at both ends. Fewer than two stops are returned
/// unchanged.
pub fn optimize_round_trip(origin: LatLon, stops: Vec<Stop>, options: &OptimizeOptions) -> Vec<Stop> {
    if stops.len() < 2 {
        return stops;
    }

    let mut tour = nearest_neighbor_seed(origin, stops);
    let n = tour.len();

    for _ in 0..options.max_passes.max(1) {
        let mut improved = false;
        for i in 0..n - 1 {
            for k in i + 1..n {
                let prev = if i == 0 { origin } else { tour[i - 1].pos };
                let next = if k == n - 1 { origin } else { tour[k + 1].pos };
                let current = distance_km(prev, tour[i].pos) + distance_km(tour[k].pos, next);
                let reversed = distance_km(prev, tour[k].pos) + distance_km(tour[i].pos, next);
                if current - reversed > options.improve_eps_km {
                    tour[i..=k].reverse();
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }

    tour
}

/// Greedy seed tour: repeatedly visit the nearest unvisited stop,
/// starting from the origin. Distance ties keep the earlier stop.
fn nearest_neighbor_seed(origin: LatLon, mut pool: Vec<Stop>) -> Vec<Stop> {
    let mut tour = Vec::with_capacity(pool.len());
    let mut current = origin;
    while !pool.is_empty() {
        let mut nearest = 0;
        let mut nearest_km = f64::INFINITY;
        for (index, stop) in pool.iter().enumerate() {
            let d = distance_km(current, stop.pos);
            if d < nearest_km {
                nearest_km = d;
                nearest = index;
            }
        }
        let stop = pool.remove(nearest);
        current = stop.pos;
        tour.push(stop);
    }
    tour
}
