pub mod models;
pub mod optimize;
pub mod regions;
pub mod spatial;

pub use models::{canonical_awb, LatLon, Route, RouteKind, Shipment, COORD_EPSILON_DEG};
pub use optimize::{best_insertion_index, optimize_round_trip, OptimizeOptions, Stop};
pub use regions::{
    classify_region, fold_text, infer_region, is_deliverable, region_by_name, Region, RegionClass,
    REGIONS, REGION_GROUP,
};
pub use spatial::{distance_km, round_trip_km, EARTH_RADIUS_KM};
