//! Stateful planner services built on the pure `lastmile-core` logic:
//! persistent key-value storage, the geocoding cache, the route store,
//! the warehouse origin and the daily allocation engine.

pub mod allocate;
pub mod config;
pub mod geocode;
pub mod oracle;
pub mod origin;
pub mod routes;
pub mod storage;

pub use allocate::{plan_daily, AllocationSummary, PlanRequest};
pub use config::PlannerConfig;
pub use geocode::{canonical_query, GeocodeCache, GeocodeEntry, GeocodeResult, Geocoder, NominatimClient};
pub use oracle::{GeometryOracle, OsrmClient, RouteGeometry};
pub use origin::{OriginStore, WarehouseOrigin};
pub use routes::{CreateRoute, RoutePatch, RouteStore};
pub use storage::{KvStore, MemoryKv, SqliteKv, StorageError};
