//! Address geocoding with a persistent, rate-limited cache.
//!
//! Lookups are deduplicated per query (single-flight) and the outbound
//! request stream is globally throttled. Results, including "no
//! result", are written through to storage on a debounced timer.
//! Transient failures are never cached, so a later call retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify, OnceCell};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

use lastmile_core::models::{LatLon, Shipment};

use crate::config::PlannerConfig;
use crate::storage::{KvStore, GEOCODE_CACHE_KEY};

/// A successful geocoder answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A persisted cache record. `lat`/`lon` of `None` memoize a query that
/// the geocoder answered with no result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Last write time (unix millis); eviction removes oldest first.
    pub ts: i64,
}

impl GeocodeEntry {
    pub fn is_negative(&self) -> bool {
        self.lat.is_none() || self.lon.is_none()
    }

    /// The entry's coordinates when present and valid.
    pub fn position(&self) -> Option<LatLon> {
        let pos = LatLon::new(self.lat?, self.lon?);
        pos.is_valid().then_some(pos)
    }

    fn to_result(&self) -> Option<GeocodeResult> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeocodeResult {
                lat,
                lon,
                display_name: self.display_name.clone(),
            }),
            _ => None,
        }
    }
}

/// External geocoder contract: zero or one candidate per query; errors
/// are transport failures, distinct from an empty answer.
pub trait Geocoder: Send + Sync + 'static {
    fn lookup(&self, query: &str) -> impl Future<Output = Result<Option<GeocodeResult>>> + Send;
}

/// Canonical geocode query for a shipment: address parts joined with
/// the country suffix, e.g. `"Comanesti, Bacau, Romania"`.
pub fn canonical_query(shipment: &Shipment) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in [
        shipment.delivery_address.as_deref(),
        shipment.locality.as_deref(),
        shipment.county.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        let part = part.trim();
        if !part.is_empty() {
            parts.push(part);
        }
    }
    if parts.is_empty() {
        return None;
    }
    parts.push("Romania");
    Some(parts.join(", "))
}

struct CacheInner<K, G> {
    kv: Arc<K>,
    geocoder: G,
    entries: DashMap<String, GeocodeEntry>,
    loaded: OnceCell<()>,
    inflight: Mutex<HashMap<String, broadcast::Sender<Option<GeocodeResult>>>>,
    /// Earliest instant the next outbound request may be dispatched.
    next_slot: Mutex<Instant>,
    dirty: Notify,
    min_delay: Duration,
    request_timeout: Duration,
    max_entries: usize,
    debounce: Duration,
}

/// Process-wide geocoding cache. Cheap to clone; all clones share state.
pub struct GeocodeCache<K: KvStore, G: Geocoder> {
    inner: Arc<CacheInner<K, G>>,
}

impl<K: KvStore, G: Geocoder> Clone for GeocodeCache<K, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KvStore, G: Geocoder> GeocodeCache<K, G> {
    /// Must be called from within a tokio runtime: spawns the debounced
    /// flush task.
    pub fn new(kv: Arc<K>, geocoder: G, config: &PlannerConfig) -> Self {
        let inner = Arc::new(CacheInner {
            kv,
            geocoder,
            entries: DashMap::new(),
            loaded: OnceCell::new(),
            inflight: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(Instant::now()),
            dirty: Notify::new(),
            min_delay: config.geocode_min_delay,
            request_timeout: config.geocode_timeout,
            max_entries: config.geocode_max_entries,
            debounce: config.flush_debounce,
        });
        tokio::spawn(run_flush_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// Load the persisted cache into memory. Idempotent; `geocode`
    /// calls this itself, but batch consumers of `get_cached` should
    /// call it up front.
    pub async fn ensure_loaded(&self) {
        let inner = &self.inner;
        inner
            .loaded
            .get_or_init(|| async {
                match inner.kv.get(GEOCODE_CACHE_KEY).await {
                    Ok(Some(json)) => {
                        match serde_json::from_str::<HashMap<String, GeocodeEntry>>(&json) {
                            Ok(map) => {
                                for (query, entry) in map {
                                    inner.entries.insert(query, entry);
                                }
                            }
                            Err(err) => warn!("Discarding malformed geocode cache: {}", err),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("Failed to load geocode cache: {}", err),
                }
            })
            .await;
    }

    /// In-memory lookup only; never touches the network. Returns the
    /// raw entry so callers can tell a cached negative (null
    /// coordinates) from an absent one.
    pub fn get_cached(&self, query: &str) -> Option<GeocodeEntry> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        self.inner.entries.get(query).map(|e| e.clone())
    }

    /// Resolve a query to coordinates, consulting the cache first.
    ///
    /// Never fails: transient errors, timeouts and empty answers all
    /// surface as `None`. Only an explicit empty answer is memoized.
    pub async fn geocode(&self, query: &str) -> Option<GeocodeResult> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        self.ensure_loaded().await;

        if let Some(entry) = self.inner.entries.get(query) {
            return entry.to_result();
        }

        enum Flight {
            Done(Option<GeocodeResult>),
            Wait(broadcast::Receiver<Option<GeocodeResult>>),
        }

        let flight = {
            let mut inflight = self.inner.inflight.lock().await;
            // Re-check under the lock: the request may have settled
            // between the cache miss above and acquiring the lock.
            if let Some(entry) = self.inner.entries.get(query) {
                Flight::Done(entry.to_result())
            } else if let Some(tx) = inflight.get(query) {
                Flight::Wait(tx.subscribe())
            } else {
                let (tx, rx) = broadcast::channel(1);
                inflight.insert(query.to_string(), tx);
                let at = reserve_slot(&self.inner).await;
                tokio::spawn(resolve_query(
                    Arc::clone(&self.inner),
                    query.to_string(),
                    at,
                ));
                Flight::Wait(rx)
            }
        };

        match flight {
            Flight::Done(result) => result,
            Flight::Wait(mut rx) => rx.recv().await.ok().flatten(),
        }
    }

    /// Evict over-cap entries and persist immediately, bypassing the
    /// debounce. Used at controlled shutdown points.
    pub async fn flush_now(&self) {
        flush(&self.inner).await;
    }
}

/// Reserve the next dispatch slot on the global rate-limit chain.
/// Slots are handed out in call order, `min_delay` apart.
async fn reserve_slot<K, G>(inner: &CacheInner<K, G>) -> Instant {
    let mut next = inner.next_slot.lock().await;
    let at = (*next).max(Instant::now());
    *next = at + inner.min_delay;
    at
}

async fn resolve_query<K: KvStore, G: Geocoder>(
    inner: Arc<CacheInner<K, G>>,
    query: String,
    dispatch_at: Instant,
) {
    time::sleep_until(dispatch_at).await;

    enum Outcome {
        Hit(GeocodeResult),
        Empty,
        Failed,
    }

    let outcome = match time::timeout(inner.request_timeout, inner.geocoder.lookup(&query)).await {
        Ok(Ok(Some(result))) => Outcome::Hit(result),
        Ok(Ok(None)) => Outcome::Empty,
        Ok(Err(err)) => {
            warn!("Geocode request failed for {:?}: {}", query, err);
            Outcome::Failed
        }
        Err(_) => {
            warn!("Geocode request timed out for {:?}", query);
            Outcome::Failed
        }
    };

    let now_ms = Utc::now().timestamp_millis();
    let result = match outcome {
        Outcome::Hit(result) => {
            inner.entries.insert(
                query.clone(),
                GeocodeEntry {
                    lat: Some(result.lat),
                    lon: Some(result.lon),
                    display_name: result.display_name.clone(),
                    ts: now_ms,
                },
            );
            inner.dirty.notify_one();
            Some(result)
        }
        Outcome::Empty => {
            debug!("Caching negative geocode entry for {:?}", query);
            inner.entries.insert(
                query.clone(),
                GeocodeEntry {
                    lat: None,
                    lon: None,
                    display_name: None,
                    ts: now_ms,
                },
            );
            inner.dirty.notify_one();
            None
        }
        // Transient: leave the cache untouched so a later call retries.
        Outcome::Failed => None,
    };

    let mut inflight = inner.inflight.lock().await;
    if let Some(tx) = inflight.remove(&query) {
        let _ = tx.send(result);
    }
}

/// Debounced flusher: the first dirty mark opens a window that each
/// further mark extends; the cache is persisted once the window goes
/// quiet.
async fn run_flush_loop<K: KvStore, G: Geocoder>(inner: Arc<CacheInner<K, G>>) {
    loop {
        inner.dirty.notified().await;
        loop {
            match time::timeout(inner.debounce, inner.dirty.notified()).await {
                Ok(()) => continue,
                Err(_) => break,
            }
        }
        flush(&inner).await;
    }
}

async fn flush<K: KvStore, G: Geocoder>(inner: &CacheInner<K, G>) {
    prune(inner);
    let snapshot: HashMap<String, GeocodeEntry> = inner
        .entries
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            if let Err(err) = inner.kv.put(GEOCODE_CACHE_KEY, &json).await {
                warn!("Failed to persist geocode cache: {}", err);
            }
        }
        Err(err) => warn!("Failed to serialize geocode cache: {}", err),
    }
}

/// Drop oldest-`ts` entries until the cache fits the configured cap.
fn prune<K, G>(inner: &CacheInner<K, G>) {
    if inner.entries.len() <= inner.max_entries {
        return;
    }
    let mut stamped: Vec<(String, i64)> = inner
        .entries
        .iter()
        .map(|e| (e.key().clone(), e.value().ts))
        .collect();
    stamped.sort_by_key(|(_, ts)| *ts);
    for (query, _) in stamped {
        if inner.entries.len() <= inner.max_entries {
            break;
        }
        inner.entries.remove(&query);
    }
}

/// Nominatim-style HTTP geocoder.
pub struct NominatimClient {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("lastmile-planner/0.3")
            .build()
            .context("Failed to build geocoder HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

// Nominatim serializes coordinates as strings.
#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl Geocoder for NominatimClient {
    async fn lookup(&self, query: &str) -> Result<Option<GeocodeResult>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let places: Vec<NominatimPlace> = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat: f64 = place.lat.parse().context("Non-numeric latitude from geocoder")?;
        let lon: f64 = place.lon.parse().context("Non-numeric longitude from geocoder")?;
        Ok(Some(GeocodeResult {
            lat,
            lon,
            display_name: place.display_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy)]
    enum Scripted {
        Hit(f64, f64),
        Empty,
        Fail,
        Hang,
    }

    #[derive(Clone, Default)]
    struct FakeGeocoder {
        script: Arc<StdMutex<HashMap<String, Vec<Scripted>>>>,
        calls: Arc<StdMutex<Vec<(String, Instant)>>>,
    }

    impl FakeGeocoder {
        fn script(&self, query: &str, outcomes: &[Scripted]) {
            self.script
                .lock()
                .unwrap()
                .insert(query.to_string(), outcomes.to_vec());
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Geocoder for FakeGeocoder {
        async fn lookup(&self, query: &str) -> Result<Option<GeocodeResult>> {
            self.calls
                .lock()
                .unwrap()
                .push((query.to_string(), Instant::now()));
            let outcome = {
                let mut script = self.script.lock().unwrap();
                let queue = script.entry(query.to_string()).or_default();
                if queue.is_empty() {
                    Scripted::Empty
                } else {
                    queue.remove(0)
                }
            };
            match outcome {
                Scripted::Hit(lat, lon) => Ok(Some(GeocodeResult {
                    lat,
                    lon,
                    display_name: Some(format!("resolved {query}")),
                })),
                Scripted::Empty => Ok(None),
                Scripted::Fail => Err(anyhow::anyhow!("connection reset")),
                Scripted::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn test_config() -> PlannerConfig {
        PlannerConfig::default()
    }

    fn cache_with(
        config: &PlannerConfig,
    ) -> (GeocodeCache<MemoryKv, FakeGeocoder>, Arc<MemoryKv>, FakeGeocoder) {
        let kv = Arc::new(MemoryKv::new());
        let geocoder = FakeGeocoder::default();
        let cache = GeocodeCache::new(Arc::clone(&kv), geocoder.clone(), config);
        (cache, kv, geocoder)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_query_short_circuits() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        assert!(cache.geocode("   ").await.is_none());
        assert!(cache.get_cached("").is_none());
        assert!(geocoder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn positive_result_is_cached() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script("Comanesti, Bacau, Romania", &[Scripted::Hit(46.43, 26.45)]);

        let first = cache.geocode("Comanesti, Bacau, Romania").await.unwrap();
        assert!((first.lat - 46.43).abs() < 1e-9);

        // Second call is served from memory; no further network traffic.
        let second = cache.geocode("Comanesti, Bacau, Romania").await.unwrap();
        assert!((second.lon - 26.45).abs() < 1e-9);
        assert_eq!(geocoder.calls().len(), 1);

        let entry = cache.get_cached("Comanesti, Bacau, Romania").unwrap();
        assert!(!entry.is_negative());
        assert!(entry.position().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answer_writes_a_negative_entry() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script("Nowhere, Romania", &[Scripted::Empty]);

        assert!(cache.geocode("Nowhere, Romania").await.is_none());
        assert!(cache.geocode("Nowhere, Romania").await.is_none());
        assert_eq!(geocoder.calls().len(), 1, "negative entry must short-circuit");

        let entry = cache.get_cached("Nowhere, Romania").unwrap();
        assert!(entry.is_negative());
        assert!(entry.position().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_not_cached() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script("Bacau, Romania", &[Scripted::Fail, Scripted::Hit(46.57, 26.91)]);

        assert!(cache.geocode("Bacau, Romania").await.is_none());
        assert!(
            cache.get_cached("Bacau, Romania").is_none(),
            "transient failure must not poison the cache"
        );

        // The retry goes back out and succeeds.
        assert!(cache.geocode("Bacau, Romania").await.is_some());
        assert_eq!(geocoder.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_behaves_like_a_transient_failure() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script(
            "Suceava, Romania",
            &[Scripted::Hang, Scripted::Hit(47.65, 26.25)],
        );

        // The request never resolves; the 15 s cap turns it into None.
        assert!(cache.geocode("Suceava, Romania").await.is_none());
        assert!(
            cache.get_cached("Suceava, Romania").is_none(),
            "a timeout must not write a negative entry"
        );

        // A later call retries and succeeds.
        assert!(cache.geocode("Suceava, Romania").await.is_some());
        assert_eq!(geocoder.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_request() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script("Iasi, Romania", &[Scripted::Hit(47.15, 27.60)]);

        let (a, b) = tokio::join!(cache.geocode("Iasi, Romania"), cache.geocode("Iasi, Romania"));
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(geocoder.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_requests_respect_the_minimum_gap() {
        let (cache, _kv, geocoder) = cache_with(&test_config());
        geocoder.script("a", &[Scripted::Hit(46.0, 26.0)]);
        geocoder.script("b", &[Scripted::Hit(47.0, 27.0)]);

        let (a, b) = tokio::join!(cache.geocode("a"), cache.geocode("b"));
        assert!(a.is_some() && b.is_some());

        let calls = geocoder.calls();
        assert_eq!(calls.len(), 2);
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(
            gap >= Duration::from_millis(1100),
            "second request dispatched after {:?}",
            gap
        );
    }

    #[tokio::test(start_paused = true)]
    async fn writes_coalesce_into_one_debounced_flush() {
        // Shrink the rate-limit gap so both writes land inside one
        // debounce window.
        let mut config = test_config();
        config.geocode_min_delay = Duration::from_millis(50);
        let (cache, kv, geocoder) = cache_with(&config);
        geocoder.script("a", &[Scripted::Hit(46.0, 26.0)]);
        geocoder.script("b", &[Scripted::Empty]);

        let (_, _) = tokio::join!(cache.geocode("a"), cache.geocode("b"));
        assert_eq!(kv.put_count(), 0, "flush must wait out the debounce");

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(kv.put_count(), 1, "both writes coalesce into one flush");

        let json = kv.get(GEOCODE_CACHE_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, GeocodeEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted["b"].is_negative());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_drops_oldest_entries_first() {
        let mut config = test_config();
        config.geocode_max_entries = 2;
        let kv = Arc::new(MemoryKv::new());
        let seeded: HashMap<String, GeocodeEntry> = [
            ("old", 100i64),
            ("older", 50),
            ("newest", 900),
        ]
        .into_iter()
        .map(|(q, ts)| {
            (
                q.to_string(),
                GeocodeEntry {
                    lat: Some(46.0),
                    lon: Some(26.0),
                    display_name: None,
                    ts,
                },
            )
        })
        .collect();
        kv.put(GEOCODE_CACHE_KEY, &serde_json::to_string(&seeded).unwrap())
            .await
            .unwrap();

        let cache = GeocodeCache::new(Arc::clone(&kv), FakeGeocoder::default(), &config);
        cache.ensure_loaded().await;
        cache.flush_now().await;

        let json = kv.get(GEOCODE_CACHE_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, GeocodeEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted.contains_key("newest"));
        assert!(persisted.contains_key("old"));
        assert!(!persisted.contains_key("older"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_persisted_cache_is_discarded() {
        let kv = Arc::new(MemoryKv::new());
        kv.put(GEOCODE_CACHE_KEY, "{not json").await.unwrap();
        let cache = GeocodeCache::new(Arc::clone(&kv), FakeGeocoder::default(), &test_config());
        cache.ensure_loaded().await;
        assert!(cache.get_cached("anything").is_none());
    }

    #[test]
    fn canonical_query_joins_parts_with_country() {
        let shipment = lastmile_core::models::Shipment {
            awb: "X7".to_string(),
            status: String::new(),
            county: Some("Bacau".to_string()),
            locality: Some("Comanesti".to_string()),
            latitude: None,
            longitude: None,
            delivery_address: None,
            raw_data: None,
        };
        assert_eq!(
            canonical_query(&shipment).as_deref(),
            Some("Comanesti, Bacau, Romania")
        );

        let empty = lastmile_core::models::Shipment {
            county: None,
            locality: None,
            ..shipment
        };
        assert!(canonical_query(&empty).is_none());
    }
}
