//! Keyed cache of server-fetched track pages, single tracks and genres.
//!
//! Entries are addressed by a structured `(namespace, params)` key. Reads are
//! stale-while-revalidate: whatever is cached is handed out immediately while
//! at most one request per key refreshes it. Only the catalog manager (through
//! fetch completions and the mutation coordinator) writes here.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::CatalogError;
use crate::protocol::{ApiResponse, RequestId, Track, TracksPage};
use crate::query_state::QueryState;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
pub enum CacheNamespace {
    TrackList,
    Track,
    Genres,
}

impl CacheNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheNamespace::TrackList => "track_list",
            CacheNamespace::Track => "track",
            CacheNamespace::Genres => "genres",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "track_list" => Some(CacheNamespace::TrackList),
            "track" => Some(CacheNamespace::Track),
            "genres" => Some(CacheNamespace::Genres),
            _ => None,
        }
    }
}

/// Structured cache key. `params` is the query fingerprint for lists and the
/// track id for single tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub namespace: CacheNamespace,
    pub params: String,
}

impl CacheKey {
    pub fn track_list(query: &QueryState) -> Self {
        Self {
            namespace: CacheNamespace::TrackList,
            params: query.fingerprint(),
        }
    }

    pub fn track(id: &str) -> Self {
        Self {
            namespace: CacheNamespace::Track,
            params: id.to_string(),
        }
    }

    pub fn genres() -> Self {
        Self {
            namespace: CacheNamespace::Genres,
            params: String::new(),
        }
    }
}

/// Selects the entries a patch or invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPredicate {
    Any,
    Namespace(CacheNamespace),
    Exact(CacheKey),
}

impl KeyPredicate {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyPredicate::Any => true,
            KeyPredicate::Namespace(namespace) => key.namespace == *namespace,
            KeyPredicate::Exact(exact) => exact == key,
        }
    }
}

/// Last-known server data for a key.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    TrackList(TracksPage),
    /// `None` records that the server has no track with this id.
    Track(Option<Track>),
    Genres(Vec<String>),
}

impl CachedValue {
    /// Converts a fetch response into the value stored under `namespace`.
    pub fn from_response(namespace: CacheNamespace, response: ApiResponse) -> Option<Self> {
        match (namespace, response) {
            (CacheNamespace::TrackList, ApiResponse::Page(page)) => {
                Some(CachedValue::TrackList(page))
            }
            (CacheNamespace::Track, ApiResponse::MaybeTrack(track)) => {
                Some(CachedValue::Track(track))
            }
            (CacheNamespace::Track, ApiResponse::Track(track)) => {
                Some(CachedValue::Track(Some(track)))
            }
            (CacheNamespace::Genres, ApiResponse::Genres(genres)) => {
                Some(CachedValue::Genres(genres))
            }
            _ => None,
        }
    }

    pub fn tracks(&self) -> Vec<&Track> {
        match self {
            CachedValue::TrackList(page) => page.data.iter().collect(),
            CachedValue::Track(track) => track.iter().collect(),
            CachedValue::Genres(_) => Vec::new(),
        }
    }

    pub fn contains_track(&self, id: &str) -> bool {
        self.tracks().iter().any(|track| track.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: Option<CachedValue>,
    in_flight: Option<RequestId>,
    in_flight_since: Option<Instant>,
    error: Option<CatalogError>,
    stale: bool,
    fetched_at: Option<Instant>,
    last_access: Instant,
    revision: u64,
    generation: u64,
}

impl CacheEntry {
    fn empty(now: Instant) -> Self {
        Self {
            value: None,
            in_flight: None,
            in_flight_since: None,
            error: None,
            stale: false,
            fetched_at: None,
            last_access: now,
            revision: 0,
            generation: 0,
        }
    }

    pub fn value(&self) -> Option<&CachedValue> {
        self.value.as_ref()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    pub fn error(&self) -> Option<&CatalogError> {
        self.error.as_ref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Bumped on every change to `value`.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Bumped only when server data replaces `value`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.value.is_some()
            && !self.stale
            && self.error.is_none()
            && self
                .fetched_at
                .is_some_and(|fetched_at| now.saturating_duration_since(fetched_at) < ttl)
    }
}

/// Per-namespace freshness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub track_list: Duration,
    pub track: Duration,
    pub genres: Duration,
}

impl Default for Freshness {
    fn default() -> Self {
        Self {
            track_list: Duration::from_secs(5 * 60),
            track: Duration::from_secs(5 * 60),
            genres: Duration::from_secs(30 * 60),
        }
    }
}

impl Freshness {
    fn for_namespace(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::TrackList => self.track_list,
            CacheNamespace::Track => self.track,
            CacheNamespace::Genres => self.genres,
        }
    }
}

/// What a read should do about the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    /// Cached value is fresh; no request.
    UseCached,
    /// A request for this key is already running.
    Join(RequestId),
    /// The caller must send a request with this id.
    Issue(RequestId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub cached: Option<CachedValue>,
    pub action: FetchAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCompletion {
    Stored,
    /// Request failed; the previous value was kept and the error recorded.
    Failed,
    /// Nobody is waiting for this request any more.
    Discarded,
}

/// Unanswered reads older than this are treated as lost.
pub const DEFAULT_ABANDON_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct TrackCache {
    entries: BTreeMap<CacheKey, CacheEntry>,
    freshness: Freshness,
    abandon_after: Duration,
}

impl Default for TrackCache {
    fn default() -> Self {
        Self::new(Freshness::default())
    }
}

impl TrackCache {
    pub fn new(freshness: Freshness) -> Self {
        Self {
            entries: BTreeMap::new(),
            freshness,
            abandon_after: DEFAULT_ABANDON_AFTER,
        }
    }

    pub fn with_abandon_after(mut self, abandon_after: Duration) -> Self {
        self.abandon_after = abandon_after;
        self
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &CacheKey) -> Option<&CachedValue> {
        self.entries.get(key).and_then(CacheEntry::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn keys_matching(&self, predicate: &KeyPredicate) -> Vec<CacheKey> {
        self.entries
            .keys()
            .filter(|key| predicate.matches(key))
            .cloned()
            .collect()
    }

    /// Read-through entry point. Hands back whatever is cached and decides
    /// whether `request_id` has to go out. Concurrent reads of one key share a
    /// single request; a request unanswered for longer than the abandon window
    /// is replaced.
    pub fn plan_fetch(&mut self, key: &CacheKey, request_id: RequestId, now: Instant) -> FetchPlan {
        let ttl = self.freshness.for_namespace(key.namespace);
        let abandon_after = self.abandon_after;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::empty(now));
        entry.last_access = now;
        let abandoned = entry
            .in_flight_since
            .is_some_and(|since| now.saturating_duration_since(since) >= abandon_after);
        if let Some(lost) = entry.in_flight.filter(|_| abandoned) {
            debug!(
                "TrackCache: request {} for {:?} went unanswered, replacing it",
                lost, key
            );
            entry.in_flight = None;
            entry.stale = true;
        }
        let action = if let Some(in_flight) = entry.in_flight {
            FetchAction::Join(in_flight)
        } else if entry.is_fresh(now, ttl) {
            FetchAction::UseCached
        } else {
            entry.in_flight = Some(request_id);
            entry.in_flight_since = Some(now);
            FetchAction::Issue(request_id)
        };
        FetchPlan {
            cached: entry.value.clone(),
            action,
        }
    }

    /// Records the result of a read. Failures keep the previous value.
    pub fn complete_fetch(
        &mut self,
        key: &CacheKey,
        request_id: RequestId,
        outcome: Result<CachedValue, CatalogError>,
        now: Instant,
    ) -> FetchCompletion {
        let Some(entry) = self.entries.get_mut(key) else {
            return FetchCompletion::Discarded;
        };
        if entry.in_flight != Some(request_id) {
            debug!(
                "TrackCache: discarding result of request {} for {:?}",
                request_id, key
            );
            return FetchCompletion::Discarded;
        }
        entry.in_flight = None;
        match outcome {
            Ok(value) => {
                entry.value = Some(value);
                entry.error = None;
                entry.stale = false;
                entry.fetched_at = Some(now);
                entry.revision += 1;
                entry.generation += 1;
                FetchCompletion::Stored
            }
            Err(error) => {
                entry.error = Some(error);
                FetchCompletion::Failed
            }
        }
    }

    /// Stores server data obtained outside a read, e.g. a mutation response.
    pub fn insert(&mut self, key: CacheKey, value: CachedValue, now: Instant) {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry::empty(now));
        entry.value = Some(value);
        entry.error = None;
        entry.stale = false;
        entry.fetched_at = Some(now);
        entry.last_access = now;
        entry.revision += 1;
        entry.generation += 1;
    }

    /// Seeds an entry restored from the local mirror. It is served until the
    /// next fetch supersedes it, and never overrides data already present.
    pub fn hydrate(&mut self, key: CacheKey, value: CachedValue, now: Instant) -> bool {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry::empty(now));
        if entry.value.is_some() {
            return false;
        }
        entry.value = Some(value);
        entry.stale = true;
        entry.revision += 1;
        entry.generation += 1;
        true
    }

    /// Applies `transform` to one cached value. Returns the new revision when
    /// the transform reported a change.
    pub fn patch<F>(&mut self, key: &CacheKey, transform: F) -> Option<u64>
    where
        F: FnOnce(&mut CachedValue) -> bool,
    {
        let entry = self.entries.get_mut(key)?;
        let value = entry.value.as_mut()?;
        if !transform(value) {
            return None;
        }
        entry.revision += 1;
        Some(entry.revision)
    }

    /// Applies `transform` to every cached value whose key matches. Returns
    /// the keys that changed.
    pub fn patch_all<F>(&mut self, predicate: &KeyPredicate, mut transform: F) -> Vec<CacheKey>
    where
        F: FnMut(&CacheKey, &mut CachedValue) -> bool,
    {
        let mut changed = Vec::new();
        for (key, entry) in self
            .entries
            .iter_mut()
            .filter(|(key, _)| predicate.matches(key))
        {
            let Some(value) = entry.value.as_mut() else {
                continue;
            };
            if transform(key, value) {
                entry.revision += 1;
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Replaces a value with a previously captured snapshot.
    pub fn restore(&mut self, key: &CacheKey, value: CachedValue) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.value = Some(value);
        entry.revision += 1;
        true
    }

    /// Marks matching entries stale so the next read refetches them.
    pub fn invalidate(&mut self, predicate: &KeyPredicate) -> usize {
        let mut count = 0;
        for (_, entry) in self
            .entries
            .iter_mut()
            .filter(|(key, _)| predicate.matches(key))
        {
            entry.stale = true;
            count += 1;
        }
        count
    }

    /// Drops interest in running reads for matching keys; their results are
    /// discarded on arrival and the entries refetch on the next read.
    pub fn cancel_fetches(&mut self, predicate: &KeyPredicate) -> usize {
        let mut count = 0;
        for (_, entry) in self
            .entries
            .iter_mut()
            .filter(|(key, _)| predicate.matches(key))
        {
            if entry.in_flight.take().is_some() {
                entry.stale = true;
                count += 1;
            }
        }
        count
    }

    /// Gives up on `request_id` if it is still the running read for `key`.
    pub fn abandon_fetch(&mut self, key: &CacheKey, request_id: RequestId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.in_flight != Some(request_id) {
            return false;
        }
        entry.in_flight = None;
        entry.stale = true;
        true
    }

    /// Finds a track in its own entry or in any cached list page.
    pub fn find_track(&self, id: &str) -> Option<Track> {
        if let Some(CachedValue::Track(Some(track))) = self.value(&CacheKey::track(id)) {
            return Some(track.clone());
        }
        self.entries
            .iter()
            .filter(|(key, _)| key.namespace == CacheNamespace::TrackList)
            .filter_map(|(_, entry)| entry.value.as_ref())
            .flat_map(CachedValue::tracks)
            .find(|track| track.id == id)
            .cloned()
    }

    /// Sorted distinct artists across every cached list page.
    pub fn artists(&self) -> Vec<String> {
        let artists: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|(key, _)| key.namespace == CacheNamespace::TrackList)
            .filter_map(|(_, entry)| entry.value.as_ref())
            .flat_map(CachedValue::tracks)
            .map(|track| track.artist.clone())
            .filter(|artist| !artist.is_empty())
            .collect();
        artists.into_iter().collect()
    }

    /// Evicts entries that are idle, not being fetched and not `keep`.
    pub fn collect_garbage(&mut self, now: Instant, idle: Duration, keep: &CacheKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            entry.in_flight.is_some()
                || key == keep
                || now.saturating_duration_since(entry.last_access) < idle
        });
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        CacheKey, CacheNamespace, CachedValue, FetchAction, FetchCompletion, Freshness,
        KeyPredicate, TrackCache,
    };
    use crate::error::CatalogError;
    use crate::protocol::{PageMeta, Track, TracksPage};
    use crate::query_state::QueryState;

    fn track(id: &str, artist: &str) -> Track {
        Track {
            id: id.to_string(),
            title: format!("Title {id}"),
            artist: artist.to_string(),
            album: None,
            genres: vec!["Rock".to_string()],
            cover_image: None,
            audio_file: None,
        }
    }

    fn page(tracks: Vec<Track>, page: u32) -> CachedValue {
        CachedValue::TrackList(TracksPage {
            meta: PageMeta {
                total: tracks.len() as u64,
                page,
                limit: 10,
                total_pages: 1,
            },
            data: tracks,
        })
    }

    fn list_key(address: &str) -> CacheKey {
        CacheKey::track_list(&QueryState::decode(address))
    }

    #[test]
    fn test_concurrent_reads_coalesce_into_one_request() {
        let mut cache = TrackCache::default();
        let key = list_key("page=1");
        let now = Instant::now();

        let first = cache.plan_fetch(&key, 1, now);
        assert_eq!(first.action, FetchAction::Issue(1));
        assert_eq!(first.cached, None);

        let second = cache.plan_fetch(&key, 2, now);
        assert_eq!(second.action, FetchAction::Join(1));
    }

    #[test]
    fn test_unanswered_request_is_replaced_after_abandon_window() {
        let mut cache = TrackCache::default().with_abandon_after(Duration::from_secs(30));
        let key = list_key("page=1");
        let start = Instant::now();

        assert_eq!(cache.plan_fetch(&key, 1, start).action, FetchAction::Issue(1));
        assert_eq!(
            cache
                .plan_fetch(&key, 2, start + Duration::from_secs(29))
                .action,
            FetchAction::Join(1)
        );
        assert_eq!(
            cache
                .plan_fetch(&key, 3, start + Duration::from_secs(30))
                .action,
            FetchAction::Issue(3)
        );

        let late = cache.complete_fetch(
            &key,
            1,
            Ok(page(vec![track("a", "Band")], 1)),
            start + Duration::from_secs(31),
        );
        assert_eq!(late, FetchCompletion::Discarded);
        assert_eq!(cache.entry(&key).and_then(|entry| entry.in_flight()), Some(3));
    }

    #[test]
    fn test_abandoned_fetch_lets_next_read_issue() {
        let mut cache = TrackCache::default();
        let key = list_key("page=1");
        let now = Instant::now();
        cache.plan_fetch(&key, 1, now);

        assert!(!cache.abandon_fetch(&key, 7));
        assert!(cache.abandon_fetch(&key, 1));
        assert_eq!(cache.plan_fetch(&key, 2, now).action, FetchAction::Issue(2));
    }

    #[test]
    fn test_fresh_value_is_served_without_request_and_stale_value_revalidates() {
        let mut cache = TrackCache::new(Freshness {
            track_list: Duration::from_secs(60),
            ..Freshness::default()
        });
        let key = list_key("page=1");
        let start = Instant::now();
        cache.plan_fetch(&key, 1, start);
        cache.complete_fetch(&key, 1, Ok(page(vec![track("a", "A")], 1)), start);

        let fresh = cache.plan_fetch(&key, 2, start + Duration::from_secs(10));
        assert_eq!(fresh.action, FetchAction::UseCached);

        let stale = cache.plan_fetch(&key, 3, start + Duration::from_secs(61));
        assert_eq!(stale.action, FetchAction::Issue(3));
        assert_eq!(stale.cached, Some(page(vec![track("a", "A")], 1)));
    }

    #[test]
    fn test_failed_refresh_keeps_previous_value_and_records_error() {
        let mut cache = TrackCache::default();
        let key = list_key("page=1");
        let now = Instant::now();
        cache.plan_fetch(&key, 1, now);
        cache.complete_fetch(&key, 1, Ok(page(vec![track("a", "A")], 1)), now);
        cache.invalidate(&KeyPredicate::Any);

        let plan = cache.plan_fetch(&key, 2, now);
        assert_eq!(plan.action, FetchAction::Issue(2));
        let completion = cache.complete_fetch(
            &key,
            2,
            Err(CatalogError::Network("offline".to_string())),
            now,
        );
        assert_eq!(completion, FetchCompletion::Failed);

        let entry = cache.entry(&key).expect("entry should remain");
        assert_eq!(entry.value(), Some(&page(vec![track("a", "A")], 1)));
        assert!(entry.error().is_some());
        assert_eq!(entry.in_flight(), None);
    }

    #[test]
    fn test_patch_all_touches_every_matching_page() {
        let mut cache = TrackCache::default();
        let now = Instant::now();
        let first = list_key("page=1");
        let filtered = list_key("genre=Rock");
        cache.insert(first.clone(), page(vec![track("a", "A"), track("x", "X")], 1), now);
        cache.insert(filtered.clone(), page(vec![track("x", "X")], 1), now);
        cache.insert(CacheKey::genres(), CachedValue::Genres(vec!["Rock".to_string()]), now);

        let changed = cache.patch_all(
            &KeyPredicate::Namespace(CacheNamespace::TrackList),
            |_, value| match value {
                CachedValue::TrackList(page) => {
                    let before = page.data.len();
                    page.data.retain(|track| track.id != "x");
                    page.data.len() != before
                }
                _ => false,
            },
        );

        assert_eq!(changed.len(), 2);
        assert!(!cache.value(&first).expect("page").contains_track("x"));
        assert!(!cache.value(&filtered).expect("page").contains_track("x"));
    }

    #[test]
    fn test_cancelled_fetch_result_is_discarded() {
        let mut cache = TrackCache::default();
        let key = list_key("page=2");
        let now = Instant::now();
        cache.plan_fetch(&key, 7, now);

        assert_eq!(
            cache.cancel_fetches(&KeyPredicate::Namespace(CacheNamespace::TrackList)),
            1
        );
        let completion = cache.complete_fetch(&key, 7, Ok(page(vec![track("x", "X")], 2)), now);
        assert_eq!(completion, FetchCompletion::Discarded);
        assert_eq!(cache.value(&key), None);
        assert_eq!(cache.plan_fetch(&key, 8, now).action, FetchAction::Issue(8));
    }

    #[test]
    fn test_find_track_prefers_entity_entry_then_list_pages() {
        let mut cache = TrackCache::default();
        let now = Instant::now();
        cache.insert(list_key("page=1"), page(vec![track("a", "A")], 1), now);
        assert_eq!(cache.find_track("a").map(|t| t.artist), Some("A".to_string()));

        let mut updated = track("a", "Renamed");
        updated.title = "Solo".to_string();
        cache.insert(CacheKey::track("a"), CachedValue::Track(Some(updated)), now);
        assert_eq!(cache.find_track("a").map(|t| t.artist), Some("Renamed".to_string()));
        assert_eq!(cache.find_track("missing"), None);
    }

    #[test]
    fn test_artists_are_sorted_and_distinct() {
        let mut cache = TrackCache::default();
        let now = Instant::now();
        cache.insert(list_key("page=1"), page(vec![track("a", "Zed"), track("b", "Abba")], 1), now);
        cache.insert(list_key("page=2"), page(vec![track("c", "Abba")], 2), now);
        assert_eq!(cache.artists(), vec!["Abba".to_string(), "Zed".to_string()]);
    }

    #[test]
    fn test_hydrated_entry_is_stale_and_does_not_override_live_data() {
        let mut cache = TrackCache::default();
        let key = list_key("page=1");
        let now = Instant::now();
        assert!(cache.hydrate(key.clone(), page(vec![track("a", "A")], 1), now));
        assert!(cache.entry(&key).expect("entry").is_stale());
        assert_eq!(cache.plan_fetch(&key, 1, now).action, FetchAction::Issue(1));
        assert!(!cache.hydrate(key, page(vec![], 1), now));
    }

    #[test]
    fn test_garbage_collection_spares_in_flight_and_kept_keys() {
        let mut cache = TrackCache::default();
        let start = Instant::now();
        let kept = list_key("page=1");
        let idle = list_key("page=2");
        let running = list_key("page=3");
        cache.insert(kept.clone(), page(vec![], 1), start);
        cache.insert(idle.clone(), page(vec![], 2), start);
        cache.plan_fetch(&running, 1, start);

        let removed = cache.collect_garbage(
            start + Duration::from_secs(600),
            Duration::from_secs(300),
            &kept,
        );
        assert_eq!(removed, 1);
        assert!(cache.entry(&kept).is_some());
        assert!(cache.entry(&idle).is_none());
        assert!(cache.entry(&running).is_some());
    }
}
