//! Address-encoded list query state.
//!
//! The navigable address is the single source of truth for paging, sorting and
//! filtering. This module decodes an address into a fully populated
//! [`QueryState`], encodes patches back into addresses, keeps the address
//! history and debounces free-text search before it reaches the address.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 100;
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(400);

/// Column the server sorts the track list by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortKey {
    #[serde(rename = "title")]
    Title,
    #[serde(rename = "artist")]
    Artist,
    #[serde(rename = "album")]
    Album,
    #[default]
    #[serde(rename = "createdAt")]
    CreatedAt,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Title => "title",
            SortKey::Artist => "artist",
            SortKey::Album => "album",
            SortKey::CreatedAt => "createdAt",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "title" => Some(SortKey::Title),
            "artist" => Some(SortKey::Artist),
            "album" => Some(SortKey::Album),
            "createdAt" => Some(SortKey::CreatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

/// Decoded list query. Always fully populated with valid values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryState {
    pub page: u32,
    pub limit: u32,
    pub search: String,
    pub sort: SortKey,
    pub order: SortOrder,
    /// Exact-match genre filter; empty means unconstrained.
    pub genre: String,
    /// Artist filter; empty means unconstrained.
    pub artist: String,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
            search: String::new(),
            sort: SortKey::default(),
            order: SortOrder::default(),
            genre: String::new(),
            artist: String::new(),
        }
    }
}

/// Partial query state; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPatch {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub sort: Option<SortKey>,
    pub order: Option<SortOrder>,
    pub genre: Option<String>,
    pub artist: Option<String>,
}

impl QueryPatch {
    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            ..Self::default()
        }
    }

    /// True when the patch narrows or reorders the result set, which makes the
    /// current page number meaningless.
    pub fn changes_result_set(&self) -> bool {
        self.limit.is_some()
            || self.search.is_some()
            || self.sort.is_some()
            || self.order.is_some()
            || self.genre.is_some()
            || self.artist.is_some()
    }
}

fn parse_page(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|page| *page >= 1)
}

fn parse_limit(raw: &str) -> Option<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|limit| (1..=MAX_LIMIT).contains(limit))
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|value| value.into_owned())
}

fn query_part(address: &str) -> &str {
    let without_fragment = address.split('#').next().unwrap_or_default();
    match without_fragment.split_once('?') {
        Some((_, query)) => query,
        None if without_fragment.contains('=') => without_fragment,
        None => "",
    }
}

impl QueryState {
    /// Decodes an address. Each field is parsed independently and replaced by
    /// its default when missing or malformed; this never fails.
    pub fn decode(address: &str) -> Self {
        let mut state = Self::default();
        let mut seen: Vec<&str> = Vec::new();
        for pair in query_part(address).split('&').filter(|pair| !pair.is_empty()) {
            let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let Some(value) = decode_component(raw_value) else {
                continue;
            };
            match key {
                "page" => state.page = parse_page(&value).unwrap_or(DEFAULT_PAGE),
                "limit" => state.limit = parse_limit(&value).unwrap_or(DEFAULT_LIMIT),
                "search" => state.search = value,
                "sort" => state.sort = SortKey::parse(&value).unwrap_or_default(),
                "order" => state.order = SortOrder::parse(&value).unwrap_or_default(),
                "genre" => state.genre = value,
                "artist" => state.artist = value,
                _ => {}
            }
        }
        state
    }

    /// Shallow merge: fields present in `patch` replace the current ones.
    pub fn merged(&self, patch: &QueryPatch) -> Self {
        Self {
            page: patch.page.unwrap_or(self.page),
            limit: patch.limit.unwrap_or(self.limit),
            search: patch.search.clone().unwrap_or_else(|| self.search.clone()),
            sort: patch.sort.unwrap_or(self.sort),
            order: patch.order.unwrap_or(self.order),
            genre: patch.genre.clone().unwrap_or_else(|| self.genre.clone()),
            artist: patch.artist.clone().unwrap_or_else(|| self.artist.clone()),
        }
    }

    /// Merges `patch` over `current` and serializes the result as an address
    /// query string.
    pub fn encode(patch: &QueryPatch, current: &QueryState) -> String {
        current.merged(patch).to_address()
    }

    /// Address query string. Empty text fields are omitted.
    pub fn to_address(&self) -> String {
        let mut parts = vec![
            format!("page={}", self.page),
            format!("limit={}", self.limit),
        ];
        if !self.search.is_empty() {
            parts.push(format!("search={}", urlencoding::encode(&self.search)));
        }
        parts.push(format!("sort={}", self.sort.as_str()));
        parts.push(format!("order={}", self.order.as_str()));
        if !self.genre.is_empty() {
            parts.push(format!("genre={}", urlencoding::encode(&self.genre)));
        }
        if !self.artist.is_empty() {
            parts.push(format!("artist={}", urlencoding::encode(&self.artist)));
        }
        parts.join("&")
    }

    /// Normalized serialization of every field, used as the list cache key.
    pub fn fingerprint(&self) -> String {
        format!(
            "page={}&limit={}&search={}&sort={}&order={}&genre={}&artist={}",
            self.page,
            self.limit,
            urlencoding::encode(&self.search),
            self.sort.as_str(),
            self.order.as_str(),
            urlencoding::encode(&self.genre),
            urlencoding::encode(&self.artist),
        )
    }

    /// Query pairs for `GET /tracks`. Empty filters are left out.
    pub fn to_api_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("page".to_string(), self.page.to_string()),
            ("limit".to_string(), self.limit.to_string()),
            ("sort".to_string(), self.sort.as_str().to_string()),
            ("order".to_string(), self.order.as_str().to_string()),
        ];
        for (key, value) in [
            ("search", &self.search),
            ("genre", &self.genre),
            ("artist", &self.artist),
        ] {
            if !value.is_empty() {
                params.push((key.to_string(), value.clone()));
            }
        }
        params
    }
}

/// Address history owned on behalf of the routing collaborator.
///
/// Navigation is the only way query state changes; the state itself is
/// re-decoded from the current address on every read.
#[derive(Debug, Clone)]
pub struct Navigator {
    entries: Vec<String>,
    cursor: usize,
}

impl Navigator {
    pub fn new(initial_address: &str) -> Self {
        Self {
            entries: vec![QueryState::decode(initial_address).to_address()],
            cursor: 0,
        }
    }

    pub fn current_address(&self) -> &str {
        &self.entries[self.cursor]
    }

    pub fn current(&self) -> QueryState {
        QueryState::decode(self.current_address())
    }

    /// Pushes `address` (normalized) and drops any forward history. Returns
    /// false when the address is unchanged.
    pub fn navigate(&mut self, address: &str) -> bool {
        let normalized = QueryState::decode(address).to_address();
        if normalized == self.current_address() {
            return false;
        }
        self.entries.truncate(self.cursor + 1);
        self.entries.push(normalized);
        self.cursor = self.entries.len() - 1;
        true
    }

    /// Applies a patch. Result-set changes without an explicit page go back to
    /// page 1.
    pub fn patch(&mut self, patch: &QueryPatch) -> bool {
        let mut effective = patch.clone();
        if effective.page.is_none() && effective.changes_result_set() {
            effective.page = Some(DEFAULT_PAGE);
        }
        let address = QueryState::encode(&effective, &self.current());
        self.navigate(&address)
    }

    pub fn back(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        true
    }

    pub fn forward(&mut self) -> bool {
        if self.cursor + 1 >= self.entries.len() {
            return false;
        }
        self.cursor += 1;
        true
    }
}

/// Coalesces search keystrokes so only the last value within a window is
/// committed to the address.
#[derive(Debug, Clone)]
pub struct SearchDebouncer {
    window: Duration,
    generation: u64,
    pending: Option<String>,
}

impl SearchDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: 0,
            pending: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a keystroke and returns the generation its timer must report.
    pub fn push(&mut self, value: String) -> u64 {
        self.generation = self.generation.saturating_add(1);
        self.pending = Some(value);
        self.generation
    }

    /// Called when the timer for `generation` fires. Yields the pending value
    /// only if no newer keystroke arrived in the meantime.
    pub fn elapsed(&mut self, generation: u64) -> Option<String> {
        if generation != self.generation {
            return None;
        }
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Navigator, QueryPatch, QueryState, SearchDebouncer, SortKey, SortOrder, DEFAULT_LIMIT,
        DEFAULT_SEARCH_DEBOUNCE,
    };

    #[test]
    fn test_decode_empty_address_yields_defaults() {
        let state = QueryState::decode("");
        assert_eq!(state, QueryState::default());
        assert_eq!(state.page, 1);
        assert_eq!(state.limit, 10);
        assert_eq!(state.sort, SortKey::CreatedAt);
        assert_eq!(state.order, SortOrder::Asc);
    }

    #[test]
    fn test_decode_replaces_each_malformed_field_independently() {
        let state = QueryState::decode(
            "/tracks?page=0&limit=500&search=rock&sort=bpm&order=sideways&genre=Jazz",
        );
        assert_eq!(state.page, 1);
        assert_eq!(state.limit, DEFAULT_LIMIT);
        assert_eq!(state.search, "rock");
        assert_eq!(state.sort, SortKey::CreatedAt);
        assert_eq!(state.order, SortOrder::Asc);
        assert_eq!(state.genre, "Jazz");
        assert_eq!(state.artist, "");
    }

    #[test]
    fn test_decode_handles_percent_plus_and_repeated_keys() {
        let state = QueryState::decode("?search=Daft+Punk%21&page=3&page=9&artist=AC%2FDC");
        assert_eq!(state.search, "Daft Punk!");
        assert_eq!(state.page, 3);
        assert_eq!(state.artist, "AC/DC");
    }

    #[test]
    fn test_decode_ignores_non_numeric_page_and_fragment() {
        let state = QueryState::decode("page=abc&limit=25#top");
        assert_eq!(state.page, 1);
        assert_eq!(state.limit, 25);
    }

    #[test]
    fn test_encode_round_trips_merged_state() {
        let current = QueryState {
            page: 4,
            limit: 20,
            search: "blue & green".to_string(),
            sort: SortKey::Title,
            order: SortOrder::Desc,
            genre: String::new(),
            artist: "Miles Davis".to_string(),
        };
        let patches = [
            QueryPatch::default(),
            QueryPatch::page(7),
            QueryPatch {
                genre: Some("Hip Hop".to_string()),
                search: Some(String::new()),
                ..QueryPatch::default()
            },
            QueryPatch {
                sort: Some(SortKey::Album),
                order: Some(SortOrder::Asc),
                limit: Some(100),
                artist: Some(String::new()),
                ..QueryPatch::default()
            },
        ];
        for patch in patches {
            let address = QueryState::encode(&patch, &current);
            assert_eq!(QueryState::decode(&address), current.merged(&patch));
        }
    }

    #[test]
    fn test_fingerprint_distinguishes_empty_and_absent_filters_consistently() {
        let a = QueryState::decode("page=1&genre=");
        let b = QueryState::decode("");
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = QueryState::decode("genre=Rock");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_api_params_omit_empty_filters() {
        let state = QueryState::decode("search=x&genre=");
        let keys: Vec<String> = state
            .to_api_params()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["page", "limit", "sort", "order", "search"]);
    }

    #[test]
    fn test_navigator_filter_patch_resets_page_and_history_works() {
        let mut navigator = Navigator::new("page=3");
        assert_eq!(navigator.current().page, 3);

        assert!(navigator.patch(&QueryPatch {
            genre: Some("Rock".to_string()),
            ..QueryPatch::default()
        }));
        assert_eq!(navigator.current().page, 1);
        assert_eq!(navigator.current().genre, "Rock");

        assert!(navigator.patch(&QueryPatch::page(2)));
        assert_eq!(navigator.current().page, 2);
        assert!(!navigator.patch(&QueryPatch::page(2)));

        assert!(navigator.back());
        assert_eq!(navigator.current().page, 1);
        assert!(navigator.back());
        assert_eq!(navigator.current().page, 3);
        assert!(!navigator.back());
        assert!(navigator.forward());
        assert_eq!(navigator.current().genre, "Rock");

        navigator.navigate("page=5");
        assert!(!navigator.forward());
    }

    #[test]
    fn test_debouncer_commits_only_latest_generation() {
        let mut debouncer = SearchDebouncer::new(DEFAULT_SEARCH_DEBOUNCE);
        let first = debouncer.push("r".to_string());
        let second = debouncer.push("ro".to_string());
        let third = debouncer.push("roc".to_string());

        assert_eq!(debouncer.elapsed(first), None);
        assert_eq!(debouncer.elapsed(second), None);
        assert_eq!(debouncer.elapsed(third), Some("roc".to_string()));
        assert_eq!(debouncer.elapsed(third), None);
    }
}
