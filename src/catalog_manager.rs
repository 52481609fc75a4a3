//! Catalog runtime coordinator.
//!
//! This manager is the bus-owned single writer for the remote collection
//! cache, in-flight mutations, the playback token, bulk selection and the
//! address history. Network calls are delegated to the remote worker and come
//! back as `RemoteMessage::Completed`; everything else happens synchronously
//! on the manager thread.

use std::collections::{BTreeSet, HashMap};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::config::Config;
use crate::db_manager::{unix_now, DbManager};
use crate::error::CatalogError;
use crate::media_uri::media_file_url;
use crate::mutation_coordinator::{
    MutationCoordinator, MutationId, MutationKind, MutationState, MutationTicket, UploadPolicy,
};
use crate::playback_arbiter::PlaybackArbiter;
use crate::protocol::{
    ApiCall, ApiResponse, CatalogMessage, ListView, Message, PlaybackMessage, QueryMessage,
    RemoteMessage, RequestId, SelectionMessage, TrackId,
};
use crate::query_state::{Navigator, QueryPatch, SearchDebouncer};
use crate::selection_store::SelectionStore;
use crate::track_cache::{
    CacheEntry, CacheKey, CacheNamespace, CachedValue, FetchAction, FetchCompletion, Freshness,
    KeyPredicate, TrackCache,
};

/// Runtime knobs derived from `Config`.
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub api_base: String,
    pub initial_address: String,
    pub freshness: Freshness,
    pub gc_idle: Duration,
    pub search_debounce: Duration,
    pub upload_policy: UploadPolicy,
    pub retention_days: u32,
    /// Requests unanswered for this long are given up on.
    pub abandon_after: Duration,
}

impl CatalogSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_base: config.api.base_url.clone(),
            initial_address: String::new(),
            freshness: config.cache.freshness(),
            gc_idle: config.cache.gc_idle(),
            search_debounce: config.query.search_debounce(),
            upload_policy: config.upload.policy(),
            retention_days: config.cache.retention_days,
            abandon_after: config.api.abandon_after(),
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone)]
enum PendingRequest {
    Fetch(CacheKey),
    Mutation(MutationId),
}

/// Coordinates catalog state and snapshot fan-out over the event bus.
pub struct CatalogManager {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    cache: TrackCache,
    coordinator: MutationCoordinator,
    arbiter: PlaybackArbiter,
    selection: SelectionStore,
    navigator: Navigator,
    debouncer: SearchDebouncer,
    db_manager: Option<DbManager>,
    api_base: String,
    gc_idle: Duration,
    retention_days: u32,
    abandon_after: Duration,
    next_request_id: RequestId,
    /// Requests awaiting completion, with the time they were sent.
    pending_requests: HashMap<RequestId, (PendingRequest, Instant)>,
    /// Bulk deletes started from the selection; the selection clears when
    /// one of them commits.
    selection_deletes: BTreeSet<MutationId>,
    last_artists: Vec<String>,
}

impl CatalogManager {
    /// Creates a manager bound to bus channels.
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        settings: CatalogSettings,
        db_manager: Option<DbManager>,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            cache: TrackCache::new(settings.freshness)
                .with_abandon_after(settings.abandon_after),
            coordinator: MutationCoordinator::new(settings.upload_policy),
            arbiter: PlaybackArbiter::new(),
            selection: SelectionStore::new(),
            navigator: Navigator::new(&settings.initial_address),
            debouncer: SearchDebouncer::new(settings.search_debounce),
            db_manager,
            api_base: settings.api_base,
            gc_idle: settings.gc_idle,
            retention_days: settings.retention_days,
            abandon_after: settings.abandon_after,
            next_request_id: 1,
            pending_requests: HashMap::new(),
            selection_deletes: BTreeSet::new(),
            last_artists: Vec::new(),
        }
    }

    /// Prunes expired mirror rows and seeds the cache with the rest as stale
    /// entries.
    pub fn restore_from_mirror(&mut self) {
        let Some(db_manager) = &self.db_manager else {
            return;
        };
        match db_manager.prune_retention(unix_now(), self.retention_days) {
            Ok(0) => {}
            Ok(removed) => info!("CatalogManager: pruned {} expired cache rows", removed),
            Err(err) => warn!("CatalogManager: failed to prune cache mirror: {}", err),
        }
        let entries = match db_manager.load_entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("CatalogManager: failed to load cache mirror: {}", err);
                return;
            }
        };
        let now = Instant::now();
        let mut restored = 0usize;
        for entry in entries {
            if self.cache.hydrate(entry.key, entry.value, now) {
                restored += 1;
            }
        }
        info!("CatalogManager: restored {} cached entries", restored);
    }

    fn send(&self, message: Message) {
        let _ = self.bus_producer.send(message);
    }

    fn allocate_request_id(&mut self) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.saturating_add(1);
        request_id
    }

    fn send_request(&mut self, pending: PendingRequest, call: ApiCall) -> RequestId {
        let request_id = self.allocate_request_id();
        debug!("CatalogManager: request {} for {:?}", request_id, pending);
        self.pending_requests
            .insert(request_id, (pending, Instant::now()));
        self.send(Message::Remote(RemoteMessage::Request { request_id, call }));
        request_id
    }

    /// Plans a read of `key` and sends `call` if the cache asks for it.
    fn fetch(&mut self, key: &CacheKey, call: ApiCall) -> (Option<CachedValue>, FetchAction) {
        let candidate = self.next_request_id;
        let plan = self.cache.plan_fetch(key, candidate, Instant::now());
        if plan.action == FetchAction::Issue(candidate) {
            self.send_request(PendingRequest::Fetch(key.clone()), call);
        }
        (plan.cached, plan.action)
    }

    fn current_list_key(&self) -> CacheKey {
        CacheKey::track_list(&self.navigator.current())
    }

    fn list_view(&self) -> ListView {
        let query = self.navigator.current();
        let entry = self.cache.entry(&CacheKey::track_list(&query));
        let page = match entry.and_then(CacheEntry::value) {
            Some(CachedValue::TrackList(page)) => Some(page),
            _ => None,
        };
        let is_fetching = entry.is_some_and(|entry| entry.in_flight().is_some());
        ListView {
            query,
            tracks: page.map(|page| page.data.clone()).unwrap_or_default(),
            meta: page.map(|page| page.meta),
            is_loading: page.is_none() && is_fetching,
            is_fetching,
            error: entry.and_then(|entry| entry.error().cloned()),
        }
    }

    fn emit_list_view(&self) {
        self.send(Message::Catalog(CatalogMessage::ListUpdated(
            self.list_view(),
        )));
    }

    fn emit_artists(&mut self) {
        let artists = self.cache.artists();
        if artists == self.last_artists {
            return;
        }
        self.last_artists = artists.clone();
        self.send(Message::Catalog(CatalogMessage::ArtistsUpdated(artists)));
    }

    fn emit_selection(&self) {
        self.send(Message::Selection(SelectionMessage::Changed {
            mode: self.selection.mode(),
            selected: self.selection.selected().clone(),
        }));
    }

    fn emit_active_track(&self) {
        let track_id = self.arbiter.active().map(ToOwned::to_owned);
        let media_url = track_id
            .as_deref()
            .and_then(|id| self.cache.find_track(id))
            .and_then(|track| track.audio_file)
            .and_then(|audio_file| media_file_url(&self.api_base, &audio_file));
        self.send(Message::Playback(PlaybackMessage::ActiveTrackChanged {
            track_id,
            media_url,
        }));
    }

    fn mirror_entry(&self, key: &CacheKey) {
        let Some(db_manager) = &self.db_manager else {
            return;
        };
        let Some(value) = self.cache.value(key) else {
            return;
        };
        if let Err(err) = db_manager.save_entry(key, value, unix_now()) {
            warn!(
                "CatalogManager: failed to mirror {} entry: {}",
                key.namespace.as_str(),
                err
            );
        }
    }

    /// Drops mirrored rows that still list any of `ids`, including rows of
    /// entries already evicted from memory.
    fn forget_mirrored_tracks(&self, ids: &[TrackId]) {
        let Some(db_manager) = &self.db_manager else {
            return;
        };
        let entries = match db_manager.load_entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("CatalogManager: failed to read cache mirror: {}", err);
                return;
            }
        };
        for entry in entries {
            if !ids.iter().any(|id| entry.value.contains_track(id)) {
                continue;
            }
            if let Err(err) = db_manager.delete_entry(&entry.key) {
                warn!(
                    "CatalogManager: failed to drop mirrored {} entry: {}",
                    entry.key.namespace.as_str(),
                    err
                );
            }
        }
    }

    fn mirror_namespace(&self, namespace: CacheNamespace) {
        if self.db_manager.is_none() {
            return;
        }
        for key in self
            .cache
            .keys_matching(&KeyPredicate::Namespace(namespace))
        {
            self.mirror_entry(&key);
        }
    }

    // Query state

    fn on_address_changed(&mut self) {
        let address = self.navigator.current_address().to_string();
        let state = self.navigator.current();
        info!("CatalogManager: address is now '{}'", address);
        self.send(Message::Query(QueryMessage::AddressChanged { address, state }));
        self.refresh_list();
    }

    fn navigate(&mut self, address: &str) {
        if self.navigator.navigate(address) {
            self.on_address_changed();
        }
    }

    fn patch_query(&mut self, patch: &QueryPatch) {
        if self.navigator.patch(patch) {
            self.on_address_changed();
        }
    }

    fn search_input(&mut self, value: String) {
        let generation = self.debouncer.push(value);
        let window = self.debouncer.window();
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || {
            thread::sleep(window);
            let _ = bus_producer.send(Message::Query(QueryMessage::SearchDebounceElapsed {
                generation,
            }));
        });
    }

    fn search_debounce_elapsed(&mut self, generation: u64) {
        let Some(search) = self.debouncer.elapsed(generation) else {
            return;
        };
        self.patch_query(&QueryPatch {
            search: Some(search),
            page: Some(1),
            ..QueryPatch::default()
        });
    }

    fn handle_query_message(&mut self, message: QueryMessage) {
        match message {
            QueryMessage::Navigate(address) => self.navigate(&address),
            QueryMessage::PatchQuery(patch) => self.patch_query(&patch),
            QueryMessage::SearchInput(value) => self.search_input(value),
            QueryMessage::SearchDebounceElapsed { generation } => {
                self.search_debounce_elapsed(generation)
            }
            QueryMessage::Back => {
                if self.navigator.back() {
                    self.on_address_changed();
                }
            }
            QueryMessage::Forward => {
                if self.navigator.forward() {
                    self.on_address_changed();
                }
            }
            QueryMessage::AddressChanged { .. } => {}
        }
    }

    // Reads

    fn refresh_list(&mut self) {
        let query = self.navigator.current();
        let key = CacheKey::track_list(&query);
        let _ = self.fetch(&key, ApiCall::ListTracks(query));
        let evicted = self
            .cache
            .collect_garbage(Instant::now(), self.gc_idle, &key);
        if evicted > 0 {
            debug!("CatalogManager: evicted {} idle cache entries", evicted);
        }
        self.emit_list_view();
    }

    fn load_genres(&mut self) {
        let (cached, _) = self.fetch(&CacheKey::genres(), ApiCall::Genres);
        if let Some(CachedValue::Genres(genres)) = cached {
            self.send(Message::Catalog(CatalogMessage::GenresUpdated(genres)));
        }
    }

    fn load_track(&mut self, id: TrackId) {
        if let Some(track) = self.cache.find_track(&id) {
            self.send(Message::Catalog(CatalogMessage::TrackLoaded {
                id,
                track: Some(track),
            }));
            return;
        }
        let key = CacheKey::track(&id);
        let (cached, action) = self.fetch(&key, ApiCall::GetTrack(id.clone()));
        if action == FetchAction::UseCached {
            if let Some(CachedValue::Track(track)) = cached {
                self.send(Message::Catalog(CatalogMessage::TrackLoaded { id, track }));
            }
        }
    }

    /// Navigates to the last page when the current one no longer exists.
    fn clamp_page_to_results(&mut self) -> bool {
        let query = self.navigator.current();
        let Some(CachedValue::TrackList(page)) = self.cache.value(&CacheKey::track_list(&query))
        else {
            return false;
        };
        let total_pages = page.meta.total_pages;
        if total_pages == 0 || query.page <= total_pages {
            return false;
        }
        info!(
            "CatalogManager: page {} is past the last page {}, moving there",
            query.page, total_pages
        );
        if self.navigator.patch(&QueryPatch::page(total_pages)) {
            self.on_address_changed();
            return true;
        }
        false
    }

    fn on_fetch_completed(
        &mut self,
        key: CacheKey,
        request_id: RequestId,
        outcome: Result<ApiResponse, CatalogError>,
    ) {
        let value = outcome.and_then(|response| {
            CachedValue::from_response(key.namespace, response).ok_or_else(|| {
                CatalogError::Decode(format!(
                    "unexpected response for {} request",
                    key.namespace.as_str()
                ))
            })
        });
        match self
            .cache
            .complete_fetch(&key, request_id, value, Instant::now())
        {
            FetchCompletion::Discarded => return,
            FetchCompletion::Stored => {
                self.mirror_entry(&key);
                self.coordinator.reapply_pending(&mut self.cache, &key);
            }
            FetchCompletion::Failed => {
                if let Some(error) = self.cache.entry(&key).and_then(CacheEntry::error) {
                    warn!(
                        "CatalogManager: {} fetch failed: {}",
                        key.namespace.as_str(),
                        error
                    );
                }
            }
        }

        match key.namespace {
            CacheNamespace::TrackList => {
                if key == self.current_list_key() && !self.clamp_page_to_results() {
                    self.emit_list_view();
                }
                self.emit_artists();
            }
            CacheNamespace::Genres => {
                if let Some(CachedValue::Genres(genres)) = self.cache.value(&key) {
                    self.send(Message::Catalog(CatalogMessage::GenresUpdated(
                        genres.clone(),
                    )));
                }
            }
            CacheNamespace::Track => {
                let track = match self.cache.value(&key) {
                    Some(CachedValue::Track(track)) => track.clone(),
                    _ => None,
                };
                self.send(Message::Catalog(CatalogMessage::TrackLoaded {
                    id: key.params.clone(),
                    track,
                }));
            }
        }
    }

    // Mutations

    fn dispatch_mutation(
        &mut self,
        kind: MutationKind,
        ticket: Result<MutationTicket, CatalogError>,
    ) -> Option<MutationId> {
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(error) => {
                warn!("CatalogManager: {:?} rejected: {}", kind, error);
                self.send(Message::Catalog(CatalogMessage::MutationRejected {
                    kind,
                    error,
                }));
                return None;
            }
        };
        let MutationTicket { id, call } = ticket;
        self.send_request(PendingRequest::Mutation(id), call);
        if let Some(status) = self.coordinator.status(id).cloned() {
            self.send(Message::Catalog(CatalogMessage::MutationUpdated(status)));
        }
        self.emit_list_view();
        Some(id)
    }

    fn delete_selected(&mut self) {
        let ids: Vec<TrackId> = self.selection.selected().iter().cloned().collect();
        let ticket = self.coordinator.begin_bulk_delete(&mut self.cache, ids);
        if let Some(id) = self.dispatch_mutation(MutationKind::BulkDelete, ticket) {
            self.selection_deletes.insert(id);
        }
    }

    fn on_mutation_completed(
        &mut self,
        mutation_id: MutationId,
        outcome: Result<ApiResponse, CatalogError>,
    ) {
        let Some(status) =
            self.coordinator
                .complete(&mut self.cache, mutation_id, outcome, Instant::now())
        else {
            warn!(
                "CatalogManager: completion for unknown mutation #{}",
                mutation_id
            );
            return;
        };
        let from_selection = self.selection_deletes.remove(&mutation_id);

        if status.state == MutationState::Committed {
            if status.kind.removes_media() {
                let mut released = false;
                for target in &status.targets {
                    released |= self.arbiter.release(target).is_some();
                }
                if released {
                    self.emit_active_track();
                }
            }
            if from_selection {
                self.selection.clear();
                self.emit_selection();
            }
            if matches!(status.kind, MutationKind::Delete | MutationKind::BulkDelete) {
                self.forget_mirrored_tracks(&status.targets);
            }
            if matches!(status.kind, MutationKind::Update | MutationKind::UploadFile) {
                for id in &status.targets {
                    if let Some(track) = self.cache.find_track(id) {
                        self.send(Message::Catalog(CatalogMessage::TrackLoaded {
                            id: id.clone(),
                            track: Some(track),
                        }));
                    }
                }
            }
            self.mirror_namespace(CacheNamespace::TrackList);
            self.mirror_namespace(CacheNamespace::Track);
        }

        self.send(Message::Catalog(CatalogMessage::MutationUpdated(status)));
        self.refresh_list();
        self.emit_artists();
    }

    fn handle_catalog_message(&mut self, message: CatalogMessage) {
        match message {
            CatalogMessage::RefreshList => self.refresh_list(),
            CatalogMessage::LoadGenres => self.load_genres(),
            CatalogMessage::LoadTrack(id) => self.load_track(id),
            CatalogMessage::CreateTrack(draft) => {
                let ticket = self.coordinator.begin_create(&mut self.cache, draft);
                self.dispatch_mutation(MutationKind::Create, ticket);
            }
            CatalogMessage::UpdateTrack { id, patch } => {
                let ticket = self.coordinator.begin_update(&mut self.cache, id, patch);
                self.dispatch_mutation(MutationKind::Update, ticket);
            }
            CatalogMessage::DeleteTrack(id) => {
                let ticket = self.coordinator.begin_delete(&mut self.cache, id);
                self.dispatch_mutation(MutationKind::Delete, Ok(ticket));
            }
            CatalogMessage::BulkDelete(ids) => {
                let ticket = self.coordinator.begin_bulk_delete(&mut self.cache, ids);
                self.dispatch_mutation(MutationKind::BulkDelete, ticket);
            }
            CatalogMessage::DeleteSelected => self.delete_selected(),
            CatalogMessage::UploadFile { id, file } => {
                let ticket = self.coordinator.begin_upload(&mut self.cache, id, file);
                self.dispatch_mutation(MutationKind::UploadFile, ticket);
            }
            CatalogMessage::RemoveFile(id) => {
                let ticket = self.coordinator.begin_remove_file(&mut self.cache, id);
                self.dispatch_mutation(MutationKind::RemoveFile, Ok(ticket));
            }
            CatalogMessage::ListUpdated(_)
            | CatalogMessage::GenresUpdated(_)
            | CatalogMessage::ArtistsUpdated(_)
            | CatalogMessage::TrackLoaded { .. }
            | CatalogMessage::MutationUpdated(_)
            | CatalogMessage::MutationRejected { .. } => {}
        }
    }

    fn handle_remote_completed(
        &mut self,
        request_id: RequestId,
        outcome: Result<ApiResponse, CatalogError>,
    ) {
        match self.pending_requests.remove(&request_id) {
            Some((PendingRequest::Fetch(key), _)) => {
                self.on_fetch_completed(key, request_id, outcome)
            }
            Some((PendingRequest::Mutation(mutation_id), _)) => {
                self.on_mutation_completed(mutation_id, outcome)
            }
            None => debug!(
                "CatalogManager: ignoring completion of unknown request {}",
                request_id
            ),
        }
    }

    /// Gives up on requests whose completion never arrived, e.g. because the
    /// bus dropped it while this manager lagged. Lost reads are reissued on
    /// the next access; lost mutations roll back.
    fn expire_abandoned_requests(&mut self, now: Instant) {
        let mut expired: Vec<RequestId> = self
            .pending_requests
            .iter()
            .filter(|(_, (_, sent_at))| {
                now.saturating_duration_since(*sent_at) >= self.abandon_after
            })
            .map(|(request_id, _)| *request_id)
            .collect();
        expired.sort_unstable();
        let window_secs = self.abandon_after.as_secs();
        for request_id in expired {
            let Some((pending, _)) = self.pending_requests.remove(&request_id) else {
                continue;
            };
            warn!(
                "CatalogManager: request {} for {:?} got no answer, giving up",
                request_id, pending
            );
            match pending {
                PendingRequest::Fetch(key) => {
                    if self.cache.abandon_fetch(&key, request_id) && key == self.current_list_key()
                    {
                        self.emit_list_view();
                    }
                }
                PendingRequest::Mutation(mutation_id) => self.on_mutation_completed(
                    mutation_id,
                    Err(CatalogError::Network(format!(
                        "no response within {}s",
                        window_secs
                    ))),
                ),
            }
        }
    }

    // Playback

    fn activate(&mut self, id: TrackId) {
        if let Some(track) = self.cache.find_track(&id) {
            if !track.is_playable() {
                warn!("CatalogManager: track '{}' has no audio file to play", id);
                return;
            }
        }
        if self.arbiter.activate(id).is_some() {
            self.emit_active_track();
        }
    }

    fn handle_playback_message(&mut self, message: PlaybackMessage) {
        let changed = match message {
            PlaybackMessage::Activate(id) => {
                self.activate(id);
                false
            }
            PlaybackMessage::Deactivate => self.arbiter.deactivate().is_some(),
            PlaybackMessage::Ended(id) => self.arbiter.ended(&id).is_some(),
            PlaybackMessage::ActiveTrackChanged { .. } => false,
        };
        if changed {
            self.emit_active_track();
        }
    }

    // Selection

    fn handle_selection_message(&mut self, message: SelectionMessage) {
        match message {
            SelectionMessage::EnterMode => self.selection.enter_mode(),
            SelectionMessage::ExitMode => self.selection.exit_mode(),
            SelectionMessage::Toggle(id) => self.selection.toggle(id),
            SelectionMessage::SelectAll(ids) => self.selection.select_all(ids),
            SelectionMessage::ToggleAllVisible => {
                let visible = self.list_view().visible_ids();
                self.selection.toggle_all(&visible);
            }
            SelectionMessage::Clear => self.selection.clear(),
            SelectionMessage::Changed { .. } => return,
        }
        self.emit_selection();
    }

    pub fn handle_message(&mut self, message: Message) {
        self.expire_abandoned_requests(Instant::now());
        match message {
            Message::Query(message) => self.handle_query_message(message),
            Message::Catalog(message) => self.handle_catalog_message(message),
            Message::Remote(RemoteMessage::Completed {
                request_id,
                outcome,
            }) => self.handle_remote_completed(request_id, outcome),
            Message::Remote(RemoteMessage::Request { .. }) => {}
            Message::Playback(message) => self.handle_playback_message(message),
            Message::Selection(message) => self.handle_selection_message(message),
        }
    }

    /// Starts the blocking event loop for catalog state.
    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "CatalogManager lagged on control bus, skipped {} message(s)",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
