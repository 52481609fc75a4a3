//! Optimistic write protocol for catalog mutations.
//!
//! Every mutation moves `Idle -> Pending -> {Committed | RolledBack}`. On
//! issue it patches the cache, snapshotting each key it touched; on completion
//! it either reconciles with the server response or restores its own
//! snapshots. Ownership of each `(track, field)` pair is tracked so that a
//! failing mutation never undoes a write made by a mutation issued after it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use log::{debug, warn};

use crate::error::CatalogError;
use crate::protocol::{
    ApiCall, ApiResponse, Track, TrackDraft, TrackId, TrackPatch, UploadFile,
};
use crate::track_cache::{CacheKey, CacheNamespace, CachedValue, KeyPredicate, TrackCache};

pub type MutationId = u64;

const SETTLED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    BulkDelete,
    UploadFile,
    RemoveFile,
}

impl MutationKind {
    /// Kinds whose success drops the media reference of their targets.
    pub fn removes_media(self) -> bool {
        matches!(
            self,
            MutationKind::Delete | MutationKind::BulkDelete | MutationKind::RemoveFile
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Pending,
    Committed,
    RolledBack,
}

/// Pending/error state of one mutation as the initiating view sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationStatus {
    pub id: MutationId,
    pub kind: MutationKind,
    pub targets: Vec<TrackId>,
    pub state: MutationState,
    /// Failure to report at the point of initiation. A committed mutation can
    /// still carry one (delete of an already missing track).
    pub error: Option<CatalogError>,
}

impl MutationStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            MutationState::Committed | MutationState::RolledBack
        )
    }
}

/// Track attribute an optimistic patch can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackField {
    Presence,
    Title,
    Artist,
    Album,
    Genres,
    CoverImage,
    AudioFile,
}

type FieldRef = (TrackId, TrackField);

#[derive(Debug, Clone)]
enum OptimisticPatch {
    Remove(BTreeSet<TrackId>),
    Edit { id: TrackId, patch: TrackPatch },
    ClearFile(TrackId),
}

impl OptimisticPatch {
    fn fields(&self) -> Vec<FieldRef> {
        match self {
            OptimisticPatch::Remove(ids) => ids
                .iter()
                .map(|id| (id.clone(), TrackField::Presence))
                .collect(),
            OptimisticPatch::Edit { id, patch } => {
                let mut fields = Vec::new();
                if patch.title.is_some() {
                    fields.push((id.clone(), TrackField::Title));
                }
                if patch.artist.is_some() {
                    fields.push((id.clone(), TrackField::Artist));
                }
                if patch.album.is_some() {
                    fields.push((id.clone(), TrackField::Album));
                }
                if patch.genres.is_some() {
                    fields.push((id.clone(), TrackField::Genres));
                }
                if patch.cover_image.is_some() {
                    fields.push((id.clone(), TrackField::CoverImage));
                }
                fields
            }
            OptimisticPatch::ClearFile(id) => vec![(id.clone(), TrackField::AudioFile)],
        }
    }

    /// The part of this patch that writes one of `fields`.
    fn restricted_to(&self, fields: &BTreeSet<FieldRef>) -> Option<OptimisticPatch> {
        let owns = |id: &TrackId, field: TrackField| fields.contains(&(id.clone(), field));
        match self {
            OptimisticPatch::Remove(ids) => {
                let kept: BTreeSet<TrackId> = ids
                    .iter()
                    .filter(|id| owns(*id, TrackField::Presence))
                    .cloned()
                    .collect();
                (!kept.is_empty()).then_some(OptimisticPatch::Remove(kept))
            }
            OptimisticPatch::Edit { id, patch } => {
                let patch = TrackPatch {
                    title: patch.title.clone().filter(|_| owns(id, TrackField::Title)),
                    artist: patch.artist.clone().filter(|_| owns(id, TrackField::Artist)),
                    album: patch.album.clone().filter(|_| owns(id, TrackField::Album)),
                    genres: patch.genres.clone().filter(|_| owns(id, TrackField::Genres)),
                    cover_image: patch
                        .cover_image
                        .clone()
                        .filter(|_| owns(id, TrackField::CoverImage)),
                };
                (!patch.is_empty()).then(|| OptimisticPatch::Edit {
                    id: id.clone(),
                    patch,
                })
            }
            OptimisticPatch::ClearFile(id) => owns(id, TrackField::AudioFile)
                .then(|| OptimisticPatch::ClearFile(id.clone())),
        }
    }

    fn apply_to_track(&self, track: &mut Track) -> bool {
        match self {
            OptimisticPatch::Remove(_) => false,
            OptimisticPatch::Edit { id, patch } if *id == track.id => {
                let before = track.clone();
                patch.apply_to(track);
                *track != before
            }
            OptimisticPatch::ClearFile(id) if *id == track.id => track.audio_file.take().is_some(),
            _ => false,
        }
    }

    fn apply(&self, value: &mut CachedValue) -> bool {
        match (self, value) {
            (OptimisticPatch::Remove(ids), CachedValue::TrackList(page)) => {
                let before = page.data.len();
                page.data.retain(|track| !ids.contains(&track.id));
                page.data.len() != before
            }
            (OptimisticPatch::Remove(ids), CachedValue::Track(slot)) => {
                if slot.as_ref().is_some_and(|track| ids.contains(&track.id)) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
            (_, CachedValue::TrackList(page)) => page
                .data
                .iter_mut()
                .fold(false, |changed, track| self.apply_to_track(track) || changed),
            (_, CachedValue::Track(Some(track))) => self.apply_to_track(track),
            _ => false,
        }
    }
}

fn restore_track_fields(current: &mut Track, original: &Track, owned: &BTreeSet<FieldRef>) -> bool {
    let before = current.clone();
    let owns = |field: TrackField| owned.contains(&(original.id.clone(), field));
    if owns(TrackField::Title) {
        current.title = original.title.clone();
    }
    if owns(TrackField::Artist) {
        current.artist = original.artist.clone();
    }
    if owns(TrackField::Album) {
        current.album = original.album.clone();
    }
    if owns(TrackField::Genres) {
        current.genres = original.genres.clone();
    }
    if owns(TrackField::CoverImage) {
        current.cover_image = original.cover_image.clone();
    }
    if owns(TrackField::AudioFile) {
        current.audio_file = original.audio_file.clone();
    }
    *current != before
}

/// Restores only the fields `owned` by the rolling-back mutation. Removed
/// rows come back at their original position.
fn restore_owned_fields(
    current: &mut CachedValue,
    before: &CachedValue,
    owned: &BTreeSet<FieldRef>,
) -> bool {
    match (current, before) {
        (CachedValue::TrackList(page), CachedValue::TrackList(original_page)) => {
            let mut changed = false;
            for (index, original) in original_page.data.iter().enumerate() {
                if let Some(existing) = page.data.iter_mut().find(|track| track.id == original.id) {
                    changed |= restore_track_fields(existing, original, owned);
                } else if owned.contains(&(original.id.clone(), TrackField::Presence)) {
                    let at = index.min(page.data.len());
                    page.data.insert(at, original.clone());
                    changed = true;
                }
            }
            changed
        }
        (CachedValue::Track(slot), CachedValue::Track(Some(original))) => {
            if let Some(existing) = slot.as_mut() {
                return restore_track_fields(existing, original, owned);
            }
            if owned.contains(&(original.id.clone(), TrackField::Presence)) {
                *slot = Some(original.clone());
                return true;
            }
            false
        }
        _ => false,
    }
}

fn replace_track_copies(value: &mut CachedValue, track: &Track) -> bool {
    match value {
        CachedValue::TrackList(page) => {
            let mut changed = false;
            for existing in page.data.iter_mut().filter(|existing| existing.id == track.id) {
                if existing != track {
                    *existing = track.clone();
                    changed = true;
                }
            }
            changed
        }
        CachedValue::Track(Some(existing)) if existing.id == track.id && existing != track => {
            *existing = track.clone();
            true
        }
        _ => false,
    }
}

/// Replaces every cached copy of `track` with the server's version.
fn write_through(cache: &mut TrackCache, track: &Track) -> Vec<CacheKey> {
    cache.patch_all(&KeyPredicate::Any, |_, value| replace_track_copies(value, track))
}

fn holds_tracks(key: &CacheKey) -> bool {
    matches!(
        key.namespace,
        CacheNamespace::TrackList | CacheNamespace::Track
    )
}

#[derive(Debug, Clone)]
struct KeySnapshot {
    key: CacheKey,
    before: CachedValue,
    revision_after: u64,
    generation: u64,
}

#[derive(Debug, Clone)]
struct MutationRecord {
    status: MutationStatus,
    snapshots: Vec<KeySnapshot>,
    patch: Option<OptimisticPatch>,
    /// Fields this mutation wrote, with the writer it displaced.
    written: Vec<(FieldRef, Option<MutationId>)>,
}

impl MutationRecord {
    fn is_pending(&self) -> bool {
        self.status.state == MutationState::Pending
    }
}

/// Issued mutation: the caller sends `call` and reports back with `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationTicket {
    pub id: MutationId,
    pub call: ApiCall,
}

/// Client-side checks for files offered for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            allowed_content_types: vec!["audio/mpeg".to_string(), "audio/wav".to_string()],
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, file: &UploadFile) -> Result<(), CatalogError> {
        let content_type = file.content_type.trim().to_ascii_lowercase();
        if !self
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
        {
            return Err(CatalogError::Validation(format!(
                "unsupported audio type '{}'",
                file.content_type
            )));
        }
        if file.bytes.len() as u64 > self.max_bytes {
            return Err(CatalogError::Validation(format!(
                "file is larger than {} MB",
                self.max_bytes / (1024 * 1024)
            )));
        }
        Ok(())
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    let _ = getrandom::fill(&mut bytes);
    bytes.iter().map(|value| format!("{value:02x}")).collect()
}

/// Appends a random hex suffix before the extension so repeated uploads of one
/// file get distinct names on the server.
pub fn randomized_file_name(original: &str) -> String {
    let suffix = random_suffix();
    match original.rfind('.') {
        Some(dot) => format!("{}_{}{}", &original[..dot], suffix, &original[dot..]),
        None => format!("{original}_{suffix}"),
    }
}

fn require_non_empty(label: &str, value: &str) -> Result<(), CatalogError> {
    if value.trim().is_empty() {
        return Err(CatalogError::Validation(format!("{label} is required")));
    }
    Ok(())
}

fn require_genres(genres: &[String]) -> Result<(), CatalogError> {
    if genres.is_empty() {
        return Err(CatalogError::Validation(
            "select at least one genre".to_string(),
        ));
    }
    Ok(())
}

pub struct MutationCoordinator {
    next_id: MutationId,
    records: BTreeMap<MutationId, MutationRecord>,
    settled: VecDeque<MutationId>,
    field_owners: HashMap<FieldRef, MutationId>,
    upload_policy: UploadPolicy,
}

impl MutationCoordinator {
    pub fn new(upload_policy: UploadPolicy) -> Self {
        Self {
            next_id: 1,
            records: BTreeMap::new(),
            settled: VecDeque::new(),
            field_owners: HashMap::new(),
            upload_policy,
        }
    }

    pub fn status(&self, id: MutationId) -> Option<&MutationStatus> {
        self.records.get(&id).map(|record| &record.status)
    }

    pub fn is_pending(&self, kind: MutationKind) -> bool {
        self.records
            .values()
            .any(|record| record.status.kind == kind && record.is_pending())
    }

    fn is_mutation_pending(&self, id: MutationId) -> bool {
        self.records.get(&id).is_some_and(MutationRecord::is_pending)
    }

    /// Fields held by pending mutations, grouped by owner in issue order.
    fn owned_fields<F>(&self, include: F) -> BTreeMap<MutationId, BTreeSet<FieldRef>>
    where
        F: Fn(&FieldRef) -> bool,
    {
        let mut owned: BTreeMap<MutationId, BTreeSet<FieldRef>> = BTreeMap::new();
        for (field, owner) in &self.field_owners {
            if include(field) && self.is_mutation_pending(*owner) {
                owned.entry(*owner).or_default().insert(field.clone());
            }
        }
        owned
    }

    fn start(
        &mut self,
        cache: &mut TrackCache,
        kind: MutationKind,
        targets: Vec<TrackId>,
        call: ApiCall,
        patch: Option<OptimisticPatch>,
    ) -> MutationTicket {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        let mut snapshots = Vec::new();
        let mut written = Vec::new();
        if let Some(patch) = &patch {
            for namespace in [CacheNamespace::TrackList, CacheNamespace::Track] {
                cache.cancel_fetches(&KeyPredicate::Namespace(namespace));
            }
            let keys: Vec<CacheKey> = cache
                .keys_matching(&KeyPredicate::Any)
                .into_iter()
                .filter(holds_tracks)
                .collect();
            for key in keys {
                let Some(entry) = cache.entry(&key) else {
                    continue;
                };
                let Some(before) = entry.value().cloned() else {
                    continue;
                };
                let generation = entry.generation();
                if let Some(revision_after) = cache.patch(&key, |value| patch.apply(value)) {
                    snapshots.push(KeySnapshot {
                        key,
                        before,
                        revision_after,
                        generation,
                    });
                }
            }
            for field in patch.fields() {
                let displaced = self.field_owners.insert(field.clone(), id);
                written.push((field, displaced));
            }
        }
        debug!(
            "MutationCoordinator: {:?} #{} pending, patched {} cache entries",
            kind,
            id,
            snapshots.len()
        );

        self.records.insert(
            id,
            MutationRecord {
                status: MutationStatus {
                    id,
                    kind,
                    targets,
                    state: MutationState::Pending,
                    error: None,
                },
                snapshots,
                patch,
                written,
            },
        );
        MutationTicket { id, call }
    }

    pub fn begin_create(
        &mut self,
        cache: &mut TrackCache,
        draft: TrackDraft,
    ) -> Result<MutationTicket, CatalogError> {
        require_non_empty("title", &draft.title)?;
        require_non_empty("artist", &draft.artist)?;
        require_genres(&draft.genres)?;
        Ok(self.start(
            cache,
            MutationKind::Create,
            Vec::new(),
            ApiCall::CreateTrack(draft),
            None,
        ))
    }

    pub fn begin_update(
        &mut self,
        cache: &mut TrackCache,
        id: TrackId,
        patch: TrackPatch,
    ) -> Result<MutationTicket, CatalogError> {
        if patch.is_empty() {
            return Err(CatalogError::Validation("nothing to update".to_string()));
        }
        if let Some(title) = &patch.title {
            require_non_empty("title", title)?;
        }
        if let Some(artist) = &patch.artist {
            require_non_empty("artist", artist)?;
        }
        if let Some(genres) = &patch.genres {
            require_genres(genres)?;
        }
        let optimistic = OptimisticPatch::Edit {
            id: id.clone(),
            patch: patch.clone(),
        };
        Ok(self.start(
            cache,
            MutationKind::Update,
            vec![id.clone()],
            ApiCall::UpdateTrack { id, patch },
            Some(optimistic),
        ))
    }

    pub fn begin_delete(&mut self, cache: &mut TrackCache, id: TrackId) -> MutationTicket {
        let optimistic = OptimisticPatch::Remove(BTreeSet::from([id.clone()]));
        self.start(
            cache,
            MutationKind::Delete,
            vec![id.clone()],
            ApiCall::DeleteTrack(id),
            Some(optimistic),
        )
    }

    /// All-or-nothing delete of several tracks.
    pub fn begin_bulk_delete(
        &mut self,
        cache: &mut TrackCache,
        ids: Vec<TrackId>,
    ) -> Result<MutationTicket, CatalogError> {
        let mut seen = BTreeSet::new();
        let ids: Vec<TrackId> = ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Err(CatalogError::Validation(
                "bulk delete needs at least one track".to_string(),
            ));
        }
        let optimistic = OptimisticPatch::Remove(seen);
        Ok(self.start(
            cache,
            MutationKind::BulkDelete,
            ids.clone(),
            ApiCall::BulkDelete(ids),
            Some(optimistic),
        ))
    }

    pub fn begin_upload(
        &mut self,
        cache: &mut TrackCache,
        id: TrackId,
        mut file: UploadFile,
    ) -> Result<MutationTicket, CatalogError> {
        self.upload_policy.validate(&file)?;
        file.file_name = randomized_file_name(&file.file_name);
        Ok(self.start(
            cache,
            MutationKind::UploadFile,
            vec![id.clone()],
            ApiCall::UploadFile { id, file },
            None,
        ))
    }

    pub fn begin_remove_file(&mut self, cache: &mut TrackCache, id: TrackId) -> MutationTicket {
        let optimistic = OptimisticPatch::ClearFile(id.clone());
        self.start(
            cache,
            MutationKind::RemoveFile,
            vec![id.clone()],
            ApiCall::RemoveFile(id),
            Some(optimistic),
        )
    }

    /// Settles a pending mutation with its network outcome. Returns `None`
    /// for unknown ids; settled mutations are returned unchanged.
    pub fn complete(
        &mut self,
        cache: &mut TrackCache,
        id: MutationId,
        outcome: Result<ApiResponse, CatalogError>,
        now: Instant,
    ) -> Option<MutationStatus> {
        let record = self.records.get(&id)?;
        if !record.is_pending() {
            return Some(record.status.clone());
        }
        let mut record = self.records.remove(&id)?;
        let kind = record.status.kind;
        match outcome {
            Ok(response) => self.commit(cache, &mut record, Some(response), None, now),
            Err(error) if error.is_not_found() && kind == MutationKind::RemoveFile => {
                debug!(
                    "MutationCoordinator: file of #{} already gone, treating as removed",
                    id
                );
                self.commit(cache, &mut record, None, None, now)
            }
            Err(error)
                if error.is_not_found()
                    && matches!(kind, MutationKind::Delete | MutationKind::BulkDelete) =>
            {
                self.commit(cache, &mut record, None, Some(error), now)
            }
            Err(error) => self.roll_back(cache, &mut record, error),
        }
        let status = record.status.clone();
        self.records.insert(id, record);
        self.remember_settled(id);
        Some(status)
    }

    /// Layers the writes of pending mutations over server data that just
    /// replaced `key`. The fresh value becomes what each layered mutation
    /// falls back to on rollback.
    pub fn reapply_pending(&mut self, cache: &mut TrackCache, key: &CacheKey) {
        if !holds_tracks(key) {
            return;
        }
        for (owner, fields) in self.owned_fields(|_| true) {
            let Some(record) = self.records.get_mut(&owner) else {
                continue;
            };
            let Some(patch) = record
                .patch
                .as_ref()
                .and_then(|patch| patch.restricted_to(&fields))
            else {
                continue;
            };
            let Some(entry) = cache.entry(key) else {
                return;
            };
            let Some(before) = entry.value().cloned() else {
                return;
            };
            let generation = entry.generation();
            let Some(revision_after) = cache.patch(key, |value| patch.apply(value)) else {
                continue;
            };
            record.snapshots.retain(|snapshot| snapshot.key != *key);
            record.snapshots.push(KeySnapshot {
                key: key.clone(),
                before,
                revision_after,
                generation,
            });
        }
    }

    /// Puts the writes of pending mutations back on top of the server copy of
    /// `track`, which becomes the value their rollback restores.
    fn rebase_pending(
        &mut self,
        cache: &mut TrackCache,
        track: &Track,
        entity_generation: Option<u64>,
    ) {
        let entity_key = CacheKey::track(&track.id);
        let inserted_generation = cache.entry(&entity_key).map(|entry| entry.generation());
        for record in self.records.values_mut().filter(|record| record.is_pending()) {
            for snapshot in &mut record.snapshots {
                replace_track_copies(&mut snapshot.before, track);
                if snapshot.key == entity_key && Some(snapshot.generation) == entity_generation {
                    if let Some(generation) = inserted_generation {
                        snapshot.generation = generation;
                    }
                }
            }
        }

        let keys: Vec<CacheKey> = cache
            .keys_matching(&KeyPredicate::Any)
            .into_iter()
            .filter(holds_tracks)
            .collect();
        for (owner, fields) in self.owned_fields(|field| field.0 == track.id) {
            let Some(record) = self.records.get_mut(&owner) else {
                continue;
            };
            let Some(patch) = record
                .patch
                .as_ref()
                .and_then(|patch| patch.restricted_to(&fields))
            else {
                continue;
            };
            for key in &keys {
                let Some(entry) = cache.entry(key) else {
                    continue;
                };
                let Some(before) = entry.value().cloned() else {
                    continue;
                };
                let generation = entry.generation();
                let Some(revision_after) = cache.patch(key, |value| patch.apply(value)) else {
                    continue;
                };
                if !record.snapshots.iter().any(|snapshot| snapshot.key == *key) {
                    record.snapshots.push(KeySnapshot {
                        key: key.clone(),
                        before,
                        revision_after,
                        generation,
                    });
                }
            }
        }
    }

    fn commit(
        &mut self,
        cache: &mut TrackCache,
        record: &mut MutationRecord,
        response: Option<ApiResponse>,
        error: Option<CatalogError>,
        now: Instant,
    ) {
        let id = record.status.id;
        if let Some(ApiResponse::Track(track)) = response {
            write_through(cache, &track);
            let entity_key = CacheKey::track(&track.id);
            let entity_generation = cache.entry(&entity_key).map(|entry| entry.generation());
            cache.insert(entity_key, CachedValue::Track(Some(track.clone())), now);
            self.rebase_pending(cache, &track, entity_generation);
        }
        self.release_fields(id, &record.written, false);

        // Reads issued before the server applied this write must not land.
        cache.cancel_fetches(&KeyPredicate::Namespace(CacheNamespace::TrackList));
        cache.invalidate(&KeyPredicate::Namespace(CacheNamespace::TrackList));

        record.snapshots.clear();
        record.status.state = MutationState::Committed;
        record.status.error = error;
        debug!("MutationCoordinator: {:?} #{} committed", record.status.kind, id);
    }

    fn roll_back(
        &mut self,
        cache: &mut TrackCache,
        record: &mut MutationRecord,
        error: CatalogError,
    ) {
        let id = record.status.id;
        let snapshots = std::mem::take(&mut record.snapshots);
        let owned: BTreeSet<FieldRef> = record
            .written
            .iter()
            .filter(|(field, _)| self.field_owners.get(field) == Some(&id))
            .map(|(field, _)| field.clone())
            .collect();

        for snapshot in snapshots {
            let Some(entry) = cache.entry(&snapshot.key) else {
                continue;
            };
            if entry.revision() == snapshot.revision_after {
                cache.restore(&snapshot.key, snapshot.before);
                continue;
            }
            if entry.generation() != snapshot.generation {
                // Server data replaced the patched value; it already reflects
                // the failed write not happening.
                continue;
            }
            cache.patch(&snapshot.key, |current| {
                restore_owned_fields(current, &snapshot.before, &owned)
            });
        }
        self.release_fields(id, &record.written, true);

        warn!(
            "MutationCoordinator: {:?} #{} rolled back: {}",
            record.status.kind, id, error
        );
        record.status.state = MutationState::RolledBack;
        record.status.error = Some(error);
    }

    /// Drops ownership of the fields `id` wrote. After a rollback the value
    /// on screen is the displaced writer's again, so a still-pending displaced
    /// writer takes the field back; after a commit the server value stands.
    fn release_fields(
        &mut self,
        id: MutationId,
        written: &[(FieldRef, Option<MutationId>)],
        hand_back: bool,
    ) {
        for (field, displaced) in written.iter().cloned() {
            if self.field_owners.get(&field) != Some(&id) {
                continue;
            }
            let displaced = displaced.filter(|_| hand_back);
            match displaced.filter(|previous| self.is_mutation_pending(*previous)) {
                Some(previous) => {
                    self.field_owners.insert(field, previous);
                }
                None => {
                    self.field_owners.remove(&field);
                }
            }
        }
    }

    fn remember_settled(&mut self, id: MutationId) {
        self.settled.push_back(id);
        while self.settled.len() > SETTLED_HISTORY {
            if let Some(oldest) = self.settled.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::{
        randomized_file_name, MutationCoordinator, MutationKind, MutationState, UploadPolicy,
    };
    use crate::error::CatalogError;
    use crate::protocol::{
        ApiCall, ApiResponse, PageMeta, Track, TrackDraft, TrackPatch, TracksPage, UploadFile,
    };
    use crate::query_state::QueryState;
    use crate::track_cache::{CacheKey, CachedValue, TrackCache};

    fn track(id: &str, audio: Option<&str>) -> Track {
        Track {
            id: id.to_string(),
            title: format!("Title {id}"),
            artist: "Band".to_string(),
            album: None,
            genres: vec!["Rock".to_string()],
            cover_image: None,
            audio_file: audio.map(str::to_string),
        }
    }

    fn page_value(ids: &[&str], page: u32, total_pages: u32) -> CachedValue {
        CachedValue::TrackList(TracksPage {
            data: ids.iter().map(|id| track(id, Some("a.mp3"))).collect(),
            meta: PageMeta {
                total: 12,
                page,
                limit: 10,
                total_pages,
            },
        })
    }

    fn list_key(address: &str) -> CacheKey {
        CacheKey::track_list(&QueryState::decode(address))
    }

    fn seeded_cache() -> TrackCache {
        let mut cache = TrackCache::default();
        let now = Instant::now();
        cache.insert(list_key("page=1"), page_value(&["a", "b", "x"], 1, 2), now);
        cache.insert(list_key("page=2"), page_value(&["y", "z"], 2, 2), now);
        cache.insert(list_key("genre=Rock"), page_value(&["x", "y"], 1, 1), now);
        cache.insert(
            CacheKey::track("x"),
            CachedValue::Track(Some(track("x", Some("a.mp3")))),
            now,
        );
        cache
    }

    fn values(cache: &TrackCache) -> Vec<(CacheKey, Option<CachedValue>)> {
        cache
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value().cloned()))
            .collect()
    }

    fn server_error() -> CatalogError {
        CatalogError::Server {
            status: 500,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_delete_removes_id_from_every_cached_page_and_commit_keeps_it_out() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let ticket = coordinator.begin_delete(&mut cache, "x".to_string());
        assert_eq!(ticket.call, ApiCall::DeleteTrack("x".to_string()));
        assert!(coordinator.is_pending(MutationKind::Delete));
        for (_, value) in values(&cache) {
            assert!(!value.expect("value").contains_track("x"));
        }

        let status = coordinator
            .complete(&mut cache, ticket.id, Ok(ApiResponse::Done), Instant::now())
            .expect("status");
        assert_eq!(status.state, MutationState::Committed);
        assert_eq!(status.error, None);
        assert!(!coordinator.is_pending(MutationKind::Delete));
        for (key, value) in values(&cache) {
            assert!(!value.expect("value").contains_track("x"));
            if key.namespace == crate::track_cache::CacheNamespace::TrackList {
                assert!(cache.entry(&key).expect("entry").is_stale());
            }
        }
    }

    #[test]
    fn test_failed_delete_restores_cache_exactly() {
        let mut cache = seeded_cache();
        let before = values(&cache);
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let ticket = coordinator.begin_delete(&mut cache, "x".to_string());
        let status = coordinator
            .complete(&mut cache, ticket.id, Err(server_error()), Instant::now())
            .expect("status");

        assert_eq!(status.state, MutationState::RolledBack);
        assert_eq!(status.error, Some(server_error()));
        assert_eq!(values(&cache), before);
    }

    #[test]
    fn test_earlier_failure_does_not_undo_later_committed_update() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        let rename = |title: &str| TrackPatch {
            title: Some(title.to_string()),
            ..TrackPatch::default()
        };

        let first = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("First"))
            .expect("first update");
        let second = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("Second"))
            .expect("second update");

        let mut committed = track("x", Some("a.mp3"));
        committed.title = "Second".to_string();
        coordinator.complete(
            &mut cache,
            second.id,
            Ok(ApiResponse::Track(committed)),
            Instant::now(),
        );
        let status = coordinator
            .complete(&mut cache, first.id, Err(server_error()), Instant::now())
            .expect("status");

        assert_eq!(status.state, MutationState::RolledBack);
        assert_eq!(
            cache.find_track("x").map(|track| track.title),
            Some("Second".to_string())
        );
        let rock = cache.value(&list_key("genre=Rock")).expect("page");
        assert!(rock
            .tracks()
            .iter()
            .any(|track| track.id == "x" && track.title == "Second"));
    }

    #[test]
    fn test_later_failure_restores_earlier_pending_value() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        let rename = |title: &str| TrackPatch {
            title: Some(title.to_string()),
            ..TrackPatch::default()
        };

        let first = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("First"))
            .expect("first update");
        let second = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("Second"))
            .expect("second update");

        coordinator.complete(&mut cache, second.id, Err(server_error()), Instant::now());
        assert_eq!(
            cache.find_track("x").map(|track| track.title),
            Some("First".to_string())
        );

        coordinator.complete(&mut cache, first.id, Err(server_error()), Instant::now());
        assert_eq!(
            cache.find_track("x").map(|track| track.title),
            Some("Title x".to_string())
        );
    }

    #[test]
    fn test_commit_of_earlier_update_keeps_later_pending_value() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        let rename = |title: &str| TrackPatch {
            title: Some(title.to_string()),
            ..TrackPatch::default()
        };

        let first = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("First"))
            .expect("first update");
        let second = coordinator
            .begin_update(&mut cache, "x".to_string(), rename("Second"))
            .expect("second update");

        let mut committed = track("x", Some("a.mp3"));
        committed.title = "First".to_string();
        coordinator.complete(
            &mut cache,
            first.id,
            Ok(ApiResponse::Track(committed)),
            Instant::now(),
        );

        let titles = |cache: &TrackCache| -> Vec<String> {
            cache
                .iter()
                .filter_map(|(_, entry)| entry.value())
                .flat_map(CachedValue::tracks)
                .filter(|track| track.id == "x")
                .map(|track| track.title.clone())
                .collect()
        };
        assert_eq!(titles(&cache), vec!["Second".to_string(); 3]);

        coordinator.complete(&mut cache, second.id, Err(server_error()), Instant::now());
        assert_eq!(titles(&cache), vec!["First".to_string(); 3]);
    }

    #[test]
    fn test_refetched_page_keeps_pending_edit_until_it_fails() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        let ticket = coordinator
            .begin_update(
                &mut cache,
                "x".to_string(),
                TrackPatch {
                    title: Some("Edited".to_string()),
                    ..TrackPatch::default()
                },
            )
            .expect("update");

        let key = list_key("page=1");
        cache.insert(key.clone(), page_value(&["a", "x"], 1, 1), Instant::now());
        coordinator.reapply_pending(&mut cache, &key);
        let title_of_x = |cache: &TrackCache| {
            cache
                .value(&key)
                .and_then(|value| {
                    value
                        .tracks()
                        .into_iter()
                        .find(|track| track.id == "x")
                        .map(|track| track.title.clone())
                })
        };
        assert_eq!(title_of_x(&cache), Some("Edited".to_string()));

        coordinator.complete(&mut cache, ticket.id, Err(server_error()), Instant::now());
        assert_eq!(title_of_x(&cache), Some("Title x".to_string()));
        assert_eq!(cache.value(&key), Some(&page_value(&["a", "x"], 1, 1)));
    }

    #[test]
    fn test_update_without_fields_is_rejected() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        assert!(matches!(
            coordinator.begin_update(&mut cache, "x".to_string(), TrackPatch::default()),
            Err(CatalogError::Validation(_))
        ));
        assert!(!coordinator.is_pending(MutationKind::Update));
    }

    #[test]
    fn test_rollback_reinserts_row_without_undoing_other_rows_edit() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let delete = coordinator.begin_delete(&mut cache, "x".to_string());
        let edit = coordinator
            .begin_update(
                &mut cache,
                "a".to_string(),
                TrackPatch {
                    artist: Some("Renamed".to_string()),
                    ..TrackPatch::default()
                },
            )
            .expect("update");

        coordinator.complete(&mut cache, delete.id, Err(server_error()), Instant::now());

        let first_page = cache.value(&list_key("page=1")).expect("page");
        let ids: Vec<&str> = first_page
            .tracks()
            .iter()
            .map(|track| track.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "x"]);
        assert_eq!(first_page.tracks()[0].artist, "Renamed");
        assert!(cache.find_track("x").is_some());
        assert!(coordinator.is_pending(MutationKind::Update));
        assert_eq!(
            coordinator.status(edit.id).map(|status| status.state),
            Some(MutationState::Pending)
        );
    }

    #[test]
    fn test_remove_file_not_found_is_already_satisfied() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let ticket = coordinator.begin_remove_file(&mut cache, "x".to_string());
        let status = coordinator
            .complete(
                &mut cache,
                ticket.id,
                Err(CatalogError::NotFound("/tracks/x/file".to_string())),
                Instant::now(),
            )
            .expect("status");

        assert_eq!(status.state, MutationState::Committed);
        assert_eq!(status.error, None);
        for (_, value) in values(&cache) {
            for track in value.expect("value").tracks() {
                if track.id == "x" {
                    assert_eq!(track.audio_file, None);
                }
            }
        }
    }

    #[test]
    fn test_delete_not_found_is_surfaced_without_rollback() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let ticket = coordinator.begin_delete(&mut cache, "x".to_string());
        let status = coordinator
            .complete(
                &mut cache,
                ticket.id,
                Err(CatalogError::NotFound("/tracks/x".to_string())),
                Instant::now(),
            )
            .expect("status");

        assert_eq!(status.state, MutationState::Committed);
        assert!(status.error.as_ref().is_some_and(CatalogError::is_not_found));
        assert!(cache.find_track("x").is_none());
    }

    #[test]
    fn test_bulk_delete_is_all_or_nothing() {
        let mut cache = seeded_cache();
        let before = values(&cache);
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        assert!(matches!(
            coordinator.begin_bulk_delete(&mut cache, Vec::new()),
            Err(CatalogError::Validation(_))
        ));

        let ticket = coordinator
            .begin_bulk_delete(
                &mut cache,
                vec!["a".to_string(), "y".to_string(), "a".to_string()],
            )
            .expect("bulk delete");
        assert_eq!(
            ticket.call,
            ApiCall::BulkDelete(vec!["a".to_string(), "y".to_string()])
        );
        assert!(cache.find_track("a").is_none());
        assert!(cache.find_track("y").is_none());

        coordinator.complete(
            &mut cache,
            ticket.id,
            Err(CatalogError::Network("offline".to_string())),
            Instant::now(),
        );
        assert_eq!(values(&cache), before);
    }

    #[test]
    fn test_update_commit_writes_server_track_everywhere() {
        let mut cache = seeded_cache();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());

        let ticket = coordinator
            .begin_update(
                &mut cache,
                "y".to_string(),
                TrackPatch {
                    album: Some("Live".to_string()),
                    ..TrackPatch::default()
                },
            )
            .expect("update");
        let mut server = track("y", Some("a.mp3"));
        server.album = Some("Live (Remastered)".to_string());
        coordinator.complete(
            &mut cache,
            ticket.id,
            Ok(ApiResponse::Track(server.clone())),
            Instant::now(),
        );

        for key in [list_key("page=2"), list_key("genre=Rock")] {
            let value = cache.value(&key).expect("page");
            let found = value
                .tracks()
                .into_iter()
                .find(|track| track.id == "y")
                .cloned();
            assert_eq!(found, Some(server.clone()));
        }
        assert_eq!(
            cache.value(&CacheKey::track("y")),
            Some(&CachedValue::Track(Some(server)))
        );
    }

    #[test]
    fn test_create_requires_title_artist_and_genre() {
        let mut cache = TrackCache::default();
        let mut coordinator = MutationCoordinator::new(UploadPolicy::default());
        let draft = TrackDraft {
            title: "Song".to_string(),
            artist: " ".to_string(),
            album: None,
            genres: vec!["Pop".to_string()],
            cover_image: None,
        };
        assert!(matches!(
            coordinator.begin_create(&mut cache, draft.clone()),
            Err(CatalogError::Validation(_))
        ));

        let valid = TrackDraft {
            artist: "Singer".to_string(),
            ..draft
        };
        let ticket = coordinator
            .begin_create(&mut cache, valid)
            .expect("create should start");
        let status = coordinator
            .complete(
                &mut cache,
                ticket.id,
                Ok(ApiResponse::Track(track("new", None))),
                Instant::now(),
            )
            .expect("status");
        assert_eq!(status.state, MutationState::Committed);
        assert!(cache.find_track("new").is_some());
    }

    #[test]
    fn test_upload_validates_type_and_size_and_randomizes_name() {
        let mut cache = TrackCache::default();
        let mut coordinator = MutationCoordinator::new(UploadPolicy {
            max_bytes: 4,
            ..UploadPolicy::default()
        });
        let file = |content_type: &str, size: usize| UploadFile {
            file_name: "song.mp3".to_string(),
            content_type: content_type.to_string(),
            bytes: vec![0; size],
        };

        assert!(coordinator
            .begin_upload(&mut cache, "a".to_string(), file("image/png", 1))
            .is_err());
        assert!(coordinator
            .begin_upload(&mut cache, "a".to_string(), file("audio/mpeg", 5))
            .is_err());

        let ticket = coordinator
            .begin_upload(&mut cache, "a".to_string(), file("audio/mpeg", 4))
            .expect("upload should start");
        let ApiCall::UploadFile { file, .. } = ticket.call else {
            panic!("unexpected call for upload");
        };
        assert!(file.file_name.starts_with("song_"));
        assert!(file.file_name.ends_with(".mp3"));
        assert_eq!(file.file_name.len(), "song_".len() + 8 + ".mp3".len());
    }

    #[test]
    fn test_randomized_file_name_without_extension() {
        let name = randomized_file_name("recording");
        assert!(name.starts_with("recording_"));
        assert_eq!(name.len(), "recording_".len() + 8);
    }
}
