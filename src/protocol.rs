//! Event-bus protocol shared by all runtime components.
//!
//! This module defines the catalog data model as the remote API shapes it and
//! every message exchanged between the catalog manager, the remote worker and
//! presentation collaborators.

use std::collections::BTreeSet;

use crate::error::CatalogError;
use crate::mutation_coordinator::{MutationKind, MutationStatus};
use crate::query_state::{QueryPatch, QueryState};

/// Server-assigned track identifier.
pub type TrackId = String;

/// Correlates a remote request with its completion.
pub type RequestId = u64;

/// Track as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    /// Opaque reference to the stored media blob. A non-blank reference marks
    /// the track as playable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
}

impl Track {
    pub fn is_playable(&self) -> bool {
        self.audio_file
            .as_deref()
            .is_some_and(|audio_file| !audio_file.trim().is_empty())
    }
}

/// Pagination metadata attached to a list response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

/// One page of the track list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct TracksPage {
    pub data: Vec<Track>,
    pub meta: PageMeta,
}

impl TracksPage {
    pub fn contains(&self, id: &str) -> bool {
        self.data.iter().any(|track| track.id == id)
    }
}

/// Metadata for a track that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDraft {
    pub title: String,
    pub artist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    pub genres: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
}

/// Edited metadata fields. `None` leaves a field untouched; an empty string
/// clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl TrackPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.genres.is_none()
            && self.cover_image.is_none()
    }

    pub fn apply_to(&self, track: &mut Track) {
        if let Some(title) = &self.title {
            track.title = title.clone();
        }
        if let Some(artist) = &self.artist {
            track.artist = artist.clone();
        }
        if let Some(album) = &self.album {
            track.album = non_empty(album);
        }
        if let Some(genres) = &self.genres {
            track.genres = genres.clone();
        }
        if let Some(cover_image) = &self.cover_image {
            track.cover_image = non_empty(cover_image);
        }
    }
}

/// Audio file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One remote API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    ListTracks(QueryState),
    GetTrack(TrackId),
    Genres,
    CreateTrack(TrackDraft),
    UpdateTrack { id: TrackId, patch: TrackPatch },
    DeleteTrack(TrackId),
    BulkDelete(Vec<TrackId>),
    UploadFile { id: TrackId, file: UploadFile },
    RemoveFile(TrackId),
}

/// Successful remote API result.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Page(TracksPage),
    /// Single-track lookup; `None` when the server has no such id.
    MaybeTrack(Option<Track>),
    Track(Track),
    Genres(Vec<String>),
    Done,
}

/// What the list view renders for the current address.
#[derive(Debug, Clone, PartialEq)]
pub struct ListView {
    pub query: QueryState,
    pub tracks: Vec<Track>,
    pub meta: Option<PageMeta>,
    /// No data to show yet and a request is running.
    pub is_loading: bool,
    /// A request is running, with or without data on screen.
    pub is_fetching: bool,
    /// Last refresh failure; previously shown data stays in `tracks`.
    pub error: Option<CatalogError>,
}

impl ListView {
    pub fn visible_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|track| track.id.clone()).collect()
    }
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Query(QueryMessage),
    Catalog(CatalogMessage),
    Remote(RemoteMessage),
    Playback(PlaybackMessage),
    Selection(SelectionMessage),
}

/// Address and query-state commands and notifications.
#[derive(Debug, Clone)]
pub enum QueryMessage {
    /// Router moved to a new address.
    Navigate(String),
    PatchQuery(QueryPatch),
    /// Raw search box input, debounced before it reaches the address.
    SearchInput(String),
    SearchDebounceElapsed { generation: u64 },
    Back,
    Forward,
    AddressChanged { address: String, state: QueryState },
}

/// Catalog reads and mutations.
#[derive(Debug, Clone)]
pub enum CatalogMessage {
    RefreshList,
    LoadGenres,
    /// Edit-form lookup; served from any cached page before hitting the API.
    LoadTrack(TrackId),
    CreateTrack(TrackDraft),
    UpdateTrack { id: TrackId, patch: TrackPatch },
    DeleteTrack(TrackId),
    BulkDelete(Vec<TrackId>),
    DeleteSelected,
    UploadFile { id: TrackId, file: UploadFile },
    RemoveFile(TrackId),
    ListUpdated(ListView),
    GenresUpdated(Vec<String>),
    ArtistsUpdated(Vec<String>),
    TrackLoaded { id: TrackId, track: Option<Track> },
    MutationUpdated(MutationStatus),
    /// Input failed client-side validation; nothing was sent or patched.
    MutationRejected {
        kind: MutationKind,
        error: CatalogError,
    },
}

/// Requests to and completions from the remote worker.
#[derive(Debug, Clone)]
pub enum RemoteMessage {
    Request {
        request_id: RequestId,
        call: ApiCall,
    },
    Completed {
        request_id: RequestId,
        outcome: Result<ApiResponse, CatalogError>,
    },
}

/// Playback-token commands and notifications.
#[derive(Debug, Clone)]
pub enum PlaybackMessage {
    Activate(TrackId),
    Deactivate,
    /// A row's media finished naturally.
    Ended(TrackId),
    ActiveTrackChanged {
        track_id: Option<TrackId>,
        media_url: Option<String>,
    },
}

/// Bulk-selection commands and notifications.
#[derive(Debug, Clone)]
pub enum SelectionMessage {
    EnterMode,
    ExitMode,
    Toggle(TrackId),
    SelectAll(Vec<TrackId>),
    /// Select every visible row, or none if all are already selected.
    ToggleAllVisible,
    Clear,
    Changed {
        mode: bool,
        selected: BTreeSet<TrackId>,
    },
}
