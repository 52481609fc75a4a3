//! Remote track API abstraction and concrete implementations.

pub mod rest_tracks;

use crate::error::CatalogError;
use crate::protocol::{
    ApiCall, ApiResponse, Track, TrackDraft, TrackId, TrackPatch, TracksPage, UploadFile,
};
use crate::query_state::QueryState;

/// Interface implemented by concrete track API adapters.
pub trait TracksBackend: Send + Sync {
    fn list_tracks(&self, query: &QueryState) -> Result<TracksPage, CatalogError>;
    /// Single-track lookup. `Ok(None)` when the server knows no such id.
    fn get_track(&self, id: &str) -> Result<Option<Track>, CatalogError>;
    fn genres(&self) -> Result<Vec<String>, CatalogError>;
    fn create_track(&self, draft: &TrackDraft) -> Result<Track, CatalogError>;
    fn update_track(&self, id: &str, patch: &TrackPatch) -> Result<Track, CatalogError>;
    fn delete_track(&self, id: &str) -> Result<(), CatalogError>;
    fn bulk_delete(&self, ids: &[TrackId]) -> Result<(), CatalogError>;
    fn upload_file(&self, id: &str, file: &UploadFile) -> Result<Track, CatalogError>;
    fn remove_file(&self, id: &str) -> Result<(), CatalogError>;
}

/// Runs one bus-level call against `backend`.
pub fn execute(backend: &dyn TracksBackend, call: &ApiCall) -> Result<ApiResponse, CatalogError> {
    match call {
        ApiCall::ListTracks(query) => backend.list_tracks(query).map(ApiResponse::Page),
        ApiCall::GetTrack(id) => backend.get_track(id).map(ApiResponse::MaybeTrack),
        ApiCall::Genres => backend.genres().map(ApiResponse::Genres),
        ApiCall::CreateTrack(draft) => backend.create_track(draft).map(ApiResponse::Track),
        ApiCall::UpdateTrack { id, patch } => {
            backend.update_track(id, patch).map(ApiResponse::Track)
        }
        ApiCall::DeleteTrack(id) => backend.delete_track(id).map(|_| ApiResponse::Done),
        ApiCall::BulkDelete(ids) => backend.bulk_delete(ids).map(|_| ApiResponse::Done),
        ApiCall::UploadFile { id, file } => backend.upload_file(id, file).map(ApiResponse::Track),
        ApiCall::RemoveFile(id) => backend.remove_file(id).map(|_| ApiResponse::Done),
    }
}
