//! Client-side state layer for a remote music track catalog.
//!
//! Components talk over a broadcast bus (`protocol::Message`). The catalog
//! manager owns all client state; the remote worker performs API calls.

pub mod app_bootstrap {
    pub mod services;
}
pub mod app_runtime;
pub mod backends;
pub mod catalog_manager;
pub mod config;
pub mod config_persistence;
pub mod db_manager;
pub mod error;
pub mod media_uri;
pub mod mutation_coordinator;
pub mod playback_arbiter;
pub mod protocol;
pub mod query_state;
pub mod remote_worker;
pub mod selection_store;
pub mod track_cache;
