//! Runtime bootstrap and the headless command driver.

use std::{path::PathBuf, sync::Arc, time::Duration};

use log::{info, warn};
use tokio::sync::broadcast;

use crate::{
    app_bootstrap::services::{spawn_background_services, BackgroundServicesConfig},
    backends::rest_tracks::RestTracksBackend,
    catalog_manager::CatalogSettings,
    config::Config,
    config_persistence::{
        apply_env_overrides, cache_db_path, config_file_path, load_or_create_config,
    },
    error::CatalogError,
    mutation_coordinator::MutationState,
    protocol::{CatalogMessage, Message, QueryMessage, TrackId},
};

/// One-shot command accepted by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// List the page addressed by a query string such as `page=2&genre=Rock`.
    List(String),
    Genres,
    Delete(TrackId),
    RemoveFile(TrackId),
}

pub const USAGE: &str = "usage: trackdeck [list [ADDRESS] | genres | delete ID | remove-file ID]";

impl CliCommand {
    /// Parses arguments after the program name. No arguments lists page 1.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut args = args.iter().map(String::as_str);
        let command = match args.next() {
            None | Some("list") => CliCommand::List(args.next().unwrap_or_default().to_string()),
            Some("genres") => CliCommand::Genres,
            Some("delete") => CliCommand::Delete(Self::required_id(args.next())?),
            Some("remove-file") => CliCommand::RemoveFile(Self::required_id(args.next())?),
            Some(other) => return Err(format!("unknown command '{other}'\n{USAGE}")),
        };
        if let Some(extra) = args.next() {
            return Err(format!("unexpected argument '{extra}'\n{USAGE}"));
        }
        Ok(command)
    }

    fn required_id(arg: Option<&str>) -> Result<TrackId, String> {
        arg.map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| format!("missing track id\n{USAGE}"))
    }

    fn messages(&self) -> Vec<Message> {
        match self {
            CliCommand::List(address) => vec![
                Message::Query(QueryMessage::Navigate(address.clone())),
                Message::Catalog(CatalogMessage::RefreshList),
            ],
            CliCommand::Genres => vec![Message::Catalog(CatalogMessage::LoadGenres)],
            CliCommand::Delete(id) => vec![Message::Catalog(CatalogMessage::DeleteTrack(
                id.clone(),
            ))],
            CliCommand::RemoveFile(id) => vec![Message::Catalog(CatalogMessage::RemoveFile(
                id.clone(),
            ))],
        }
    }

    /// Inspects one bus message. `Some` once the command has settled.
    fn settle(&self, message: &Message) -> Option<Result<(), CatalogError>> {
        match (self, message) {
            (CliCommand::List(_), Message::Catalog(CatalogMessage::ListUpdated(view)))
                if !view.is_fetching =>
            {
                if let Some(meta) = view.meta {
                    info!(
                        "Page {}/{} ({} tracks total)",
                        meta.page, meta.total_pages, meta.total
                    );
                }
                for track in &view.tracks {
                    info!(
                        "{}  {} - {}{}",
                        track.id,
                        track.artist,
                        track.title,
                        if track.is_playable() { "" } else { "  [no audio]" }
                    );
                }
                Some(view.error.clone().map_or(Ok(()), Err))
            }
            (CliCommand::Genres, Message::Catalog(CatalogMessage::GenresUpdated(genres))) => {
                info!("Genres: {}", genres.join(", "));
                Some(Ok(()))
            }
            (
                CliCommand::Delete(_) | CliCommand::RemoveFile(_),
                Message::Catalog(CatalogMessage::MutationUpdated(status)),
            ) if status.is_settled() => match (&status.state, &status.error) {
                (MutationState::RolledBack, Some(error)) => Some(Err(error.clone())),
                (_, Some(error)) => {
                    warn!("{:?} of {:?} committed with: {}", status.kind, status.targets, error);
                    Some(Ok(()))
                }
                _ => {
                    info!("{:?} of {:?} committed", status.kind, status.targets);
                    Some(Ok(()))
                }
            },
            (_, Message::Catalog(CatalogMessage::MutationRejected { error, .. })) => {
                Some(Err(error.clone()))
            }
            _ => None,
        }
    }
}

/// Owns the bus and the background service threads.
pub struct AppRuntime {
    bus_sender: broadcast::Sender<Message>,
    config: Config,
}

impl AppRuntime {
    /// Loads config from the user's config directory and starts services.
    pub fn build() -> Self {
        let config = match config_file_path() {
            Some(path) => load_or_create_config(&path),
            None => {
                warn!("No config directory available, using defaults");
                Config::default()
            }
        };
        let config = apply_env_overrides(config, |key| std::env::var(key).ok());
        let cache_db = if config.cache.persist_enabled {
            cache_db_path()
        } else {
            None
        };
        Self::start(config, cache_db)
    }

    pub fn start(config: Config, cache_db_path: Option<PathBuf>) -> Self {
        info!("Using track API at {}", config.api.base_url);
        let (bus_sender, _) = broadcast::channel(1024);
        spawn_background_services(BackgroundServicesConfig {
            bus_sender: bus_sender.clone(),
            backend: Arc::new(RestTracksBackend::new(&config.api)),
            catalog_settings: CatalogSettings::from_config(&config),
            cache_db_path,
        });
        Self { bus_sender, config }
    }

    pub fn bus_sender(&self) -> broadcast::Sender<Message> {
        self.bus_sender.clone()
    }

    /// Upper bound for one command, covering a refetch after a mutation.
    pub fn command_timeout(&self) -> Duration {
        self.config.api.abandon_after()
    }

    /// Sends `command` over the bus and waits until it settles or times out.
    pub fn execute(&self, command: &CliCommand) -> Result<(), CatalogError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| CatalogError::Network(format!("failed to start runtime: {err}")))?;
        let timeout = self.command_timeout();
        let mut bus_receiver = self.bus_sender.subscribe();
        for message in command.messages() {
            let _ = self.bus_sender.send(message);
        }

        runtime.block_on(async move {
            let wait = async {
                loop {
                    match bus_receiver.recv().await {
                        Ok(message) => {
                            if let Some(result) = command.settle(&message) {
                                return result;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Command driver lagged, skipped {} message(s)", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(CatalogError::Network("event bus closed".to_string()));
                        }
                    }
                }
            };
            tokio::time::timeout(timeout, wait).await.map_err(|_| {
                CatalogError::Network(format!("no result within {}s", timeout.as_secs()))
            })?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::CliCommand;
    use crate::error::CatalogError;
    use crate::mutation_coordinator::{MutationKind, MutationState, MutationStatus};
    use crate::protocol::{CatalogMessage, ListView, Message};
    use crate::query_state::QueryState;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(CliCommand::parse(&[]), Ok(CliCommand::List(String::new())));
        assert_eq!(
            CliCommand::parse(&args(&["list", "page=2"])),
            Ok(CliCommand::List("page=2".to_string()))
        );
        assert_eq!(
            CliCommand::parse(&args(&["remove-file", "t1"])),
            Ok(CliCommand::RemoveFile("t1".to_string()))
        );
        assert!(CliCommand::parse(&args(&["delete"])).is_err());
        assert!(CliCommand::parse(&args(&["genres", "extra"])).is_err());
        assert!(CliCommand::parse(&args(&["play"])).is_err());
    }

    #[test]
    fn test_list_settles_only_when_not_fetching() {
        let command = CliCommand::List(String::new());
        let mut view = ListView {
            query: QueryState::default(),
            tracks: Vec::new(),
            meta: None,
            is_loading: true,
            is_fetching: true,
            error: None,
        };
        let message = Message::Catalog(CatalogMessage::ListUpdated(view.clone()));
        assert_eq!(command.settle(&message), None);

        view.is_loading = false;
        view.is_fetching = false;
        view.error = Some(CatalogError::Network("down".to_string()));
        let message = Message::Catalog(CatalogMessage::ListUpdated(view));
        assert_eq!(
            command.settle(&message),
            Some(Err(CatalogError::Network("down".to_string())))
        );
    }

    #[test]
    fn test_delete_not_found_settles_as_success() {
        let command = CliCommand::Delete("t1".to_string());
        let pending = MutationStatus {
            id: 1,
            kind: MutationKind::Delete,
            targets: vec!["t1".to_string()],
            state: MutationState::Pending,
            error: None,
        };
        let message = Message::Catalog(CatalogMessage::MutationUpdated(pending.clone()));
        assert_eq!(command.settle(&message), None);

        let committed = MutationStatus {
            state: MutationState::Committed,
            error: Some(CatalogError::NotFound("t1".to_string())),
            ..pending
        };
        let message = Message::Catalog(CatalogMessage::MutationUpdated(committed));
        assert_eq!(command.settle(&message), Some(Ok(())));
    }
}
