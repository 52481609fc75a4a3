use std::{any::Any, path::PathBuf, sync::Arc, thread};

use log::{error, warn};
use tokio::sync::broadcast;

use crate::{
    backends::TracksBackend,
    catalog_manager::{CatalogManager, CatalogSettings},
    db_manager::DbManager,
    protocol::Message,
    remote_worker::RemoteWorker,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub backend: Arc<dyn TracksBackend>,
    pub catalog_settings: CatalogSettings,
    /// Cache mirror location; `None` keeps the cache in memory only.
    pub cache_db_path: Option<PathBuf>,
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn open_cache_mirror(path: Option<PathBuf>) -> Option<DbManager> {
    let path = path?;
    match DbManager::open(&path) {
        Ok(db_manager) => Some(db_manager),
        Err(err) => {
            warn!(
                "Cache mirror unavailable at {}, continuing in memory: {}",
                path.display(),
                err
            );
            None
        }
    }
}

pub fn spawn_background_services(config: BackgroundServicesConfig) {
    let BackgroundServicesConfig {
        bus_sender,
        backend,
        catalog_settings,
        cache_db_path,
    } = config;

    let remote_worker_bus_receiver = bus_sender.subscribe();
    let remote_worker_bus_sender = bus_sender.clone();
    thread::spawn(move || {
        let mut remote_worker =
            RemoteWorker::new(remote_worker_bus_receiver, remote_worker_bus_sender, backend);
        remote_worker.run();
    });

    let catalog_manager_bus_receiver = bus_sender.subscribe();
    let catalog_manager_bus_sender = bus_sender.clone();
    thread::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let db_manager = open_cache_mirror(cache_db_path);
            let mut catalog_manager = CatalogManager::new(
                catalog_manager_bus_receiver,
                catalog_manager_bus_sender,
                catalog_settings,
                db_manager,
            );
            catalog_manager.restore_from_mirror();
            catalog_manager.run();
        }));
        if let Err(payload) = result {
            error!(
                "CatalogManager thread terminated by panic: {}",
                panic_payload_to_string(payload.as_ref())
            );
        }
    });
}
