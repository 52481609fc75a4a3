//! Loading, sanitizing and first-run creation of `config.toml`.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::Config;

pub const APP_DIR_NAME: &str = "trackdeck";
pub const API_BASE_ENV: &str = "TRACKDECK_API_BASE";

/// `<config_dir>/trackdeck/config.toml`, if the platform has a config dir.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

/// `<data_dir>/trackdeck/cache.db`, if the platform has a data dir.
pub fn cache_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME).join("cache.db"))
}

/// Parses config text, falling back to defaults on malformed input.
pub fn parse_config(text: &str) -> Config {
    match toml::from_str::<Config>(text) {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!("Config parse failed, using defaults: {}", err);
            Config::default()
        }
    }
}

/// Reads `path`, writing a default file first when it does not exist.
pub fn load_or_create_config(path: &Path) -> Config {
    if !path.exists() {
        let default_config = Config::default();
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    err
                );
            }
        }
        match toml::to_string(&default_config) {
            Ok(text) => {
                if let Err(err) = std::fs::write(path, text) {
                    warn!("Failed to write default config {}: {}", path.display(), err);
                }
            }
            Err(err) => warn!("Failed to serialize default config: {}", err),
        }
        return default_config;
    }

    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(err) => {
            warn!("Failed to read config {}: {}", path.display(), err);
            Config::default()
        }
    }
}

/// Applies environment overrides. `lookup` is `std::env::var` in production.
pub fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(base_url) = lookup(API_BASE_ENV)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        info!("Using API base from {}: {}", API_BASE_ENV, base_url);
        config.api.base_url = base_url;
    }
    config
}

/// Clamps values that would make the client unusable.
pub fn sanitize_config(mut config: Config) -> Config {
    config.api.base_url = config.api.base_url.trim().trim_end_matches('/').to_string();
    if config.api.base_url.is_empty() {
        config.api.base_url = Config::default().api.base_url;
    }
    config.api.connect_timeout_secs = config.api.connect_timeout_secs.clamp(1, 120);
    config.api.request_timeout_secs = config.api.request_timeout_secs.clamp(1, 600);
    config.query.search_debounce_ms = config.query.search_debounce_ms.min(5_000);
    config.cache.retention_days = config.cache.retention_days.max(1);
    config.upload.max_file_size_mb = config.upload.max_file_size_mb.max(1);
    config
        .upload
        .allowed_content_types
        .retain(|content_type| !content_type.trim().is_empty());
    if config.upload.allowed_content_types.is_empty() {
        config.upload.allowed_content_types = Config::default().upload.allowed_content_types;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::{apply_env_overrides, parse_config, sanitize_config, API_BASE_ENV};
    use crate::config::Config;

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        assert_eq!(parse_config("[api\nbase_url = "), Config::default());
    }

    #[test]
    fn test_sanitize_trims_base_url_and_clamps_zero_values() {
        let mut config = Config::default();
        config.api.base_url = " https://tracks.example/ ".to_string();
        config.api.connect_timeout_secs = 0;
        config.cache.retention_days = 0;
        config.upload.allowed_content_types = vec![" ".to_string()];

        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.api.base_url, "https://tracks.example");
        assert_eq!(sanitized.api.connect_timeout_secs, 1);
        assert_eq!(sanitized.cache.retention_days, 1);
        assert_eq!(
            sanitized.upload.allowed_content_types,
            Config::default().upload.allowed_content_types
        );
    }

    #[test]
    fn test_env_override_replaces_base_url_only_when_set() {
        let overridden = apply_env_overrides(Config::default(), |key| {
            (key == API_BASE_ENV).then(|| "http://test-api".to_string())
        });
        assert_eq!(overridden.api.base_url, "http://test-api");

        let untouched = apply_env_overrides(Config::default(), |_| Some("   ".to_string()));
        assert_eq!(untouched, Config::default());
    }

    #[test]
    fn test_load_or_create_writes_defaults_for_missing_file() {
        let dir = std::env::temp_dir().join(format!(
            "trackdeck-config-test-{}",
            std::process::id()
        ));
        let path = dir.join("config.toml");
        let _ = std::fs::remove_file(&path);

        let config = super::load_or_create_config(&path);
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(super::load_or_create_config(&path), Config::default());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
