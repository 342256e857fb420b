use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_storage::DEFAULT_CONVERSATION_TITLE;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "parley.db";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_conversation_title")]
    pub default_conversation_title: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            database_path: default_database_path(),
            log_level: default_log_level(),
            connect_timeout_secs: default_connect_timeout_secs(),
            default_conversation_title: default_conversation_title(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(&self.endpoint, default_endpoint);
        self.api_key = self.api_key.trim().to_string();
        self.database_path = non_blank_or(&self.database_path, default_database_path);
        self.log_level = non_blank_or(&self.log_level, default_log_level);
        self.default_conversation_title =
            non_blank_or(&self.default_conversation_title, default_conversation_title);
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        self
    }

    pub fn api_key(&self) -> Option<String> {
        if self.api_key.is_empty() {
            None
        } else {
            Some(self.api_key.clone())
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Swaps in new settings for this process only.
    pub fn replace(&self, settings: ClientSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        // Environment variables apply even when no settings file exists.
        let mut figment = Figment::from(Serialized::defaults(ClientSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley"))
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_conversation_title() -> String {
    DEFAULT_CONVERSATION_TITLE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("parley-settings-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn normalization_trims_and_fills_blank_fields() {
        let settings = ClientSettings {
            endpoint: "  ".to_string(),
            api_key: "  secret ".to_string(),
            database_path: String::new(),
            log_level: " debug ".to_string(),
            connect_timeout_secs: 0,
            default_conversation_title: "\t".to_string(),
        }
        .normalized();

        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.api_key(), Some("secret".to_string()));
        assert_eq!(settings.database_path, default_database_path());
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.default_conversation_title, DEFAULT_CONVERSATION_TITLE);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(scratch_dir().join(SETTINGS_FILE_NAME));
        let settings = store.settings();
        assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(settings.default_conversation_title, DEFAULT_CONVERSATION_TITLE);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"endpoint": "https://chat.example.test/api/", "connect_timeout_secs": 3}"#,
        )
        .expect("write settings");

        let store = SettingsStore::new(path);
        let settings = store.settings();
        assert_eq!(settings.endpoint, "https://chat.example.test/api/");
        assert_eq!(settings.connect_timeout_secs, 3);
        assert_eq!(settings.api_key(), None);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"connect_timeout_secs": "soon"}"#).expect("write settings");

        let store = SettingsStore::new(path);
        assert_eq!(store.settings().connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = scratch_dir();
        let path = dir.join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let settings = ClientSettings {
            api_key: " token ".to_string(),
            ..ClientSettings::default()
        };
        store.update(settings).expect("settings persist");
        assert_eq!(store.settings().api_key, "token");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().api_key, "token");

        std::fs::remove_dir_all(dir).ok();
    }
}
