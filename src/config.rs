use async_trait::async_trait;
use dashmap::DashMap;
use rail_protocol::{Endpoint, Language};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub const KEY_ENDPOINT: &str = "RAILHOST_ENDPOINT";
pub const KEY_CALL_TIMEOUT_MS: &str = "RAILHOST_CALL_TIMEOUT_MS";
pub const KEY_HANDSHAKE_TIMEOUT_MS: &str = "RAILHOST_HANDSHAKE_TIMEOUT_MS";
pub const KEY_MAX_PENDING_CALLS: &str = "RAILHOST_MAX_PENDING_CALLS";
pub const KEY_AMBIENT_LANGUAGES: &str = "RAILHOST_AMBIENT_LANGUAGES";
pub const KEY_CATALOG_DIR: &str = "RAILHOST_CATALOG_DIR";
pub const KEY_LOG_DIR: &str = "RAILHOST_LOG_DIR";
pub const KEY_LOG_LEVEL: &str = "RAILHOST_LOG_LEVEL";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            }
            Some(path) => warn!("could not load .env from {}", path.display()),
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    info!("Loaded .env from {}", path.display());
                }
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("RAILHOST_"))
            .collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// In-memory settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

// -----------------------------------------------------------------------------
// Broker settings
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub endpoint: Endpoint,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_pending_calls: usize,
    /// Sessions in these languages may be handed functions they never declared.
    pub ambient_languages: Vec<Language>,
    pub catalog_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_level: String,
}

pub fn default_endpoint() -> Endpoint {
    if cfg!(windows) {
        Endpoint::Pipe(r"\\.\pipe\railhost".to_string())
    } else {
        Endpoint::Unix(env::temp_dir().join("railhost.sock"))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_pending_calls: 1024,
            ambient_languages: vec![Language::CSharp],
            catalog_dir: None,
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Reads `RAILHOST_*` keys, falling back to defaults for anything unset.
    pub async fn from_manager(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let mut config = BrokerConfig::default();
        let store = &manager.0;

        if let Some(raw) = store.get(KEY_ENDPOINT).await {
            config.endpoint = raw.parse().map_err(|e: rail_protocol::endpoint::EndpointParseError| {
                ConfigError::Invalid {
                    key: KEY_ENDPOINT,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(raw) = store.get(KEY_CALL_TIMEOUT_MS).await {
            config.call_timeout = Duration::from_millis(parse_positive(KEY_CALL_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = store.get(KEY_HANDSHAKE_TIMEOUT_MS).await {
            config.handshake_timeout =
                Duration::from_millis(parse_positive(KEY_HANDSHAKE_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = store.get(KEY_MAX_PENDING_CALLS).await {
            config.max_pending_calls = parse_positive(KEY_MAX_PENDING_CALLS, &raw)? as usize;
        }
        if let Some(raw) = store.get(KEY_AMBIENT_LANGUAGES).await {
            config.ambient_languages = parse_languages(&raw)?;
        }
        if let Some(raw) = store.get(KEY_CATALOG_DIR).await {
            if !raw.trim().is_empty() {
                config.catalog_dir = Some(PathBuf::from(raw.trim()));
            }
        }
        if let Some(raw) = store.get(KEY_LOG_DIR).await {
            config.log_dir = PathBuf::from(raw.trim());
        }
        if let Some(raw) = store.get(KEY_LOG_LEVEL).await {
            config.log_level = raw.trim().to_string();
        }
        Ok(config)
    }

    pub fn is_ambient(&self, language: Option<Language>) -> bool {
        language.is_some_and(|l| self.ambient_languages.contains(&l))
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".into(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Comma separated, e.g. `csharp,python`. An empty value disables ambient dispatch.
fn parse_languages(raw: &str) -> Result<Vec<Language>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|tag| {
            tag.parse::<Language>().map_err(|_| ConfigError::Invalid {
                key: KEY_AMBIENT_LANGUAGES,
                value: raw.to_string(),
                reason: format!("unknown language '{tag}'"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaults_when_nothing_is_set() {
        let mgr = ConfigManager(MapConfigManager::new());
        let config = BrokerConfig::from_manager(&mgr).await.unwrap();

        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_calls, 1024);
        assert_eq!(config.ambient_languages, vec![Language::CSharp]);
        assert!(config.catalog_dir.is_none());
    }

    #[tokio::test]
    async fn map_values_override_defaults() {
        let mgr = ConfigManager(
            MapConfigManager::new()
                .with(KEY_ENDPOINT, "tcp:127.0.0.1:7878")
                .with(KEY_CALL_TIMEOUT_MS, "200")
                .with(KEY_AMBIENT_LANGUAGES, "python, CSharp")
                .with(KEY_CATALOG_DIR, "/srv/catalog"),
        );
        let config = BrokerConfig::from_manager(&mgr).await.unwrap();

        assert_eq!(config.endpoint, Endpoint::Tcp("127.0.0.1:7878".into()));
        assert_eq!(config.call_timeout, Duration::from_millis(200));
        assert_eq!(config.ambient_languages, vec![Language::Python, Language::CSharp]);
        assert_eq!(config.catalog_dir, Some(PathBuf::from("/srv/catalog")));
        assert!(config.is_ambient(Some(Language::Python)));
        assert!(!config.is_ambient(Some(Language::Cpp)));
        assert!(!config.is_ambient(None));
    }

    #[tokio::test]
    async fn empty_language_list_disables_ambient_dispatch() {
        let mgr = ConfigManager(MapConfigManager::new().with(KEY_AMBIENT_LANGUAGES, ""));
        let config = BrokerConfig::from_manager(&mgr).await.unwrap();
        assert!(config.ambient_languages.is_empty());
    }

    #[tokio::test]
    async fn bad_values_name_the_key() {
        let mgr = ConfigManager(MapConfigManager::new().with(KEY_CALL_TIMEOUT_MS, "0"));
        let err = BrokerConfig::from_manager(&mgr).await.unwrap_err();
        assert!(err.to_string().contains(KEY_CALL_TIMEOUT_MS));

        let mgr = ConfigManager(MapConfigManager::new().with(KEY_AMBIENT_LANGUAGES, "cobol"));
        let err = BrokerConfig::from_manager(&mgr).await.unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[tokio::test]
    async fn env_manager_reads_dotenv_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "RAILHOST_TEST_ONLY_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(Some(env_path));
        assert_eq!(mgr.get("RAILHOST_TEST_ONLY_KEY").await, Some("abc123".to_string()));
        assert!(mgr.keys().await.contains(&"RAILHOST_TEST_ONLY_KEY".to_string()));
        assert!(mgr.as_vec().await.iter().all(|(k, _)| k.starts_with("RAILHOST_")));
    }
}
