use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_DIRECTORY_TTL_SECS;

/// Top-level relay config, loaded from TOML. Every field has a CLI/env
/// counterpart; the file is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind the HTTP/WebSocket listener.
    pub bind: Option<String>,
    /// Local server identity overrides.
    pub server: Option<ServerIdentityConfig>,
    /// Shared store settings.
    pub store: Option<StoreConfig>,
}

/// Server identity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentityConfig {
    /// Override the generated server id.
    pub id: Option<String>,
}

/// Shared store section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. Absent means in-process store (single-server).
    pub url: Option<String>,
    /// Directory TTL in seconds.
    pub ttl_seconds: Option<u64>,
}

impl RelayConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (the store URL may embed
        // credentials).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Directory TTL, falling back to the contract default.
    pub fn ttl_seconds(&self) -> u64 {
        self.store
            .as_ref()
            .and_then(|s| s.ttl_seconds)
            .unwrap_or(DEFAULT_DIRECTORY_TTL_SECS)
    }

    /// Store URL, if configured.
    pub fn store_url(&self) -> Option<&str> {
        self.store.as_ref().and_then(|s| s.url.as_deref())
    }
}

/// Validate a server id override. Ids must be 1-32 chars,
/// alphanumeric/hyphens/underscores.
pub fn validate_server_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("server id must not be empty".into());
    }
    if id.len() > 32 {
        return Err(format!("server id too long ({} chars, max 32)", id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!("server id contains invalid characters: {id}"));
    }
    Ok(())
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
    WriteFailed(std::path::PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain store credentials.
#[cfg(unix)]
pub fn check_config_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return, // File doesn't exist or can't be read; nothing to warn about.
    };

    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        tracing::warn!(
            "Relay config file {} is world-readable (mode {:o}). \
             It may contain store credentials -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &std::path::Path) {}

/// Returns true if the given file mode has the world-readable bit set.
///
/// This is a pure helper for testing; it does NOT read the filesystem.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            bind = "127.0.0.1:8080"
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bind.as_deref(), Some("127.0.0.1:8080"));
        assert!(config.store.is_none());
        assert_eq!(config.ttl_seconds(), DEFAULT_DIRECTORY_TTL_SECS);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            bind = "0.0.0.0:9000"

            [server]
            id = "relay-1"

            [store]
            url = "redis://cache.internal:6379/0"
            ttl_seconds = 600
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.server.as_ref().unwrap().id.as_deref(),
            Some("relay-1")
        );
        assert_eq!(
            config.store_url(),
            Some("redis://cache.internal:6379/0")
        );
        assert_eq!(config.ttl_seconds(), 600);
    }

    #[test]
    fn parse_empty_config() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert!(config.bind.is_none());
        assert!(config.store_url().is_none());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = RelayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        let config = RelayConfig {
            bind: Some("127.0.0.1:8080".into()),
            server: Some(ServerIdentityConfig {
                id: Some("relay-1".into()),
            }),
            store: Some(StoreConfig {
                url: Some("redis://localhost:6379".into()),
                ttl_seconds: Some(120),
            }),
        };
        config.save(&path).unwrap();

        let reloaded = RelayConfig::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.bind.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(reloaded.ttl_seconds(), 120);
        assert_eq!(reloaded.store_url(), Some("redis://localhost:6379"));
    }

    #[test]
    fn server_id_validation() {
        assert!(validate_server_id("relay-1").is_ok());
        assert!(validate_server_id("a").is_ok());
        assert!(validate_server_id("").is_err());
        assert!(validate_server_id(&"x".repeat(33)).is_err());
        assert!(validate_server_id("bad id").is_err());
        assert!(validate_server_id("bad:id").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_detects_644() {
        assert!(is_world_readable(0o644));
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_rejects_600() {
        assert!(!is_world_readable(0o600));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_does_not_panic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "# test").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        check_config_permissions(&path);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        check_config_permissions(&path);
    }
}
