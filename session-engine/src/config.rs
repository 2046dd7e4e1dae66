//! Engine configuration, loaded from JSON.

use std::{fmt, fs, path::Path};

use double_ratchets::BackendKind;
use serde::{Deserialize, Serialize};
use storage::StorageConfig;

use crate::errors::ConfigError;

const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// When an outbound group session must be rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSessionPolicy {
    pub max_age_ms: i64,
    pub max_messages: u32,
}

impl Default for GroupSessionPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: WEEK_MS,
            max_messages: 100,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key the store files this device's rows under.
    pub account_id: String,
    pub user_id: String,
    pub device_id: String,
    pub backend: BackendKind,
    pub storage: StorageConfig,
    /// Seals every pickle written to the store.
    pub pickle_key: String,
    pub group_session: GroupSessionPolicy,
    /// How long pairwise message hashes are kept for duplicate detection.
    pub message_hash_retention_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            user_id: String::new(),
            device_id: String::new(),
            backend: BackendKind::default(),
            storage: StorageConfig::default(),
            pickle_key: String::new(),
            group_session: GroupSessionPolicy::default(),
            message_hash_retention_ms: 30 * DAY_MS,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("account_id", &self.account_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("backend", &self.backend)
            .field("storage", &self.storage)
            .field("pickle_key", &"..redacted..")
            .field("group_session", &self.group_session)
            .field("message_hash_retention_ms", &self.message_hash_retention_ms)
            .finish()
    }
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pickle_key.is_empty() {
            return Err(ConfigError::Invalid("pickle_key must not be empty"));
        }
        if self.account_id.is_empty() {
            return Err(ConfigError::Invalid("account_id must not be empty"));
        }
        if self.user_id.is_empty() {
            return Err(ConfigError::Invalid("user_id must not be empty"));
        }
        if self.group_session.max_age_ms <= 0 || self.group_session.max_messages == 0 {
            return Err(ConfigError::Invalid(
                "group_session limits must be positive",
            ));
        }
        if self.message_hash_retention_ms < 0 {
            return Err(ConfigError::Invalid(
                "message_hash_retention_ms must not be negative",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            account_id: "@alice:example.org/ALICE".into(),
            user_id: "@alice:example.org".into(),
            device_id: "ALICE".into(),
            pickle_key: "secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backend, BackendKind::Portable);
        assert_eq!(config.storage, StorageConfig::InMemory);
        assert_eq!(config.group_session.max_messages, 100);
        assert_eq!(config.group_session.max_age_ms, WEEK_MS);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.pickle_key.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = valid();
        config.group_session.max_messages = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "account_id": "@bob:example.org/BOB",
                "user_id": "@bob:example.org",
                "device_id": "BOB",
                "backend": "native",
                "storage": {{ "type": "file", "path": "/tmp/bob.db" }},
                "pickle_key": "hunter2",
                "group_session": {{ "max_messages": 5 }}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.backend, BackendKind::Native);
        assert_eq!(config.group_session.max_messages, 5);
        assert_eq!(config.group_session.max_age_ms, WEEK_MS);
        assert!(matches!(config.storage, StorageConfig::File { .. }));
    }

    #[test]
    fn test_load_reports_missing_file_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            EngineConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&bad), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_debug_hides_pickle_key() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("secret"));
    }
}
