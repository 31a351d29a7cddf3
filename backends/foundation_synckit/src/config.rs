//! TOML configuration for the toolkit.
//!
//! Every section has defaults, so an empty document is a valid config:
//!
//! ```toml
//! [semaphore]
//! undo = "rollback-on-exit"
//! permissions = 0o600
//!
//! [workers]
//! name_prefix = "synckit-worker"
//!
//! [dual_lock]
//! spin_limit = 10
//! ```

use derive_more::derive::From;
use serde::Deserialize;

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    IOError(std::io::Error),

    #[from(ignore)]
    DeserializationFailed(toml::de::Error),

    InvalidPath(std::path::PathBuf),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::DeserializationFailed(value)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// `UndoPolicy` decides what happens to semaphore units held by a
/// process that exits without returning them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UndoPolicy {
    /// The kernel rolls back every unit the process still holds.
    RollbackOnExit,

    /// Units taken by a dead process stay taken; other waiters may
    /// block forever.
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    pub undo: UndoPolicy,

    /// Permission bits applied when the semaphore set is created.
    pub permissions: u32,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            undo: UndoPolicy::RollbackOnExit,
            permissions: 0o600,
        }
    }
}

impl SemaphoreConfig {
    #[must_use]
    pub fn with_undo(mut self, undo: UndoPolicy) -> Self {
        self.undo = undo;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::from("synckit-worker"),
            stack_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DualLockConfig {
    /// Backoff rounds spent spinning before a waiting worker yields.
    pub spin_limit: u32,
}

impl Default for DualLockConfig {
    fn default() -> Self {
        Self { spin_limit: 10 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub semaphore: SemaphoreConfig,
    pub workers: WorkerConfig,
    pub dual_lock: DualLockConfig,
}

/// Reads and parses a [`SyncConfig`] from a TOML file.
pub fn from_path<V>(target: V) -> ConfigResult<SyncConfig>
where
    V: Into<std::path::PathBuf>,
{
    let target_path = target.into();
    if !target_path.is_file() {
        return Err(ConfigError::InvalidPath(target_path));
    }
    let config_content = std::fs::read_to_string(target_path)?;
    from_str(&config_content)
}

pub fn from_str(content: &str) -> ConfigResult<SyncConfig> {
    let config_obj: SyncConfig = toml::from_str(content)?;
    Ok(config_obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// WHY: callers should be able to rely on defaults for absent sections
    /// WHAT: an empty document yields `SyncConfig::default()`
    #[test]
    fn test_empty_document_is_default() {
        let config = from_str("").expect("should parse");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.semaphore.undo, UndoPolicy::RollbackOnExit);
    }

    /// WHY: undo-on-crash must be an explicit, readable choice
    /// WHAT: kebab-case policy names map onto `UndoPolicy`
    #[test]
    fn test_parses_sections() {
        let config = from_str(
            r#"
            [semaphore]
            undo = "persist"
            permissions = 0o640

            [workers]
            name_prefix = "bank"
            stack_size = 65536

            [dual_lock]
            spin_limit = 4
            "#,
        )
        .expect("should parse");

        assert_eq!(config.semaphore.undo, UndoPolicy::Persist);
        assert_eq!(config.semaphore.permissions, 0o640);
        assert_eq!(config.workers.name_prefix, "bank");
        assert_eq!(config.workers.stack_size, Some(65536));
        assert_eq!(config.dual_lock.spin_limit, 4);
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let err = from_str("[semaphore]\nundo = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::DeserializationFailed(_)));
    }

    #[test]
    fn test_missing_file_is_invalid_path() {
        let err = from_path("/definitely/not/here/synckit.toml").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPath(_)));
    }

    #[test]
    fn test_loads_from_file() {
        let path = std::env::temp_dir().join(format!("synckit-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[dual_lock]\nspin_limit = 2\n").expect("should write");

        let config = from_path(&path);
        std::fs::remove_file(&path).expect("should clean up");

        assert_eq!(config.expect("should load").dual_lock.spin_limit, 2);
    }
}
