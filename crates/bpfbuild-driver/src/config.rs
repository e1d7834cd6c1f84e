//! External JSON configuration naming custom optimization passes.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::passes::{validate_pass_flag, PassError};

/// On-disk config document. Exactly one key is recognized; anything else is
/// a load error rather than a silent ignore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkerConfig {
    #[serde(default)]
    pub custom_passes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unreadable config {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in config {path}: {message}")]
    Json { path: String, message: String },
    #[error("config {path}: custom pass #{index}: {source}")]
    InvalidPass {
        path: String,
        index: usize,
        #[source]
        source: PassError,
    },
}

/// Loads and validates a config file. Every pass name is trimmed and checked
/// before any of the list is handed downstream; the first violation fails the
/// whole load with its index.
pub fn load_linker_config(path: &Path) -> Result<LinkerConfig, ConfigError> {
    let display = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Unreadable {
        path: display.clone(),
        source,
    })?;
    let mut config: LinkerConfig =
        serde_json::from_slice(&bytes).map_err(|err| ConfigError::Json {
            path: display.clone(),
            message: err.to_string(),
        })?;
    for (index, pass) in config.custom_passes.iter_mut().enumerate() {
        let trimmed = pass.trim().to_string();
        validate_pass_flag(&trimmed).map_err(|source| ConfigError::InvalidPass {
            path: display.clone(),
            index,
            source,
        })?;
        *pass = trimmed;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TMP_N: AtomicUsize = AtomicUsize::new(0);

    fn write_config(contents: &str) -> PathBuf {
        let pid = std::process::id();
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("bpfbuild_config_{pid}_{n}.json"));
        std::fs::write(&path, contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_and_trims_custom_passes() {
        let path = write_config(r#"{"custom_passes": [" dce ", "-adce"]}"#);
        let config = load_linker_config(&path).unwrap();
        assert_eq!(config.custom_passes, vec!["dce".to_string(), "-adce".to_string()]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn invalid_pass_fails_with_its_index() {
        let path = write_config(r#"{"custom_passes": ["dce", "-inline;rm"]}"#);
        match load_linker_config(&path).unwrap_err() {
            ConfigError::InvalidPass { index, .. } => assert_eq!(index, 1),
            other => panic!("expected InvalidPass, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn traversal_tokens_and_empty_entries_are_rejected() {
        let path = write_config(r#"{"custom_passes": ["../../etc/passwd"]}"#);
        assert!(matches!(
            load_linker_config(&path).unwrap_err(),
            ConfigError::InvalidPass { index: 0, .. }
        ));
        let _ = std::fs::remove_file(&path);

        let path = write_config(r#"{"custom_passes": ["   "]}"#);
        assert!(matches!(
            load_linker_config(&path).unwrap_err(),
            ConfigError::InvalidPass {
                index: 0,
                source: PassError::Empty,
                ..
            }
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_json_and_unknown_keys_fail() {
        let path = write_config("{not json");
        assert!(matches!(
            load_linker_config(&path).unwrap_err(),
            ConfigError::Json { .. }
        ));
        let _ = std::fs::remove_file(&path);

        let path = write_config(r#"{"custom_passes": [], "extra": 1}"#);
        assert!(matches!(
            load_linker_config(&path).unwrap_err(),
            ConfigError::Json { .. }
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let path = std::env::temp_dir().join("bpfbuild_config_does_not_exist.json");
        assert!(matches!(
            load_linker_config(&path).unwrap_err(),
            ConfigError::Unreadable { .. }
        ));
    }
}
