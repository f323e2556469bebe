//! Daemon configuration file.

use anyhow::{Context, Result};
use replica_core::SyncConfig;
use std::path::Path;
use tracing::info;

/// Load a `SyncConfig` from a JSON file. Missing fields take their defaults;
/// no path means all defaults.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SyncConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path_gives_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.retry.max_attempts, SyncConfig::default().retry.max_attempts);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replica.json");
        std::fs::write(
            &path,
            r#"{"circuit": {"maxConsecutiveErrors": 9}, "leader": {"autoClaim": true}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.circuit.max_consecutive_errors, 9);
        assert!(config.leader.auto_claim);
        assert_eq!(config.health.interval_ms, 30_000);
    }

    #[test]
    fn test_bad_file_names_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
