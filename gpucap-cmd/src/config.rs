//! Replay configuration file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use gpucap_ipc::ReplayConfig;

/// Reads a JSON config file. Missing keys keep their defaults.
pub fn load_config(path: Option<&Path>) -> Result<ReplayConfig> {
    let Some(path) = path else {
        return Ok(ReplayConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        fs::write(&path, r#"{ "counter_passes": 1 }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.counter_passes, 1);
        assert_eq!(config.debug_view_capacity, 64);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/replay.json"))).is_err());
        assert_eq!(load_config(None).unwrap().counter_passes, 2);
    }
}
