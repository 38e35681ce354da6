use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Poll cadence when the config file doesn't override it.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 50;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct EngineConfig {
    pub(crate) poll_interval_secs: Option<u64>,
}

/// Read `<data_dir>/barter_config.json`, defaulting on any read or parse
/// failure so a missing or corrupt file never blocks startup.
pub(crate) fn load_engine_config(data_dir: &str) -> EngineConfig {
    let path = Path::new(data_dir).join("barter_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return EngineConfig::default();
    };
    serde_json::from_slice::<EngineConfig>(&bytes).unwrap_or_default()
}

impl EngineConfig {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_engine_config(dir.path().to_str().unwrap());
        assert_eq!(config.poll_interval(), Duration::from_secs(50));
    }

    #[test]
    fn file_overrides_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("barter_config.json"),
            br#"{"poll_interval_secs": 2}"#,
        )
        .unwrap();
        let config = load_engine_config(dir.path().to_str().unwrap());
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("barter_config.json"), b"not json").unwrap();
        let config = load_engine_config(dir.path().to_str().unwrap());
        assert_eq!(config.poll_interval(), Duration::from_secs(50));
    }
}
