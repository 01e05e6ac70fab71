//! TOML 設定ファイルの読み込み

use std::path::Path;

use anyhow::{Context, Result};
use nostrpress_core::EngineConfig;

/// ファイルが無ければデフォルト設定
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        tracing::info!("Using default configuration");
        return Ok(EngineConfig::default());
    };

    tracing::info!("Loading configuration from {}", path.display());
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(text: &str) -> Result<EngineConfig> {
    Ok(toml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let config = parse(
            r#"
            relays = ["wss://relay.example"]
            site_secret_key = "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5"
            queue_interval_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.relays, vec!["wss://relay.example"]);
        assert_eq!(config.queue_interval_secs, 60);
        assert_eq!(config.nwc_timeout_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nostrpress.toml");
        std::fs::write(&path, "lease_ttl_secs = 120\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.lease_ttl_secs, 120);
        assert_eq!(config.relays, EngineConfig::default().relays);

        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(parse("relays = 5").is_err());
    }
}
