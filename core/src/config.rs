use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::keys::Keys;
use crate::lnurl::LightningAddress;
use crate::nwc::NwcConnection;
use crate::relay::ws::validate_relay_url;

/// エンジン設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub relays: Vec<String>,
    /// サイトの秘密鍵 (hex / nsec)
    pub site_secret_key: Option<String>,
    pub nwc_uri: Option<String>,
    pub nwc_timeout_secs: u64,
    pub queue_interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub sent_log_capacity: usize,
    pub connect_timeout_secs: u64,
    pub lightning_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: vec!["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()],
            site_secret_key: None,
            nwc_uri: None,
            nwc_timeout_secs: 30,
            queue_interval_secs: 300,
            lease_ttl_secs: 600,
            sent_log_capacity: 50,
            connect_timeout_secs: 10,
            lightning_address: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            return Err(CoreError::Other("at least one relay is required".to_string()));
        }
        for relay in &self.relays {
            validate_relay_url(relay)?;
        }

        let durations = [
            ("nwc_timeout_secs", self.nwc_timeout_secs),
            ("queue_interval_secs", self.queue_interval_secs),
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(CoreError::Other(format!("{} must be greater than zero", name)));
        }
        if self.sent_log_capacity == 0 {
            return Err(CoreError::Other("sent_log_capacity must be greater than zero".to_string()));
        }

        self.site_keys()?;
        self.nwc_connection()?;
        if let Some(address) = self.lightning_address.as_deref().filter(|a| !a.is_empty()) {
            LightningAddress::parse(address)?;
        }
        Ok(())
    }

    /// 設定されたサイト鍵
    pub fn site_keys(&self) -> Result<Option<Keys>> {
        match self.site_secret_key.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => Keys::parse(secret).map(Some),
            None => Ok(None),
        }
    }

    pub fn nwc_connection(&self) -> Result<Option<NwcConnection>> {
        match self.nwc_uri.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(uri) => NwcConnection::parse(uri).map(Some),
            None => Ok(None),
        }
    }

    pub fn nwc_timeout(&self) -> Duration {
        Duration::from_secs(self.nwc_timeout_secs)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.nwc_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue_interval(), Duration::from_secs(300));
        assert!(config.site_keys().unwrap().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"relays":["wss://relay.example"]}"#).unwrap();
        assert_eq!(config.relays, vec!["wss://relay.example"]);
        assert_eq!(config.sent_log_capacity, 50);
        assert_eq!(config.lease_ttl_secs, 600);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig { relays: vec![], ..Default::default() };
        assert!(config.validate().is_err());

        config.relays = vec!["https://relay.example".to_string()];
        assert!(config.validate().is_err());

        config = EngineConfig { nwc_timeout_secs: 0, ..Default::default() };
        assert!(config.validate().is_err());

        config = EngineConfig { site_secret_key: Some("nope".to_string()), ..Default::default() };
        assert!(matches!(config.validate(), Err(CoreError::InvalidKeyFormat(_))));

        config = EngineConfig { nwc_uri: Some("http://wallet".to_string()), ..Default::default() };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConnectionUri(_))));

        config = EngineConfig { lightning_address: Some("no-at-sign".to_string()), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_site_keys_accepts_nsec() {
        let config = EngineConfig {
            site_secret_key: Some("nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5".to_string()),
            ..Default::default()
        };
        let keys = config.site_keys().unwrap().unwrap();
        assert_eq!(
            keys.secret_key().to_hex(),
            "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa"
        );
    }
}
