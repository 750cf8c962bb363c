use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GarageBotError, Result};

/// Settings for the OpenAI-compatible endpoint used to generate advisory
/// text. Advisory output is informational only and never drives reminders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdvisorConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Wall-clock cadence of the three reminder sub-checks, in seconds.
/// Deployment configuration, not part of the evaluation contract.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub insurance_check_secs: u64,
    pub service_check_secs: u64,
    pub recurring_check_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            insurance_check_secs: 86_400,
            service_check_secs: 86_400,
            recurring_check_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub admin_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub advisor: Option<AdvisorConfig>,
    #[serde(default = "default_fuel_type_labels")]
    pub fuel_type_labels: BTreeMap<String, String>,
    #[serde(default = "default_maintenance_categories")]
    pub maintenance_categories: BTreeMap<String, String>,
}

fn default_session_ttl_secs() -> u64 {
    1800
}

fn default_fuel_type_labels() -> BTreeMap<String, String> {
    [
        ("petrol", "Petrol"),
        ("diesel", "Diesel"),
        ("lpg", "LPG"),
        ("electric", "Electric"),
        ("hybrid", "Hybrid"),
    ]
    .into_iter()
    .map(|(code, label)| (code.to_string(), label.to_string()))
    .collect()
}

fn default_maintenance_categories() -> BTreeMap<String, String> {
    [
        ("service", "Scheduled service"),
        ("repair", "Repair"),
        ("parts", "Part replacement"),
        ("tires", "Tires and wheels"),
        ("other", "Other"),
    ]
    .into_iter()
    .map(|(code, label)| (code.to_string(), label.to_string()))
    .collect()
}

impl Config {
    pub fn convention_defaults() -> Self {
        Self {
            admin_chat_id: None,
            webhook_url: None,
            session_ttl_secs: default_session_ttl_secs(),
            schedule: ScheduleConfig::default(),
            advisor: None,
            fuel_type_labels: default_fuel_type_labels(),
            maintenance_categories: default_maintenance_categories(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| GarageBotError::Config(format!("failed to read {path}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| GarageBotError::Config(format!("failed to parse {path}: {e}")))
    }

    /// File config when given, conventions otherwise; environment values
    /// win over both so deployments can inject secrets without a file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::convention_defaults(),
        };

        if let Ok(value) = std::env::var("GARAGE_ADMIN_CHAT") {
            if !value.trim().is_empty() {
                config.admin_chat_id = Some(value.trim().to_string());
            }
        }
        if let Ok(value) = std::env::var("GARAGE_WEBHOOK_URL") {
            if !value.trim().is_empty() {
                config.webhook_url = Some(value.trim().to_string());
            }
        }
        if let Ok(value) = std::env::var("OPENAI_API_KEY") {
            if !value.trim().is_empty() {
                let advisor = config.advisor.get_or_insert(AdvisorConfig {
                    api_key: None,
                    model: None,
                    base_url: None,
                });
                advisor.api_key = Some(value.trim().to_string());
            }
        }

        Ok(config)
    }

    pub fn fuel_type_label<'a>(&'a self, code: &'a str) -> &'a str {
        self.fuel_type_labels
            .get(code)
            .map(String::as_str)
            .unwrap_or(code)
    }

    pub fn maintenance_category_label<'a>(&'a self, code: &'a str) -> &'a str {
        self.maintenance_categories
            .get(code)
            .map(String::as_str)
            .unwrap_or(code)
    }

    pub fn fuel_type_codes(&self) -> Vec<String> {
        self.fuel_type_labels.keys().cloned().collect()
    }

    pub fn maintenance_category_codes(&self) -> Vec<String> {
        self.maintenance_categories.keys().cloned().collect()
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_known_labels() {
        let config = Config::convention_defaults();
        assert_eq!(config.fuel_type_label("diesel"), "Diesel");
        assert_eq!(config.maintenance_category_label("service"), "Scheduled service");
        assert_eq!(config.fuel_type_label("kerosene"), "kerosene");
        assert_eq!(config.session_ttl_secs, 1800);
    }

    #[test]
    fn parses_partial_file_with_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"admin_chat_id": "42", "session_ttl_secs": 60}"#)
            .expect("write config");

        let config = Config::from_file(path.to_str().expect("path")).expect("parse");
        assert_eq!(config.admin_chat_id.as_deref(), Some("42"));
        assert_eq!(config.session_ttl_secs, 60);
        assert!(config.maintenance_categories.contains_key("parts"));
    }
}
