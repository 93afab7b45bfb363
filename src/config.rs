use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

#[derive(Debug, Clone, Deserialize)]
pub struct HolodexConfig {
    pub api_key: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_chat_lang")]
    pub chat_lang: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub offset_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            offset_secs: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TrackingConfig {
    #[serde(default, deserialize_with = "deserialize_string_or_list_to_set")]
    pub channels: HashSet<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub holodex: HolodexConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

fn default_cache_dir() -> String {
    ".".to_string()
}

fn default_chat_lang() -> String {
    "en".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

pub fn load_settings() -> AppResult<AppSettings> {
    let settings = Config::builder()
        .add_source(
            Environment::with_prefix("HOLOFEED")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("tracking.channels")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    if settings.polling.interval_secs == 0 {
        return Err(
            ConfigError::InvalidValue("polling.interval_secs must be non-zero".to_string()).into(),
        );
    }
    if settings.polling.offset_secs >= settings.polling.interval_secs {
        return Err(ConfigError::InvalidValue(
            "polling.offset_secs must be smaller than polling.interval_secs".to_string(),
        )
        .into());
    }

    Ok(settings)
}

fn deserialize_string_or_list_to_set<'de, D>(deserializer: D) -> Result<HashSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    let mut set = HashSet::new();

    match value {
        Value::String(s) => {
            for item in s.split(',') {
                let trimmed = item.trim();
                if !trimmed.is_empty() {
                    set.insert(trimmed.to_string());
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                if let Value::String(s) = item {
                    set.insert(s.trim().to_string());
                } else {
                    return Err(D::Error::custom("Array must contain only strings"));
                }
            }
        }
        _ => return Err(D::Error::custom("Expected string or array of strings")),
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "deserialize_string_or_list_to_set")]
        channels: HashSet<String>,
    }

    #[test]
    fn test_channel_list_from_comma_string() {
        let wrapper: Wrapper =
            serde_json::from_str(r#"{"channels": "UC1234, UC5678 ,UC9012"}"#).unwrap();
        assert_eq!(wrapper.channels.len(), 3);
        assert!(wrapper.channels.contains("UC5678"));
    }

    #[test]
    fn test_channel_list_from_array() {
        let wrapper: Wrapper = serde_json::from_str(r#"{"channels": ["UC1234", "UC5678"]}"#).unwrap();
        assert_eq!(wrapper.channels.len(), 2);
    }

    #[test]
    fn test_channel_list_rejects_non_strings() {
        let result: Result<Wrapper, _> = serde_json::from_str(r#"{"channels": [1, 2]}"#);
        assert!(result.is_err());
    }
}
