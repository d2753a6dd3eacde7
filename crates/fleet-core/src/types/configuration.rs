//! Configuration values served by the remote configuration service.
//!
//! The typed accessors (`as_int`, `as_bool`, ...) are pure: they never touch
//! the cache or the network.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// ConfigValueType
// ---------------------------------------------------------------------------

/// Declared type of a configuration value.
///
/// Decodes from either the numeric code (`0..=3`) or the lowercase name;
/// always encodes as the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "RawValueType")]
pub enum ConfigValueType {
    #[default]
    String,
    Number,
    Boolean,
    Structured,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValueType {
    Code(u8),
    Name(String),
}

impl TryFrom<RawValueType> for ConfigValueType {
    type Error = String;

    fn try_from(raw: RawValueType) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawValueType::Code(0) => Ok(Self::String),
            RawValueType::Code(1) => Ok(Self::Number),
            RawValueType::Code(2) => Ok(Self::Boolean),
            RawValueType::Code(3) => Ok(Self::Structured),
            RawValueType::Code(other) => Err(format!("unknown config value type code {other}")),
            RawValueType::Name(name) => match name.to_ascii_lowercase().as_str() {
                "string" => Ok(Self::String),
                "number" => Ok(Self::Number),
                "boolean" | "bool" => Ok(Self::Boolean),
                "structured" | "json" => Ok(Self::Structured),
                other => Err(format!("unknown config value type '{other}'")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationValue
// ---------------------------------------------------------------------------

/// A named configuration entry as returned by the configuration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationValue {
    pub key: String,
    /// Raw textual value.
    pub value: String,
    #[serde(rename = "type", default)]
    pub value_type: ConfigValueType,
    #[serde(default)]
    pub environment: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl ConfigurationValue {
    /// Build a value by hand (tests, defaults).
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        value_type: ConfigValueType,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type,
            environment: String::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn as_string(&self) -> &str {
        &self.value
    }

    /// Parse the raw value as a base-10 integer.
    pub fn as_int(&self) -> Result<i64> {
        self.value.parse::<i64>().map_err(|_| self.conversion_error("integer"))
    }

    /// Parse the raw value as a float.
    pub fn as_f64(&self) -> Result<f64> {
        self.value.parse::<f64>().map_err(|_| self.conversion_error("float"))
    }

    /// Parse the raw value as a boolean.
    ///
    /// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
    pub fn as_bool(&self) -> Result<bool> {
        match self.value.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
            _ => Err(self.conversion_error("boolean")),
        }
    }

    /// Decode a structured (JSON) value into `T`.
    pub fn as_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.value)
            .map_err(|_| self.conversion_error(std::any::type_name::<T>()))
    }

    fn conversion_error(&self, target: &'static str) -> FleetError {
        FleetError::Conversion {
            value: self.value.clone(),
            target,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheStats
// ---------------------------------------------------------------------------

/// Snapshot of the configuration cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn new(cache_hits: u64, cache_misses: u64, cache_size: usize) -> Self {
        let total = cache_hits + cache_misses;
        let hit_rate = if total > 0 {
            cache_hits as f64 / total as f64
        } else {
            0.0
        };
        Self {
            cache_hits,
            cache_misses,
            cache_size,
            hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(raw: &str) -> ConfigurationValue {
        ConfigurationValue::new("custodian.settlement.timeout_hours", raw, ConfigValueType::Number)
    }

    #[test]
    fn int_conversion() {
        assert_eq!(value("24").as_int().unwrap(), 24);
        assert_eq!(value("-3").as_int().unwrap(), -3);
        assert!(matches!(
            value("abc").as_int(),
            Err(FleetError::Conversion { target: "integer", .. })
        ));
        assert!(value(" 24").as_int().is_err());
    }

    #[test]
    fn bool_conversion() {
        assert!(value("true").as_bool().unwrap());
        assert!(value("T").as_bool().unwrap());
        assert!(!value("0").as_bool().unwrap());
        assert!(matches!(
            value("maybe").as_bool(),
            Err(FleetError::Conversion { target: "boolean", .. })
        ));
    }

    #[test]
    fn string_and_json_conversion() {
        assert_eq!(value("custodian-simulator").as_string(), "custodian-simulator");
        let assets: Vec<String> = value(r#"["BTC","ETH"]"#).as_json().unwrap();
        assert_eq!(assets, vec!["BTC", "ETH"]);
        assert!(value("not json").as_json::<Vec<String>>().is_err());
    }

    #[test]
    fn value_type_accepts_code_or_name() {
        let raw = r#"{"key":"a","value":"true","type":2,"environment":"dev"}"#;
        let by_code: ConfigurationValue = serde_json::from_str(raw).unwrap();
        assert_eq!(by_code.value_type, ConfigValueType::Boolean);

        let raw = r#"{"key":"a","value":"{}","type":"structured"}"#;
        let by_name: ConfigurationValue = serde_json::from_str(raw).unwrap();
        assert_eq!(by_name.value_type, ConfigValueType::Structured);

        let raw = r#"{"key":"a","value":"1","type":9}"#;
        assert!(serde_json::from_str::<ConfigurationValue>(raw).is_err());
        assert_eq!(serde_json::to_string(&ConfigValueType::Number).unwrap(), "\"number\"");
    }

    #[test]
    fn hit_rate_is_zero_without_lookups() {
        assert_eq!(CacheStats::new(0, 0, 0).hit_rate, 0.0);
        assert_eq!(CacheStats::new(3, 1, 2).hit_rate, 0.75);
    }
}
