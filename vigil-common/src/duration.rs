//! Serde and CLI support for duration settings
//!
//! Accepts humantime text (`"2s"`, `"500ms"`, `"1m 30s"`) and bare seconds,
//! either as a number or as a numeric string. Serializes as humantime text.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Parse one duration setting
pub fn parse(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<f64>() {
        return from_secs(secs);
    }
    humantime::parse_duration(text).map_err(|e| format!("invalid duration {:?}: {}", text, e))
}

fn from_secs(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {}s: {}", secs, e))
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Fractional(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Fractional(secs) => from_secs(secs).map_err(serde::de::Error::custom),
        Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
    }
}
