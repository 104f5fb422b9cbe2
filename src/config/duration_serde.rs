//! Common serde utilities for human-readable durations across configuration.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

/// Custom serde functions for Duration that support human-readable strings
pub mod duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration_str = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&duration_str)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a duration as seconds (number) or human-readable string (e.g., '250ms', '5m', '1h30m')",
                )
            }

            fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(seconds))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(value)
                    .map_err(|e| de::Error::custom(format!("Invalid duration '{value}': {e}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Parse a default-constant duration string; only used on values we define
/// ourselves in `defaults.rs`.
pub fn parse_default(value: &str) -> Duration {
    humantime::parse_duration(value)
        .unwrap_or_else(|_| panic!("invalid built-in duration default: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(with = "duration")]
        value: Duration,
    }

    #[test]
    fn parses_human_readable_and_numeric() {
        let w: Wrapper = toml::from_str(r#"value = "1h30m""#).unwrap();
        assert_eq!(w.value, Duration::from_secs(5400));

        let w: Wrapper = toml::from_str("value = 45").unwrap();
        assert_eq!(w.value, Duration::from_secs(45));
    }

    #[test]
    fn built_in_defaults_parse() {
        assert_eq!(parse_default("250ms"), Duration::from_millis(250));
        assert_eq!(parse_default("25m"), Duration::from_secs(1500));
    }
}
