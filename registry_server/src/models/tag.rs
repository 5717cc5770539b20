//! Release tags attached to a build.
//!
//! On the wire an unset version is `""` and an unset release date is `""`;
//! a set release date is the Unix epoch seconds as a quoted decimal string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name used when a tag is set without an explicit name.
pub const DEFAULT_TAG: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, with = "empty_string")]
    pub version: Option<String>,
    #[serde(default, with = "unix_string")]
    pub release_date: Option<DateTime<Utc>>,
}

impl Tag {
    /// Merge an incoming update into an existing tag.
    ///
    /// A non-empty version and a set release date overwrite; `ready` always
    /// overwrites.
    pub fn merge(&mut self, incoming: Tag) {
        if let Some(version) = incoming.version.filter(|v| !v.is_empty()) {
            self.version = Some(version);
        }
        if incoming.release_date.is_some() {
            self.release_date = incoming.release_date;
        }
        self.ready = incoming.ready;
    }
}

mod empty_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.as_deref().unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.filter(|v| !v.is_empty()))
    }
}

mod unix_string {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => s.serialize_str(&date.timestamp().to_string()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = match Option::<Raw>::deserialize(d)? {
            None => return Ok(None),
            Some(Raw::Number(n)) => n,
            Some(Raw::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                text.parse::<i64>().map_err(D::Error::custom)?
            }
        };
        if secs == 0 {
            return Ok(None);
        }
        DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}")))
    }
}
