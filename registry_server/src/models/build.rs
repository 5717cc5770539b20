//! A single CI build, keyed by commit hash within its repository.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::tag::Tag;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Build number assigned by the CI engine.
    pub external_id: i64,
    pub branch: String,
    /// First line of the commit message.
    pub title: String,
    pub link: String,
    /// Authoritative push time reported by the CI engine.
    pub push_date: DateTime<Utc>,
    /// Last time artifacts were written for this commit.
    #[serde(default)]
    pub last_artifact_change: Option<DateTime<Utc>>,
    /// Commit directory relative to the blob store root. `None` = no artifacts.
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
}

impl Build {
    /// Placeholder for a commit that received artifacts before the CI
    /// engine reported it.
    pub fn unlisted(now: DateTime<Utc>) -> Self {
        Self {
            external_id: 0,
            branch: String::new(),
            title: String::new(),
            link: String::new(),
            push_date: now,
            last_artifact_change: None,
            artifact_path: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artifact_path.as_deref().is_none_or(str::is_empty)
    }

    /// Timestamp retention is measured from.
    pub fn last_change(&self) -> DateTime<Utc> {
        self.last_artifact_change.unwrap_or(self.push_date)
    }
}
