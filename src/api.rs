use serde::{Deserialize, Serialize};

use crate::link_service::{CreatedLink, SweepReport};

#[derive(Debug, Deserialize)]
pub struct CreateLinkPayload {
    #[serde(rename = "longURL", default)]
    pub long_url: Option<String>,
    #[serde(default)]
    pub redirect: Option<RedirectFlag>,
}

/// Clients send either `true` or the string `"1"` to ask for a redirect.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RedirectFlag {
    Bool(bool),
    Text(String),
    Other(serde_json::Value),
}

impl RedirectFlag {
    #[must_use]
    pub fn is_set(&self) -> bool {
        match self {
            Self::Bool(flag) => *flag,
            Self::Text(text) => text == "1",
            Self::Other(_) => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ShortenedLink {
    pub id: String,
    #[serde(rename = "shortURL")]
    pub short_url: String,
    pub title: String,
    pub exp: Option<i64>,
    pub duration: Option<&'static str>,
}

impl From<CreatedLink> for ShortenedLink {
    fn from(CreatedLink { record, duration }: CreatedLink) -> Self {
        Self {
            id: record.id,
            short_url: record.short_url,
            title: record.title,
            exp: record.exp,
            duration: duration.map(|class| class.label()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SweepResult {
    pub cleaned: u64,
    pub scanned: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl From<SweepReport> for SweepResult {
    fn from(
        SweepReport {
            scanned,
            removed,
            skipped,
            failed,
        }: SweepReport,
    ) -> Self {
        Self {
            cleaned: removed,
            scanned,
            skipped,
            failed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}
