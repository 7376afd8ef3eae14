//! Generation tokens stored in the remote version marker.
//!
//! Readers compare tokens for equality only. The writer side issues new
//! tokens as unix seconds, bumped past the previous token when the clock
//! has not moved on, so issued values strictly increase.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Parses marker contents. Surrounding whitespace is ignored and an
    /// empty marker holds no token.
    pub fn parse(raw: &str) -> Option<VersionToken> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(VersionToken(trimmed.to_string()))
        }
    }

    /// Issue the token that follows `previous`.
    pub fn next_after(previous: Option<&VersionToken>) -> VersionToken {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Self::next_after_at(previous, now)
    }

    fn next_after_at(previous: Option<&VersionToken>, now: u64) -> VersionToken {
        let floor = previous
            .and_then(|token| token.0.parse::<u64>().ok())
            .map(|prev| prev.saturating_add(1))
            .unwrap_or(0);

        VersionToken(now.max(floor).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Issue order of writer tokens. Tokens that are not unix seconds sort first.
    pub fn sequence(&self) -> u64 {
        self.0.parse().unwrap_or(0)
    }

    pub fn is_newer_than(&self, other: &VersionToken) -> bool {
        self.sequence() > other.sequence()
    }
}

impl Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for VersionToken {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for VersionToken {
    fn from(fr: &str) -> Self {
        VersionToken(fr.to_string())
    }
}
