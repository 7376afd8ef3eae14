use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// Content identifier. Generated ids are `{prefix}_{ulid}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Eid {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Eid(s.to_string()))
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl From<String> for Eid {
    fn from(fr: String) -> Self {
        Eid(fr)
    }
}

impl From<Eid> for String {
    fn from(fr: Eid) -> Self {
        fr.0
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string().to_lowercase())
    }

    pub fn with_prefix(prefix: &str) -> Eid {
        Eid(format!("{prefix}_{}", Self::new()))
    }

    /// Id of the n-th chunk (1-based) of this content.
    pub fn chunk_id(&self, n: usize) -> String {
        format!("{}_chunk{n}", self.0)
    }

    /// Prefix shared by every chunk id of this content. Ids of other
    /// contents can share it too, see [`Eid::owns_chunk_id`].
    pub fn chunk_prefix(&self) -> String {
        format!("{}_chunk", self.0)
    }

    /// Whether `chunk_id` is exactly `<self>_chunk<n>`.
    pub fn owns_chunk_id(&self, chunk_id: &str) -> bool {
        chunk_id
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix("_chunk"))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}
