//! Read preferences: which server roles and tags may satisfy a read.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// A single tag predicate: every listed key must match the server's tag
/// value. A list of tag sets accepts a server when ANY set matches.
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
    /// Hard pin to one canonical address.
    Server,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<TagSet>,
    /// Set only for `ReadMode::Server`.
    pub pinned: Option<String>,
}

impl ReadPreference {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn primary_preferred() -> Self {
        Self {
            mode: ReadMode::PrimaryPreferred,
            ..Default::default()
        }
    }

    pub fn secondary() -> Self {
        Self {
            mode: ReadMode::Secondary,
            ..Default::default()
        }
    }

    pub fn secondary_preferred() -> Self {
        Self {
            mode: ReadMode::SecondaryPreferred,
            ..Default::default()
        }
    }

    pub fn nearest() -> Self {
        Self {
            mode: ReadMode::Nearest,
            ..Default::default()
        }
    }

    pub fn server(address: impl Into<String>) -> Self {
        Self {
            mode: ReadMode::Server,
            tag_sets: Vec::new(),
            pinned: Some(address.into()),
        }
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    /// Whether this preference can only be satisfied by the primary.
    pub fn requires_primary(&self) -> bool {
        self.mode == ReadMode::Primary
    }

    /// Whether a server's tag map satisfies the predicate list. An empty
    /// list accepts every server.
    pub fn tags_match(&self, server_tags: &BTreeMap<String, String>) -> bool {
        if self.tag_sets.is_empty() {
            return true;
        }
        self.tag_sets.iter().any(|set| {
            set.iter()
                .all(|(k, v)| server_tags.get(k).is_some_and(|sv| sv == v))
        })
    }

    /// Parse the `readPreference` connection-string value.
    pub fn parse_mode(value: &str) -> Result<ReadMode> {
        match value {
            "primary" => Ok(ReadMode::Primary),
            "primaryPreferred" => Ok(ReadMode::PrimaryPreferred),
            "secondary" => Ok(ReadMode::Secondary),
            "secondaryPreferred" => Ok(ReadMode::SecondaryPreferred),
            "nearest" => Ok(ReadMode::Nearest),
            other => Err(Error::Configuration(format!(
                "unknown read preference {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ReadMode::Primary => write!(f, "primary"),
            ReadMode::PrimaryPreferred => write!(f, "primaryPreferred"),
            ReadMode::Secondary => write!(f, "secondary"),
            ReadMode::SecondaryPreferred => write!(f, "secondaryPreferred"),
            ReadMode::Nearest => write!(f, "nearest"),
            ReadMode::Server => {
                write!(f, "server({})", self.pinned.as_deref().unwrap_or("?"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_tag_sets_accept_all() {
        let pref = ReadPreference::secondary();
        assert!(pref.tags_match(&tags(&[("dc", "east")])));
        assert!(pref.tags_match(&BTreeMap::new()));
    }

    #[test]
    fn test_any_tag_set_matching_accepts() {
        let pref = ReadPreference::secondary()
            .with_tag_sets(vec![tags(&[("dc", "west")]), tags(&[("dc", "east")])]);
        assert!(pref.tags_match(&tags(&[("dc", "east"), ("rack", "2")])));
        assert!(!pref.tags_match(&tags(&[("dc", "north")])));
    }

    #[test]
    fn test_all_keys_in_a_set_must_match() {
        let pref =
            ReadPreference::nearest().with_tag_sets(vec![tags(&[("dc", "east"), ("ssd", "yes")])]);
        assert!(!pref.tags_match(&tags(&[("dc", "east")])));
        assert!(pref.tags_match(&tags(&[("dc", "east"), ("ssd", "yes")])));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            ReadPreference::parse_mode("secondaryPreferred").unwrap(),
            ReadMode::SecondaryPreferred
        );
        assert!(ReadPreference::parse_mode("sometimes").is_err());
    }
}
