//! Write durability levels and their getLastError form.

use crate::bson::Document;
use crate::doc;
use crate::error::{Error, Result};

/// How much acknowledgement a write demands before it is considered
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Durability {
    /// Fire-and-forget; no getLastError is issued.
    None,
    /// Acknowledged by the primary.
    #[default]
    Ack,
    /// Flushed to disk on the primary.
    Fsync,
    /// In the primary's journal.
    Journal,
    /// Acknowledged by `n` members.
    Replicas(i32),
    /// Acknowledged by a majority of members.
    Majority,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteConcern {
    pub durability: Durability,
    /// Milliseconds to wait for replication before the server gives up.
    pub wtimeout_ms: Option<i32>,
}

impl WriteConcern {
    pub fn new(durability: Durability) -> Self {
        Self {
            durability,
            wtimeout_ms: None,
        }
    }

    pub fn with_wtimeout(mut self, wtimeout_ms: i32) -> Self {
        self.wtimeout_ms = Some(wtimeout_ms);
        self
    }

    /// Whether the write is paired with a getLastError probe.
    pub fn is_acknowledged(&self) -> bool {
        self.durability != Durability::None
    }

    /// The getLastError command document for this concern. `None` for
    /// unacknowledged writes.
    pub fn get_last_error(&self) -> Option<Document> {
        let mut doc = doc! {"getlasterror": 1};
        match &self.durability {
            Durability::None => return None,
            Durability::Ack => {}
            Durability::Fsync => {
                doc.insert("fsync", true);
            }
            Durability::Journal => {
                doc.insert("j", true);
            }
            Durability::Replicas(n) => {
                doc.insert("w", *n);
            }
            Durability::Majority => {
                doc.insert("w", "majority");
            }
        }
        if let Some(wtimeout) = self.wtimeout_ms {
            doc.insert("wtimeout", wtimeout);
        }
        Some(doc)
    }

    /// Parse the `w` connection-string value.
    pub fn parse_w(value: &str) -> Result<Durability> {
        match value {
            "majority" => Ok(Durability::Majority),
            "0" => Ok(Durability::None),
            "1" => Ok(Durability::Ack),
            n => n
                .parse::<i32>()
                .ok()
                .filter(|n| *n > 1)
                .map(Durability::Replicas)
                .ok_or_else(|| Error::Configuration(format!("invalid w value {value:?}"))),
        }
    }
}
