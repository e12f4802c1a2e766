// Namespace handling for wire messages: `db.collection`, NUL-terminated on
// the wire. Command namespaces use the reserved `$cmd` collection.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// The command namespace for a database: `<db>.$cmd`.
    pub fn command(database: impl Into<String>) -> Self {
        Self::new(database, "$cmd")
    }

    /// Parse a `db.collection` string; the collection part may itself
    /// contain dots.
    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::Configuration(format!(
                "invalid namespace {full:?}, expected db.collection"
            ))),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn is_command(&self) -> bool {
        self.collection == "$cmd"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
