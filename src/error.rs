use std::result::Result as StdResult;

use crate::bson::Document;

/// Server error codes that indicate a duplicate unique-index key.
pub const DUPLICATE_KEY_CODES: [i32; 2] = [11000, 11001];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The socket broke while an operation was in flight.
    #[error("connection to {server} lost")]
    ConnectionLost {
        server: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A send was attempted on a session that is not OPEN.
    #[error("connection to {0} is not available")]
    ConnectionNotAvailable(String),

    /// The session or dispatcher is draining and refused the operation.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// No candidate server satisfied the read preference.
    #[error("no suitable server for read preference {0}")]
    NoSuitableServer(String),

    /// A primary-required operation was issued while no primary exists.
    #[error("no primary available")]
    NoPrimary,

    /// The server reported a duplicate unique-index key.
    #[error("duplicate key: {message}")]
    DuplicateKey { code: i32, message: String },

    /// A GET_MORE referenced a cursor unknown to the server.
    #[error("cursor {0} not found")]
    CursorNotFound(i64),

    /// The reply carried the query-failure flag; details in the document.
    #[error("query failure: {0:?}")]
    QueryFailure(Document),

    /// A mongos requires a config refresh before it can serve the request.
    #[error("stale shard configuration")]
    ShardConfigStale(Document),

    /// A command reply had an unexpected shape.
    #[error("reply validation failed: {0}")]
    ReplyValidation(String),

    /// The per-operation deadline elapsed before a reply arrived.
    #[error("operation timed out")]
    OperationTimedOut,

    /// The caller cancelled the pending operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed incoming bytes at the document or message framing layer.
    #[error("framing error: {0}")]
    Framing(String),

    /// Invalid connection string or client option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO failure while establishing a connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn connection_lost(server: impl Into<String>) -> Self {
        Error::ConnectionLost {
            server: server.into(),
            source: None,
        }
    }

    pub(crate) fn connection_lost_io(server: impl Into<String>, source: std::io::Error) -> Self {
        Error::ConnectionLost {
            server: server.into(),
            source: Some(source),
        }
    }

    /// A same-kind copy for the cases where one failure must be reported
    /// both to a sink and to the caller. IO sources are rebuilt from kind
    /// and message.
    pub(crate) fn shadow(&self) -> Error {
        match self {
            Error::ConnectionLost { server, source } => Error::ConnectionLost {
                server: server.clone(),
                source: source
                    .as_ref()
                    .map(|e| std::io::Error::new(e.kind(), e.to_string())),
            },
            Error::ConnectionNotAvailable(s) => Error::ConnectionNotAvailable(s.clone()),
            Error::ShutdownInProgress => Error::ShutdownInProgress,
            Error::NoSuitableServer(s) => Error::NoSuitableServer(s.clone()),
            Error::NoPrimary => Error::NoPrimary,
            Error::DuplicateKey { code, message } => Error::DuplicateKey {
                code: *code,
                message: message.clone(),
            },
            Error::CursorNotFound(id) => Error::CursorNotFound(*id),
            Error::QueryFailure(doc) => Error::QueryFailure(doc.clone()),
            Error::ShardConfigStale(doc) => Error::ShardConfigStale(doc.clone()),
            Error::ReplyValidation(s) => Error::ReplyValidation(s.clone()),
            Error::OperationTimedOut => Error::OperationTimedOut,
            Error::Cancelled => Error::Cancelled,
            Error::Framing(s) => Error::Framing(s.clone()),
            Error::Configuration(s) => Error::Configuration(s.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Whether the dispatcher may transparently retry on another candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost { .. } | Error::ShardConfigStale(_)
        )
    }

    /// Inspect a server-reported error document and lift it to a typed kind.
    /// Returns `None` when the document does not describe an error.
    pub fn from_error_document(doc: &Document) -> Option<Self> {
        let message = doc
            .get_str("$err")
            .or_else(|| doc.get_str("err"))
            .or_else(|| doc.get_str("errmsg"))?;
        let code = doc.get_i32("code").unwrap_or(0);
        if DUPLICATE_KEY_CODES.contains(&code) || message.contains("duplicate key") {
            return Some(Error::DuplicateKey {
                code,
                message: message.to_string(),
            });
        }
        Some(Error::QueryFailure(doc.clone()))
    }
}

pub type Result<T> = StdResult<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_duplicate_key_from_code() {
        let doc = doc! {"err": "E11000 duplicate key error", "code": 11000};
        match Error::from_error_document(&doc) {
            Some(Error::DuplicateKey { code, .. }) => assert_eq!(code, 11000),
            other => panic!("expected DuplicateKey, got {:?}", other),
        }
    }

    #[test]
    fn test_query_failure_from_dollar_err() {
        let doc = doc! {"$err": "exhausted memory", "code": 17144};
        assert!(matches!(
            Error::from_error_document(&doc),
            Some(Error::QueryFailure(_))
        ));
    }

    #[test]
    fn test_ok_reply_is_not_an_error() {
        let doc = doc! {"ok": 1.0, "n": 3};
        assert!(Error::from_error_document(&doc).is_none());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::connection_lost("a:27017").is_retryable());
        assert!(!Error::NoPrimary.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
