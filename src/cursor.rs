//! Paged result retrieval over one session.
//!
//! A cursor is born from a QUERY reply carrying a non-zero cursor id and
//! advances with GET_MORE messages sent to the same server over the same
//! session. Exhaustion, explicit close, or the drop guard ends it; a live
//! server-side cursor is always killed with KILL_CURSORS.

use std::collections::VecDeque;

use crate::bson::Document;
use crate::callback::{reply_future, validate_reply};
use crate::doc;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::protocol::{Message, Reply};
use crate::session::Session;

pub struct Cursor {
    session: Session,
    namespace: Namespace,
    cursor_id: i64,
    batch: VecDeque<Document>,
    batch_size: i32,
    /// Client-side document cap; zero means unlimited.
    limit: i32,
    seen: i32,
    exhausted: bool,
}

impl Cursor {
    /// Build a cursor from the reply to the initiating QUERY.
    pub fn from_reply(
        session: Session,
        namespace: Namespace,
        batch_size: i32,
        limit: i32,
        reply: &Reply,
    ) -> Self {
        Self {
            session,
            namespace,
            cursor_id: reply.cursor_id,
            batch: reply.documents.iter().cloned().collect(),
            batch_size,
            limit,
            seen: 0,
            exhausted: reply.cursor_id == 0 && reply.documents.is_empty(),
        }
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.batch.is_empty()
    }

    /// The canonical address of the server this cursor is pinned to.
    pub fn server_name(&self) -> &str {
        self.session.server_name()
    }

    /// Next document, fetching another batch from the pinned server when
    /// the local one runs out.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        loop {
            if self.limit > 0 && self.seen >= self.limit {
                self.close();
                return None;
            }
            if let Some(doc) = self.batch.pop_front() {
                self.seen += 1;
                return Some(Ok(doc));
            }
            if self.exhausted || self.cursor_id == 0 {
                self.exhausted = true;
                return None;
            }
            if let Err(error) = self.fetch_more().await {
                self.exhausted = true;
                self.cursor_id = 0;
                return Some(Err(error));
            }
        }
    }

    async fn fetch_more(&mut self) -> Result<()> {
        // Cursor affinity: a GET_MORE is only meaningful on the session
        // that produced the cursor. A closed session means the cursor is
        // gone for us.
        if !self.session.is_open() {
            return Err(Error::CursorNotFound(self.cursor_id));
        }
        let message = Message::GetMore {
            namespace: self.namespace.clone(),
            number_to_return: self.next_batch_request(),
            cursor_id: self.cursor_id,
        };
        let (sink, future) = reply_future();
        if let Err(failure) = self.session.send(&message, sink).await {
            let _ = failure.surface();
            return Err(Error::CursorNotFound(self.cursor_id));
        }
        let reply = future.recv().await?;
        if let Some(error) = validate_reply(&reply, Some(self.cursor_id)) {
            return Err(error);
        }
        self.cursor_id = reply.cursor_id;
        if reply.cursor_id == 0 {
            self.exhausted = reply.documents.is_empty() && self.batch.is_empty();
        }
        self.batch.extend(reply.documents.iter().cloned());
        if self.batch.is_empty() && self.cursor_id == 0 {
            self.exhausted = true;
        }
        Ok(())
    }

    fn next_batch_request(&self) -> i32 {
        if self.limit > 0 {
            let remaining = self.limit - self.seen;
            if self.batch_size > 0 {
                remaining.min(self.batch_size)
            } else {
                remaining
            }
        } else {
            self.batch_size
        }
    }

    /// Release the server-side cursor if it is still alive. Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        if self.cursor_id != 0 {
            let kill = Message::KillCursors {
                cursor_ids: vec![self.cursor_id],
            };
            if let Err(error) = self.session.send_no_reply(&kill) {
                tracing::debug!(
                    cursor_id = self.cursor_id,
                    error = %error,
                    "could not kill cursor"
                );
            }
            self.cursor_id = 0;
        }
        self.batch.clear();
        self.exhausted = true;
    }

    /// Portable cursor state. The only structure a user may persist and
    /// later resume from.
    pub fn state(&self) -> Document {
        doc! {
            "cursorId": self.cursor_id,
            "address": self.session.server_name(),
            "namespace": self.namespace.full_name(),
            "batchSize": self.batch_size,
            "limit": if self.limit > 0 { self.limit - self.seen } else { 0 },
        }
    }

    /// Rebuild a cursor from persisted state and a session to the same
    /// server. Identity is preserved iff the server still has the cursor.
    pub fn resume(state: &Document, session: Session) -> Result<Cursor> {
        let cursor_id = state
            .get_i64("cursorId")
            .ok_or_else(|| Error::Configuration("cursor state missing cursorId".into()))?;
        let address = state
            .get_str("address")
            .ok_or_else(|| Error::Configuration("cursor state missing address".into()))?;
        let namespace = state
            .get_str("namespace")
            .ok_or_else(|| Error::Configuration("cursor state missing namespace".into()))
            .and_then(Namespace::parse)?;
        let batch_size = state.get_i32("batchSize").unwrap_or(0);
        let limit = state.get_i32("limit").unwrap_or(0);

        if session.server_name() != address {
            return Err(Error::Configuration(format!(
                "cursor belongs to {address}, session speaks to {}",
                session.server_name()
            )));
        }

        Ok(Cursor {
            session,
            namespace,
            cursor_id,
            batch: VecDeque::new(),
            batch_size,
            limit,
            seen: 0,
            exhausted: cursor_id == 0,
        })
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // Dropped without close: the server-side cursor must still die.
        if self.cursor_id != 0 {
            self.close();
        }
    }
}
