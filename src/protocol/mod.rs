//! MongoDB wire protocol message codec.
//!
//! 16-byte little-endian header followed by an opcode-specific body.
//! Request ids come from one process-wide monotonic counter.

mod flags;

pub use flags::{DeleteFlags, InsertFlags, QueryFlags, ReplyFlags, UpdateFlags};

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bson::{Document, decode_document, encode_document_into};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;

pub const HEADER_LEN: usize = 16;

/// Upper bound accepted for a whole incoming message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Next process-wide request id. Strictly increasing across all sessions.
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        // Little-endian 32-bit fields
        Some(Self {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Sanity-check an incoming header before the body is read.
    pub fn validate(&self, max_size: usize) -> Result<usize> {
        let len = self.message_length;
        if (len as usize) < HEADER_LEN || len as usize > max_size {
            return Err(Error::Framing(format!("invalid message length {len}")));
        }
        Ok(len as usize - HEADER_LEN)
    }
}

/// An outbound request, one variant per client opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(Query),
    Insert {
        namespace: Namespace,
        flags: InsertFlags,
        documents: Vec<Document>,
    },
    Update {
        namespace: Namespace,
        flags: UpdateFlags,
        selector: Document,
        update: Document,
    },
    Delete {
        namespace: Namespace,
        flags: DeleteFlags,
        selector: Document,
    },
    GetMore {
        namespace: Namespace,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    pub fn op_code(&self) -> i32 {
        match self {
            Message::Query(_) => OP_QUERY,
            Message::Insert { .. } => OP_INSERT,
            Message::Update { .. } => OP_UPDATE,
            Message::Delete { .. } => OP_DELETE,
            Message::GetMore { .. } => OP_GET_MORE,
            Message::KillCursors { .. } => OP_KILL_CURSORS,
        }
    }

    /// Whether a reply is expected for this message.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Message::Query(_) | Message::GetMore { .. })
    }

    /// Decode a request body. The client never receives requests; this is
    /// the test-server path and the codec round-trip witness.
    pub fn decode_body(header: &MessageHeader, mut body: &[u8]) -> Result<Message> {
        match header.op_code {
            OP_QUERY => {
                let flags = QueryFlags::from_bits_truncate(get_i32(&mut body)?);
                let namespace = get_namespace(&mut body)?;
                let skip = get_i32(&mut body)?;
                let limit = get_i32(&mut body)?;
                let query = decode_document(&mut body)?;
                let projection = if body.has_remaining() {
                    Some(decode_document(&mut body)?)
                } else {
                    None
                };
                Ok(Message::Query(Query {
                    namespace,
                    flags,
                    skip,
                    limit,
                    query,
                    projection,
                }))
            }
            OP_INSERT => {
                let flags = InsertFlags::from_bits_truncate(get_i32(&mut body)?);
                let namespace = get_namespace(&mut body)?;
                let mut documents = Vec::new();
                while body.has_remaining() {
                    documents.push(decode_document(&mut body)?);
                }
                Ok(Message::Insert {
                    namespace,
                    flags,
                    documents,
                })
            }
            OP_UPDATE => {
                let _reserved = get_i32(&mut body)?;
                let namespace = get_namespace(&mut body)?;
                let flags = UpdateFlags::from_bits_truncate(get_i32(&mut body)?);
                let selector = decode_document(&mut body)?;
                let update = decode_document(&mut body)?;
                Ok(Message::Update {
                    namespace,
                    flags,
                    selector,
                    update,
                })
            }
            OP_DELETE => {
                let _reserved = get_i32(&mut body)?;
                let namespace = get_namespace(&mut body)?;
                let flags = DeleteFlags::from_bits_truncate(get_i32(&mut body)?);
                let selector = decode_document(&mut body)?;
                Ok(Message::Delete {
                    namespace,
                    flags,
                    selector,
                })
            }
            OP_GET_MORE => {
                let _reserved = get_i32(&mut body)?;
                let namespace = get_namespace(&mut body)?;
                let number_to_return = get_i32(&mut body)?;
                let cursor_id = get_i64(&mut body)?;
                Ok(Message::GetMore {
                    namespace,
                    number_to_return,
                    cursor_id,
                })
            }
            OP_KILL_CURSORS => {
                let _reserved = get_i32(&mut body)?;
                let count = get_i32(&mut body)?;
                let mut cursor_ids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    cursor_ids.push(get_i64(&mut body)?);
                }
                Ok(Message::KillCursors { cursor_ids })
            }
            other => Err(Error::Framing(format!("unexpected request opcode {other}"))),
        }
    }

    /// Serialize with the assigned request id into a full wire frame.
    pub fn encode(&self, request_id: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(0); // total length, patched below
        buf.put_i32_le(request_id);
        buf.put_i32_le(0); // response_to is zero on requests
        buf.put_i32_le(self.op_code());

        match self {
            Message::Query(q) => {
                buf.put_i32_le(q.flags.bits());
                put_cstring(&mut buf, &q.namespace.full_name());
                buf.put_i32_le(q.skip);
                buf.put_i32_le(q.limit);
                encode_document_into(&mut buf, &q.query);
                if let Some(projection) = &q.projection {
                    encode_document_into(&mut buf, projection);
                }
            }
            Message::Insert {
                namespace,
                flags,
                documents,
            } => {
                buf.put_i32_le(flags.bits());
                put_cstring(&mut buf, &namespace.full_name());
                for doc in documents {
                    encode_document_into(&mut buf, doc);
                }
            }
            Message::Update {
                namespace,
                flags,
                selector,
                update,
            } => {
                buf.put_i32_le(0); // reserved
                put_cstring(&mut buf, &namespace.full_name());
                buf.put_i32_le(flags.bits());
                encode_document_into(&mut buf, selector);
                encode_document_into(&mut buf, update);
            }
            Message::Delete {
                namespace,
                flags,
                selector,
            } => {
                buf.put_i32_le(0); // reserved
                put_cstring(&mut buf, &namespace.full_name());
                buf.put_i32_le(flags.bits());
                encode_document_into(&mut buf, selector);
            }
            Message::GetMore {
                namespace,
                number_to_return,
                cursor_id,
            } => {
                buf.put_i32_le(0); // reserved
                put_cstring(&mut buf, &namespace.full_name());
                buf.put_i32_le(*number_to_return);
                buf.put_i64_le(*cursor_id);
            }
            Message::KillCursors { cursor_ids } => {
                buf.put_i32_le(0); // reserved
                buf.put_i32_le(cursor_ids.len() as i32);
                for id in cursor_ids {
                    buf.put_i64_le(*id);
                }
            }
        }

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        buf.freeze()
    }
}

/// A QUERY under construction. One builder replaces the original's many
/// overloads per verb.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub namespace: Namespace,
    pub flags: QueryFlags,
    pub skip: i32,
    pub limit: i32,
    pub query: Document,
    pub projection: Option<Document>,
}

impl Query {
    pub fn new(namespace: Namespace, query: Document) -> Self {
        Self {
            namespace,
            flags: QueryFlags::empty(),
            skip: 0,
            limit: 0,
            query,
            projection: None,
        }
    }

    /// A single-reply command against `<db>.$cmd`.
    pub fn command(database: impl Into<String>, command: Document) -> Self {
        Self::new(Namespace::command(database), command).limit(-1)
    }

    pub fn skip(mut self, skip: i32) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Allow routing to non-primary members.
    pub fn slave_ok(mut self) -> Self {
        self.flags |= QueryFlags::SLAVE_OK;
        self
    }

    pub fn into_message(self) -> Message {
        Message::Query(self)
    }
}

/// A decoded REPLY.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Decode a REPLY body; `header` has already been parsed and validated.
    pub fn decode_body(header: &MessageHeader, mut body: &[u8]) -> Result<Reply> {
        if header.op_code != OP_REPLY {
            return Err(Error::Framing(format!(
                "expected OP_REPLY, got opcode {}",
                header.op_code
            )));
        }
        if body.len() < 20 {
            return Err(Error::Framing("truncated reply body".into()));
        }
        let flags = ReplyFlags::from_bits_truncate(body.get_i32_le());
        let cursor_id = body.get_i64_le();
        let starting_from = body.get_i32_le();
        let number_returned = body.get_i32_le();

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        while body.has_remaining() {
            documents.push(decode_document(&mut body)?);
        }
        if documents.len() != number_returned.max(0) as usize {
            return Err(Error::Framing(format!(
                "reply declared {number_returned} documents, carried {}",
                documents.len()
            )));
        }

        Ok(Reply {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub fn first_document(&self) -> Option<&Document> {
        self.documents.first()
    }

    /// Serialize as a wire frame. The client never sends replies; this is
    /// the test-server path.
    pub fn encode(&self, request_id: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32_le(0);
        buf.put_i32_le(request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(OP_REPLY);
        buf.put_i32_le(self.flags.bits());
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.number_returned);
        for doc in &self.documents {
            encode_document_into(&mut buf, doc);
        }
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        buf.freeze()
    }

    /// Convenience constructor for test servers.
    pub fn with_documents(response_to: i32, cursor_id: i64, documents: Vec<Document>) -> Self {
        Reply {
            response_to,
            flags: ReplyFlags::empty(),
            cursor_id,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_i32(body: &mut &[u8]) -> Result<i32> {
    if body.remaining() < 4 {
        return Err(Error::Framing("truncated message body".into()));
    }
    Ok(body.get_i32_le())
}

fn get_i64(body: &mut &[u8]) -> Result<i64> {
    if body.remaining() < 8 {
        return Err(Error::Framing("truncated message body".into()));
    }
    Ok(body.get_i64_le())
}

fn get_namespace(body: &mut &[u8]) -> Result<Namespace> {
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Framing("unterminated namespace".into()))?;
    let raw = std::str::from_utf8(&body[..nul])
        .map_err(|_| Error::Framing("invalid utf-8 in namespace".into()))?;
    let namespace = Namespace::parse(raw)
        .map_err(|_| Error::Framing(format!("invalid namespace {raw:?}")))?;
    body.advance(nul + 1);
    Ok(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_request_ids_are_strictly_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        let c = next_request_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_query_frame_layout() {
        let query = Query::new(Namespace::parse("app.users").unwrap(), doc! {"name": "ada"})
            .skip(2)
            .limit(5)
            .slave_ok();
        let frame = query.into_message().encode(77);

        let header = MessageHeader::parse(&frame).unwrap();
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.request_id, 77);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, OP_QUERY);

        let mut body = &frame[HEADER_LEN..];
        assert_eq!(body.get_i32_le(), QueryFlags::SLAVE_OK.bits());
        let nul = body.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&body[..nul], b"app.users");
        body.advance(nul + 1);
        assert_eq!(body.get_i32_le(), 2);
        assert_eq!(body.get_i32_le(), 5);
        let doc = decode_document(&mut body).unwrap();
        assert_eq!(doc.get_str("name"), Some("ada"));
        assert!(!body.has_remaining());
    }

    #[test]
    fn test_kill_cursors_frame_layout() {
        let frame = Message::KillCursors {
            cursor_ids: vec![42, 99],
        }
        .encode(5);
        let header = MessageHeader::parse(&frame).unwrap();
        assert_eq!(header.op_code, OP_KILL_CURSORS);
        let mut body = &frame[HEADER_LEN..];
        assert_eq!(body.get_i32_le(), 0);
        assert_eq!(body.get_i32_le(), 2);
        assert_eq!(body.get_i64_le(), 42);
        assert_eq!(body.get_i64_le(), 99);
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply::with_documents(123, 42, vec![doc! {"a": 1}, doc! {"a": 2}]);
        let frame = reply.encode(900);
        let header = MessageHeader::parse(&frame).unwrap();
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.response_to, 123);

        let decoded = Reply::decode_body(&header, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded.cursor_id, 42);
        assert_eq!(decoded.number_returned, 2);
        assert_eq!(decoded.documents[1].get_i32("a"), Some(2));
    }

    #[test]
    fn test_reply_document_count_mismatch_is_framing_error() {
        let mut reply = Reply::with_documents(1, 0, vec![doc! {"a": 1}]);
        reply.number_returned = 2;
        let frame = reply.encode(9);
        let header = MessageHeader::parse(&frame).unwrap();
        assert!(matches!(
            Reply::decode_body(&header, &frame[HEADER_LEN..]),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_request_round_trip() {
        let ns = Namespace::parse("app.users").unwrap();
        let messages = vec![
            Query::new(ns.clone(), doc! {"q": 1})
                .skip(1)
                .limit(3)
                .projection(doc! {"a": 1})
                .into_message(),
            Message::Insert {
                namespace: ns.clone(),
                flags: InsertFlags::CONTINUE_ON_ERROR,
                documents: vec![doc! {"a": 1}, doc! {"a": 2}],
            },
            Message::Update {
                namespace: ns.clone(),
                flags: UpdateFlags::UPSERT | UpdateFlags::MULTI_UPDATE,
                selector: doc! {"a": 1},
                update: doc! {"$set": {"b": 2}},
            },
            Message::Delete {
                namespace: ns.clone(),
                flags: DeleteFlags::SINGLE_REMOVE,
                selector: doc! {"a": 1},
            },
            Message::GetMore {
                namespace: ns,
                number_to_return: 10,
                cursor_id: 42,
            },
            Message::KillCursors {
                cursor_ids: vec![7, 8, 9],
            },
        ];

        for message in messages {
            let frame = message.encode(11);
            let header = MessageHeader::parse(&frame).unwrap();
            let decoded = Message::decode_body(&header, &frame[HEADER_LEN..]).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_header_validate_bounds() {
        let header = MessageHeader {
            message_length: 12,
            request_id: 0,
            response_to: 0,
            op_code: OP_REPLY,
        };
        assert!(header.validate(DEFAULT_MAX_MESSAGE_SIZE).is_err());
    }
}
