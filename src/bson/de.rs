//! Document decoder.
//!
//! Reads a length-prefixed document from any `Buf`, rejecting declared
//! lengths beyond a configurable maximum. Duplicate keys in foreign byte
//! streams are preserved; `Document` lookups are first-wins.

use bytes::{Buf, Bytes};

use super::{
    Binary, Bson, DbPointer, Document, JavaScriptCodeWithScope, ObjectId, Regex, Timestamp,
};
use crate::error::{Error, Result};

/// Default maximum accepted document size: 16 MiB plus a little slack for
/// command overhead.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024 + 16 * 1024;

/// Decode one document with the default size limit.
pub fn decode_document(buf: &mut impl Buf) -> Result<Document> {
    decode_document_with_limit(buf, DEFAULT_MAX_DOCUMENT_SIZE)
}

/// Decode one document, rejecting declared lengths above `max_size`.
pub fn decode_document_with_limit(buf: &mut impl Buf, max_size: usize) -> Result<Document> {
    if buf.remaining() < 4 {
        return Err(Error::Framing("truncated document length".into()));
    }
    let declared = buf.get_i32_le();
    if declared < 5 {
        return Err(Error::Framing(format!("document length {declared} too small")));
    }
    let declared = declared as usize;
    if declared > max_size {
        return Err(Error::Framing(format!(
            "document length {declared} exceeds maximum {max_size}"
        )));
    }
    if buf.remaining() < declared - 4 {
        return Err(Error::Framing("truncated document body".into()));
    }
    let mut body = buf.copy_to_bytes(declared - 4);
    let doc = parse_elements(&mut body, max_size)?;
    if body.has_remaining() {
        return Err(Error::Framing("trailing bytes after document".into()));
    }
    Ok(doc)
}

fn parse_elements(body: &mut Bytes, max_size: usize) -> Result<Document> {
    let mut doc = Document::new();
    loop {
        let tag = get_u8(body)?;
        if tag == 0 {
            return Ok(doc);
        }
        let name = get_cstring(body)?;
        let value = decode_value(body, tag, max_size)?;
        doc.push(name, value);
    }
}

fn decode_value(body: &mut Bytes, tag: u8, max_size: usize) -> Result<Bson> {
    Ok(match tag {
        0x01 => Bson::Double(get_f64(body)?),
        0x02 => Bson::String(get_string(body)?),
        0x03 => Bson::Document(decode_nested(body, max_size)?),
        0x04 => {
            let doc = decode_nested(body, max_size)?;
            Bson::Array(doc.iter().map(|(_, v)| v.clone()).collect())
        }
        0x05 => {
            let len = get_i32(body)?;
            if len < 0 {
                return Err(Error::Framing("negative binary length".into()));
            }
            let subtype = get_u8(body)?;
            let bytes = get_bytes(body, len as usize)?.to_vec();
            Bson::Binary(Binary { subtype, bytes })
        }
        0x06 => Bson::Undefined,
        0x07 => Bson::ObjectId(get_object_id(body)?),
        0x08 => match get_u8(body)? {
            0 => Bson::Boolean(false),
            1 => Bson::Boolean(true),
            other => return Err(Error::Framing(format!("invalid boolean byte {other}"))),
        },
        0x09 => Bson::DateTime(get_i64(body)?),
        0x0A => Bson::Null,
        0x0B => Bson::Regex(Regex {
            pattern: get_cstring(body)?,
            options: get_cstring(body)?,
        }),
        0x0C => Bson::DbPointer(DbPointer {
            namespace: get_string(body)?,
            id: get_object_id(body)?,
        }),
        0x0D => Bson::JavaScriptCode(get_string(body)?),
        0x0E => Bson::Symbol(get_string(body)?),
        0x0F => {
            let total = get_i32(body)?;
            if total < 14 {
                return Err(Error::Framing("code-with-scope too short".into()));
            }
            let code = get_string(body)?;
            let scope = decode_nested(body, max_size)?;
            Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
        }
        0x10 => Bson::Int32(get_i32(body)?),
        0x11 => {
            let increment = get_u32(body)?;
            let time = get_u32(body)?;
            Bson::Timestamp(Timestamp { time, increment })
        }
        0x12 => Bson::Int64(get_i64(body)?),
        0x7F => Bson::MaxKey,
        0xFF => Bson::MinKey,
        other => return Err(Error::Framing(format!("unknown element tag {other:#04x}"))),
    })
}

fn decode_nested(body: &mut Bytes, max_size: usize) -> Result<Document> {
    decode_document_with_limit(body, max_size)
}

fn need(body: &Bytes, n: usize) -> Result<()> {
    if body.remaining() < n {
        return Err(Error::Framing("truncated element".into()));
    }
    Ok(())
}

fn get_u8(body: &mut Bytes) -> Result<u8> {
    need(body, 1)?;
    Ok(body.get_u8())
}

fn get_i32(body: &mut Bytes) -> Result<i32> {
    need(body, 4)?;
    Ok(body.get_i32_le())
}

fn get_u32(body: &mut Bytes) -> Result<u32> {
    need(body, 4)?;
    Ok(body.get_u32_le())
}

fn get_i64(body: &mut Bytes) -> Result<i64> {
    need(body, 8)?;
    Ok(body.get_i64_le())
}

fn get_f64(body: &mut Bytes) -> Result<f64> {
    need(body, 8)?;
    Ok(body.get_f64_le())
}

fn get_bytes(body: &mut Bytes, n: usize) -> Result<Bytes> {
    need(body, n)?;
    Ok(body.copy_to_bytes(n))
}

fn get_object_id(body: &mut Bytes) -> Result<ObjectId> {
    need(body, 12)?;
    let mut bytes = [0u8; 12];
    body.copy_to_slice(&mut bytes);
    Ok(ObjectId::from_bytes(bytes))
}

fn get_cstring(body: &mut Bytes) -> Result<String> {
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Framing("unterminated cstring".into()))?;
    let raw = body.copy_to_bytes(nul);
    body.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Framing("invalid utf-8 in cstring".into()))
}

fn get_string(body: &mut Bytes) -> Result<String> {
    let len = get_i32(body)?;
    if len < 1 {
        return Err(Error::Framing(format!("invalid string length {len}")));
    }
    let raw = get_bytes(body, len as usize)?;
    if raw[raw.len() - 1] != 0 {
        return Err(Error::Framing("string missing NUL terminator".into()));
    }
    String::from_utf8(raw[..raw.len() - 1].to_vec())
        .map_err(|_| Error::Framing("invalid utf-8 in string".into()))
}
