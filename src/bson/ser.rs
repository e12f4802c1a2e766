//! Document encoders.
//!
//! Two paths: `encode_document_into` materializes into a `BytesMut` and
//! back-patches each length prefix; `encode_document_sized` walks the
//! value tree to compute sizes first and then writes straight into any
//! `BufMut` without patching.

use bytes::{BufMut, BytesMut};

use super::{Bson, Document};

/// Buffered encode into a fresh vector.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(128);
    encode_document_into(&mut buf, doc);
    buf.to_vec()
}

/// Buffered encode appending to `buf`; length prefixes are back-patched.
pub fn encode_document_into(buf: &mut BytesMut, doc: &Document) {
    let start = buf.len();
    buf.put_i32_le(0); // patched once the document is materialized
    for (key, value) in doc.iter() {
        buf.put_u8(value.element_type());
        put_cstring(buf, key);
        encode_value(buf, value);
    }
    buf.put_u8(0);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn encode_array_into(buf: &mut BytesMut, items: &[Bson]) {
    let start = buf.len();
    buf.put_i32_le(0);
    for (index, item) in items.iter().enumerate() {
        buf.put_u8(item.element_type());
        put_cstring(buf, &index.to_string());
        encode_value(buf, item);
    }
    buf.put_u8(0);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn encode_value(buf: &mut BytesMut, value: &Bson) {
    match value {
        Bson::Double(v) => buf.put_f64_le(*v),
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => put_string(buf, s),
        Bson::Document(doc) => encode_document_into(buf, doc),
        Bson::Array(items) => encode_array_into(buf, items),
        Bson::Binary(bin) => {
            buf.put_i32_le(bin.bytes.len() as i32);
            buf.put_u8(bin.subtype);
            buf.put_slice(&bin.bytes);
        }
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::ObjectId(id) => buf.put_slice(&id.bytes()),
        Bson::Boolean(v) => buf.put_u8(*v as u8),
        Bson::DateTime(millis) => buf.put_i64_le(*millis),
        Bson::Regex(re) => {
            put_cstring(buf, &re.pattern);
            put_cstring(buf, &re.options);
        }
        Bson::DbPointer(ptr) => {
            put_string(buf, &ptr.namespace);
            buf.put_slice(&ptr.id.bytes());
        }
        Bson::JavaScriptCodeWithScope(cws) => {
            let total = 4 + 4 + cws.code.len() + 1 + document_len(&cws.scope);
            buf.put_i32_le(total as i32);
            put_string(buf, &cws.code);
            encode_document_into(buf, &cws.scope);
        }
        Bson::Int32(v) => buf.put_i32_le(*v),
        Bson::Timestamp(ts) => {
            buf.put_u32_le(ts.increment);
            buf.put_u32_le(ts.time);
        }
        Bson::Int64(v) => buf.put_i64_le(*v),
    }
}

/// Size-visitor encode: the encoded length of a document, prefix and
/// terminator included.
pub fn encoded_len(doc: &Document) -> usize {
    document_len(doc)
}

fn document_len(doc: &Document) -> usize {
    4 + doc
        .iter()
        .map(|(key, value)| 1 + key.len() + 1 + value_len(value))
        .sum::<usize>()
        + 1
}

fn array_len(items: &[Bson]) -> usize {
    4 + items
        .iter()
        .enumerate()
        .map(|(index, item)| 1 + decimal_digits(index) + 1 + value_len(item))
        .sum::<usize>()
        + 1
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

fn value_len(value: &Bson) -> usize {
    match value {
        Bson::Double(_) | Bson::DateTime(_) | Bson::Int64(_) | Bson::Timestamp(_) => 8,
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => 4 + s.len() + 1,
        Bson::Document(doc) => document_len(doc),
        Bson::Array(items) => array_len(items),
        Bson::Binary(bin) => 4 + 1 + bin.bytes.len(),
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => 0,
        Bson::ObjectId(_) => 12,
        Bson::Boolean(_) => 1,
        Bson::Regex(re) => re.pattern.len() + 1 + re.options.len() + 1,
        Bson::DbPointer(ptr) => 4 + ptr.namespace.len() + 1 + 12,
        Bson::JavaScriptCodeWithScope(cws) => {
            4 + 4 + cws.code.len() + 1 + document_len(&cws.scope)
        }
        Bson::Int32(_) => 4,
    }
}

/// Size-visitor encode: sizes are computed up front, then the document is
/// streamed into `buf` without back-patching.
pub fn encode_document_sized(buf: &mut impl BufMut, doc: &Document) {
    buf.put_i32_le(document_len(doc) as i32);
    for (key, value) in doc.iter() {
        buf.put_u8(value.element_type());
        put_cstring_buf(buf, key);
        encode_value_sized(buf, value);
    }
    buf.put_u8(0);
}

fn encode_array_sized(buf: &mut impl BufMut, items: &[Bson]) {
    buf.put_i32_le(array_len(items) as i32);
    for (index, item) in items.iter().enumerate() {
        buf.put_u8(item.element_type());
        put_cstring_buf(buf, &index.to_string());
        encode_value_sized(buf, item);
    }
    buf.put_u8(0);
}

fn encode_value_sized(buf: &mut impl BufMut, value: &Bson) {
    match value {
        Bson::Double(v) => buf.put_f64_le(*v),
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => put_string_buf(buf, s),
        Bson::Document(doc) => encode_document_sized(buf, doc),
        Bson::Array(items) => encode_array_sized(buf, items),
        Bson::Binary(bin) => {
            buf.put_i32_le(bin.bytes.len() as i32);
            buf.put_u8(bin.subtype);
            buf.put_slice(&bin.bytes);
        }
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::ObjectId(id) => buf.put_slice(&id.bytes()),
        Bson::Boolean(v) => buf.put_u8(*v as u8),
        Bson::DateTime(millis) => buf.put_i64_le(*millis),
        Bson::Regex(re) => {
            put_cstring_buf(buf, &re.pattern);
            put_cstring_buf(buf, &re.options);
        }
        Bson::DbPointer(ptr) => {
            put_string_buf(buf, &ptr.namespace);
            buf.put_slice(&ptr.id.bytes());
        }
        Bson::JavaScriptCodeWithScope(cws) => {
            let total = 4 + 4 + cws.code.len() + 1 + document_len(&cws.scope);
            buf.put_i32_le(total as i32);
            put_string_buf(buf, &cws.code);
            encode_document_sized(buf, &cws.scope);
        }
        Bson::Int32(v) => buf.put_i32_le(*v),
        Bson::Timestamp(ts) => {
            buf.put_u32_le(ts.increment);
            buf.put_u32_le(ts.time);
        }
        Bson::Int64(v) => buf.put_i64_le(*v),
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0), "cstring with interior NUL");
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32_le(s.len() as i32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_cstring_buf(buf: &mut impl BufMut, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0), "cstring with interior NUL");
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_string_buf(buf: &mut impl BufMut, s: &str) {
    buf.put_i32_le(s.len() as i32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
