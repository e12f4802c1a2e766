//! BSON document model and codec.
//!
//! Documents are ordered sequences of named elements over the closed BSON
//! type set, represented as a tagged `Bson` variant. Two write paths are
//! provided: a buffered encoder that back-patches length prefixes into a
//! `BytesMut`, and a size-visitor encoder that computes sizes first and
//! then streams into any `BufMut`.

mod de;
mod oid;
mod ser;

pub use de::{DEFAULT_MAX_DOCUMENT_SIZE, decode_document, decode_document_with_limit};
pub use oid::ObjectId;
pub use ser::{encode_document, encode_document_into, encode_document_sized, encoded_len};

use std::fmt;

use crate::error::Result;

/// Binary element payload with its subtype tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbPointer {
    pub namespace: String,
    pub id: ObjectId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// Internal replication timestamp: 4-byte increment, 4-byte seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

/// A single BSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    /// Milliseconds since the epoch.
    DateTime(i64),
    Null,
    Regex(Regex),
    DbPointer(DbPointer),
    JavaScriptCode(String),
    Symbol(String),
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    MinKey,
    MaxKey,
}

impl Bson {
    /// The wire tag for this value.
    pub fn element_type(&self) -> u8 {
        match self {
            Bson::Double(_) => 0x01,
            Bson::String(_) => 0x02,
            Bson::Document(_) => 0x03,
            Bson::Array(_) => 0x04,
            Bson::Binary(_) => 0x05,
            Bson::Undefined => 0x06,
            Bson::ObjectId(_) => 0x07,
            Bson::Boolean(_) => 0x08,
            Bson::DateTime(_) => 0x09,
            Bson::Null => 0x0A,
            Bson::Regex(_) => 0x0B,
            Bson::DbPointer(_) => 0x0C,
            Bson::JavaScriptCode(_) => 0x0D,
            Bson::Symbol(_) => 0x0E,
            Bson::JavaScriptCodeWithScope(_) => 0x0F,
            Bson::Int32(_) => 0x10,
            Bson::Timestamp(_) => 0x11,
            Bson::Int64(_) => 0x12,
            Bson::MaxKey => 0x7F,
            Bson::MinKey => 0xFF,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Bson]> {
        match self {
            Bson::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Bson {
    fn from(v: f64) -> Self {
        Bson::Double(v)
    }
}

impl From<&str> for Bson {
    fn from(v: &str) -> Self {
        Bson::String(v.to_string())
    }
}

impl From<&String> for Bson {
    fn from(v: &String) -> Self {
        Bson::String(v.clone())
    }
}

impl From<String> for Bson {
    fn from(v: String) -> Self {
        Bson::String(v)
    }
}

impl From<Document> for Bson {
    fn from(v: Document) -> Self {
        Bson::Document(v)
    }
}

impl From<Binary> for Bson {
    fn from(v: Binary) -> Self {
        Bson::Binary(v)
    }
}

impl From<ObjectId> for Bson {
    fn from(v: ObjectId) -> Self {
        Bson::ObjectId(v)
    }
}

impl From<bool> for Bson {
    fn from(v: bool) -> Self {
        Bson::Boolean(v)
    }
}

impl From<i32> for Bson {
    fn from(v: i32) -> Self {
        Bson::Int32(v)
    }
}

impl From<i64> for Bson {
    fn from(v: i64) -> Self {
        Bson::Int64(v)
    }
}

impl From<Timestamp> for Bson {
    fn from(v: Timestamp) -> Self {
        Bson::Timestamp(v)
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(v: Vec<T>) -> Self {
        Bson::Array(v.into_iter().map(Into::into).collect())
    }
}

/// An ordered BSON document.
///
/// `insert` keeps keys unique by replacing an existing entry in place. The
/// decoder may produce duplicate keys from foreign byte streams; lookups
/// are first-wins in that case.
#[derive(Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a value, replacing any existing entry with the same key in
    /// place. Returns the replaced value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        for (k, v) in self.entries.iter_mut() {
            if *k == key {
                return Some(std::mem::replace(v, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    /// Append without the uniqueness check. Decoder-only path.
    pub(crate) fn push(&mut self, key: String, value: Bson) {
        self.entries.push((key, value));
    }

    /// First-wins lookup.
    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            Bson::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Bson::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Bson::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Bson::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key)?.as_document()
    }

    pub fn get_array(&self, key: &str) -> Option<&[Bson]> {
        self.get(key)?.as_array()
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        match self.get(key)? {
            Bson::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    /// Numeric lookup across the three number types. Command replies carry
    /// `ok` and counters as any of double/int32/int64 depending on server.
    pub fn get_numeric(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(*v as f64),
            Bson::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Whether this looks like a successful command reply (`ok: 1`).
    pub fn is_ok(&self) -> bool {
        self.get_numeric("ok").is_some_and(|v| v == 1.0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encode through the buffered path.
    pub fn to_vec(&self) -> Vec<u8> {
        encode_document(self)
    }

    /// Decode from a byte slice with the default size limit.
    pub fn from_slice(mut bytes: &[u8]) -> Result<Self> {
        decode_document(&mut bytes)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Bson)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

/// Construct a `Bson` value from literal syntax.
#[macro_export]
macro_rules! bson {
    //////////////////////
    // Array munching
    //////////////////////
    (@array [$($elems:expr,)*]) => {
        vec![$($elems,)*]
    };
    (@array [$($elems:expr),*]) => {
        vec![$($elems),*]
    };
    (@array [$($elems:expr,)*] null $($rest:tt)*) => {
        $crate::bson!(@array [$($elems,)* $crate::bson!(null)] $($rest)*)
    };
    (@array [$($elems:expr,)*] [$($array:tt)*] $($rest:tt)*) => {
        $crate::bson!(@array [$($elems,)* $crate::bson!([$($array)*])] $($rest)*)
    };
    (@array [$($elems:expr,)*] {$($map:tt)*} $($rest:tt)*) => {
        $crate::bson!(@array [$($elems,)* $crate::bson!({$($map)*})] $($rest)*)
    };
    (@array [$($elems:expr,)*] $next:expr, $($rest:tt)*) => {
        $crate::bson!(@array [$($elems,)* $crate::bson!($next),] $($rest)*)
    };
    (@array [$($elems:expr,)*] $last:expr) => {
        $crate::bson!(@array [$($elems,)* $crate::bson!($last)])
    };
    (@array [$($elems:expr),*] , $($rest:tt)*) => {
        $crate::bson!(@array [$($elems,)*] $($rest)*)
    };

    //////////////////////
    // Object munching
    //////////////////////
    (@object $object:ident () () ()) => {};
    (@object $object:ident [$($key:tt)+] ($value:expr) , $($rest:tt)*) => {
        $object.insert(($($key)+), $value);
        $crate::bson!(@object $object () ($($rest)*) ($($rest)*));
    };
    (@object $object:ident [$($key:tt)+] ($value:expr) $unexpected:tt $($rest:tt)*) => {
        $crate::bson_unexpected!($unexpected);
    };
    (@object $object:ident [$($key:tt)+] ($value:expr)) => {
        $object.insert(($($key)+), $value);
    };
    (@object $object:ident ($($key:tt)+) (: null $($rest:tt)*) $copy:tt) => {
        $crate::bson!(@object $object [$($key)+] ($crate::bson!(null)) $($rest)*);
    };
    (@object $object:ident ($($key:tt)+) (: [$($array:tt)*] $($rest:tt)*) $copy:tt) => {
        $crate::bson!(@object $object [$($key)+] ($crate::bson!([$($array)*])) $($rest)*);
    };
    (@object $object:ident ($($key:tt)+) (: {$($map:tt)*} $($rest:tt)*) $copy:tt) => {
        $crate::bson!(@object $object [$($key)+] ($crate::bson!({$($map)*})) $($rest)*);
    };
    (@object $object:ident ($($key:tt)+) (: $value:expr , $($rest:tt)*) $copy:tt) => {
        $crate::bson!(@object $object [$($key)+] ($crate::bson!($value)) , $($rest)*);
    };
    (@object $object:ident ($($key:tt)+) (: $value:expr) $copy:tt) => {
        $crate::bson!(@object $object [$($key)+] ($crate::bson!($value)));
    };
    (@object $object:ident ($($key:tt)+) (:) $copy:tt) => {
        $crate::bson!();
    };
    (@object $object:ident ($($key:tt)+) () $copy:tt) => {
        $crate::bson!();
    };
    (@object $object:ident ($($key:tt)*) ($tt:tt $($rest:tt)*) $copy:tt) => {
        $crate::bson!(@object $object ($($key)* $tt) ($($rest)*) ($($rest)*));
    };

    //////////////////////
    // Entry points
    //////////////////////
    (null) => { $crate::bson::Bson::Null };
    ([]) => { $crate::bson::Bson::Array(::std::vec::Vec::new()) };
    ([ $($tt:tt)+ ]) => { $crate::bson::Bson::Array($crate::bson!(@array [] $($tt)+)) };
    ({}) => { $crate::bson::Bson::Document($crate::bson::Document::new()) };
    ({ $($tt:tt)+ }) => { $crate::bson::Bson::Document($crate::doc!{$($tt)+}) };
    ($other:expr) => { $crate::bson::Bson::from($other) };
}

/// Construct a `Document` from literal syntax.
#[macro_export]
macro_rules! doc {
    () => { $crate::bson::Document::new() };
    ( $($tt:tt)+ ) => {{
        let mut object = $crate::bson::Document::new();
        $crate::bson!(@object object () ($($tt)+) ($($tt)+));
        object
    }};
}

#[macro_export]
#[doc(hidden)]
macro_rules! bson_unexpected {
    () => {};
}
