use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A 12-byte BSON object identifier.
///
/// Layout: 4-byte big-endian seconds since epoch, 3-byte machine id,
/// 2-byte process id, 3-byte big-endian counter. Generation is unique per
/// process; the only shared state is one atomic counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    bytes: [u8; 12],
}

static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
static MACHINE_ID: OnceLock<[u8; 3]> = OnceLock::new();

fn counter() -> &'static AtomicU32 {
    COUNTER.get_or_init(|| AtomicU32::new(rand::random::<u32>()))
}

/// First three bytes of a SHA-256 over the hostname, falling back to a
/// random value when no hostname is visible in the environment.
fn machine_id() -> [u8; 3] {
    *MACHINE_ID.get_or_init(|| {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| format!("{:016x}", rand::random::<u64>()));
        let digest = Sha256::digest(host.as_bytes());
        [digest[0], digest[1], digest[2]]
    })
}

impl ObjectId {
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let machine = machine_id();
        let pid = (std::process::id() & 0xffff) as u16;
        let count = counter().fetch_add(1, Ordering::Relaxed);
        let count_bytes = count.to_be_bytes();

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..7].copy_from_slice(&machine);
        bytes[7..9].copy_from_slice(&pid.to_be_bytes());
        bytes[9..12].copy_from_slice(&count_bytes[1..4]);
        Self { bytes }
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { bytes }
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.bytes
    }

    /// Seconds since epoch embedded in the id.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(24);
        for b in &self.bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn parse_hex(s: &str) -> Result<Self> {
        if s.len() != 24 {
            return Err(Error::Configuration(format!("invalid object id: {s:?}")));
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16);
            let lo = (chunk[1] as char).to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => bytes[i] = ((hi << 4) | lo) as u8,
                _ => {
                    return Err(Error::Configuration(format!("invalid object id: {s:?}")));
                }
            }
        }
        Ok(Self { bytes })
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_roundtrip_hex() {
        let id = ObjectId::new();
        let parsed = ObjectId::parse_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(ObjectId::parse_hex("zz").is_err());
        assert!(ObjectId::parse_hex("0123456789abcdef0123456g").is_err());
    }

    #[test]
    fn test_timestamp_is_current() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        let id = ObjectId::new();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        assert!(id.timestamp() >= before && id.timestamp() <= after);
    }

    #[test]
    fn test_ids_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(ObjectId::new()));
        }
    }
}
