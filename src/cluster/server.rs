//! Per-server mutable state: role, tags, measured latency, freshness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::bson::Document;
use crate::config::Address;

/// Role a server reported in its last topology reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    Primary,
    Secondary,
    Mongos,
    Standalone,
    #[default]
    Unknown,
}

/// Weight of a new latency sample in the exponentially-weighted average.
const LATENCY_DECAY: f64 = 0.2;

#[derive(Debug, Default)]
struct ServerMeta {
    role: ServerRole,
    tags: BTreeMap<String, String>,
    hosts: Vec<Address>,
    set_name: Option<String>,
    /// `me` from the last topology reply; a primary names itself here.
    self_name: Option<String>,
    max_wire_version: Option<i32>,
    max_bson_size: Option<i32>,
    last_seen: Option<Instant>,
}

/// One record per canonical address. Role and tags are mutated only by
/// the pinger or by replies carrying topology information; latency is
/// folded in on every round trip.
#[derive(Debug)]
pub struct Server {
    address: Address,
    canonical: String,
    meta: RwLock<ServerMeta>,
    /// f64 bit pattern; infinity until the first successful round trip.
    latency_bits: AtomicU64,
}

impl Server {
    pub fn new(address: Address) -> Self {
        let canonical = address.canonical();
        Self {
            address,
            canonical,
            meta: RwLock::new(ServerMeta::default()),
            latency_bits: AtomicU64::new(f64::INFINITY.to_bits()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    pub fn role(&self) -> ServerRole {
        self.meta.read().role
    }

    pub fn set_role(&self, role: ServerRole) {
        self.meta.write().role = role;
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.role(),
            ServerRole::Primary | ServerRole::Mongos | ServerRole::Standalone
        )
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.meta.read().tags.clone()
    }

    /// Hosts list from the last topology reply, for discovery.
    pub fn known_hosts(&self) -> Vec<Address> {
        self.meta.read().hosts.clone()
    }

    pub fn set_name(&self) -> Option<String> {
        self.meta.read().set_name.clone()
    }

    pub fn max_bson_size(&self) -> Option<i32> {
        self.meta.read().max_bson_size
    }

    pub fn max_wire_version(&self) -> Option<i32> {
        self.meta.read().max_wire_version
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.meta.read().last_seen
    }

    /// Mean round-trip latency in milliseconds; infinite when unknown.
    pub fn average_latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_bits.load(Ordering::Relaxed))
    }

    /// Fold one round-trip sample into the EWMA.
    pub fn record_latency(&self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1_000.0;
        loop {
            let bits = self.latency_bits.load(Ordering::Relaxed);
            let old = f64::from_bits(bits);
            let new = if old.is_finite() {
                old * (1.0 - LATENCY_DECAY) + sample * LATENCY_DECAY
            } else {
                sample
            };
            if self
                .latency_bits
                .compare_exchange(bits, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Absorb an `isMaster` reply: role, tags, hosts, wire limits.
    /// Returns the role the reply implies.
    pub fn apply_hello(&self, reply: &Document, rtt: Duration) -> ServerRole {
        let role = role_from_hello(reply);
        let mut meta = self.meta.write();
        meta.role = role;
        meta.last_seen = Some(Instant::now());
        meta.set_name = reply.get_str("setName").map(str::to_string);
        meta.self_name = reply.get_str("me").map(str::to_string);
        if let Some(size) = reply.get_i32("maxBsonObjectSize") {
            meta.max_bson_size = Some(size);
        }
        if let Some(version) = reply.get_i32("maxWireVersion") {
            meta.max_wire_version = Some(version);
        }
        if let Some(tags) = reply.get_document("tags") {
            meta.tags = tags
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.to_string(), s.to_string())))
                .collect();
        }
        if let Some(hosts) = reply.get_array("hosts") {
            meta.hosts = hosts
                .iter()
                .filter_map(|h| h.as_str())
                .filter_map(|h| Address::parse(h).ok())
                .collect();
        }
        drop(meta);
        self.record_latency(rtt);
        role
    }

    /// A failed ping: role becomes unknown, latency becomes infinite.
    pub fn mark_unreachable(&self) {
        self.meta.write().role = ServerRole::Unknown;
        self.latency_bits
            .store(f64::INFINITY.to_bits(), Ordering::Relaxed);
    }

    /// Whether the last reply claimed this server is the primary under
    /// its own name.
    pub fn reports_self_primary(&self) -> bool {
        let meta = self.meta.read();
        meta.role == ServerRole::Primary
            && meta
                .self_name
                .as_deref()
                .is_none_or(|me| me.eq_ignore_ascii_case(&self.canonical))
    }
}

/// Derive the role a topology reply implies.
fn role_from_hello(reply: &Document) -> ServerRole {
    if reply.get_str("msg") == Some("isdbgrid") {
        return ServerRole::Mongos;
    }
    let in_replica_set = reply.contains_key("setName")
        || reply.contains_key("hosts")
        || reply.contains_key("primary")
        || reply.get_bool("secondary").is_some();
    let is_master = reply.get_bool("ismaster").unwrap_or(false);
    if in_replica_set {
        if is_master {
            ServerRole::Primary
        } else if reply.get_bool("secondary").unwrap_or(false) {
            ServerRole::Secondary
        } else {
            ServerRole::Unknown
        }
    } else if is_master {
        ServerRole::Standalone
    } else {
        ServerRole::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn server(addr: &str) -> Server {
        Server::new(Address::parse(addr).unwrap())
    }

    #[test]
    fn test_primary_hello() {
        let s = server("a:27017");
        let role = s.apply_hello(
            &doc! {
                "ismaster": true,
                "setName": "rs0",
                "me": "a:27017",
                "hosts": ["a:27017", "b:1234"],
                "maxBsonObjectSize": 16_777_216,
                "maxWireVersion": 8,
                "ok": 1.0,
            },
            Duration::from_millis(3),
        );
        assert_eq!(role, ServerRole::Primary);
        assert!(s.is_writable());
        assert!(s.reports_self_primary());
        assert_eq!(s.known_hosts().len(), 2);
        assert_eq!(s.set_name().as_deref(), Some("rs0"));
        assert_eq!(s.max_bson_size(), Some(16_777_216));
        assert!(s.average_latency_ms().is_finite());
    }

    #[test]
    fn test_secondary_hello_with_tags() {
        let s = server("b:27017");
        let role = s.apply_hello(
            &doc! {
                "ismaster": false,
                "secondary": true,
                "setName": "rs0",
                "tags": {"dc": "east", "rack": "1"},
                "ok": 1.0,
            },
            Duration::from_millis(5),
        );
        assert_eq!(role, ServerRole::Secondary);
        assert!(!s.is_writable());
        assert_eq!(s.tags().get("dc").map(String::as_str), Some("east"));
    }

    #[test]
    fn test_mongos_hello() {
        let s = server("r:27017");
        let role = s.apply_hello(
            &doc! {"ismaster": true, "msg": "isdbgrid", "ok": 1.0},
            Duration::from_millis(1),
        );
        assert_eq!(role, ServerRole::Mongos);
        assert!(s.is_writable());
    }

    #[test]
    fn test_standalone_hello() {
        let s = server("s:27017");
        let role = s.apply_hello(&doc! {"ismaster": true, "ok": 1.0}, Duration::from_millis(1));
        assert_eq!(role, ServerRole::Standalone);
    }

    #[test]
    fn test_unreachable_resets_latency() {
        let s = server("a:27017");
        s.apply_hello(&doc! {"ismaster": true, "ok": 1.0}, Duration::from_millis(2));
        assert!(s.average_latency_ms().is_finite());
        s.mark_unreachable();
        assert_eq!(s.role(), ServerRole::Unknown);
        assert!(s.average_latency_ms().is_infinite());
    }

    #[test]
    fn test_latency_ewma_moves_toward_samples() {
        let s = server("a:27017");
        s.record_latency(Duration::from_millis(10));
        assert!((s.average_latency_ms() - 10.0).abs() < 1e-9);
        s.record_latency(Duration::from_millis(20));
        let after = s.average_latency_ms();
        assert!(after > 10.0 && after < 20.0);
    }
}
