//! Cluster model: the concurrent set of known servers, membership
//! change notifications, and read-preference candidate selection.

mod pinger;
mod server;

pub use pinger::Pinger;
pub(crate) use pinger::hello_exchange;
pub use server::{Server, ServerRole};

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::config::Address;
use crate::read_preference::{ReadMode, ReadPreference};

/// Membership change notifications.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    ServerAdded(Arc<Server>),
    ServerRemoved(Arc<Server>),
}

struct ClusterInner {
    servers: DashMap<String, Arc<Server>>,
    events: broadcast::Sender<ClusterEvent>,
    /// Serializes the at-most-one-writable invariant in replica-set mode.
    writable_lock: parking_lot::Mutex<()>,
}

/// Handle to the cluster model. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ClusterInner {
                servers: DashMap::new(),
                events,
                writable_lock: parking_lot::Mutex::new(()),
            }),
        }
    }

    /// Idempotent add keyed by canonical address; returns the existing
    /// record on collision.
    pub fn add(&self, address: Address) -> Arc<Server> {
        let canonical = address.canonical();
        if let Some(existing) = self.inner.servers.get(&canonical) {
            return existing.value().clone();
        }
        let server = Arc::new(Server::new(address));
        match self.inner.servers.entry(canonical) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                entry.insert(server.clone());
                tracing::debug!(server = %server.canonical_name(), "server added to cluster");
                let _ = self
                    .inner
                    .events
                    .send(ClusterEvent::ServerAdded(server.clone()));
                server
            }
        }
    }

    /// Remove a record and notify observers with it.
    pub fn remove(&self, canonical: &str) -> Option<Arc<Server>> {
        let (_, server) = self.inner.servers.remove(canonical)?;
        tracing::debug!(server = %canonical, "server removed from cluster");
        let _ = self
            .inner
            .events
            .send(ClusterEvent::ServerRemoved(server.clone()));
        Some(server)
    }

    /// O(1) lookup by canonical address.
    pub fn get(&self, canonical: &str) -> Option<Arc<Server>> {
        self.inner.servers.get(canonical).map(|s| s.value().clone())
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.inner.servers.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.servers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Promote `server` to primary, demoting any other writable record.
    pub fn mark_writable(&self, server: &Arc<Server>) {
        let _guard = self.inner.writable_lock.lock();
        for other in self.inner.servers.iter() {
            if other.canonical_name() != server.canonical_name()
                && other.role() == ServerRole::Primary
            {
                other.set_role(ServerRole::Secondary);
            }
        }
        server.set_role(ServerRole::Primary);
    }

    /// Demote `server` from primary.
    pub fn mark_not_writable(&self, server: &Arc<Server>) {
        let _guard = self.inner.writable_lock.lock();
        if server.role() == ServerRole::Primary {
            server.set_role(ServerRole::Secondary);
        }
    }

    /// The current primary, if any.
    pub fn primary(&self) -> Option<Arc<Server>> {
        self.inner
            .servers
            .iter()
            .find(|s| s.role() == ServerRole::Primary)
            .map(|s| s.value().clone())
    }

    /// Servers acceptable for `preference`, preferred group first, each
    /// group ordered by ascending mean latency.
    pub fn candidate_servers(&self, preference: &ReadPreference) -> Vec<Arc<Server>> {
        if preference.mode == ReadMode::Server {
            return preference
                .pinned
                .as_deref()
                .and_then(|addr| self.get(addr))
                .into_iter()
                .collect();
        }

        let mut preferred = Vec::new();
        let mut fallback = Vec::new();
        for server in self.inner.servers.iter() {
            let role = server.role();
            let tags_ok = || preference.tags_match(&server.tags());
            match preference.mode {
                ReadMode::Primary => {
                    if role == ServerRole::Primary {
                        preferred.push(server.value().clone());
                    }
                }
                ReadMode::PrimaryPreferred => {
                    if role == ServerRole::Primary {
                        preferred.push(server.value().clone());
                    } else if role == ServerRole::Secondary && tags_ok() {
                        fallback.push(server.value().clone());
                    }
                }
                ReadMode::Secondary => {
                    if role == ServerRole::Secondary && tags_ok() {
                        preferred.push(server.value().clone());
                    }
                }
                ReadMode::SecondaryPreferred => {
                    if role == ServerRole::Secondary && tags_ok() {
                        preferred.push(server.value().clone());
                    } else if role == ServerRole::Primary {
                        fallback.push(server.value().clone());
                    }
                }
                ReadMode::Nearest => {
                    if matches!(role, ServerRole::Primary | ServerRole::Secondary) && tags_ok() {
                        preferred.push(server.value().clone());
                    }
                }
                ReadMode::Server => unreachable!("handled above"),
            }
        }

        sort_by_latency(&mut preferred);
        sort_by_latency(&mut fallback);
        preferred.extend(fallback);
        preferred
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_by_latency(servers: &mut [Arc<Server>]) {
    servers.sort_by(|a, b| {
        a.average_latency_ms()
            .partial_cmp(&b.average_latency_ms())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use std::time::Duration;

    fn cluster_of(addrs: &[&str]) -> Cluster {
        let cluster = Cluster::new();
        for addr in addrs {
            cluster.add(Address::parse(addr).unwrap());
        }
        cluster
    }

    fn promote(cluster: &Cluster, addr: &str, latency_ms: u64) {
        let server = cluster.get(addr).unwrap();
        server.apply_hello(
            &doc! {"ismaster": true, "setName": "rs0", "ok": 1.0},
            Duration::from_millis(latency_ms),
        );
        cluster.mark_writable(&server);
    }

    fn make_secondary(cluster: &Cluster, addr: &str, latency_ms: u64) {
        let server = cluster.get(addr).unwrap();
        server.apply_hello(
            &doc! {"ismaster": false, "secondary": true, "setName": "rs0", "ok": 1.0},
            Duration::from_millis(latency_ms),
        );
    }

    #[test]
    fn test_add_is_idempotent() {
        let cluster = Cluster::new();
        let a = cluster.add(Address::parse("a:27017").unwrap());
        let b = cluster.add(Address::parse("A:27017").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn test_remove_notifies() {
        let cluster = cluster_of(&["a:27017"]);
        let mut events = cluster.subscribe();
        cluster.remove("a:27017").unwrap();
        match events.try_recv().unwrap() {
            ClusterEvent::ServerRemoved(server) => {
                assert_eq!(server.canonical_name(), "a:27017");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(cluster.get("a:27017").is_none());
    }

    #[test]
    fn test_at_most_one_writable() {
        let cluster = cluster_of(&["a:27017", "b:27017", "c:27017"]);
        promote(&cluster, "a:27017", 1);
        promote(&cluster, "b:27017", 1);
        let writable: Vec<_> = cluster
            .servers()
            .into_iter()
            .filter(|s| s.role() == ServerRole::Primary)
            .collect();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].canonical_name(), "b:27017");
    }

    #[test]
    fn test_secondary_candidates_latency_ordered() {
        let cluster = cluster_of(&["p:27017", "s1:27017", "s2:27017"]);
        promote(&cluster, "p:27017", 1);
        make_secondary(&cluster, "s1:27017", 50);
        make_secondary(&cluster, "s2:27017", 5);

        let candidates = cluster.candidate_servers(&ReadPreference::secondary());
        let names: Vec<_> = candidates.iter().map(|s| s.canonical_name()).collect();
        assert_eq!(names, vec!["s2:27017", "s1:27017"]);
    }

    #[test]
    fn test_secondary_preferred_falls_back_to_primary() {
        let cluster = cluster_of(&["p:27017", "s:27017"]);
        promote(&cluster, "p:27017", 1);
        make_secondary(&cluster, "s:27017", 5);

        let candidates = cluster.candidate_servers(&ReadPreference::secondary_preferred());
        let names: Vec<_> = candidates.iter().map(|s| s.canonical_name()).collect();
        assert_eq!(names, vec!["s:27017", "p:27017"]);
    }

    #[test]
    fn test_tag_filtering() {
        let cluster = cluster_of(&["s1:27017", "s2:27017"]);
        let s1 = cluster.get("s1:27017").unwrap();
        s1.apply_hello(
            &doc! {"ismaster": false, "secondary": true, "setName": "rs0",
                   "tags": {"dc": "east"}, "ok": 1.0},
            Duration::from_millis(1),
        );
        let s2 = cluster.get("s2:27017").unwrap();
        s2.apply_hello(
            &doc! {"ismaster": false, "secondary": true, "setName": "rs0",
                   "tags": {"dc": "west"}, "ok": 1.0},
            Duration::from_millis(1),
        );

        let pref = ReadPreference::secondary().with_tag_sets(vec![
            [("dc".to_string(), "west".to_string())].into_iter().collect(),
        ]);
        let candidates = cluster.candidate_servers(&pref);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].canonical_name(), "s2:27017");
    }

    #[test]
    fn test_pinned_server_preference() {
        let cluster = cluster_of(&["a:27017", "b:27017"]);
        let pref = ReadPreference::server("b:27017");
        let candidates = cluster.candidate_servers(&pref);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].canonical_name(), "b:27017");

        let missing = cluster.candidate_servers(&ReadPreference::server("zz:1"));
        assert!(missing.is_empty());
    }

    #[test]
    fn test_primary_preference_empty_without_primary() {
        let cluster = cluster_of(&["s:27017"]);
        make_secondary(&cluster, "s:27017", 1);
        assert!(cluster.candidate_servers(&ReadPreference::primary()).is_empty());
    }
}
