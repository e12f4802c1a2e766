//! Topology-aware dispatchers: turn a logical request plus a read
//! preference into a choice of session.
//!
//! One variant per deployment shape. The variant is chosen at bootstrap
//! from the first successful topology reply.

mod reconnect;
mod replica_set;
mod sharded;
mod standalone;

pub use replica_set::ReplicaSetConnection;
pub use sharded::ShardedConnection;
pub use standalone::StandaloneConnection;

use crate::callback::ReplySink;
use crate::cluster::{Cluster, ServerRole};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::read_preference::ReadPreference;
use crate::session::{SendFailure, Session};

/// A request on its way to a session: a single message, an atomic pair
/// (only the second message of a pair is tracked for a reply), or a
/// fire-and-forget write that expects no reply at all.
#[derive(Clone, Copy)]
pub(crate) enum Request<'a> {
    Single(&'a Message),
    Pair(&'a Message, &'a Message),
    Fire(&'a Message),
}

impl Request<'_> {
    pub(crate) async fn send_on(
        &self,
        session: &Session,
        sink: Box<dyn ReplySink>,
    ) -> std::result::Result<i32, SendFailure> {
        match self {
            Request::Single(message) => session.send(message, sink).await,
            Request::Pair(first, second) => session.send_pair(first, second, sink).await,
            Request::Fire(message) => match session.send_no_reply(message) {
                // Nothing will be correlated; completion means the write
                // was queued for the wire.
                Ok(id) => {
                    sink.deliver(crate::protocol::Reply::with_documents(0, 0, Vec::new()));
                    Ok(id)
                }
                Err(error) => Err(SendFailure::preflight(error, sink)),
            },
        }
    }
}

/// The per-deployment dispatcher.
pub enum Topology {
    Standalone(StandaloneConnection),
    ReplicaSet(ReplicaSetConnection),
    Sharded(ShardedConnection),
}

impl Topology {
    /// Choose the dispatcher variant from the cluster as the initial ping
    /// sweep left it. Requires at least one reachable server.
    pub fn bootstrap(cluster: Cluster, options: &ClientOptions) -> Result<Topology> {
        let servers = cluster.servers();
        let reachable: Vec<_> = servers
            .iter()
            .filter(|s| s.role() != ServerRole::Unknown)
            .collect();
        if reachable.is_empty() {
            return Err(Error::NoSuitableServer("no reachable seed server".into()));
        }

        if let Some(expected) = &options.replica_set {
            for server in &reachable {
                if let Some(actual) = server.set_name() {
                    if actual != *expected {
                        return Err(Error::Configuration(format!(
                            "server {} is in replica set {actual:?}, expected {expected:?}",
                            server.canonical_name()
                        )));
                    }
                }
            }
        }

        let any_mongos = reachable.iter().any(|s| s.role() == ServerRole::Mongos);
        let any_replica = reachable.iter().any(|s| {
            matches!(s.role(), ServerRole::Primary | ServerRole::Secondary)
                && s.set_name().is_some()
        });

        if any_mongos {
            tracing::info!("sharded topology detected");
            Ok(Topology::Sharded(ShardedConnection::new(cluster, options)))
        } else if any_replica || options.replica_set.is_some() {
            tracing::info!("replica-set topology detected");
            Ok(Topology::ReplicaSet(ReplicaSetConnection::new(
                cluster, options,
            )))
        } else {
            tracing::info!("standalone topology detected");
            let address = reachable[0].address().clone();
            Ok(Topology::Standalone(StandaloneConnection::new(
                address, options,
            )))
        }
    }

    /// Route one message. Returns the canonical name of the server the
    /// message went to. On error the sink has been completed.
    pub async fn send(
        &self,
        message: &Message,
        preference: &ReadPreference,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        match self {
            Topology::Standalone(conn) => conn.send(Request::Single(message), sink).await,
            Topology::ReplicaSet(conn) => {
                conn.send(Request::Single(message), preference, sink).await
            }
            Topology::Sharded(conn) => conn.send(Request::Single(message), sink).await,
        }
    }

    /// Route an unacknowledged write. The sink completes with an empty
    /// reply as soon as the message is queued for the wire.
    pub async fn send_unacknowledged(
        &self,
        message: &Message,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        let preference = ReadPreference::primary();
        match self {
            Topology::Standalone(conn) => conn.send(Request::Fire(message), sink).await,
            Topology::ReplicaSet(conn) => {
                conn.send(Request::Fire(message), &preference, sink).await
            }
            Topology::Sharded(conn) => conn.send(Request::Fire(message), sink).await,
        }
    }

    /// Route an atomic message pair (write plus getLastError probe).
    pub async fn send_pair(
        &self,
        first: &Message,
        second: &Message,
        preference: &ReadPreference,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        match self {
            Topology::Standalone(conn) => conn.send(Request::Pair(first, second), sink).await,
            Topology::ReplicaSet(conn) => {
                conn.send(Request::Pair(first, second), preference, sink)
                    .await
            }
            Topology::Sharded(conn) => conn.send(Request::Pair(first, second), sink).await,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Topology::Standalone(conn) => conn.is_open(),
            Topology::ReplicaSet(conn) => conn.is_open(),
            Topology::Sharded(conn) => conn.is_open(),
        }
    }

    /// The cached session for a server `send` reported routing to.
    /// Cursors use this to pin GET_MOREs to the right session.
    pub fn session_for(&self, server: &str) -> Option<Session> {
        match self {
            Topology::Standalone(conn) => conn.cached_session(),
            Topology::ReplicaSet(conn) => conn.cached_session(server),
            Topology::Sharded(conn) => conn.cached_session(server),
        }
    }

    /// Close the dispatcher and every session it owns.
    pub async fn close(&self) {
        match self {
            Topology::Standalone(conn) => conn.close().await,
            Topology::ReplicaSet(conn) => conn.close(),
            Topology::Sharded(conn) => conn.close(),
        }
    }
}
