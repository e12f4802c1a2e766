//! Asynchronous MongoDB wire-protocol client core.
//!
//! The crate owns the four subsystems a driver core is made of: the BSON
//! wire codec, the socket session that multiplexes logical requests over
//! one TCP connection, the cluster model kept fresh by a periodic pinger,
//! and the topology-aware dispatchers that route each request to the
//! right server under a read preference.

pub mod bson;
pub mod callback;
pub mod client;
pub mod cluster;
pub mod config;
pub mod cursor;
pub mod error;
pub mod namespace;
pub mod protocol;
pub mod read_preference;
pub mod registry;
pub mod session;
pub mod topology;
pub mod write_concern;

pub use bson::{Bson, Document, ObjectId};
pub use callback::{LockType, ReplySink};
pub use client::Client;
pub use cluster::{Cluster, ClusterEvent, Pinger, Server, ServerRole};
pub use config::{Address, ClientOptions};
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use namespace::Namespace;
pub use protocol::{Message, Query, Reply};
pub use read_preference::{ReadMode, ReadPreference, TagSet};
pub use session::{Session, SessionConfig, SessionEvent, SessionState};
pub use topology::Topology;
pub use write_concern::{Durability, WriteConcern};
