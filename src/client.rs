//! Client bootstrap: seed the cluster, run the initial ping sweep, sniff
//! the topology, and expose the routing surface the operation façades
//! build on.

use std::sync::Arc;

use crate::bson::Document;
use crate::callback::{ReplySink, ValidatingSink, reply_future};
use crate::cluster::{Cluster, Pinger};
use crate::config::ClientOptions;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::protocol::{Message, Query};
use crate::read_preference::ReadPreference;
use crate::topology::Topology;
use crate::write_concern::WriteConcern;

pub struct Client {
    options: ClientOptions,
    cluster: Cluster,
    topology: Topology,
    pinger: Arc<Pinger>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect from a `mongodb://` connection string.
    pub async fn connect(uri: &str) -> Result<Client> {
        Self::with_options(ClientOptions::parse(uri)?).await
    }

    pub async fn with_options(options: ClientOptions) -> Result<Client> {
        options.validate()?;
        let cluster = Cluster::new();
        for host in &options.hosts {
            cluster.add(host.clone());
        }

        // The first sweep is synchronous so bootstrap sees a populated
        // cluster; discovery may add members mid-sweep, so probe the
        // stragglers once as well.
        let pinger = Arc::new(Pinger::new(cluster.clone(), &options));
        pinger.sweep().await;
        if options.auto_discover && cluster.len() > options.hosts.len() {
            pinger.sweep().await;
        }

        let topology = Topology::bootstrap(cluster.clone(), &options)?;
        pinger.clone().start();

        Ok(Client {
            options,
            cluster,
            topology,
            pinger,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.options.read_preference
    }

    pub fn write_concern(&self) -> &WriteConcern {
        &self.options.write_concern
    }

    /// Route one message under the client's default read preference.
    pub async fn send(&self, message: &Message, sink: Box<dyn ReplySink>) -> Result<String> {
        self.topology
            .send(message, &self.options.read_preference, sink)
            .await
    }

    /// Route one message under an explicit read preference.
    pub async fn send_with_preference(
        &self,
        message: &Message,
        preference: &ReadPreference,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        self.topology.send(message, preference, sink).await
    }

    /// Route a write paired with its getLastError probe.
    pub async fn send_write(
        &self,
        write: &Message,
        concern: &WriteConcern,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        let database = match write {
            Message::Insert { namespace, .. }
            | Message::Update { namespace, .. }
            | Message::Delete { namespace, .. } => namespace.database.clone(),
            other => {
                let error = Error::Configuration(format!(
                    "send_write expects a write message, got opcode {}",
                    other.op_code()
                ));
                let shadow = error.shadow();
                sink.fail(error);
                return Err(shadow);
            }
        };
        match concern.get_last_error() {
            Some(gle) => {
                let probe = Query::command(database, gle).into_message();
                self.topology
                    .send_pair(write, &probe, &ReadPreference::primary(), sink)
                    .await
            }
            // Unacknowledged write: nothing to correlate, the sink
            // completes once the frame is queued.
            None => self.topology.send_unacknowledged(write, sink).await,
        }
    }

    /// Run a single-reply command and return its first document.
    pub async fn command(
        &self,
        database: impl Into<String>,
        command: Document,
    ) -> Result<Document> {
        let message = Query::command(database, command).into_message();
        let (sink, future) = reply_future();
        self.send(&message, ValidatingSink::new(sink)).await?;
        let reply = future.recv().await?;
        reply
            .first_document()
            .cloned()
            .ok_or_else(|| Error::ReplyValidation("command reply carried no document".into()))
    }

    /// Run a QUERY and wrap the reply in a cursor pinned to the session
    /// that served it.
    pub async fn query(&self, query: Query, preference: &ReadPreference) -> Result<Cursor> {
        self.query_with_limit(query, 0, preference).await
    }

    /// `query` with a client-side document limit.
    pub async fn query_with_limit(
        &self,
        query: Query,
        limit: i32,
        preference: &ReadPreference,
    ) -> Result<Cursor> {
        let namespace = query.namespace.clone();
        let batch_size = query.limit.max(0);
        let message = query.into_message();
        let (sink, future) = reply_future();
        let server = self
            .send_with_preference(&message, preference, ValidatingSink::new(sink))
            .await?;
        let reply = future.recv().await?;
        let session = self
            .topology
            .session_for(&server)
            .ok_or_else(|| Error::ConnectionNotAvailable(server.clone()))?;
        Ok(Cursor::from_reply(
            session, namespace, batch_size, limit, &reply,
        ))
    }

    /// Stop the pinger and close the dispatcher with every session it
    /// owns.
    pub async fn close(&self) {
        self.pinger.stop();
        self.topology.close().await;
        tracing::debug!("client closed");
    }
}
