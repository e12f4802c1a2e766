//! Periodic health and latency probe sweeping the cluster members.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::Cluster;
use crate::bson::Document;
use crate::callback::reply_future;
use crate::config::{Address, ClientOptions};
use crate::doc;
use crate::error::{Error, Result};
use crate::protocol::Query;
use crate::session::{Session, SessionConfig};

/// Background pinger. The initial sweep runs synchronously so bootstrap
/// can observe a populated cluster; after `start` the sweep repeats on
/// the configured interval until `stop`.
pub struct Pinger {
    cluster: Cluster,
    session_config: SessionConfig,
    interval: Duration,
    auto_discover: bool,
    app_name: Option<String>,
    stop_tx: watch::Sender<bool>,
}

impl Pinger {
    pub fn new(cluster: Cluster, options: &ClientOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cluster,
            session_config: SessionConfig::from(options),
            interval: options.ping_interval,
            auto_discover: options.auto_discover,
            app_name: options.app_name.clone(),
            stop_tx,
        }
    }

    /// The `isMaster` handshake document, carrying the configured
    /// application name.
    pub fn handshake(app_name: Option<&str>) -> Document {
        let mut cmd = doc! {"ismaster": 1};
        if let Some(name) = app_name {
            cmd.insert("client", doc! {"application": {"name": name}});
        }
        cmd
    }

    /// Probe every known member once, concurrently, and wait for all
    /// probes to finish.
    pub async fn sweep(&self) {
        let mut probes = JoinSet::new();
        for server in self.cluster.servers() {
            let cluster = self.cluster.clone();
            let config = self.session_config.clone();
            let app_name = self.app_name.clone();
            let auto_discover = self.auto_discover;
            probes.spawn(async move {
                ping_server(&cluster, server, config, app_name.as_deref(), auto_discover).await;
            });
        }
        while probes.join_next().await.is_some() {}
    }

    /// Spawn the periodic sweep task.
    pub fn start(self: std::sync::Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let pinger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pinger.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; bootstrap already swept.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => pinger.sweep().await,
                }
            }
            tracing::debug!("pinger stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// One probe: time an `isMaster` round trip on a fresh session, fold the
/// result into the server record, and absorb discovered hosts.
async fn ping_server(
    cluster: &Cluster,
    server: std::sync::Arc<super::Server>,
    config: SessionConfig,
    app_name: Option<&str>,
    auto_discover: bool,
) {
    let started = Instant::now();
    match hello_round_trip(&server, config, app_name).await {
        Ok(reply) => {
            let rtt = started.elapsed();
            let role = server.apply_hello(&reply, rtt);
            tracing::trace!(
                server = %server.canonical_name(),
                ?role,
                rtt_ms = rtt.as_millis() as u64,
                "ping ok"
            );
            if role == super::ServerRole::Primary {
                cluster.mark_writable(&server);
            }
            if auto_discover {
                for host in server.known_hosts() {
                    cluster.add(host);
                }
            }
        }
        Err(error) => {
            tracing::debug!(server = %server.canonical_name(), error = %error, "ping failed");
            server.mark_unreachable();
        }
    }
}

async fn hello_round_trip(
    server: &super::Server,
    config: SessionConfig,
    app_name: Option<&str>,
) -> Result<Document> {
    let (session, reply) = hello_exchange(server.address(), config, app_name).await?;
    session.close();
    Ok(reply)
}

/// Open a session to `address` and run the `isMaster` handshake on it.
/// The session stays open on success; the reconnect strategy keeps it.
pub(crate) async fn hello_exchange(
    address: &Address,
    config: SessionConfig,
    app_name: Option<&str>,
) -> Result<(Session, Document)> {
    let deadline = config.connect_timeout;
    let session = Session::connect(address, config).await?;
    let command = Query::command("admin", Pinger::handshake(app_name)).into_message();
    let (sink, future) = reply_future();
    if let Err(failure) = session.send(&command, sink).await {
        session.close();
        return Err(failure.surface());
    }
    let reply = match timeout(deadline, future.recv()).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(error)) => {
            session.close();
            return Err(error);
        }
        Err(_) => {
            session.close();
            return Err(Error::OperationTimedOut);
        }
    };
    match reply.first_document() {
        Some(doc) => Ok((session, doc.clone())),
        None => {
            session.close();
            Err(Error::ReplyValidation("empty isMaster reply".into()))
        }
    }
}
