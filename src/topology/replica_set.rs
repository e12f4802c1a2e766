//! Replica-set dispatcher: primary tracking, a per-server session cache,
//! latency-ordered candidate iteration, and primary failover through the
//! reconnect strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::{Request, reconnect};
use crate::callback::ReplySink;
use crate::cluster::{Cluster, ClusterEvent, Server};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::read_preference::ReadPreference;
use crate::session::{Session, SessionConfig, SessionEvent};

pub struct ReplicaSetConnection {
    inner: Arc<RsInner>,
}

struct RsInner {
    cluster: Cluster,
    sessions: DashMap<String, Session>,
    primary: parking_lot::RwLock<Option<String>>,
    session_config: SessionConfig,
    selection_timeout: Duration,
    app_name: Option<String>,
    open: AtomicBool,
    /// Observer deregistration: close() signals this before touching any
    /// child session.
    stop_tx: watch::Sender<bool>,
    /// Serializes concurrent primary searches.
    reconnecting: tokio::sync::Mutex<()>,
}

impl ReplicaSetConnection {
    pub fn new(cluster: Cluster, options: &ClientOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let primary = cluster.primary().map(|s| s.canonical_name().to_string());
        let inner = Arc::new(RsInner {
            cluster,
            sessions: DashMap::new(),
            primary: parking_lot::RwLock::new(primary),
            session_config: SessionConfig::from(options),
            selection_timeout: options.server_selection_timeout,
            app_name: options.app_name.clone(),
            open: AtomicBool::new(true),
            stop_tx,
            reconnecting: tokio::sync::Mutex::new(()),
        });
        inner.spawn_membership_watcher();
        Self { inner }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// The canonical address of the current primary, if one is known.
    pub fn primary(&self) -> Option<String> {
        self.inner.primary.read().clone()
    }

    /// The cached session for a server, when one is open.
    pub fn cached_session(&self, server: &str) -> Option<Session> {
        self.inner
            .sessions
            .get(server)
            .map(|s| s.value().clone())
            .filter(Session::is_open)
    }

    pub(crate) async fn send(
        &self,
        request: Request<'_>,
        preference: &ReadPreference,
        mut sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        if !self.is_open() {
            sink.fail(Error::ShutdownInProgress);
            return Err(Error::ShutdownInProgress);
        }

        let mut candidates = self.inner.cluster.candidate_servers(preference);
        if candidates.is_empty() && self.primary().is_none() {
            // No acceptable server and no primary: run the recovery
            // procedure, then enumerate again.
            self.inner.run_reconnect().await;
            candidates = self.inner.cluster.candidate_servers(preference);
        }
        if candidates.is_empty() {
            return Err(fail_with(sink, no_candidate_error(preference)));
        }

        let mut last_error: Option<Error> = None;
        for server in candidates {
            let session = match self.inner.session_for(&server).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::debug!(
                        server = %server.canonical_name(),
                        error = %error,
                        "candidate unusable, moving on"
                    );
                    last_error = Some(error);
                    continue;
                }
            };
            match request.send_on(&session, sink).await {
                Ok(_) => return Ok(server.canonical_name().to_string()),
                Err(failure) => match failure.sink {
                    Some(returned) => {
                        sink = returned;
                        last_error = Some(failure.error);
                    }
                    // The sink was completed while the session died under
                    // us; nothing left to retry with.
                    None => return Err(failure.error),
                },
            }
        }

        let error = last_error.unwrap_or_else(|| no_candidate_error(preference));
        Err(fail_with(sink, error))
    }

    /// Close the dispatcher: deregister observers first, then close every
    /// cached session.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);
        *self.inner.primary.write() = None;
        let names: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for name in names {
            if let Some((_, session)) = self.inner.sessions.remove(&name) {
                session.close();
            }
        }
        tracing::debug!("replica-set connection closed");
    }
}

impl RsInner {
    /// Cached session for a server, opening one on miss. Never holds a
    /// map reference across an await.
    async fn session_for(self: &Arc<Self>, server: &Arc<Server>) -> Result<Session> {
        let name = server.canonical_name();
        if let Some(existing) = self.sessions.get(name).map(|s| s.value().clone()) {
            if existing.is_open() {
                return Ok(existing);
            }
            self.sessions.remove_if(name, |_, s| !s.is_open());
        }
        let session = Session::connect(server.address(), self.session_config.clone()).await?;
        Ok(self.install_session(name.to_string(), session))
    }

    /// Publish a freshly opened session, resolving the open race in
    /// favour of whichever session is already cached and healthy.
    fn install_session(self: &Arc<Self>, name: String, session: Session) -> Session {
        match self.sessions.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_open() {
                    session.close();
                    entry.get().clone()
                } else {
                    let stale = entry.insert(session.clone());
                    stale.close();
                    self.spawn_session_watcher(name, session.clone());
                    session
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                self.spawn_session_watcher(name, session.clone());
                session
            }
        }
    }

    fn spawn_session_watcher(self: &Arc<Self>, name: String, session: Session) {
        let mut events = session.subscribe();
        let mut stop = self.stop_tx.subscribe();
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = events.recv() => match event {
                        Some(SessionEvent::Closed { .. }) => {
                            inner.handle_session_closed(&name);
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn spawn_membership_watcher(self: &Arc<Self>) {
        let mut events = self.cluster.subscribe();
        let mut stop = self.stop_tx.subscribe();
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = events.recv() => match event {
                        Ok(ClusterEvent::ServerRemoved(server)) => {
                            inner.evict(server.canonical_name());
                        }
                        Ok(ClusterEvent::ServerAdded(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Drop a cached session for a server that left the cluster.
    fn evict(&self, name: &str) {
        if let Some((_, session)) = self.sessions.remove(name) {
            session.close();
        }
        let mut primary = self.primary.write();
        if primary.as_deref() == Some(name) {
            *primary = None;
        }
    }

    /// A cached session transitioned to CLOSED underneath us.
    fn handle_session_closed(self: &Arc<Self>, name: &str) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        self.sessions.remove(name);
        let was_primary = {
            let mut primary = self.primary.write();
            if primary.as_deref() == Some(name) {
                *primary = None;
                true
            } else {
                false
            }
        };
        if was_primary {
            tracing::warn!(server = %name, "primary session closed, starting failover");
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_reconnect().await;
            });
        }
    }

    /// Find and install a new primary. Returns its canonical address.
    async fn run_reconnect(self: &Arc<Self>) -> Option<String> {
        let _guard = self.reconnecting.lock().await;
        if !self.open.load(Ordering::Acquire) {
            return None;
        }
        if let Some(current) = self.primary.read().clone() {
            return Some(current);
        }
        match reconnect::find_primary(
            &self.cluster,
            &self.session_config,
            self.app_name.as_deref(),
            self.selection_timeout,
        )
        .await
        {
            Some((session, server)) => {
                let name = server.canonical_name().to_string();
                self.install_session(name.clone(), session);
                *self.primary.write() = Some(name.clone());
                Some(name)
            }
            None => {
                // A primary that shut down gracefully with nothing else
                // cached leaves this connection with no way forward.
                if self.sessions.is_empty() && self.cluster.is_empty() {
                    self.open.store(false, Ordering::Release);
                    let _ = self.stop_tx.send(true);
                }
                None
            }
        }
    }
}

fn no_candidate_error(preference: &ReadPreference) -> Error {
    if preference.requires_primary() {
        Error::NoPrimary
    } else {
        Error::NoSuitableServer(preference.to_string())
    }
}

/// Complete the sink with `error` and hand a matching error back.
fn fail_with(sink: Box<dyn ReplySink>, error: Error) -> Error {
    let shadow = error.shadow();
    sink.fail(error);
    shadow
}
