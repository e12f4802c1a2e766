//! Sharded dispatcher: every known mongos router is a candidate, tried in
//! latency order. No primary, no election; dead routers are evicted and
//! the next one is selected. A stale-shard-config reply invalidates the
//! router's cached session and the request is retried once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::Request;
use crate::callback::ReplySink;
use crate::cluster::{Cluster, ClusterEvent, Server, ServerRole};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::protocol::{Message, Reply, ReplyFlags};
use crate::session::{Session, SessionConfig, SessionEvent};

#[derive(Clone)]
pub struct ShardedConnection {
    inner: Arc<ShardedInner>,
}

struct ShardedInner {
    cluster: Cluster,
    sessions: DashMap<String, Session>,
    session_config: SessionConfig,
    open: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ShardedConnection {
    pub fn new(cluster: Cluster, options: &ClientOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(ShardedInner {
            cluster,
            sessions: DashMap::new(),
            session_config: SessionConfig::from(options),
            open: AtomicBool::new(true),
            stop_tx,
        });
        inner.spawn_membership_watcher();
        Self { inner }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Known routers in ascending latency order.
    fn routers(&self) -> Vec<Arc<Server>> {
        let mut routers: Vec<_> = self
            .inner
            .cluster
            .servers()
            .into_iter()
            .filter(|s| s.role() == ServerRole::Mongos)
            .collect();
        routers.sort_by(|a, b| {
            a.average_latency_ms()
                .partial_cmp(&b.average_latency_ms())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        routers
    }

    pub(crate) async fn send(
        &self,
        request: Request<'_>,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        // Wrap single messages so a stale-config reply re-dispatches once.
        match request {
            Request::Single(message) => {
                let router_slot = Arc::new(parking_lot::Mutex::new(None));
                let sink =
                    StaleRetrySink::wrap(self.clone(), message.clone(), router_slot.clone(), sink);
                let result = self.send_once(request, sink).await;
                if let Ok(name) = &result {
                    *router_slot.lock() = Some(name.clone());
                }
                result
            }
            Request::Pair(..) | Request::Fire(..) => self.send_once(request, sink).await,
        }
    }

    pub(crate) async fn send_once(
        &self,
        request: Request<'_>,
        mut sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        if !self.is_open() {
            sink.fail(Error::ShutdownInProgress);
            return Err(Error::ShutdownInProgress);
        }
        let routers = self.routers();
        if routers.is_empty() {
            sink.fail(Error::NoSuitableServer("no mongos router known".into()));
            return Err(Error::NoSuitableServer("no mongos router known".into()));
        }

        let mut last_error: Option<Error> = None;
        for router in routers {
            let session = match self.inner.session_for(&router).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::debug!(
                        router = %router.canonical_name(),
                        error = %error,
                        "router unusable, moving on"
                    );
                    last_error = Some(error);
                    continue;
                }
            };
            match request.send_on(&session, sink).await {
                Ok(_) => return Ok(router.canonical_name().to_string()),
                Err(failure) => match failure.sink {
                    Some(returned) => {
                        sink = returned;
                        last_error = Some(failure.error);
                    }
                    None => return Err(failure.error),
                },
            }
        }

        let error = last_error
            .unwrap_or_else(|| Error::NoSuitableServer("no mongos router usable".into()));
        let shadow = error.shadow();
        sink.fail(error);
        Err(shadow)
    }

    /// The cached session for a router, when one is open.
    pub fn cached_session(&self, server: &str) -> Option<Session> {
        self.inner
            .sessions
            .get(server)
            .map(|s| s.value().clone())
            .filter(Session::is_open)
    }

    /// Forget the cached session for a router whose config went stale.
    fn invalidate_router(&self, name: &str) {
        if let Some((_, session)) = self.inner.sessions.remove(name) {
            session.close();
        }
    }

    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);
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
        tracing::debug!("sharded connection closed");
    }
}

impl ShardedInner {
    async fn session_for(self: &Arc<Self>, router: &Arc<Server>) -> Result<Session> {
        let name = router.canonical_name();
        if let Some(existing) = self.sessions.get(name).map(|s| s.value().clone()) {
            if existing.is_open() {
                return Ok(existing);
            }
            self.sessions.remove_if(name, |_, s| !s.is_open());
        }
        let session = Session::connect(router.address(), self.session_config.clone()).await?;
        Ok(self.install_session(name.to_string(), session))
    }

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
                            // Evict-and-reselect is the whole recovery
                            // story for routers.
                            inner.sessions.remove(&name);
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
                            if let Some((_, session)) =
                                inner.sessions.remove(server.canonical_name())
                            {
                                session.close();
                            }
                        }
                        Ok(ClusterEvent::ServerAdded(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Retries a request once when the reply says the router's shard config
/// is stale, after invalidating that router's cached session.
struct StaleRetrySink {
    dispatcher: ShardedConnection,
    message: Message,
    router: Arc<parking_lot::Mutex<Option<String>>>,
    inner: Box<dyn ReplySink>,
}

impl StaleRetrySink {
    fn wrap(
        dispatcher: ShardedConnection,
        message: Message,
        router: Arc<parking_lot::Mutex<Option<String>>>,
        inner: Box<dyn ReplySink>,
    ) -> Box<Self> {
        Box::new(Self {
            dispatcher,
            message,
            router,
            inner,
        })
    }
}

impl crate::callback::ReplySink for StaleRetrySink {
    fn deliver(self: Box<Self>, reply: Reply) {
        let StaleRetrySink {
            dispatcher,
            message,
            router,
            inner,
        } = *self;
        if !reply.flags.contains(ReplyFlags::SHARD_CONFIG_STALE) {
            inner.deliver(reply);
            return;
        }
        tracing::debug!("stale shard config, invalidating router and retrying once");
        if let Some(name) = router.lock().take() {
            dispatcher.invalidate_router(&name);
        }
        tokio::spawn(async move {
            // The retry goes through plain dispatch: a second stale reply
            // propagates to the caller.
            let _ = dispatcher.send_once(Request::Single(&message), inner).await;
        });
    }

    fn fail(self: Box<Self>, error: Error) {
        self.inner.fail(error);
    }
}
