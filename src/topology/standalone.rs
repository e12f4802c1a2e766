//! Single-server dispatcher: one underlying session, every request
//! forwarded, close cascades.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use super::{Request, reconnect};
use crate::callback::ReplySink;
use crate::config::{Address, ClientOptions};
use crate::error::{Error, Result};
use crate::session::{Session, SessionConfig};

pub struct StandaloneConnection {
    address: Address,
    session: Mutex<Option<Session>>,
    session_config: SessionConfig,
    selection_timeout: Duration,
    open: AtomicBool,
}

impl StandaloneConnection {
    pub fn new(address: Address, options: &ClientOptions) -> Self {
        Self {
            address,
            session: Mutex::new(None),
            session_config: SessionConfig::from(options),
            selection_timeout: options.server_selection_timeout,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The cached session, when one is open. Non-blocking.
    pub fn cached_session(&self) -> Option<Session> {
        self.session
            .try_lock()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(Session::is_open)
    }

    /// The cached session, reconnecting with backoff when it has died.
    async fn healthy_session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
        }
        let session = reconnect::reconnect_standalone(
            &self.address,
            &self.session_config,
            self.selection_timeout,
        )
        .await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    pub(crate) async fn send(
        &self,
        request: Request<'_>,
        sink: Box<dyn ReplySink>,
    ) -> Result<String> {
        if !self.is_open() {
            sink.fail(Error::ShutdownInProgress);
            return Err(Error::ShutdownInProgress);
        }
        let session = match self.healthy_session().await {
            Ok(session) => session,
            Err(error) => {
                let shadow = error.shadow();
                sink.fail(error);
                return Err(shadow);
            }
        };
        match request.send_on(&session, sink).await {
            Ok(_) => Ok(session.server_name().to_string()),
            Err(failure) => Err(failure.surface()),
        }
    }

    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.close();
        }
        tracing::debug!(server = %self.address, "standalone connection closed");
    }
}
