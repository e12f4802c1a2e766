//! Per-topology recovery procedures for a lost primary or endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::cluster::{Cluster, Server, hello_exchange};
use crate::config::Address;
use crate::error::Result;
use crate::session::{Session, SessionConfig};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Replica-set recovery: poll every configured and discovered member with
/// `isMaster` until one reports itself primary under its own name, within
/// `deadline`. On success the new session and the promoted record are
/// returned. On expiry `None`: secondary-preference reads may continue,
/// primary reads fail upstream.
pub(crate) async fn find_primary(
    cluster: &Cluster,
    config: &SessionConfig,
    app_name: Option<&str>,
    deadline: Duration,
) -> Option<(Session, Arc<Server>)> {
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    while started.elapsed() < deadline {
        for server in cluster.servers() {
            let probe_started = Instant::now();
            let result = hello_exchange(server.address(), config.clone(), app_name).await;
            let (session, reply) = match result {
                Ok(pair) => pair,
                Err(error) => {
                    tracing::trace!(
                        server = %server.canonical_name(),
                        error = %error,
                        "primary poll failed"
                    );
                    server.mark_unreachable();
                    continue;
                }
            };

            server.apply_hello(&reply, probe_started.elapsed());

            let claims_mastership = reply.get_bool("ismaster").unwrap_or(false);
            let names_itself = reply
                .get_str("me")
                .is_none_or(|me| me.eq_ignore_ascii_case(server.canonical_name()));
            if claims_mastership && names_itself {
                cluster.mark_writable(&server);
                tracing::info!(server = %server.canonical_name(), "primary elected");
                return Some((session, server));
            }

            // Not the primary; keep the record fresh but drop the session.
            session.close();
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    tracing::warn!(elapsed = ?started.elapsed(), "primary search deadline expired");
    None
}

/// Standalone recovery: reconnect to the sole configured endpoint with
/// exponential backoff until `deadline`.
pub(crate) async fn reconnect_standalone(
    address: &Address,
    config: &SessionConfig,
    deadline: Duration,
) -> Result<Session> {
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match Session::connect(address, config.clone()).await {
            Ok(session) => {
                tracing::info!(server = %address, "reconnected");
                return Ok(session);
            }
            Err(error) => {
                if started.elapsed() + backoff >= deadline {
                    tracing::warn!(server = %address, error = %error, "reconnect gave up");
                    return Err(error);
                }
                tracing::debug!(server = %address, error = %error, "reconnect attempt failed");
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
