//! Completion sinks for in-flight requests.
//!
//! A sink is consumed by whichever of `deliver`/`fail` runs, so exactly-once
//! completion is enforced by ownership rather than convention. Adapters
//! layer on top: a future pair for async callers, a synchronous receiver
//! with a selectable wait discipline, a validating wrapper that lifts
//! server-reported failures to typed errors, and a converting sink that
//! maps a reply into a user-facing value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::{Reply, ReplyFlags};

/// Completion interface registered with a session per request id.
pub trait ReplySink: Send + Sync + 'static {
    fn deliver(self: Box<Self>, reply: Reply);
    fn fail(self: Box<Self>, error: Error);
}

struct FnSink<F>(F);

impl<F> ReplySink for FnSink<F>
where
    F: FnOnce(Result<Reply>) + Send + Sync + 'static,
{
    fn deliver(self: Box<Self>, reply: Reply) {
        let FnSink(f) = *self;
        f(Ok(reply))
    }

    fn fail(self: Box<Self>, error: Error) {
        let FnSink(f) = *self;
        f(Err(error))
    }
}

/// Adapt a closure into a sink.
pub fn sink_fn(f: impl FnOnce(Result<Reply>) + Send + Sync + 'static) -> Box<dyn ReplySink> {
    Box::new(FnSink(f))
}

/// Sink half of an async future pair.
pub struct FutureSink {
    tx: oneshot::Sender<Result<Reply>>,
}

/// Caller half of an async future pair.
pub struct ReplyFuture {
    rx: oneshot::Receiver<Result<Reply>>,
}

/// Build a connected sink/future pair.
pub fn reply_future() -> (Box<FutureSink>, ReplyFuture) {
    let (tx, rx) = oneshot::channel();
    (Box::new(FutureSink { tx }), ReplyFuture { rx })
}

impl ReplySink for FutureSink {
    fn deliver(self: Box<Self>, reply: Reply) {
        let _ = self.tx.send(Ok(reply));
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

impl ReplyFuture {
    pub async fn recv(self) -> Result<Reply> {
        match self.rx.await {
            Ok(result) => result,
            // The sink was dropped without completing; treat as cancelled.
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Wait discipline for the synchronous receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    /// Park on a condvar immediately.
    #[default]
    Mutex,
    /// Spin briefly before parking; lower latency when replies are fast.
    LowLatencySpin,
}

const SPIN_ITERATIONS: u32 = 10_000;

struct SyncShared {
    ready: AtomicBool,
    slot: Mutex<Option<Result<Reply>>>,
    cond: Condvar,
}

/// Sink half of a synchronous pair.
pub struct SyncSink {
    shared: Arc<SyncShared>,
}

/// Blocking receiver with a selectable wait discipline.
pub struct SyncReceiver {
    shared: Arc<SyncShared>,
    lock_type: LockType,
}

/// Build a connected sink/receiver pair for blocking callers.
pub fn sync_pair(lock_type: LockType) -> (Box<SyncSink>, SyncReceiver) {
    let shared = Arc::new(SyncShared {
        ready: AtomicBool::new(false),
        slot: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        Box::new(SyncSink {
            shared: shared.clone(),
        }),
        SyncReceiver { shared, lock_type },
    )
}

impl SyncSink {
    fn complete(self, result: Result<Reply>) {
        let mut slot = self.shared.slot.lock();
        *slot = Some(result);
        self.shared.ready.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }
}

impl ReplySink for SyncSink {
    fn deliver(self: Box<Self>, reply: Reply) {
        self.complete(Ok(reply));
    }

    fn fail(self: Box<Self>, error: Error) {
        self.complete(Err(error));
    }
}

impl SyncReceiver {
    /// Block until the reply arrives or `timeout` elapses.
    pub fn wait(self, timeout: Option<Duration>) -> Result<Reply> {
        let deadline = timeout.map(|t| Instant::now() + t);

        if self.lock_type == LockType::LowLatencySpin {
            for _ in 0..SPIN_ITERATIONS {
                if self.shared.ready.load(Ordering::Acquire) {
                    return self.take();
                }
                std::hint::spin_loop();
            }
        }

        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                        return slot.take().unwrap_or(Err(Error::OperationTimedOut));
                    }
                }
                None => self.shared.cond.wait(&mut slot),
            }
        }
    }

    fn take(self) -> Result<Reply> {
        self.shared
            .slot
            .lock()
            .take()
            .unwrap_or(Err(Error::Cancelled))
    }
}

/// Inspect a reply for wire-level and server-reported failures.
///
/// `expected_cursor` names the cursor a GET_MORE referenced, for the
/// cursor-not-found case.
pub fn validate_reply(reply: &Reply, expected_cursor: Option<i64>) -> Option<Error> {
    if reply.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
        return Some(Error::CursorNotFound(
            expected_cursor.unwrap_or(reply.cursor_id),
        ));
    }
    if reply.flags.contains(ReplyFlags::SHARD_CONFIG_STALE) {
        return Some(Error::ShardConfigStale(
            reply.first_document().cloned().unwrap_or_default(),
        ));
    }
    if reply.flags.contains(ReplyFlags::QUERY_FAILURE) {
        let doc = reply.first_document().cloned().unwrap_or_default();
        return Some(
            Error::from_error_document(&doc).unwrap_or(Error::QueryFailure(doc)),
        );
    }
    if let Some(doc) = reply.first_document() {
        return Error::from_error_document(doc);
    }
    None
}

/// Sink that validates the reply before delegating to the inner sink.
pub struct ValidatingSink {
    inner: Box<dyn ReplySink>,
    expected_cursor: Option<i64>,
}

impl ValidatingSink {
    pub fn new(inner: Box<dyn ReplySink>) -> Box<Self> {
        Box::new(Self {
            inner,
            expected_cursor: None,
        })
    }

    pub fn for_cursor(inner: Box<dyn ReplySink>, cursor_id: i64) -> Box<Self> {
        Box::new(Self {
            inner,
            expected_cursor: Some(cursor_id),
        })
    }
}

impl ReplySink for ValidatingSink {
    fn deliver(self: Box<Self>, reply: Reply) {
        match validate_reply(&reply, self.expected_cursor) {
            Some(error) => self.inner.fail(error),
            None => self.inner.deliver(reply),
        }
    }

    fn fail(self: Box<Self>, error: Error) {
        self.inner.fail(error);
    }
}

/// Sink that maps a reply into a user-facing value before completing a
/// typed future.
pub struct ConvertingSink<T: Send + 'static> {
    convert: Box<dyn FnOnce(Reply) -> Result<T> + Send + Sync>,
    tx: oneshot::Sender<Result<T>>,
}

pub struct ConvertedFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

pub fn converting_pair<T: Send + 'static>(
    convert: impl FnOnce(Reply) -> Result<T> + Send + Sync + 'static,
) -> (Box<ConvertingSink<T>>, ConvertedFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(ConvertingSink {
            convert: Box::new(convert),
            tx,
        }),
        ConvertedFuture { rx },
    )
}

impl<T: Send + Sync + 'static> ReplySink for ConvertingSink<T> {
    fn deliver(self: Box<Self>, reply: Reply) {
        let _ = self.tx.send((self.convert)(reply));
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

impl<T> ConvertedFuture<T> {
    pub async fn recv(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}
