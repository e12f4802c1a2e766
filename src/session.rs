//! Socket session: multiplexes concurrent logical requests over one TCP
//! connection.
//!
//! One writer task drains the outbound queue preserving FIFO; one reader
//! task demultiplexes replies by `response_to` against the pending table.
//! Any IO or framing problem is fatal to the session: it transitions to
//! CLOSED, fails every pending entry, and notifies observers. Retry and
//! failover belong to the dispatcher, never here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::callback::ReplySink;
use crate::config::{Address, ClientOptions};
use crate::error::{Error, Result};
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, Message, MessageHeader, Reply, next_request_id,
};

/// Session lifecycle. Terminal state is `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Opening = 0,
    Open = 1,
    ShuttingDown = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Opening,
            1 => SessionState::Open,
            2 => SessionState::ShuttingDown,
            _ => SessionState::Closed,
        }
    }
}

/// Open-state transition events delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Closed { server: String },
}

/// Per-session knobs, derived from the client options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Deadline applied to each pending entry; `None` disables the
    /// timeout sweeper.
    pub request_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub queue_depth: usize,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_depth: 256,
            sweep_interval: Duration::from_millis(100),
        }
    }
}

impl From<&ClientOptions> for SessionConfig {
    fn from(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            request_timeout: options.socket_timeout,
            ..Default::default()
        }
    }
}

/// A send that did not take effect. When `sink` is present the entry was
/// never registered (or was withdrawn un-completed) and the caller may
/// retry it on another session; when absent the close path already
/// completed it.
pub struct SendFailure {
    pub error: Error,
    pub sink: Option<Box<dyn ReplySink>>,
}

impl SendFailure {
    pub(crate) fn preflight(error: Error, sink: Box<dyn ReplySink>) -> Self {
        Self {
            error,
            sink: Some(sink),
        }
    }

    /// Give up on retrying: complete the sink (when still owned) with the
    /// error and hand a matching error back to the caller.
    pub fn surface(self) -> Error {
        match self.sink {
            Some(sink) => {
                let shadow = self.error.shadow();
                sink.fail(self.error);
                shadow
            }
            None => self.error,
        }
    }
}

impl std::fmt::Debug for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFailure")
            .field("error", &self.error)
            .field("sink_returned", &self.sink.is_some())
            .finish()
    }
}

impl From<SendFailure> for Error {
    fn from(failure: SendFailure) -> Error {
        failure.surface()
    }
}

pub type SendResult = std::result::Result<i32, SendFailure>;

struct PendingEntry {
    sink: Box<dyn ReplySink>,
    #[allow(dead_code)]
    enqueued_at: Instant,
    deadline: Option<Instant>,
}

enum Outbound {
    Frame(Bytes),
    /// Two frames written inside one sender critical section.
    Pair(Bytes, Bytes),
    Flush(oneshot::Sender<()>),
    /// Graceful-shutdown marker: flush and stop.
    Drain,
}

struct Inner {
    server: String,
    state: AtomicU8,
    pending: DashMap<i32, PendingEntry>,
    outbound: mpsc::Sender<Outbound>,
    closed_tx: watch::Sender<bool>,
    observers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    config: SessionConfig,
}

/// Handle to one socket session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Open a TCP connection and spawn the session tasks.
    pub async fn connect(address: &Address, config: SessionConfig) -> Result<Session> {
        let connect = TcpStream::connect((address.host.as_str(), address.port));
        let stream = timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::over_stream(stream, address.canonical(), config))
    }

    /// Run a session over any duplex byte stream. Encrypted transports
    /// plug in here.
    pub fn over_stream<S>(stream: S, server: String, config: SessionConfig) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_depth);
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            server,
            state: AtomicU8::new(SessionState::Open as u8),
            pending: DashMap::new(),
            outbound: outbound_tx,
            closed_tx,
            observers: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        tokio::spawn(run_writer(
            inner.clone(),
            write_half,
            outbound_rx,
            inner.closed_tx.subscribe(),
        ));
        tokio::spawn(run_reader(
            inner.clone(),
            read_half,
            inner.closed_tx.subscribe(),
        ));
        if inner.config.request_timeout.is_some() {
            tokio::spawn(run_sweeper(inner.clone(), inner.closed_tx.subscribe()));
        }

        tracing::debug!(server = %inner.server, "session open");
        Session { inner }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server
    }

    pub fn is_idle(&self) -> bool {
        self.inner.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register an observer for open-state transitions. A session that is
    /// already closed notifies immediately.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self.inner.observers.lock();
        if self.state() == SessionState::Closed {
            let _ = tx.send(SessionEvent::Closed {
                server: self.inner.server.clone(),
            });
        } else {
            observers.push(tx);
        }
        rx
    }

    /// Send one message and register `sink` for its reply. Returns the
    /// assigned request id.
    pub async fn send(&self, message: &Message, sink: Box<dyn ReplySink>) -> SendResult {
        self.send_with_deadline(message, self.default_deadline(), sink)
            .await
    }

    /// `send` with an explicit per-operation deadline.
    pub async fn send_with_deadline(
        &self,
        message: &Message,
        deadline: Option<Instant>,
        sink: Box<dyn ReplySink>,
    ) -> SendResult {
        let request_id = next_request_id();
        let frame = message.encode(request_id);
        self.dispatch(request_id, Outbound::Frame(frame), deadline, sink)
            .await
    }

    /// Send two messages inside one sender critical section. Only the
    /// second id is tracked for reply correlation; the write-then-probe
    /// pattern (INSERT + getLastError) relies on this.
    pub async fn send_pair(
        &self,
        first: &Message,
        second: &Message,
        sink: Box<dyn ReplySink>,
    ) -> SendResult {
        let first_frame = first.encode(next_request_id());
        let request_id = next_request_id();
        let second_frame = second.encode(request_id);
        self.dispatch(
            request_id,
            Outbound::Pair(first_frame, second_frame),
            self.default_deadline(),
            sink,
        )
        .await
    }

    async fn dispatch(
        &self,
        request_id: i32,
        outbound: Outbound,
        deadline: Option<Instant>,
        sink: Box<dyn ReplySink>,
    ) -> SendResult {
        if self.state() != SessionState::Open {
            return Err(SendFailure::preflight(
                Error::ConnectionNotAvailable(self.inner.server.clone()),
                sink,
            ));
        }

        self.inner.pending.insert(
            request_id,
            PendingEntry {
                sink,
                enqueued_at: Instant::now(),
                deadline,
            },
        );

        // Backpressure: a full queue suspends the caller here.
        if self.inner.outbound.send(outbound).await.is_err() {
            return Err(self.withdraw(request_id, || {
                Error::ConnectionNotAvailable(self.inner.server.clone())
            }));
        }

        // The session may have closed between the state check and the
        // queue write; the closer drains the table, so re-check and
        // complete whichever side still owns the entry.
        if self.state() == SessionState::Closed {
            return Err(self.withdraw(request_id, || {
                Error::connection_lost(&self.inner.server)
            }));
        }

        Ok(request_id)
    }

    /// Pull a just-registered entry back out. If the close path got to it
    /// first, the sink has already been completed.
    fn withdraw(&self, request_id: i32, make_error: impl Fn() -> Error) -> SendFailure {
        match self.inner.pending.remove(&request_id) {
            Some((_, entry)) => SendFailure {
                error: make_error(),
                sink: Some(entry.sink),
            },
            None => SendFailure {
                error: make_error(),
                sink: None,
            },
        }
    }

    /// Fire-and-forget send with no reply tracking. Used for
    /// KILL_CURSORS, including from drop guards; best-effort.
    pub fn send_no_reply(&self, message: &Message) -> Result<i32> {
        if self.state() != SessionState::Open {
            return Err(Error::ConnectionNotAvailable(self.inner.server.clone()));
        }
        let request_id = next_request_id();
        let frame = message.encode(request_id);
        self.inner
            .outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|_| Error::ConnectionNotAvailable(self.inner.server.clone()))?;
        Ok(request_id)
    }

    /// Cancel a pending entry. The message is not recalled; a late reply
    /// is discarded silently.
    pub fn cancel(&self, request_id: i32) -> bool {
        match self.inner.pending.remove(&request_id) {
            Some((_, entry)) => {
                entry.sink.fail(Error::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Wait until the outbound queue has drained to the kernel.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outbound::Flush(tx))
            .await
            .map_err(|_| Error::ConnectionNotAvailable(self.inner.server.clone()))?;
        rx.await
            .map_err(|_| Error::connection_lost(&self.inner.server))
    }

    /// Close immediately. Every pending entry fails with
    /// `ConnectionLost`.
    pub fn close(&self) {
        let server = self.inner.server.clone();
        self.inner
            .close_with(&move || Error::connection_lost(server.clone()));
    }

    /// Drain-or-abort shutdown. With `force`, queued work is failed
    /// immediately; otherwise the writer flushes what is queued first.
    pub async fn shutdown(&self, force: bool) {
        if force {
            self.inner.close_with(&|| Error::ShutdownInProgress);
            return;
        }
        let _ = self.inner.state.compare_exchange(
            SessionState::Open as u8,
            SessionState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.inner.outbound.send(Outbound::Drain).await.is_err() {
            // Writer already gone; finish the transition ourselves.
            self.inner.close_with(&|| Error::ShutdownInProgress);
            return;
        }
        let mut closed = self.inner.closed_tx.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    fn default_deadline(&self) -> Option<Instant> {
        self.inner
            .config
            .request_timeout
            .map(|t| Instant::now() + t)
    }
}

impl Inner {
    /// Perform the CLOSED transition exactly once: wake the IO tasks,
    /// fail every pending entry, notify observers.
    fn close_with(&self, make_error: &(dyn Fn() -> Error + Send + Sync)) {
        let prev = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if prev == SessionState::Closed as u8 {
            return;
        }
        let _ = self.closed_tx.send(true);

        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.sink.fail(make_error());
            }
        }

        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            let _ = observer.send(SessionEvent::Closed {
                server: self.server.clone(),
            });
        }
        tracing::debug!(server = %self.server, "session closed");
    }

    fn close_io(&self, error: std::io::Error) {
        let server = self.server.clone();
        let kind = error.kind();
        let message = error.to_string();
        tracing::debug!(server = %self.server, error = %message, "session io error");
        self.close_with(&move || {
            Error::connection_lost_io(
                server.clone(),
                std::io::Error::new(kind, message.clone()),
            )
        });
    }

    fn close_framing(&self, error: Error) {
        tracing::warn!(server = %self.server, error = %error, "session framing error");
        let server = self.server.clone();
        self.close_with(&move || Error::connection_lost(server.clone()));
    }

    fn complete(&self, response_to: i32, reply: Reply) {
        match self.pending.remove(&response_to) {
            Some((_, entry)) => entry.sink.deliver(reply),
            // Cancelled or timed-out request; the late reply is dropped.
            None => {
                tracing::trace!(server = %self.server, response_to, "discarding uncorrelated reply")
            }
        }
    }
}

async fn run_writer<W>(
    inner: Arc<Inner>,
    mut writer: W,
    mut queue: mpsc::Receiver<Outbound>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            command = queue.recv() => match command {
                None => break,
                Some(Outbound::Frame(frame)) => {
                    if let Err(error) = writer.write_all(&frame).await {
                        inner.close_io(error);
                        break;
                    }
                }
                Some(Outbound::Pair(first, second)) => {
                    let result = async {
                        writer.write_all(&first).await?;
                        writer.write_all(&second).await
                    }
                    .await;
                    if let Err(error) = result {
                        inner.close_io(error);
                        break;
                    }
                }
                Some(Outbound::Flush(done)) => {
                    if let Err(error) = writer.flush().await {
                        inner.close_io(error);
                        break;
                    }
                    let _ = done.send(());
                }
                Some(Outbound::Drain) => {
                    let _ = writer.flush().await;
                    inner.close_with(&|| Error::ShutdownInProgress);
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader<R>(inner: Arc<Inner>, mut reader: R, mut closed: watch::Receiver<bool>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            result = read_frame(&mut reader, inner.config.max_message_size) => match result {
                Ok((header, body)) => match Reply::decode_body(&header, &body) {
                    Ok(reply) => inner.complete(header.response_to, reply),
                    Err(error) => {
                        inner.close_framing(error);
                        break;
                    }
                },
                Err(Error::Io(error)) => {
                    inner.close_io(error);
                    break;
                }
                Err(error) => {
                    inner.close_framing(error);
                    break;
                }
            }
        }
    }
}

async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<(MessageHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = MessageHeader::parse(&header_buf)
        .ok_or_else(|| Error::Framing("short message header".into()))?;
    let body_len = header.validate(max_size)?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Fails pending entries whose deadline has passed.
async fn run_sweeper(inner: Arc<Inner>, mut closed: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let expired: Vec<i32> = inner
                    .pending
                    .iter()
                    .filter(|entry| entry.value().deadline.is_some_and(|d| d <= now))
                    .map(|entry| *entry.key())
                    .collect();
                for id in expired {
                    if let Some((_, entry)) = inner.pending.remove(&id) {
                        tracing::debug!(server = %inner.server, request_id = id, "request timed out");
                        entry.sink.fail(Error::OperationTimedOut);
                    }
                }
            }
        }
    }
}
