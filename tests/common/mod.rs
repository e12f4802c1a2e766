//! In-process mock server speaking OP_QUERY/OP_REPLY for e2e tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use monoxide::protocol::{HEADER_LEN, Message, MessageHeader, Reply, next_request_id};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What the handler wants done with one incoming message.
pub enum Action {
    Reply(Reply),
    ReplyAfter(Reply, Duration),
    Ignore,
}

impl Action {
    pub fn reply(cursor_id: i64, documents: Vec<monoxide::bson::Document>) -> Action {
        Action::Reply(Reply::with_documents(0, cursor_id, documents))
    }
}

type Handler = dyn Fn(&Message) -> Action + Send + Sync;

pub struct MockServer {
    local: SocketAddr,
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
    connections: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    /// Bind to an ephemeral port; the address is known before the handler
    /// is installed, so handlers can name each other's addresses.
    pub async fn bind() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        MockServer {
            local,
            listener: Some(listener),
            accept_task: None,
            connections: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.local.port())
    }

    /// Start serving with `handler` deciding each message's fate.
    pub fn serve<F>(&mut self, handler: F)
    where
        F: Fn(&Message) -> Action + Send + Sync + 'static,
    {
        let listener = self.listener.take().expect("serve called twice");
        let handler: Arc<Handler> = Arc::new(handler);
        let connections = self.connections.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let task = tokio::spawn(serve_connection(stream, handler));
                connections.lock().unwrap().push(task);
            }
        }));
    }

    /// Sever every open connection without stopping the listener.
    pub fn close_connections(&self) {
        for task in self.connections.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Stop accepting and sever everything.
    pub fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.listener = None;
        self.close_connections();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<Handler>) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    loop {
        let (header, body) = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let message = match Message::decode_body(&header, &body) {
            Ok(message) => message,
            Err(_) => break,
        };
        match handler(&message) {
            Action::Reply(mut reply) => {
                reply.response_to = header.request_id;
                let frame = reply.encode(next_request_id());
                if writer.lock().await.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Action::ReplyAfter(mut reply, delay) => {
                reply.response_to = header.request_id;
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let frame = reply.encode(next_request_id());
                    let _ = writer.lock().await.write_all(&frame).await;
                });
            }
            Action::Ignore => {}
        }
    }
    let _ = writer.lock().await.shutdown().await;
    drop(reader);
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<(MessageHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = MessageHeader::parse(&header_buf).unwrap();
    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Install the test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .compact()
            .try_init();
    });
}

/// Whether a decoded message is an `isMaster` handshake.
pub fn is_handshake(message: &Message) -> bool {
    match message {
        Message::Query(query) => {
            query.namespace.is_command()
                && (query.query.contains_key("ismaster") || query.query.contains_key("isMaster"))
        }
        _ => false,
    }
}
