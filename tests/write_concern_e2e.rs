mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{Action, MockServer, is_handshake};
use monoxide::callback::{ValidatingSink, reply_future};
use monoxide::config::{Address, ClientOptions};
use monoxide::doc;
use monoxide::namespace::Namespace;
use monoxide::protocol::InsertFlags;
use monoxide::write_concern::{Durability, WriteConcern};
use monoxide::{Client, Error, Message};

fn options(seed: &str) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = vec![Address::parse(seed).unwrap()];
    options.connect_timeout = Duration::from_secs(2);
    options.server_selection_timeout = Duration::from_secs(5);
    options
}

fn insert() -> Message {
    Message::Insert {
        namespace: Namespace::parse("app.users").unwrap(),
        flags: InsertFlags::empty(),
        documents: vec![doc! {"_id": 1, "name": "ada"}],
    }
}

fn serve_write_target(server: &mut MockServer, fail_duplicate: Arc<AtomicBool>) {
    server.serve(move |message| match message {
        message if is_handshake(message) => {
            Action::reply(0, vec![doc! {"ismaster": true, "ok": 1.0}])
        }
        Message::Query(query) => {
            assert!(query.query.contains_key("getlasterror"));
            if fail_duplicate.load(Ordering::Acquire) {
                Action::reply(
                    0,
                    vec![doc! {
                        "ok": 1.0,
                        "err": "E11000 duplicate key error index: app.users.$_id_",
                        "code": 11000,
                        "n": 0,
                    }],
                )
            } else {
                Action::reply(0, vec![doc! {"ok": 1.0, "err": null, "n": 1}])
            }
        }
        // OP_INSERT itself has no reply.
        _ => Action::Ignore,
    });
}

/// An acknowledged write pairs the INSERT with a getLastError probe on
/// one sender critical section; the probe's reply lands on the sink.
#[tokio::test]
async fn e2e_acknowledged_write_round_trip() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    serve_write_target(&mut server, Arc::new(AtomicBool::new(false)));

    let client = Client::with_options(options(&addr)).await.unwrap();
    let (sink, future) = reply_future();
    let routed = client
        .send_write(&insert(), &WriteConcern::new(Durability::Ack), sink)
        .await
        .unwrap();
    assert_eq!(routed, addr);

    let reply = future.recv().await.unwrap();
    let doc = reply.first_document().unwrap();
    assert!(doc.is_ok());
    assert_eq!(doc.get_i32("n"), Some(1));

    client.close().await;
}

/// A duplicate unique-index key reported by getLastError surfaces as a
/// typed error through the validating sink.
#[tokio::test]
async fn e2e_duplicate_key_is_typed() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    serve_write_target(&mut server, Arc::new(AtomicBool::new(true)));

    let client = Client::with_options(options(&addr)).await.unwrap();
    let (sink, future) = reply_future();
    client
        .send_write(
            &insert(),
            &WriteConcern::new(Durability::Majority),
            ValidatingSink::new(sink),
        )
        .await
        .unwrap();

    match future.recv().await {
        Err(Error::DuplicateKey { code, .. }) => assert_eq!(code, 11000),
        other => panic!("expected DuplicateKey, got {other:?}"),
    }

    client.close().await;
}

/// An unacknowledged write completes as soon as the frame is queued.
#[tokio::test]
async fn e2e_unacknowledged_write_completes_immediately() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    serve_write_target(&mut server, Arc::new(AtomicBool::new(false)));

    let client = Client::with_options(options(&addr)).await.unwrap();
    let (sink, future) = reply_future();
    client
        .send_write(&insert(), &WriteConcern::new(Durability::None), sink)
        .await
        .unwrap();
    let reply = future.recv().await.unwrap();
    assert_eq!(reply.number_returned, 0);

    client.close().await;
}
