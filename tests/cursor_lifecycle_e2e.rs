mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{Action, MockServer, is_handshake};
use monoxide::config::{Address, ClientOptions};
use monoxide::doc;
use monoxide::namespace::Namespace;
use monoxide::protocol::{Query, Reply};
use monoxide::read_preference::ReadPreference;
use monoxide::{Client, Message};

fn options(seed: &str) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = vec![Address::parse(seed).unwrap()];
    options.connect_timeout = Duration::from_secs(2);
    options.server_selection_timeout = Duration::from_secs(5);
    options
}

/// Mock collection of 15 documents behind cursor id 42, served in a
/// first batch of 10 plus one GET_MORE batch. KILL_CURSORS ids are
/// recorded.
fn serve_collection(server: &mut MockServer, killed: Arc<Mutex<Vec<i64>>>) {
    server.serve(move |message| match message {
        message if is_handshake(message) => {
            Action::reply(0, vec![doc! {"ismaster": true, "ok": 1.0}])
        }
        Message::Query(query) => {
            assert_eq!(query.namespace.full_name(), "app.items");
            let docs: Vec<_> = (0..10).map(|i| doc! {"i": i}).collect();
            Action::Reply(Reply::with_documents(0, 42, docs))
        }
        Message::GetMore {
            cursor_id,
            number_to_return,
            ..
        } => {
            assert_eq!(*cursor_id, 42);
            assert_eq!(*number_to_return, 10);
            let docs: Vec<_> = (10..15).map(|i| doc! {"i": i}).collect();
            Action::Reply(Reply::with_documents(0, 0, docs))
        }
        Message::KillCursors { cursor_ids } => {
            killed.lock().unwrap().extend_from_slice(cursor_ids);
            Action::Ignore
        }
        _ => Action::Ignore,
    });
}

/// Drain through exhaustion: the iterator follows up with one GET_MORE
/// and never sends KILL_CURSORS.
#[tokio::test]
async fn e2e_cursor_drains_to_exhaustion() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    let killed = Arc::new(Mutex::new(Vec::new()));
    serve_collection(&mut server, killed.clone());

    let client = Client::with_options(options(&addr)).await.unwrap();
    let query = Query::new(Namespace::parse("app.items").unwrap(), doc! {}).limit(10);
    let mut cursor = client
        .query(query, &ReadPreference::primary())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(doc) = cursor.next().await {
        seen.push(doc.unwrap().get_i32("i").unwrap());
    }
    assert_eq!(seen, (0..15).collect::<Vec<_>>());
    assert!(cursor.is_exhausted());

    drop(cursor);
    client.close().await;
    assert!(killed.lock().unwrap().is_empty(), "exhausted cursor must not be killed");
}

/// Close after the first batch: exactly one KILL_CURSORS for id 42 goes
/// to the same server.
#[tokio::test]
async fn e2e_cursor_early_close_kills() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    let killed = Arc::new(Mutex::new(Vec::new()));
    serve_collection(&mut server, killed.clone());

    let client = Client::with_options(options(&addr)).await.unwrap();
    let query = Query::new(Namespace::parse("app.items").unwrap(), doc! {}).limit(10);
    let mut cursor = client
        .query(query, &ReadPreference::primary())
        .await
        .unwrap();
    assert_eq!(cursor.server_name(), addr);

    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_i32("i"), Some(0));
    cursor.close();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if killed.lock().unwrap().as_slice() == [42] {
            break;
        }
        assert!(Instant::now() < deadline, "kill_cursors never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.close().await;
}

/// Persisted cursor state resumes against the same server and continues
/// where it left off.
#[tokio::test]
async fn e2e_cursor_state_resume() {
    let mut server = MockServer::bind().await;
    let addr = server.address();
    let killed = Arc::new(Mutex::new(Vec::new()));
    serve_collection(&mut server, killed.clone());

    let client = Client::with_options(options(&addr)).await.unwrap();
    let query = Query::new(Namespace::parse("app.items").unwrap(), doc! {}).limit(10);
    let mut cursor = client
        .query(query, &ReadPreference::primary())
        .await
        .unwrap();

    // Drain the first batch without touching the server again.
    for _ in 0..10 {
        cursor.next().await.unwrap().unwrap();
    }
    let state = cursor.state();
    assert_eq!(state.get_i64("cursorId"), Some(42));
    assert_eq!(state.get_str("address"), Some(addr.as_str()));

    // Forget the iterator without killing the server-side cursor.
    std::mem::forget(cursor);

    let session = client
        .topology()
        .session_for(&addr)
        .expect("session still cached");
    let mut resumed = monoxide::Cursor::resume(&state, session).unwrap();
    let mut rest = Vec::new();
    while let Some(doc) = resumed.next().await {
        rest.push(doc.unwrap().get_i32("i").unwrap());
    }
    assert_eq!(rest, (10..15).collect::<Vec<_>>());

    client.close().await;
}
