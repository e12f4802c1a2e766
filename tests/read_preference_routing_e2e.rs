mod common;

use std::time::Duration;

use common::{Action, MockServer, is_handshake};
use monoxide::callback::reply_future;
use monoxide::config::{Address, ClientOptions};
use monoxide::doc;
use monoxide::namespace::Namespace;
use monoxide::protocol::{Query, Reply};
use monoxide::read_preference::ReadPreference;
use monoxide::{Client, Message};

fn options(seeds: &[&str]) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = seeds.iter().map(|s| Address::parse(s).unwrap()).collect();
    options.connect_timeout = Duration::from_secs(2);
    options.server_selection_timeout = Duration::from_secs(5);
    options.read_preference = ReadPreference::secondary();
    options
}

fn user_query() -> Message {
    Query::new(Namespace::parse("app.users").unwrap(), doc! {})
        .slave_ok()
        .into_message()
}

/// A member that answers its handshake after `rtt` and tags its query
/// replies with `marker`.
fn serve_member(
    server: &mut MockServer,
    all: Vec<String>,
    me: String,
    primary: String,
    rtt: Duration,
    marker: &'static str,
) {
    server.serve(move |message| {
        if is_handshake(message) {
            let is_primary = me == primary;
            let reply = Reply::with_documents(
                0,
                0,
                vec![doc! {
                    "ismaster": is_primary,
                    "secondary": !is_primary,
                    "setName": "rs0",
                    "me": me.clone(),
                    "primary": primary.clone(),
                    "hosts": all.clone(),
                    "ok": 1.0,
                }],
            );
            Action::ReplyAfter(reply, rtt)
        } else {
            Action::reply(0, vec![doc! {"served_by": marker, "ok": 1.0}])
        }
    });
}

/// With `readPreference=secondary` and two secondaries at 5 ms and 80 ms,
/// queries route to the faster one; once it dies, they move to the other.
#[tokio::test]
async fn e2e_secondary_reads_follow_latency_then_fail_over() {
    let mut p = MockServer::bind().await;
    let mut s1 = MockServer::bind().await;
    let mut s2 = MockServer::bind().await;
    let p_addr = p.address();
    let s1_addr = s1.address();
    let s2_addr = s2.address();
    let all = vec![p_addr.clone(), s1_addr.clone(), s2_addr.clone()];

    serve_member(
        &mut p,
        all.clone(),
        p_addr.clone(),
        p_addr.clone(),
        Duration::from_millis(2),
        "p",
    );
    serve_member(
        &mut s1,
        all.clone(),
        s1_addr.clone(),
        p_addr.clone(),
        Duration::from_millis(5),
        "s1",
    );
    serve_member(
        &mut s2,
        all.clone(),
        s2_addr.clone(),
        p_addr.clone(),
        Duration::from_millis(80),
        "s2",
    );

    let client = Client::with_options(options(&[&p_addr, &s1_addr, &s2_addr]))
        .await
        .unwrap();
    let query = user_query();

    // The faster secondary wins.
    let (sink, future) = reply_future();
    let routed = client.send(&query, sink).await.unwrap();
    assert_eq!(routed, s1_addr);
    let reply = future.recv().await.unwrap();
    assert_eq!(reply.documents[0].get_str("served_by"), Some("s1"));

    // Kill the fast secondary; the next query must route to the slow one.
    s1.close_connections();
    s1.stop();

    // Wait until the dispatcher has noticed the dead session.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.topology().session_for(&s1_addr).is_some() {
        assert!(std::time::Instant::now() < deadline, "dead session never evicted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (sink, future) = reply_future();
    let routed = client.send(&query, sink).await.unwrap();
    assert_eq!(routed, s2_addr);
    let reply = future.recv().await.unwrap();
    assert_eq!(reply.documents[0].get_str("served_by"), Some("s2"));

    client.close().await;
}

/// Tag predicates narrow the candidate set regardless of latency.
#[tokio::test]
async fn e2e_tagged_secondary_reads() {
    let mut p = MockServer::bind().await;
    let mut s1 = MockServer::bind().await;
    let mut s2 = MockServer::bind().await;
    let p_addr = p.address();
    let s1_addr = s1.address();
    let s2_addr = s2.address();
    let all = vec![p_addr.clone(), s1_addr.clone(), s2_addr.clone()];

    serve_member(
        &mut p,
        all.clone(),
        p_addr.clone(),
        p_addr.clone(),
        Duration::from_millis(2),
        "p",
    );
    {
        let me = s1_addr.clone();
        let primary = p_addr.clone();
        let all = all.clone();
        s1.serve(move |message| {
            if is_handshake(message) {
                Action::reply(
                    0,
                    vec![doc! {
                        "ismaster": false,
                        "secondary": true,
                        "setName": "rs0",
                        "me": me.clone(),
                        "primary": primary.clone(),
                        "hosts": all.clone(),
                        "tags": {"dc": "east"},
                        "ok": 1.0,
                    }],
                )
            } else {
                Action::reply(0, vec![doc! {"served_by": "s1", "ok": 1.0}])
            }
        });
    }
    {
        let me = s2_addr.clone();
        let primary = p_addr.clone();
        let all = all.clone();
        s2.serve(move |message| {
            if is_handshake(message) {
                Action::reply(
                    0,
                    vec![doc! {
                        "ismaster": false,
                        "secondary": true,
                        "setName": "rs0",
                        "me": me.clone(),
                        "primary": primary.clone(),
                        "hosts": all.clone(),
                        "tags": {"dc": "west"},
                        "ok": 1.0,
                    }],
                )
            } else {
                Action::reply(0, vec![doc! {"served_by": "s2", "ok": 1.0}])
            }
        });
    }

    let client = Client::with_options(options(&[&p_addr, &s1_addr, &s2_addr]))
        .await
        .unwrap();

    let west_only = ReadPreference::secondary().with_tag_sets(vec![
        [("dc".to_string(), "west".to_string())].into_iter().collect(),
    ]);
    let (sink, future) = reply_future();
    let routed = client
        .send_with_preference(&user_query(), &west_only, sink)
        .await
        .unwrap();
    assert_eq!(routed, s2_addr);
    let reply = future.recv().await.unwrap();
    assert_eq!(reply.documents[0].get_str("served_by"), Some("s2"));

    client.close().await;
}
