mod common;

use std::time::Duration;

use common::{Action, MockServer, is_handshake};
use monoxide::config::{Address, ClientOptions};
use monoxide::callback::reply_future;
use monoxide::doc;
use monoxide::namespace::Namespace;
use monoxide::protocol::{Query, Reply};
use monoxide::{Client, Message};

fn options(seed: &str) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = vec![Address::parse(seed).unwrap()];
    options.connect_timeout = Duration::from_secs(2);
    options.server_selection_timeout = Duration::from_secs(5);
    options
}

/// Three queries on one session receive their replies in reverse order;
/// each sink must still get the document set matched by request id.
#[tokio::test]
async fn e2e_replies_correlate_out_of_submission_order() {
    let mut server = MockServer::bind().await;
    let addr = server.address();

    server.serve(move |message| {
        if is_handshake(message) {
            return Action::reply(0, vec![doc! {"ismaster": true, "ok": 1.0}]);
        }
        let Message::Query(query) = message else {
            return Action::Ignore;
        };
        let marker = query.query.get_i32("marker").unwrap();
        // Later submissions answer sooner.
        let delay = Duration::from_millis(60 * (3 - marker) as u64);
        let reply = Reply::with_documents(0, 0, vec![doc! {"marker": marker, "ok": 1.0}]);
        Action::ReplyAfter(reply, delay)
    });

    let client = Client::with_options(options(&addr)).await.unwrap();
    let namespace = Namespace::parse("app.users").unwrap();

    let mut futures = Vec::new();
    for marker in 0..3 {
        let message = Query::new(namespace.clone(), doc! {"marker": marker}).into_message();
        let (sink, future) = reply_future();
        client.send(&message, sink).await.unwrap();
        futures.push((marker, future));
    }

    for (marker, future) in futures {
        let reply = future.recv().await.unwrap();
        assert_eq!(reply.documents[0].get_i32("marker"), Some(marker));
    }

    client.close().await;
}
