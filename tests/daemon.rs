//! End-to-end scenarios: daemons wired to one shared medium, with timers
//! compressed through the config so pollers and ack timeouts run in
//! milliseconds.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use machined::config::Config;
use machined::daemon::Daemon;
use machined::error::Error;
use machined::ipfs::{Ipfs, MemIpfs};
use machined::lang::{parse, Value};
use machined::machine::{MachineId, Role};
use machined::{poller, server};
use tower::ServiceExt;

struct Harness {
    dir: tempfile::TempDir,
    ipfs: Arc<MemIpfs>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            ipfs: Arc::new(MemIpfs::new()),
        }
    }

    fn config(&self, name: &str) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            file_prefix: format!("{}/{}.", self.dir.path().display(), name),
            ack_timeout_ms: 300,
            poll_interval_ms: 25,
            high_freq_window_secs: 0,
        })
    }

    /// A daemon named `name`, sharing the harness medium. Restoring an
    /// existing follow file is part of construction, as at boot.
    async fn daemon(&self, name: &str) -> Daemon {
        let daemon = Daemon::new(self.config(name), self.ipfs.clone());
        daemon.restore().await.unwrap();
        daemon
    }

    fn follow_file(&self, name: &str) -> serde_json::Value {
        let path = self.dir.path().join(format!("{}.follows.json", name));
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }
}

fn num(n: i64) -> Value {
    Value::Num(n)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(res: axum::response::Response) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn new_writer_http_roundtrip() {
    let h = Harness::new();
    let daemon = h.daemon("a").await;
    let app = server::app(daemon);

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v0/machines")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = read_json(res).await;
    let id = body["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(post_json(
            &format!("/v0/machines/{}/send", id),
            serde_json::json!({ "expressions": [1, 2, 3] }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        read_json(res).await,
        serde_json::json!({ "results": [1, 2, 3] })
    );

    let res = app
        .clone()
        .oneshot(post_json(
            &format!("/v0/machines/{}/query", id),
            serde_json::json!({ "expression": "(+ 1 2)" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        read_json(res).await,
        serde_json::json!({ "expression": 3 })
    );
}

#[tokio::test]
async fn http_maps_invalid_input_to_400() {
    let h = Harness::new();
    let daemon = h.daemon("a").await;
    let id = daemon.new_machine().await.unwrap();
    let app = server::app(daemon);

    let res = app
        .oneshot(post_json(
            &format!("/v0/machines/{}/query", id),
            serde_json::json!({ "expression": "(+ 1" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(read_json(res).await["error"].is_string());
}

#[tokio::test]
async fn reader_follows_writer() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let b = h.daemon("b").await;
    let id = a.new_machine().await.unwrap();
    a.send(&id, vec![num(10)]).await.unwrap();

    // B has never heard of the machine; the query adopts it as a reader
    // and folds the current log.
    assert_eq!(b.query(&id, &num(42)).await.unwrap(), num(42));
    let status = b.status(&id).await.unwrap();
    assert_eq!(status.role, Role::Reader);
    assert_eq!(status.history_len, 1);

    assert_eq!(h.follow_file("b")[id.as_str()], "Reader");
    assert_eq!(h.follow_file("a")[id.as_str()], "Writer");
}

#[tokio::test]
async fn reader_send_round_trips_through_writer() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let b = h.daemon("b").await;
    let id = a.new_machine().await.unwrap();

    let results = b.send(&id, vec![num(5), num(6)]).await.unwrap();
    assert_eq!(results, vec![num(5), num(6)]);

    // The append went through the writer into the log.
    assert_eq!(a.status(&id).await.unwrap().history_len, 2);
    let (_, log) = h.ipfs.read_log_from(&id, None).await.unwrap();
    assert_eq!(log, vec![num(5), num(6)]);
    assert_eq!(b.status(&id).await.unwrap().role, Role::Reader);
}

#[tokio::test]
async fn send_to_reader_times_out_without_writer() {
    let h = Harness::new();
    let id = MachineId::new("orphan");
    h.ipfs.write_log(&id, &[num(1)]).await.unwrap();
    let b = h.daemon("b").await;

    let err = b.send(&id, vec![num(9)]).await.unwrap_err();
    assert!(matches!(err, Error::AckTimeout));

    // Nothing reached storage.
    let (_, log) = h.ipfs.read_log_from(&id, None).await.unwrap();
    assert_eq!(log, vec![num(1)]);
}

#[tokio::test]
async fn poller_recovers_missed_notifications() {
    let h = Harness::new();
    let id = MachineId::new("m");
    h.ipfs.write_log(&id, &[num(1)]).await.unwrap();
    let b = h.daemon("b").await;
    b.query(&id, &num(0)).await.unwrap();
    assert_eq!(b.status(&id).await.unwrap().history_len, 1);

    // Appended behind B's back, as if the broadcast got dropped.
    h.ipfs.write_log(&id, &[num(2), num(3)]).await.unwrap();

    let poll = tokio::spawn(poller::run(b.clone()));
    let mut caught_up = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if b.status(&id).await.unwrap().history_len == 3 {
            caught_up = true;
            break;
        }
    }
    poll.abort();
    assert!(caught_up, "reader never caught up with the log");
}

#[tokio::test]
async fn restart_replays_the_follow_file() {
    let h = Harness::new();
    let id = {
        let a = h.daemon("a").await;
        let id = a.new_machine().await.unwrap();
        a.send(&id, vec![num(1), num(2), num(3)]).await.unwrap();
        a.drain().await;
        id
    };

    let a = h.daemon("a").await;
    assert_eq!(a.status(&id).await.unwrap().role, Role::Writer);
    assert_eq!(
        a.query(&id, &parse("(count history)").unwrap()).await.unwrap(),
        num(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_serialise_on_the_writer() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let id = a.new_machine().await.unwrap();

    let (r1, r2) = tokio::join!(a.send(&id, vec![num(1)]), a.send(&id, vec![num(2)]));
    // Each caller gets its own results back.
    assert_eq!(r1.unwrap(), vec![num(1)]);
    assert_eq!(r2.unwrap(), vec![num(2)]);

    assert_eq!(a.status(&id).await.unwrap().history_len, 2);
    let history = a.query(&id, &parse("history").unwrap()).await.unwrap();
    assert!(
        history == Value::List(vec![num(1), num(2)])
            || history == Value::List(vec![num(2), num(1)]),
        "unexpected history {}",
        history
    );
    // The log agrees with the cache about the order.
    let (_, log) = h.ipfs.read_log_from(&id, None).await.unwrap();
    assert_eq!(Value::List(log), history);
}

#[tokio::test]
async fn empty_send_changes_nothing() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let id = a.new_machine().await.unwrap();
    a.send(&id, vec![num(1)]).await.unwrap();

    let before = a.status(&id).await.unwrap();
    assert_eq!(a.send(&id, vec![]).await.unwrap(), vec![]);
    let after = a.status(&id).await.unwrap();
    assert_eq!(after.history_len, before.history_len);
    assert_eq!(after.last_index, before.last_index);
}

#[tokio::test]
async fn invalid_inputs_never_reach_the_log() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let id = a.new_machine().await.unwrap();

    let inputs = vec![num(1), parse("(boom)").unwrap()];
    let err = a.send(&id, inputs).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let status = a.status(&id).await.unwrap();
    assert_eq!(status.history_len, 0);
    assert_eq!(status.last_index, None);
    let (index, log) = h.ipfs.read_log_from(&id, None).await.unwrap();
    assert_eq!(index, None);
    assert!(log.is_empty());
}

#[tokio::test]
async fn queries_are_idempotent_and_uncommitted() {
    let h = Harness::new();
    let a = h.daemon("a").await;
    let id = a.new_machine().await.unwrap();
    a.send(&id, vec![parse("(def x 7)").unwrap()]).await.unwrap();

    let expr = parse("(+ x 1)").unwrap();
    assert_eq!(a.query(&id, &expr).await.unwrap(), num(8));
    assert_eq!(a.query(&id, &expr).await.unwrap(), num(8));

    // A definition made inside a query evaporates.
    assert_eq!(
        a.query(&id, &parse("(def y 1)").unwrap()).await.unwrap(),
        num(1)
    );
    let err = a.query(&id, &parse("y").unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}
