//! Black-box RPC tests against a real broker instance: a `UnixListener`
//! bound by `broker::rpc::serve`, driven over an actual `UnixStream`, with
//! no shortcuts through the library's internal types.

use std::io::Write;
use std::time::Duration;

use broker::{rpc, Broker};
use cb_protocol::{Action, Request, Response, SubscriptionFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

struct TestBroker {
    broker: Broker,
    socket_path: std::path::PathBuf,
    db_path: std::path::PathBuf,
    config_path: std::path::PathBuf,
    _tmp: tempfile::TempDir,
    _serve: tokio::task::JoinHandle<()>,
}

async fn start_broker(extra_config: &str) -> TestBroker {
    let tmp = tempfile::tempdir().unwrap();
    let socket_path = tmp.path().join("broker.sock");
    let db_path = tmp.path().join("broker.db");
    let config_path = tmp.path().join("config.yaml");

    let contents = format!(
        "server:\n  socket_path: {}\n  db_path: {}\n{}\n",
        socket_path.display(),
        db_path.display(),
        extra_config,
    );
    let mut f = std::fs::File::create(&config_path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();

    let broker = Broker::bootstrap(config_path.clone()).await.expect("bootstrap failed");
    let shutdown = broker.root_cancel();
    let serve_broker = broker.clone();
    let serve = tokio::spawn(async move {
        let _ = rpc::serve(serve_broker, shutdown).await;
    });

    // give the listener a moment to bind before the first connection attempt
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    TestBroker { broker, socket_path, db_path, config_path, _tmp: tmp, _serve: serve }
}

async fn roundtrip(socket_path: &std::path::Path, request: &Request) -> Response {
    let mut stream = UnixStream::connect(socket_path).await.expect("connect failed");
    let mut body = serde_json::to_vec(request).unwrap();
    body.push(b'\n');
    stream.write_all(&body).await.unwrap();

    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

fn bare(action: Action) -> Request {
    Request { action, ..Request::ping() }
}

#[tokio::test]
async fn ping_returns_pong_ack() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;
    let resp = roundtrip(&tb.socket_path, &Request::ping()).await;
    assert!(resp.ok);
    assert_eq!(resp.ack.as_deref(), Some("pong"));
}

#[tokio::test]
async fn bots_lists_configured_bot() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;
    let resp = roundtrip(&tb.socket_path, &bare(Action::Bots)).await;
    assert!(resp.ok);
    let bots = resp.bots.expect("bots field present");
    assert_eq!(bots.len(), 1);
    assert_eq!(bots[0].name, "ops-bot");
    assert_eq!(bots[0].service, "mock");
}

#[tokio::test]
async fn send_then_history_round_trips_the_event() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;

    let send_req = Request {
        bot: Some("ops-bot".to_string()),
        channel: Some("C1".to_string()),
        text: Some("deploy finished".to_string()),
        ..bare(Action::Send)
    };
    let send_resp = roundtrip(&tb.socket_path, &send_req).await;
    assert!(send_resp.ok, "{:?}", send_resp.error);
    let sent = send_resp.event.expect("send echoes the event");
    assert_eq!(sent.direction, "out");
    assert!(sent.id > 0);

    let history_req = Request { bot: Some("ops-bot".to_string()), limit: Some(10), ..bare(Action::History) };
    let history_resp = roundtrip(&tb.socket_path, &history_req).await;
    assert!(history_resp.ok);
    let events = history_resp.events.expect("events field present");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].text, "deploy finished");
}

#[tokio::test]
async fn clear_history_without_filter_or_all_is_refused() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;
    let send_req = Request {
        bot: Some("ops-bot".to_string()),
        channel: Some("C1".to_string()),
        text: Some("hello".to_string()),
        ..bare(Action::Send)
    };
    roundtrip(&tb.socket_path, &send_req).await;

    let clear_resp = roundtrip(&tb.socket_path, &bare(Action::ClearHistory)).await;
    assert!(!clear_resp.ok);
    assert!(clear_resp.error.unwrap().contains("refusing broad"));
}

#[tokio::test]
async fn subscribe_sends_ack_before_any_event() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;

    let mut stream = UnixStream::connect(&tb.socket_path).await.unwrap();
    let sub_req = Request { bot: Some("ops-bot".to_string()), ..bare(Action::Subscribe) };
    let mut body = serde_json::to_vec(&sub_req).unwrap();
    body.push(b'\n');
    stream.write_all(&body).await.unwrap();

    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let frame: SubscriptionFrame = serde_json::from_str(line.trim()).unwrap();
    assert!(frame.ok);
    assert_eq!(frame.ack.as_deref(), Some("subscribed"));
    assert!(frame.event.is_none());
}

#[tokio::test]
async fn subscribe_on_unknown_bot_errors_before_ack() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;
    let sub_req = Request { bot: Some("does-not-exist".to_string()), ..bare(Action::Subscribe) };
    let resp = roundtrip(&tb.socket_path, &sub_req).await;
    assert!(!resp.ok);
}

#[tokio::test]
async fn reload_rejects_socket_or_db_path_changes() {
    let tb = start_broker("bots:\n  - name: ops-bot\n    type: mock\n").await;

    let new_socket_path = tb.socket_path.with_file_name("moved.sock");
    let contents = format!(
        "server:\n  socket_path: {}\n  db_path: {}\nbots:\n  - name: ops-bot\n    type: mock\n",
        new_socket_path.display(),
        tb.db_path.display(),
    );
    std::fs::write(&tb.config_path, contents).unwrap();

    let resp = roundtrip(&tb.socket_path, &bare(Action::Reload)).await;
    assert!(!resp.ok);
    let err = resp.error.expect("reload rejection carries a message");
    assert!(err.contains(&tb.socket_path.display().to_string()), "{err}");
    assert!(err.contains(&new_socket_path.display().to_string()), "{err}");
}
