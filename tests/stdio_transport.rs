#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;
use shutter_host_core::catalog::client::StdioCatalogClient;
use shutter_host_core::catalog::{CatalogError, CatalogGateway, ClientInfo};
use shutter_host_core::worker::transport::{RpcTransport, TransportError};
use shutter_host_core::worker::{TransportState, WorkerLaunch};

const STUB_WORKER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"echo"'*)
      params=$(printf '%s' "$line" | sed -n 's/.*"params":\(.*\)}$/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":%s}}\n' "$id" "$params"
      ;;
    *'"method":"whoami"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"id":%s}}\n' "$id" "$id"
      ;;
    *'"method":"slow"'*)
      echo "delayed response" >&2
      sleep 2
      printf '{"jsonrpc":"2.0","id":%s,"result":"late"}\n' "$id"
      ;;
    *'"method":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"no such method"}}\n' "$id"
      ;;
    *'"method":"garbage"'*)
      echo "this is not json"
      ;;
    *'"method":"crash"'*)
      echo "worker exploding" >&2
      exit 3
      ;;
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"stub"}}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"called"}]}}\n' "$id"
      ;;
  esac
done
"#;

fn stub_worker() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("shutter_stub_worker_{stamp}"));
    fs::create_dir_all(&dir).expect("stub dir should be created");
    let path = dir.join("worker.sh");
    fs::write(&path, STUB_WORKER).expect("stub worker should be written");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("stub worker should be executable");
    path
}

fn launch(script: &Path) -> WorkerLaunch {
    WorkerLaunch::plain(vec![String::from("sh"), script.display().to_string()])
}

fn started(timeout: Duration) -> RpcTransport {
    let mut transport =
        RpcTransport::new(launch(&stub_worker()), timeout).with_shutdown_grace(Duration::from_secs(1));
    transport.start().expect("stub worker should start");
    transport
}

#[test]
fn echo_round_trip_returns_result_unchanged() {
    let mut transport = started(Duration::from_secs(5));

    let result = transport
        .request("echo", json!({"foo": "bar"}))
        .expect("echo should succeed");

    assert_eq!(result, json!({"echo": {"foo": "bar"}}));
    transport.close();
}

#[test]
fn request_ids_increase_by_one_from_one() {
    let mut transport = started(Duration::from_secs(5));

    let ids: Vec<u64> = (0..4)
        .map(|_| {
            transport
                .request("whoami", json!({}))
                .expect("whoami should succeed")["id"]
                .as_u64()
                .expect("id should be a number")
        })
        .collect();

    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[test]
fn silent_worker_times_out_with_diagnostics() {
    let mut transport = started(Duration::from_millis(400));

    let started_at = Instant::now();
    let err = transport
        .request("slow", json!({}))
        .expect_err("slow call should time out");

    assert!(started_at.elapsed() < Duration::from_millis(1500));
    let TransportError::Timeout { diagnostics, .. } = &err else {
        panic!("expected timeout, got {err:?}");
    };
    assert!(diagnostics.contains("delayed response"));
    let message = err.to_string();
    assert!(message.contains("(timeout)"));
    assert!(message.contains("delayed response"));
    assert_eq!(transport.state(), TransportState::Running);
}

#[test]
fn late_reply_to_timed_out_request_is_discarded() {
    let mut transport = started(Duration::from_millis(1500));

    let err = transport
        .request("slow", json!({}))
        .expect_err("slow call should time out");
    assert!(matches!(err, TransportError::Timeout { .. }));

    let result = transport
        .request("echo", json!({"after": "timeout"}))
        .expect("next call should get its own reply");
    assert_eq!(result, json!({"echo": {"after": "timeout"}}));
}

#[test]
fn worker_exit_is_transport_closed() {
    let mut transport = started(Duration::from_secs(5));

    let err = transport
        .request("crash", json!({}))
        .expect_err("crash should close the transport");

    let TransportError::TransportClosed { diagnostics } = &err else {
        panic!("expected transport closed, got {err:?}");
    };
    assert!(diagnostics.contains("worker exploding"));
}

#[test]
fn error_replies_carry_the_payload() {
    let mut transport = started(Duration::from_secs(5));

    let err = transport
        .request("fail", json!({}))
        .expect_err("fail should return an rpc error");

    let TransportError::Rpc { payload } = err else {
        panic!("expected rpc error");
    };
    assert_eq!(payload["code"], json!(-32601));

    let still_works = transport
        .request("echo", json!(1))
        .expect("transport should keep working after an rpc error");
    assert_eq!(still_works, json!({"echo": 1}));
}

#[test]
fn malformed_line_is_reported_verbatim() {
    let mut transport = started(Duration::from_secs(5));

    let err = transport
        .request("garbage", json!({}))
        .expect_err("garbage should not parse");

    let TransportError::MalformedResponse { line, .. } = err else {
        panic!("expected malformed response");
    };
    assert_eq!(line, "this is not json");
}

#[test]
fn close_reaps_worker_and_is_idempotent() {
    let mut transport = started(Duration::from_secs(5));
    transport
        .request("echo", json!({}))
        .expect("echo should succeed");
    let pid = transport.worker_pid().expect("running worker should have a pid");

    transport.close();
    transport.close();

    assert_eq!(transport.state(), TransportState::Closed);
    assert!(transport.worker_pid().is_none());
    if Path::new("/proc/self").exists() {
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
    assert!(matches!(
        transport.request("echo", json!({})),
        Err(TransportError::NotRunning { state: "closed" })
    ));
    assert!(matches!(transport.start(), Err(TransportError::AlreadyClosed)));
}

#[test]
fn start_is_idempotent_while_running() {
    let mut transport = started(Duration::from_secs(5));
    let pid = transport.worker_pid();

    transport.start().expect("second start should be a no-op");

    assert_eq!(transport.worker_pid(), pid);
}

#[test]
fn catalog_client_speaks_through_the_transport() {
    let mut client = StdioCatalogClient::start(launch(&stub_worker()), Duration::from_secs(5))
        .expect("client should start");

    let server = client
        .initialize(
            "2024-11-05",
            json!({}),
            &ClientInfo {
                name: String::from("shutter-test"),
                version: String::from("0.0.0"),
            },
        )
        .expect("initialize should succeed");
    assert_eq!(server["serverInfo"]["name"], json!("stub"));

    let called = client
        .invoke_capability("list_collection", json!({"min_rating": 0}))
        .expect("tool call should succeed");
    assert_eq!(called["content"][0]["text"], json!("called"));

    client.close();
    assert!(matches!(
        client.invoke_capability("list_collection", json!({})),
        Err(CatalogError::Transport(TransportError::NotRunning { .. }))
    ));
}
