//! RPC scenarios over real loopback connections.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::*;
use heron_rpc::error::{RpcError, WireFault};
use heron_rpc::message::Message;
use rstest::*;

#[fixture]
fn log_env() {
    init_log();
}

type CallResult = Result<TestResponse, RpcError>;

/// Issue one call and wait for its `done`.
fn call_wait(
    client: &TestClient, service: &str, method: &str, request: &dyn Message,
) -> CallResult {
    let (tx, rx) = mpsc::channel::<CallResult>();
    client.client.call(
        service,
        method,
        request,
        Box::new(TestResponse::default()),
        Box::new(move |r| {
            let r = r.map(|slot| {
                slot.as_any().downcast_ref::<TestResponse>().expect("response type").clone()
            });
            let _ = tx.send(r);
        }),
    );
    rx.recv_timeout(Duration::from_secs(5)).expect("done never ran")
}

#[rstest]
fn test_echo_call(#[from(log_env)] _env: ()) {
    let server = TestServer::start(1);
    let client = TestClient::connect(server.addr);

    let req = TestRequest { name: "cpu0".to_string(), count: 7 };
    let resp = call_wait(&client, "Echo", "say", &req).expect("echo response");
    assert!(resp.status);
    assert_eq!(resp.cpu_info, " hight_ 7");
}

#[rstest]
fn test_unknown_service(#[from(log_env)] _env: ()) {
    let server = TestServer::start(0);
    let client = TestClient::connect(server.addr);

    let req = TestRequest { name: "x".to_string(), count: 1 };
    let err = call_wait(&client, "missing.svc", "foo", &req).unwrap_err();
    assert_eq!(err, RpcError::Fault(WireFault::NoService));
}

#[rstest]
fn test_unknown_method(#[from(log_env)] _env: ()) {
    let server = TestServer::start(0);
    let client = TestClient::connect(server.addr);

    let req = TestRequest { name: "x".to_string(), count: 1 };
    let err = call_wait(&client, "Echo", "shout", &req).unwrap_err();
    assert_eq!(err, RpcError::Fault(WireFault::NoMethod));
}

#[rstest]
fn test_invalid_request_bytes(#[from(log_env)] _env: ()) {
    let server = TestServer::start(0);
    let client = TestClient::connect(server.addr);

    let err = call_wait(&client, "Echo", "say", &GarbageRequest).unwrap_err();
    assert_eq!(err, RpcError::Fault(WireFault::InvalidRequest));
}

#[rstest]
fn test_concurrent_calls(#[from(log_env)] _env: ()) {
    let server = TestServer::start(2);
    let client = TestClient::connect(server.addr);

    let (tx, rx) = mpsc::channel::<(i32, CallResult)>();
    thread::scope(|scope| {
        for t in 0..10 {
            let tx = tx.clone();
            let channel = client.client.channel().clone();
            scope.spawn(move || {
                for i in 0..100 {
                    let count = t * 100 + i;
                    let req = TestRequest { name: "cpu0".to_string(), count };
                    let tx = tx.clone();
                    channel.call(
                        "Echo",
                        "say",
                        &req,
                        Box::new(TestResponse::default()),
                        Box::new(move |r| {
                            let r = r.map(|slot| {
                                slot.as_any()
                                    .downcast_ref::<TestResponse>()
                                    .expect("response type")
                                    .clone()
                            });
                            let _ = tx.send((count, r));
                        }),
                    );
                }
            });
        }
    });
    drop(tx);

    // every call's done fires once, with the response matching its request
    let mut seen = vec![false; 1000];
    for _ in 0..1000 {
        let (count, result) = rx.recv_timeout(Duration::from_secs(30)).expect("done");
        let resp = result.expect("response");
        assert_eq!(resp.cpu_info, format!(" hight_ {}", count));
        assert!(!seen[count as usize], "done fired twice for {}", count);
        seen[count as usize] = true;
    }
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[rstest]
fn test_teardown_cancels_outstanding(#[from(log_env)] _env: ()) {
    let server = TestServer::start(0);
    let client = TestClient::connect(server.addr);

    // the sink never answers; the forced close must cancel the call
    let (tx, rx) = mpsc::channel::<CallResult>();
    let req = TestRequest { name: "x".to_string(), count: 1 };
    client.client.call(
        "Sink",
        "swallow",
        &req,
        Box::new(TestResponse::default()),
        Box::new(move |r| {
            let _ = tx.send(r.map(|_| TestResponse::default()));
        }),
    );
    thread::sleep(Duration::from_millis(100));

    let conn = client.client.connection().expect("connection");
    conn.force_close();

    let err = rx.recv_timeout(Duration::from_secs(5)).expect("done").unwrap_err();
    assert_eq!(err, RpcError::Canceled);
    // the continuation ran exactly once
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // calls on the dead channel fail fast
    for _ in 0..100 {
        if !client.client.connected() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let err = call_wait(&client, "Echo", "say", &req).unwrap_err();
    assert_eq!(err, RpcError::Disconnected);
}

#[rstest]
fn test_reconnect_after_server_side_close(#[from(log_env)] _env: ()) {
    let server = TestServer::start(0);
    let client = TestClient::connect(server.addr);
    client.client.set_reconnect(true);

    let conn = client.client.connection().expect("connection");
    conn.force_close();

    // the connector must bring a fresh connection up on its own
    let mut reconnected = false;
    for _ in 0..500 {
        if let Some(c) = client.client.connection() {
            if c.connected() && c.name() != conn.name() {
                reconnected = true;
                break;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(reconnected, "client did not reconnect");

    let req = TestRequest { name: "cpu0".to_string(), count: 3 };
    let resp = call_wait(&client, "Echo", "say", &req).expect("echo after reconnect");
    assert_eq!(resp.cpu_info, " hight_ 3");
}
