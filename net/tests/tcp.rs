//! End-to-end exercises of the reactor networking stack on loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use heron_net::{
    Addr, Buffer, Conn, ConnEvents, Reactor, ReactorHandle, RetryPolicy, TcpClient, TcpServer,
};
use rstest::*;

#[fixture]
fn log_env() {
    init_log();
}

fn init_log() {
    let _ = captains_log::recipe::raw_file_logger("/tmp/heron_net_test.log", log::Level::Trace)
        .test()
        .build();
}

struct EchoServer;

impl ConnEvents for EchoServer {
    fn on_state(&self, conn: &Conn) {
        log::info!("server side {} connected={}", conn.name(), conn.connected());
    }

    fn on_message(&self, conn: &Conn, input: &mut Buffer) {
        let data = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&data);
    }
}

struct Recorder {
    rx_bytes: Mutex<mpsc::Sender<Vec<u8>>>,
    disconnects: Arc<AtomicUsize>,
}

impl ConnEvents for Recorder {
    fn on_state(&self, conn: &Conn) {
        if conn.disconnected() {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_message(&self, _conn: &Conn, input: &mut Buffer) {
        let data = input.peek().to_vec();
        input.retrieve_all();
        let _ = self.rx_bytes.lock().unwrap().send(data);
    }
}

/// Server reactor on its own thread; reports (bound addr, reactor handle).
fn spawn_echo_server(workers: usize) -> (Addr, ReactorHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let th = thread::spawn(move || {
        let reactor = Reactor::new();
        let server = TcpServer::bind(
            &reactor,
            "echo",
            Addr::loopback(0),
            Arc::new(EchoServer),
            false,
            false,
        )
        .expect("bind");
        server.start(workers).expect("start");
        tx.send((server.local_addr(), reactor.handle())).unwrap();
        reactor.run();
        server.stop();
    });
    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, th)
}

fn spawn_client_reactor() -> (ReactorHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let th = thread::spawn(move || {
        let reactor = Reactor::new();
        tx.send(reactor.handle()).unwrap();
        reactor.run();
    });
    (rx.recv().unwrap(), th)
}

fn wait_connected(client: &TcpClient) -> Conn {
    for _ in 0..200 {
        if let Some(conn) = client.connection() {
            if conn.connected() {
                return conn;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("client did not connect");
}

#[rstest]
fn test_echo_roundtrip(#[from(log_env)] _env: ()) {
    let (addr, server_handle, server_th) = spawn_echo_server(1);
    let (client_handle, client_th) = spawn_client_reactor();

    let (tx, rx) = mpsc::channel();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(Recorder { rx_bytes: Mutex::new(tx), disconnects: disconnects.clone() });
    let client =
        TcpClient::new(client_handle.clone(), "echo-cli", addr, events, RetryPolicy::default());
    client.connect();
    let conn = wait_connected(&client);

    conn.send(b"hello reactor");
    let mut got = Vec::new();
    while got.len() < 13 {
        got.extend(rx.recv_timeout(Duration::from_secs(5)).expect("echo"));
    }
    assert_eq!(&got, b"hello reactor");

    // a large payload exercises the buffered-send path
    let big = vec![0x5au8; 4 * 1024 * 1024];
    conn.send(&big);
    let mut got = Vec::new();
    while got.len() < big.len() {
        got.extend(rx.recv_timeout(Duration::from_secs(10)).expect("big echo"));
    }
    assert_eq!(got.len(), big.len());
    assert!(got.iter().all(|&b| b == 0x5a));

    // close fires the state callback exactly once
    client.stop();
    conn.force_close();
    for _ in 0..200 {
        if disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // send after close is a no-op
    conn.send(b"into the void");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    client_handle.quit();
    client_th.join().unwrap();
    server_handle.quit();
    server_th.join().unwrap();
}

#[rstest]
fn test_connector_retries_until_listener_appears(#[from(log_env)] _env: ()) {
    let addr: Addr = "127.0.0.1:19377".parse().unwrap();
    let (client_handle, client_th) = spawn_client_reactor();

    let (tx, rx) = mpsc::channel();
    let events = Arc::new(Recorder {
        rx_bytes: Mutex::new(tx),
        disconnects: Arc::new(AtomicUsize::new(0)),
    });
    let retry =
        RetryPolicy { init_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1) };
    let client = TcpClient::new(client_handle.clone(), "late-cli", addr, events, retry);
    client.connect();

    // no listener yet; the connector must keep retrying on its own
    thread::sleep(Duration::from_millis(350));
    assert!(client.connection().is_none());

    let (srv_tx, srv_rx) = mpsc::channel();
    let server_th = thread::spawn(move || {
        let reactor = Reactor::new();
        let server =
            TcpServer::bind(&reactor, "late", addr, Arc::new(EchoServer), false, false)
                .expect("bind");
        server.start(0).expect("start");
        srv_tx.send(reactor.handle()).unwrap();
        reactor.run();
        server.stop();
    });
    let server_handle = srv_rx.recv().unwrap();

    let conn = wait_connected(&client);
    conn.send(b"ping");
    let _ = rx.recv_timeout(Duration::from_secs(5)).expect("echo after retry");

    client.stop();
    conn.force_close();
    client_handle.quit();
    client_th.join().unwrap();
    server_handle.quit();
    server_th.join().unwrap();
}

#[rstest]
fn test_shutdown_drains_output(#[from(log_env)] _env: ()) {
    let (addr, server_handle, server_th) = spawn_echo_server(0);
    let (client_handle, client_th) = spawn_client_reactor();

    let (tx, rx) = mpsc::channel();
    let events = Arc::new(Recorder {
        rx_bytes: Mutex::new(tx),
        disconnects: Arc::new(AtomicUsize::new(0)),
    });
    let client =
        TcpClient::new(client_handle.clone(), "half", addr, events, RetryPolicy::default());
    client.connect();
    let conn = wait_connected(&client);

    // queue a payload and immediately half-close: the write side must only
    // close after the payload drains, so the echo still comes back
    let payload = vec![7u8; 512 * 1024];
    conn.send(&payload);
    conn.shutdown();

    let mut got = Vec::new();
    while got.len() < payload.len() {
        got.extend(rx.recv_timeout(Duration::from_secs(10)).expect("echo after shutdown"));
    }
    assert_eq!(got.len(), payload.len());

    client_handle.quit();
    client_th.join().unwrap();
    server_handle.quit();
    server_th.join().unwrap();
}
