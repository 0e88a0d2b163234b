//! Shared fixtures: logging, test payloads, the echo service, and
//! server/client harnesses.

use std::any::Any;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use heron_net::{Addr, Reactor, ReactorHandle, RetryPolicy};
use heron_rpc::message::{Message, MethodDescriptor, ServeDone, Service, ServiceDescriptor};
use heron_rpc::{NetConfig, RpcClient, RpcServer};
use heron_rpc_codec::MsgpCodec;
use heron_rpc_core::Codec;

pub fn init_log() {
    let _ = captains_log::recipe::raw_file_logger("/tmp/heron_rpc_test.log", log::Level::Trace)
        .test()
        .build();
}

/// Implement [`Message`] for a serde type through the MessagePack codec.
macro_rules! impl_msg {
    ($t:ty) => {
        impl Message for $t {
            fn merge_from(&mut self, buf: &[u8]) -> Result<(), ()> {
                *self = MsgpCodec::default().decode(buf)?;
                Ok(())
            }
            fn to_bytes(&self) -> Vec<u8> {
                MsgpCodec::default().encode(self).unwrap_or_default()
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
    };
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct TestRequest {
    pub name: String,
    pub count: i32,
}
impl_msg!(TestRequest);

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct TestResponse {
    pub status: bool,
    pub cpu_info: String,
}
impl_msg!(TestResponse);

/// A payload whose bytes are never valid MessagePack.
#[derive(Default)]
pub struct GarbageRequest;

impl Message for GarbageRequest {
    fn merge_from(&mut self, _buf: &[u8]) -> Result<(), ()> {
        Err(())
    }
    fn to_bytes(&self) -> Vec<u8> {
        // 0xc1 is the one byte MessagePack never produces
        vec![0xc1, 0xc1, 0xc1]
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `Echo.say(TestRequest) -> TestResponse`
pub struct EchoService {
    desc: ServiceDescriptor,
}

impl EchoService {
    pub fn new() -> Self {
        Self { desc: ServiceDescriptor::new("Echo", &["say"]) }
    }
}

impl Service for EchoService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.desc
    }

    fn request_prototype(&self, _method: &MethodDescriptor) -> Box<dyn Message> {
        Box::new(TestRequest::default())
    }

    fn response_prototype(&self, _method: &MethodDescriptor) -> Box<dyn Message> {
        Box::new(TestResponse::default())
    }

    fn call_method(
        &self, _method: &MethodDescriptor, request: Box<dyn Message>,
        mut response: Box<dyn Message>, done: ServeDone,
    ) {
        let req = request.as_any().downcast_ref::<TestRequest>().expect("request type");
        let resp = response.as_any_mut().downcast_mut::<TestResponse>().expect("response type");
        resp.status = true;
        resp.cpu_info = format!(" hight_ {}", req.count);
        done(response);
    }
}

/// `Sink.swallow(...)`: accepts the request and never answers.
pub struct SinkService {
    desc: ServiceDescriptor,
}

impl SinkService {
    pub fn new() -> Self {
        Self { desc: ServiceDescriptor::new("Sink", &["swallow"]) }
    }
}

impl Service for SinkService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.desc
    }

    fn request_prototype(&self, _method: &MethodDescriptor) -> Box<dyn Message> {
        Box::new(TestRequest::default())
    }

    fn response_prototype(&self, _method: &MethodDescriptor) -> Box<dyn Message> {
        Box::new(TestResponse::default())
    }

    fn call_method(
        &self, _method: &MethodDescriptor, _request: Box<dyn Message>,
        _response: Box<dyn Message>, done: ServeDone,
    ) {
        // the response is owed forever
        drop(done);
    }
}

pub struct TestServer {
    pub addr: Addr,
    pub reactor: ReactorHandle,
    th: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Echo + Sink services on a kernel-chosen loopback port.
    pub fn start(workers: usize) -> TestServer {
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let reactor = Reactor::new();
            let config = NetConfig { workers, ..Default::default() };
            let mut server = RpcServer::<MsgpCodec>::bind(&reactor, Addr::loopback(0), config)
                .expect("bind");
            server.register_service(Box::new(EchoService::new()));
            server.register_service(Box::new(SinkService::new()));
            server.start().expect("start");
            tx.send((server.local_addr(), reactor.handle())).unwrap();
            reactor.run();
            server.stop();
        });
        let (addr, reactor) = rx.recv().unwrap();
        TestServer { addr, reactor, th: Some(th) }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.reactor.quit();
        if let Some(th) = self.th.take() {
            let _ = th.join();
        }
    }
}

pub struct TestClient {
    pub client: RpcClient<MsgpCodec>,
    pub reactor: ReactorHandle,
    th: Option<thread::JoinHandle<()>>,
}

impl TestClient {
    pub fn connect(addr: Addr) -> TestClient {
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let reactor = Reactor::new();
            tx.send(reactor.handle()).unwrap();
            reactor.run();
        });
        let reactor: ReactorHandle = rx.recv().unwrap();
        let client = RpcClient::<MsgpCodec>::new(reactor.clone(), addr, RetryPolicy::default());
        client.connect();
        for _ in 0..500 {
            if client.connected() {
                return TestClient { client, reactor, th: Some(th) };
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("client did not connect to {}", addr);
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.stop();
        self.reactor.quit();
        if let Some(th) = self.th.take() {
            let _ = th.join();
        }
    }
}
