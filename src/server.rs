//! Server orchestration: a TCP server whose connections each get a serving
//! RPC channel.

use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use log::*;

use heron_net::{Addr, Buffer, Conn, ConnEvents, Reactor, TcpServer};
use heron_rpc_core::message::Service;
use heron_rpc_core::{Codec, NetConfig};

use crate::channel::{RpcChannel, ServiceMap};

struct ServerEvents<C: Codec> {
    // empty until start() seals the registry; no connection exists before
    // the listener goes live
    services: OnceLock<Arc<ServiceMap>>,
    _phan: PhantomData<fn(&C)>,
}

impl<C: Codec> ConnEvents for ServerEvents<C> {
    fn on_state(&self, conn: &Conn) {
        if conn.connected() {
            info!("rpc {} -> {} is up", conn.peer_addr(), conn.local_addr());
            let channel = match self.services.get() {
                Some(map) => RpcChannel::<C>::serving(map.clone()),
                None => RpcChannel::<C>::new(),
            };
            channel.bind_connection(conn.clone());
            conn.set_context(Arc::new(channel));
        } else {
            info!("rpc {} -> {} is down", conn.peer_addr(), conn.local_addr());
            if let Some(channel) = conn.take_context::<RpcChannel<C>>() {
                channel.take_connection();
                channel.teardown();
            }
        }
    }

    fn on_message(&self, conn: &Conn, input: &mut Buffer) {
        match conn.context::<RpcChannel<C>>() {
            Some(channel) => channel.on_message(conn, input),
            None => {
                warn!("{}: bytes on a connection with no channel", conn.name());
                input.retrieve_all();
            }
        }
    }
}

/// Serves registered services to any number of clients.
///
/// Register services before [`start`](Self::start); the registry freezes at
/// startup and is read lock-free afterwards.
pub struct RpcServer<C: Codec> {
    tcp: TcpServer,
    events: Arc<ServerEvents<C>>,
    staging: ServiceMap,
    config: NetConfig,
}

impl<C: Codec> RpcServer<C> {
    /// Bind the listening socket on `reactor`'s thread.
    pub fn bind(reactor: &Reactor, addr: Addr, config: NetConfig) -> io::Result<RpcServer<C>> {
        let events =
            Arc::new(ServerEvents::<C> { services: OnceLock::new(), _phan: PhantomData });
        let tcp = TcpServer::bind(
            reactor,
            "rpc",
            addr,
            events.clone(),
            config.reuse_port,
            config.tcp_no_delay,
        )?;
        Ok(RpcServer { tcp, events, staging: ServiceMap::new(), config })
    }

    /// The bound address (with the kernel-chosen port when bound to 0).
    pub fn local_addr(&self) -> Addr {
        self.tcp.local_addr()
    }

    pub fn register_service(&mut self, service: Box<dyn Service>) {
        let name = service.descriptor().full_name().to_string();
        debug!("register service {}", name);
        self.staging.insert(name, service);
    }

    /// Freeze the registry, start the worker pool and begin listening.
    pub fn start(&mut self) -> io::Result<()> {
        let map = Arc::new(std::mem::take(&mut self.staging));
        let _ = self.events.services.set(map);
        self.tcp.start(self.config.workers)
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}
