//! Client orchestration: one TCP client feeding one calling channel.

use std::sync::Arc;

use log::*;

use heron_net::{Addr, Buffer, Conn, ConnEvents, ReactorHandle, RetryPolicy, TcpClient};
use heron_rpc_core::message::Message;
use heron_rpc_core::Codec;

use crate::channel::{CallDone, RpcChannel};

struct ClientEvents<C: Codec> {
    channel: RpcChannel<C>,
}

impl<C: Codec> ConnEvents for ClientEvents<C> {
    fn on_state(&self, conn: &Conn) {
        if conn.connected() {
            info!("rpc {} -> {} is up", conn.local_addr(), conn.peer_addr());
            self.channel.bind_connection(conn.clone());
        } else {
            info!("rpc {} -> {} is down", conn.local_addr(), conn.peer_addr());
            self.channel.take_connection();
            // a broken transport fails the in-flight calls instead of
            // retrying them
            self.channel.teardown();
        }
    }

    fn on_message(&self, conn: &Conn, input: &mut Buffer) {
        self.channel.on_message(conn, input);
    }
}

/// Initiates calls and awaits replies over one connection.
pub struct RpcClient<C: Codec> {
    tcp: TcpClient,
    channel: RpcChannel<C>,
}

impl<C: Codec> RpcClient<C> {
    pub fn new(reactor: ReactorHandle, server_addr: Addr, retry: RetryPolicy) -> RpcClient<C> {
        let channel = RpcChannel::<C>::new();
        let events = Arc::new(ClientEvents { channel: channel.clone() });
        let tcp = TcpClient::new(reactor, "rpc-client", server_addr, events, retry);
        RpcClient { tcp, channel }
    }

    pub fn connect(&self) {
        self.tcp.connect();
    }

    /// Reconnect automatically when the connection drops. Outstanding calls
    /// of the broken connection still fail.
    pub fn set_reconnect(&self, on: bool) {
        self.tcp.set_retry(on);
    }

    pub fn disconnect(&self) {
        self.tcp.disconnect();
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }

    pub fn connected(&self) -> bool {
        self.tcp.connection().map(|c| c.connected()).unwrap_or(false)
    }

    pub fn connection(&self) -> Option<Conn> {
        self.tcp.connection()
    }

    #[inline]
    pub fn channel(&self) -> &RpcChannel<C> {
        &self.channel
    }

    /// Issue `service.method(request)`; `done` observes the filled response
    /// slot or the failure.
    pub fn call(
        &self, service: &str, method: &str, request: &dyn Message,
        response: Box<dyn Message>, done: CallDone,
    ) {
        self.channel.call(service, method, request, response, done);
    }
}
