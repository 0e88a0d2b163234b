//! Request/response correlation over one connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use heron_net::{Buffer, Conn};
use heron_rpc_core::error::{RpcError, WireFault};
use heron_rpc_core::message::{Message, ServeDone, Service};
use heron_rpc_core::Codec;

use crate::envelope::{Envelope, Kind};
use crate::frame::FrameCodec;

/// Continuation for a client call. Runs exactly once: with the parsed
/// response, a dispatch fault, or a teardown cancellation.
pub type CallDone = Box<dyn FnOnce(Result<Box<dyn Message>, RpcError>) + Send>;

/// Frozen name -> service map a serving channel dispatches into.
pub type ServiceMap = HashMap<String, Box<dyn Service>>;

struct OutstandingCall {
    response: Box<dyn Message>,
    done: CallDone,
}

struct ChannelInner<C: Codec> {
    framer: FrameCodec<C>,
    conn: Mutex<Option<Conn>>,
    services: Option<Arc<ServiceMap>>,
    next_id: AtomicI64,
    outstandings: Mutex<HashMap<i64, OutstandingCall>>,
}

/// The per-connection object correlating calls and responses.
///
/// Ids are allocated monotonically per channel; two concurrent calls may be
/// framed in either order, the id is the sole correlator.
pub struct RpcChannel<C: Codec> {
    inner: Arc<ChannelInner<C>>,
}

impl<C: Codec> Clone for RpcChannel<C> {
    fn clone(&self) -> Self {
        RpcChannel { inner: self.inner.clone() }
    }
}

impl<C: Codec> Default for RpcChannel<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> RpcChannel<C> {
    /// A calling-side channel with no service registry.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A serving-side channel dispatching into `services`.
    pub fn serving(services: Arc<ServiceMap>) -> Self {
        Self::build(Some(services))
    }

    fn build(services: Option<Arc<ServiceMap>>) -> Self {
        RpcChannel {
            inner: Arc::new(ChannelInner {
                framer: FrameCodec::new(),
                conn: Mutex::new(None),
                services,
                next_id: AtomicI64::new(0),
                outstandings: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bind_connection(&self, conn: Conn) {
        *self.inner.conn.lock().unwrap() = Some(conn);
    }

    pub fn take_connection(&self) -> Option<Conn> {
        self.inner.conn.lock().unwrap().take()
    }

    pub fn connection(&self) -> Option<Conn> {
        self.inner.conn.lock().unwrap().clone()
    }

    fn alloc_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Issue a call. Never blocks; `done` runs on whatever thread delivers
    /// the response (normally the connection's reactor).
    pub fn call(
        &self, service: &str, method: &str, request: &dyn Message, response: Box<dyn Message>,
        done: CallDone,
    ) {
        let id = self.alloc_id();
        let conn = self.inner.conn.lock().unwrap().clone();
        let Some(conn) = conn else {
            done(Err(RpcError::Disconnected));
            return;
        };
        let env = Envelope::request(id, service, method, request.to_bytes());
        {
            let mut table = self.inner.outstandings.lock().unwrap();
            table.insert(id, OutstandingCall { response, done });
        }
        trace!("call {}.{} id={}", service, method, id);
        self.inner.framer.send(&conn, &env);
    }

    /// Inbound byte stream entry point; installed as the connection's
    /// message callback.
    pub fn on_message(&self, conn: &Conn, input: &mut Buffer) {
        loop {
            match self.inner.framer.try_split(input) {
                Ok(Some(env)) => self.on_envelope(conn, env),
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: frame error {}, shutting down", conn.name(), e);
                    conn.shutdown();
                    break;
                }
            }
        }
    }

    fn on_envelope(&self, conn: &Conn, env: Envelope) {
        match env.kind {
            Kind::Request => self.handle_request(conn, env),
            Kind::Response | Kind::Error => self.handle_response(env),
        }
    }

    fn handle_response(&self, env: Envelope) {
        let out = {
            let mut table = self.inner.outstandings.lock().unwrap();
            table.remove(&env.id)
        };
        let Some(out) = out else {
            debug!("response for unknown id {} dropped", env.id);
            return;
        };
        if let Some(fault) = env.error {
            // non-success responses carry no usable bytes; fail the call
            // without parsing
            (out.done)(Err(RpcError::Fault(fault)));
            return;
        }
        let mut slot = out.response;
        if let Some(bytes) = &env.response {
            if !bytes.is_empty() && slot.merge_from(bytes).is_err() {
                warn!("response id={} failed to parse", env.id);
                (out.done)(Err(RpcError::Decode));
                return;
            }
        }
        (out.done)(Ok(slot));
    }

    fn handle_request(&self, conn: &Conn, env: Envelope) {
        let id = env.id;
        if let Err(fault) = self.dispatch_request(conn, env) {
            debug!("{}: request id={} failed: {}", conn.name(), id, fault);
            self.inner.framer.send(conn, &Envelope::fault(id, fault));
        }
    }

    fn dispatch_request(&self, conn: &Conn, env: Envelope) -> Result<(), WireFault> {
        let services = self.inner.services.as_ref().ok_or(WireFault::NoService)?;
        let service_name = env.service.as_deref().ok_or(WireFault::WrongProto)?;
        let service = services.get(service_name).ok_or(WireFault::NoService)?;
        let method_name = env.method.as_deref().ok_or(WireFault::WrongProto)?;
        let method =
            service.descriptor().find_method(method_name).ok_or(WireFault::NoMethod)?;

        let mut request = service.request_prototype(method);
        request
            .merge_from(env.request.as_deref().unwrap_or(&[]))
            .map_err(|_| WireFault::InvalidRequest)?;
        let response = service.response_prototype(method);

        let id = env.id;
        let ch = self.clone();
        let conn = conn.clone();
        let done: ServeDone = Box::new(move |resp| ch.done_callback(&conn, id, resp));
        service.call_method(method, request, response, done);
        Ok(())
    }

    // Runs on whatever thread the service invoked `done` from; the
    // connection serializes the actual bytes onto its reactor.
    fn done_callback(&self, conn: &Conn, id: i64, response: Box<dyn Message>) {
        let env = Envelope::response(id, response.to_bytes());
        self.inner.framer.send(conn, &env);
    }

    /// Finalize every surviving call with a cancellation so no `done`
    /// continuation is ever lost.
    pub fn teardown(&self) {
        let entries: Vec<OutstandingCall> = {
            let mut table = self.inner.outstandings.lock().unwrap();
            table.drain().map(|(_, v)| v).collect()
        };
        if !entries.is_empty() {
            debug!("channel teardown cancels {} outstanding calls", entries.len());
        }
        for out in entries {
            (out.done)(Err(RpcError::Canceled));
        }
    }
}

impl<C: Codec> Drop for ChannelInner<C> {
    fn drop(&mut self) {
        // surviving entries are finalized even when teardown was skipped
        let table = self.outstandings.get_mut().unwrap();
        for (_, out) in table.drain() {
            (out.done)(Err(RpcError::Canceled));
        }
    }
}
