//! Per-connection state machine: buffered send, half-close, force-close,
//! all serialized onto the owning reactor.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::*;
use nix::errno::Errno;

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::handle::Handle;
use crate::reactor::ReactorHandle;
use crate::sockets;
use crate::sockets::Socket;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Callbacks an embedder installs on every connection. `on_state` fires on
/// establish and again on disconnect; `on_message` whenever bytes landed in
/// the input buffer. All of them run on the connection's reactor thread.
pub trait ConnEvents: Send + Sync + 'static {
    fn on_state(&self, conn: &Conn);

    fn on_message(&self, conn: &Conn, input: &mut Buffer);

    fn on_write_complete(&self, _conn: &Conn) {}
}

/// Internal close hook; server/client use it to unregister the connection.
pub(crate) type CloseAction = Box<dyn Fn(&Conn) + Send + Sync>;

// Reactor-thread-only state. Input and output live in separate cells so the
// message callback can hold the input while it sends.
struct IoCtl {
    handle: Option<Handle>,
    fault: bool,
}

pub(crate) struct ConnInner {
    reactor: ReactorHandle,
    name: String,
    sock: Socket,
    local: Addr,
    peer: Addr,
    state: AtomicU8,
    events: Arc<dyn ConnEvents>,
    close_action: CloseAction,
    ctx: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    ctl: UnsafeCell<IoCtl>,
    input: UnsafeCell<Buffer>,
    output: UnsafeCell<Buffer>,
}

// The cells are only touched from the owning reactor thread; cross-thread
// entry points copy their payload and hop onto that thread first.
unsafe impl Send for ConnInner {}
unsafe impl Sync for ConnInner {}

/// Shared handle to one TCP connection.
pub struct Conn(Arc<ConnInner>);

impl Clone for Conn {
    fn clone(&self) -> Self {
        Conn(self.0.clone())
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn {} [{} -> {}]", self.0.name, self.0.local, self.0.peer)
    }
}

impl Conn {
    pub(crate) fn new(
        reactor: ReactorHandle, name: String, sock: Socket, local: Addr, peer: Addr,
        events: Arc<dyn ConnEvents>, close_action: CloseAction,
    ) -> Conn {
        sock.set_keep_alive(true);
        trace!("conn {} ctor fd={}", name, sock.fd());
        Conn(Arc::new(ConnInner {
            reactor,
            name,
            sock,
            local,
            peer,
            state: AtomicU8::new(ConnState::Connecting as u8),
            events,
            close_action,
            ctx: Mutex::new(None),
            ctl: UnsafeCell::new(IoCtl { handle: None, fault: false }),
            input: UnsafeCell::new(Buffer::new()),
            output: UnsafeCell::new(Buffer::new()),
        }))
    }

    fn from_weak(w: &Weak<ConnInner>) -> Option<Conn> {
        w.upgrade().map(Conn)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn local_addr(&self) -> Addr {
        self.0.local
    }

    #[inline]
    pub fn peer_addr(&self) -> Addr {
        self.0.peer
    }

    #[inline]
    pub fn reactor(&self) -> &ReactorHandle {
        &self.0.reactor
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_no_delay(&self, on: bool) {
        self.0.sock.set_no_delay(on);
    }

    /// Stash a protocol object on the connection.
    pub fn set_context(&self, v: Arc<dyn Any + Send + Sync>) {
        *self.0.ctx.lock().unwrap() = Some(v);
    }

    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let guard = self.0.ctx.lock().unwrap();
        guard.clone().and_then(|v| v.downcast::<T>().ok())
    }

    pub fn take_context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let v = self.0.ctx.lock().unwrap().take();
        v.and_then(|v| v.downcast::<T>().ok())
    }

    #[inline]
    fn ctl(&self) -> &mut IoCtl {
        debug_assert!(self.0.reactor.is_in_loop_thread());
        unsafe { &mut *self.0.ctl.get() }
    }

    /// Wire the poll handle up and flip to Connected. Runs on the owning
    /// reactor, dispatched there by server/client orchestration.
    pub(crate) fn established(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        assert_eq!(self.state(), ConnState::Connecting);
        self.0.state.store(ConnState::Connected as u8, Ordering::Release);

        let h = Handle::new(self.0.sock.fd());
        let w = Arc::downgrade(&self.0);
        h.set_read_callback(move || {
            if let Some(c) = Conn::from_weak(&w) {
                c.handle_read();
            }
        });
        let w = Arc::downgrade(&self.0);
        h.set_write_callback(move || {
            if let Some(c) = Conn::from_weak(&w) {
                c.handle_write();
            }
        });
        let w = Arc::downgrade(&self.0);
        h.set_close_callback(move || {
            if let Some(c) = Conn::from_weak(&w) {
                c.handle_close();
            }
        });
        let w = Arc::downgrade(&self.0);
        h.set_error_callback(move || {
            if let Some(c) = Conn::from_weak(&w) {
                c.handle_error();
            }
        });
        h.enable_reading();
        self.ctl().handle = Some(h);

        trace!("{} established", self);
        self.0.events.on_state(self);
    }

    /// Final teardown on the owning reactor: deregister the poll handle.
    /// When the connection never saw `handle_close` (server shutdown), the
    /// disconnect notification is delivered from here.
    pub(crate) fn destroy(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let prev = self.0.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_ok() {
            if let Some(h) = &self.ctl().handle {
                h.disable_all();
            }
            self.0.events.on_state(self);
        }
        if let Some(h) = self.ctl().handle.take() {
            h.remove();
        }
        trace!("{} destroyed", self);
    }

    /// Queue `data` for delivery. May be called from any thread; the bytes
    /// hit the wire in the order the owning reactor serializes them.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.0.reactor.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let c = self.clone();
            self.0.reactor.queue(move || c.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        assert!(self.0.reactor.is_in_loop_thread());
        if self.state() == ConnState::Disconnected {
            warn!("{} disconnected, give up writing", self);
            return;
        }
        let ctl = self.ctl();
        if ctl.fault {
            return;
        }
        let output = unsafe { &mut *self.0.output.get() };
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let writing = ctl.handle.as_ref().map(|h| h.is_writing()).unwrap_or(false);

        // try a direct write when nothing is queued ahead of us
        if !writing && output.readable_bytes() == 0 {
            match sockets::write_fd(self.0.sock.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let c = self.clone();
                        self.0.reactor.queue(move || c.0.events.on_write_complete(&c));
                    }
                }
                Err(e) => {
                    if e != Errno::EAGAIN && e != Errno::EWOULDBLOCK {
                        error!("{} send: {}", self, e);
                        if e == Errno::EPIPE || e == Errno::ECONNRESET {
                            ctl.fault = true;
                        }
                    }
                }
            }
        }

        if !ctl.fault && remaining > 0 {
            output.append(&data[nwrote..]);
            if let Some(h) = &ctl.handle {
                if !h.is_writing() {
                    h.enable_writing();
                }
            }
        }
    }

    /// Half-close: stop sending once the output buffer drains; keep
    /// delivering inbound data until the peer closes.
    pub fn shutdown(&self) {
        if self
            .0
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let c = self.clone();
            self.0.reactor.post(move || c.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let writing = self.ctl().handle.as_ref().map(|h| h.is_writing()).unwrap_or(false);
        if !writing {
            self.0.sock.shutdown_write();
        }
    }

    /// Drop the connection without waiting for pending output.
    pub fn force_close(&self) {
        let st = self.state();
        if st == ConnState::Connected || st == ConnState::Disconnecting {
            self.0.state.store(ConnState::Disconnecting as u8, Ordering::Release);
            let c = self.clone();
            self.0.reactor.queue(move || c.force_close_in_loop());
        }
    }

    /// Like [`force_close`](Self::force_close), delayed by `d`.
    pub fn force_close_with_delay(&self, d: Duration) {
        let st = self.state();
        if st == ConnState::Connected || st == ConnState::Disconnecting {
            self.0.state.store(ConnState::Disconnecting as u8, Ordering::Release);
            let c = self.clone();
            self.0.reactor.run_after(d, move || c.force_close());
        }
    }

    fn force_close_in_loop(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let st = self.state();
        if st == ConnState::Connected || st == ConnState::Disconnecting {
            self.handle_close();
        }
    }

    fn handle_read(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let input = unsafe { &mut *self.0.input.get() };
        match input.read_fd(self.0.sock.fd()) {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!("{} read {} bytes", self, n);
                self.0.events.on_message(self, input);
            }
            Err(e) => {
                if e != Errno::EAGAIN && e != Errno::EWOULDBLOCK && e != Errno::EINTR {
                    error!("{} handle_read: {}", self, e);
                    self.handle_error();
                }
            }
        }
    }

    fn handle_write(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let writing = self.ctl().handle.as_ref().map(|h| h.is_writing()).unwrap_or(false);
        if !writing {
            trace!("{} is down, no more writing", self);
            return;
        }
        let output = unsafe { &mut *self.0.output.get() };
        match sockets::write_fd(self.0.sock.fd(), output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    if let Some(h) = &self.ctl().handle {
                        h.disable_writing();
                    }
                    let c = self.clone();
                    self.0.reactor.queue(move || c.0.events.on_write_complete(&c));
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                if e != Errno::EAGAIN && e != Errno::EWOULDBLOCK {
                    error!("{} handle_write: {}", self, e);
                }
            }
        }
    }

    fn handle_close(&self) {
        assert!(self.0.reactor.is_in_loop_thread());
        let prev = ConnState::from_u8(
            self.0.state.swap(ConnState::Disconnected as u8, Ordering::AcqRel),
        );
        if prev == ConnState::Disconnected {
            // close already delivered
            return;
        }
        debug_assert!(prev == ConnState::Connected || prev == ConnState::Disconnecting);
        trace!("{} handle_close (was {:?})", self, prev);
        if let Some(h) = &self.ctl().handle {
            h.disable_all();
        }
        self.0.events.on_state(self);
        (self.0.close_action)(self);
    }

    fn handle_error(&self) {
        let err = self.0.sock.so_error();
        error!("{} handle_error SO_ERROR={}", self, Errno::from_raw(err));
    }
}
