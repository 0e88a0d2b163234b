//! Non-blocking active connect with exponential backoff.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::*;
use nix::errno::Errno;

use crate::addr::Addr;
use crate::handle::Handle;
use crate::reactor::ReactorHandle;
use crate::sockets::Socket;

/// Backoff schedule for reconnect attempts.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub init_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { init_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30) }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

// Reactor-thread-only state.
struct LoopState {
    state: State,
    retry_delay: Duration,
    sock: Option<Socket>,
    handle: Option<Handle>,
}

struct Inner {
    reactor: ReactorHandle,
    server_addr: Addr,
    retry: RetryPolicy,
    connect: AtomicBool,
    on_connect: Box<dyn Fn(Socket) + Send + Sync>,
    ls: UnsafeCell<LoopState>,
}

// LoopState is only touched on the owning reactor thread.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Drives one endpoint towards a connected socket:
/// `Disconnected -> Connecting -> Connected`, retrying transient failures
/// with doubling delay up to the cap.
pub struct Connector {
    inner: Arc<Inner>,
}

impl Clone for Connector {
    fn clone(&self) -> Self {
        Connector { inner: self.inner.clone() }
    }
}

impl Connector {
    pub fn new(
        reactor: ReactorHandle, server_addr: Addr, retry: RetryPolicy,
        on_connect: impl Fn(Socket) + Send + Sync + 'static,
    ) -> Connector {
        Connector {
            inner: Arc::new(Inner {
                reactor,
                server_addr,
                retry,
                connect: AtomicBool::new(false),
                on_connect: Box::new(on_connect),
                ls: UnsafeCell::new(LoopState {
                    state: State::Disconnected,
                    retry_delay: retry.init_delay,
                    sock: None,
                    handle: None,
                }),
            }),
        }
    }

    #[inline]
    pub fn server_addr(&self) -> Addr {
        self.inner.server_addr
    }

    #[inline]
    fn ls(&self) -> &mut LoopState {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        unsafe { &mut *self.inner.ls.get() }
    }

    fn from_weak(w: &Weak<Inner>) -> Option<Connector> {
        w.upgrade().map(|inner| Connector { inner })
    }

    pub fn start(&self) {
        self.inner.connect.store(true, Ordering::Release);
        let c = self.clone();
        self.inner.reactor.post(move || c.start_in_loop());
    }

    /// Back to square one with a fresh delay; owner thread only.
    pub fn restart(&self) {
        let ls = self.ls();
        ls.state = State::Disconnected;
        ls.retry_delay = self.inner.retry.init_delay;
        self.inner.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    /// Cancel future retries. An in-progress attempt is abandoned; an
    /// in-flight syscall is not interrupted.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        let c = self.clone();
        self.inner.reactor.queue(move || c.stop_in_loop());
    }

    fn start_in_loop(&self) {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        debug_assert_eq!(self.ls().state, State::Disconnected);
        if self.inner.connect.load(Ordering::Acquire) {
            self.connect();
        } else {
            debug!("connector {}: do not connect", self.inner.server_addr);
        }
    }

    fn stop_in_loop(&self) {
        if self.ls().state == State::Connecting {
            self.ls().state = State::Disconnected;
            let sock = self.remove_and_reset();
            drop(sock);
        }
    }

    fn connect(&self) {
        let addr = self.inner.server_addr;
        let sock = match Socket::new_stream(&addr) {
            Ok(s) => s,
            Err(e) => {
                error!("connector {}: socket: {}", addr, e);
                self.schedule_retry();
                return;
            }
        };
        match sock.connect(&addr) {
            Ok(()) => self.connecting(sock),
            Err(e) => match e {
                Errno::EINPROGRESS | Errno::EINTR | Errno::EISCONN => self.connecting(sock),

                Errno::EAGAIN
                | Errno::EADDRINUSE
                | Errno::EADDRNOTAVAIL
                | Errno::ECONNREFUSED
                | Errno::ENETUNREACH => self.retry(sock),

                Errno::EACCES
                | Errno::EPERM
                | Errno::EAFNOSUPPORT
                | Errno::EALREADY
                | Errno::EBADF
                | Errno::EFAULT
                | Errno::ENOTSOCK => {
                    error!("connector {}: connect error {}", addr, e);
                }

                other => {
                    error!("connector {}: unexpected connect error {}", addr, other);
                }
            },
        }
    }

    fn connecting(&self, sock: Socket) {
        let ls = self.ls();
        ls.state = State::Connecting;
        debug_assert!(ls.handle.is_none());

        let h = Handle::new(sock.fd());
        let w = Arc::downgrade(&self.inner);
        h.set_write_callback(move || {
            if let Some(c) = Connector::from_weak(&w) {
                c.handle_write();
            }
        });
        let w = Arc::downgrade(&self.inner);
        h.set_error_callback(move || {
            if let Some(c) = Connector::from_weak(&w) {
                c.handle_error();
            }
        });
        ls.sock = Some(sock);
        ls.handle = Some(h.clone());
        h.enable_writing();
    }

    fn remove_and_reset(&self) -> Option<Socket> {
        let ls = self.ls();
        if let Some(h) = ls.handle.take() {
            h.disable_all();
            h.remove();
        }
        ls.sock.take()
    }

    fn handle_write(&self) {
        trace!("connector {}: handle_write {:?}", self.inner.server_addr, self.ls().state);
        if self.ls().state != State::Connecting {
            debug_assert_eq!(self.ls().state, State::Disconnected);
            return;
        }
        let Some(sock) = self.remove_and_reset() else {
            return;
        };
        let err = sock.so_error();
        if err != 0 {
            warn!("connector {}: SO_ERROR = {}", self.inner.server_addr, Errno::from_raw(err));
            self.retry(sock);
        } else if sock.is_self_connect() {
            warn!("connector {}: self connect", self.inner.server_addr);
            self.retry(sock);
        } else {
            self.ls().state = State::Connected;
            if self.inner.connect.load(Ordering::Acquire) {
                (self.inner.on_connect)(sock);
            } else {
                drop(sock);
            }
        }
    }

    fn handle_error(&self) {
        error!("connector {}: handle_error {:?}", self.inner.server_addr, self.ls().state);
        if self.ls().state == State::Connecting {
            if let Some(sock) = self.remove_and_reset() {
                debug!(
                    "connector {}: SO_ERROR = {}",
                    self.inner.server_addr,
                    Errno::from_raw(sock.so_error())
                );
                self.retry(sock);
            }
        }
    }

    fn retry(&self, sock: Socket) {
        drop(sock);
        self.ls().state = State::Disconnected;
        self.schedule_retry();
    }

    fn schedule_retry(&self) {
        if !self.inner.connect.load(Ordering::Acquire) {
            debug!("connector {}: do not connect", self.inner.server_addr);
            return;
        }
        let ls = self.ls();
        let delay = ls.retry_delay;
        ls.retry_delay = (delay * 2).min(self.inner.retry.max_delay);
        info!("connector {}: retry in {:?}", self.inner.server_addr, delay);
        let c = self.clone();
        self.inner.reactor.run_after(delay, move || {
            if c.ls().state == State::Disconnected {
                c.start_in_loop();
            }
        });
    }
}
