//! Connect -> wire up a single current connection, optional reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::*;

use crate::addr::Addr;
use crate::conn::{CloseAction, Conn, ConnEvents};
use crate::connector::{Connector, RetryPolicy};
use crate::reactor::ReactorHandle;
use crate::sockets::Socket;

struct ClientInner {
    reactor: ReactorHandle,
    name: String,
    server_addr: Addr,
    events: Arc<dyn ConnEvents>,
    connector: OnceLock<Connector>,
    conn: Mutex<Option<Conn>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
}

/// Owns a connector and at most one current connection.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl Clone for TcpClient {
    fn clone(&self) -> Self {
        TcpClient { inner: self.inner.clone() }
    }
}

impl TcpClient {
    pub fn new(
        reactor: ReactorHandle, name: &str, server_addr: Addr, events: Arc<dyn ConnEvents>,
        retry_policy: RetryPolicy,
    ) -> TcpClient {
        let inner = Arc::new(ClientInner {
            reactor: reactor.clone(),
            name: name.to_string(),
            server_addr,
            events,
            connector: OnceLock::new(),
            conn: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(0),
        });
        let w = Arc::downgrade(&inner);
        let connector = Connector::new(reactor, server_addr, retry_policy, move |sock| {
            if let Some(inner) = Weak::upgrade(&w) {
                TcpClient { inner }.new_connection(sock);
            }
        });
        let _ = inner.connector.set(connector);
        TcpClient { inner }
    }

    #[inline]
    pub fn server_addr(&self) -> Addr {
        self.inner.server_addr
    }

    /// Reconnect automatically when an established connection drops.
    pub fn set_retry(&self, on: bool) {
        self.inner.retry.store(on, Ordering::Release);
    }

    /// The current connection, if one is established.
    pub fn connection(&self) -> Option<Conn> {
        self.inner.conn.lock().unwrap().clone()
    }

    pub fn connect(&self) {
        info!("client {}: connecting to {}", self.inner.name, self.inner.server_addr);
        self.inner.connect.store(true, Ordering::Release);
        if let Some(ct) = self.inner.connector.get() {
            ct.start();
        }
    }

    /// Half-close the current connection; no reconnect.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Cancel connect attempts; the current connection, if any, stays.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(ct) = self.inner.connector.get() {
            ct.stop();
        }
    }

    // Runs on the client reactor thread, handed a freshly connected socket.
    fn new_connection(&self, sock: Socket) {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        let peer = sock.peer_addr().unwrap_or(self.inner.server_addr);
        let local = match sock.local_addr() {
            Ok(a) => a,
            Err(e) => {
                error!("client {}: local_addr: {}", self.inner.name, e);
                Addr::any(0)
            }
        };
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}:{}#{}", self.inner.name, peer, id);

        let w = Arc::downgrade(&self.inner);
        let close_action: CloseAction = Box::new(move |conn| {
            match Weak::upgrade(&w) {
                Some(inner) => TcpClient { inner }.remove_connection(conn),
                None => {
                    let c = conn.clone();
                    conn.reactor().queue(move || c.destroy());
                }
            }
        });

        let conn = Conn::new(
            self.inner.reactor.clone(),
            name,
            sock,
            local,
            peer,
            self.inner.events.clone(),
            close_action,
        );
        *self.inner.conn.lock().unwrap() = Some(conn.clone());
        conn.established();
    }

    // Close path, on the client reactor thread.
    fn remove_connection(&self, conn: &Conn) {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        *self.inner.conn.lock().unwrap() = None;
        let c = conn.clone();
        self.inner.reactor.queue(move || c.destroy());

        if self.inner.retry.load(Ordering::Acquire) && self.inner.connect.load(Ordering::Acquire)
        {
            info!("client {}: reconnecting to {}", self.inner.name, self.inner.server_addr);
            if let Some(ct) = self.inner.connector.get() {
                ct.restart();
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let conn = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match conn {
            // the close action falls back to plain teardown once this
            // inner is gone
            Some(c) => c.force_close(),
            None => {
                if let Some(ct) = self.connector.get() {
                    ct.stop();
                }
            }
        }
    }
}
