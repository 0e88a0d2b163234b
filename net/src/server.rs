//! Accept -> pick a worker reactor -> wire the connection up.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::*;

use crate::acceptor::Acceptor;
use crate::addr::Addr;
use crate::conn::{CloseAction, Conn, ConnEvents};
use crate::pool::ReactorPool;
use crate::reactor::{Reactor, ReactorHandle};
use crate::sockets::Socket;

struct ServerInner {
    reactor: ReactorHandle,
    name: String,
    addr: Addr,
    events: Arc<dyn ConnEvents>,
    tcp_no_delay: bool,
    pool: Mutex<ReactorPool>,
    // main reactor thread only
    acceptor: UnsafeCell<Option<Rc<Acceptor>>>,
    conns: Mutex<HashMap<String, Conn>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

// The acceptor cell is only touched on the main reactor thread.
unsafe impl Send for ServerInner {}
unsafe impl Sync for ServerInner {}

/// Owns the listening socket, a pool of worker reactors and the live
/// connection map.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl Clone for TcpServer {
    fn clone(&self) -> Self {
        TcpServer { inner: self.inner.clone() }
    }
}

impl TcpServer {
    /// Bind the listening socket on the main reactor. Must be called on the
    /// thread that owns `reactor`.
    pub fn bind(
        reactor: &Reactor, name: &str, addr: Addr, events: Arc<dyn ConnEvents>,
        reuse_port: bool, tcp_no_delay: bool,
    ) -> io::Result<TcpServer> {
        let inner = Arc::new(ServerInner {
            reactor: reactor.handle(),
            name: name.to_string(),
            addr,
            events,
            tcp_no_delay,
            pool: Mutex::new(ReactorPool::new(reactor.handle(), name)),
            acceptor: UnsafeCell::new(None),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
        });
        let w = Arc::downgrade(&inner);
        let acceptor = Acceptor::new(
            &addr,
            reuse_port,
            Box::new(move |sock, peer| {
                if let Some(inner) = Weak::upgrade(&w) {
                    TcpServer { inner }.new_connection(sock, peer);
                }
            }),
        )?;
        unsafe { *inner.acceptor.get() = Some(acceptor) };
        Ok(TcpServer { inner })
    }

    #[inline]
    pub fn main_reactor(&self) -> &ReactorHandle {
        &self.inner.reactor
    }

    /// The bound address, with the kernel-chosen port when bound to port 0.
    pub fn local_addr(&self) -> Addr {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        let acceptor = unsafe { (*self.inner.acceptor.get()).clone() };
        match acceptor {
            Some(a) => a.local_addr().unwrap_or(self.inner.addr),
            None => self.inner.addr,
        }
    }

    /// Start `workers` I/O reactors and begin listening.
    pub fn start(&self, workers: usize) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.pool.lock().unwrap().start(workers);

        if self.inner.reactor.is_in_loop_thread() {
            return self.listen_in_loop();
        }
        let server = self.clone();
        self.inner.reactor.queue(move || {
            if let Err(e) = server.listen_in_loop() {
                error!("server {}: listen: {}", server.inner.name, e);
            }
        });
        Ok(())
    }

    fn listen_in_loop(&self) -> io::Result<()> {
        let acceptor = unsafe { (*self.inner.acceptor.get()).clone() };
        match acceptor {
            Some(a) => {
                a.listen()?;
                info!("server {} listening on {}", self.inner.name, self.inner.addr);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "acceptor gone")),
        }
    }

    fn new_connection(&self, sock: Socket, peer: Addr) {
        debug_assert!(self.inner.reactor.is_in_loop_thread());
        let worker = self.inner.pool.lock().unwrap().get_next();
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}#{}", self.inner.name, self.inner.addr, id);
        info!("server {}: new connection [{}] from {}", self.inner.name, name, peer);
        let local = sock.local_addr().unwrap_or(self.inner.addr);
        if self.inner.tcp_no_delay {
            sock.set_no_delay(true);
        }

        let w = Arc::downgrade(&self.inner);
        let close_action: CloseAction = Box::new(move |conn| {
            match Weak::upgrade(&w) {
                Some(inner) => TcpServer { inner }.remove_connection(conn),
                None => {
                    let c = conn.clone();
                    conn.reactor().queue(move || c.destroy());
                }
            }
        });

        let conn = Conn::new(
            worker.clone(),
            name.clone(),
            sock,
            local,
            peer,
            self.inner.events.clone(),
            close_action,
        );
        self.inner.conns.lock().unwrap().insert(name, conn.clone());
        worker.post(move || conn.established());
    }

    // Runs on the connection's worker thread; hop to the main reactor to
    // erase the map entry, then back to the worker for the final teardown.
    fn remove_connection(&self, conn: &Conn) {
        let inner = self.inner.clone();
        let conn = conn.clone();
        self.inner.reactor.post(move || {
            debug!("server {}: remove connection {}", inner.name, conn.name());
            inner.conns.lock().unwrap().remove(conn.name());
            let c = conn.clone();
            conn.reactor().queue(move || c.destroy());
        });
    }

    /// Tear down every live connection and stop the worker pool.
    pub fn stop(&self) {
        let conns: Vec<Conn> = {
            let mut map = self.inner.conns.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            let c = conn.clone();
            conn.reactor().queue(move || c.destroy());
        }
        self.inner.pool.lock().unwrap().stop();
        info!("server {} stopped", self.inner.name);
    }
}
