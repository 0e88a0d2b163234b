use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::rc::{Rc, Weak};

use log::*;

use crate::addr::Addr;
use crate::handle::Handle;
use crate::reactor;
use crate::sockets::Socket;

pub(crate) type AcceptAction = Box<dyn Fn(Socket, Addr)>;

/// Listening socket on the main reactor. Accepts at most one connection per
/// readiness wake and hands it to the accept action.
///
/// Lives on the main reactor thread only (built there, dropped there).
pub(crate) struct Acceptor {
    sock: Socket,
    handle: Handle,
    on_accept: AcceptAction,
    listening: Cell<bool>,
    // spare descriptor for EMFILE recovery
    idle_fd: RefCell<Option<File>>,
}

impl Acceptor {
    pub(crate) fn new(
        addr: &Addr, reuse_port: bool, on_accept: AcceptAction,
    ) -> io::Result<Rc<Acceptor>> {
        let sock = Socket::new_stream(addr)?;
        sock.set_reuse_addr(true);
        sock.set_reuse_port(reuse_port);
        sock.bind(addr)?;
        let handle = Handle::new(sock.fd());
        let idle = open_idle_fd();
        let a = Rc::new(Acceptor {
            sock,
            handle,
            on_accept,
            listening: Cell::new(false),
            idle_fd: RefCell::new(idle),
        });
        let w = Rc::downgrade(&a);
        a.handle.set_read_callback(move || {
            if let Some(a) = Weak::upgrade(&w) {
                a.handle_read();
            }
        });
        Ok(a)
    }

    pub(crate) fn local_addr(&self) -> io::Result<Addr> {
        self.sock.local_addr()
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.sock.listen()?;
        self.listening.set(true);
        self.handle.enable_reading();
        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    fn handle_read(&self) {
        match self.sock.accept() {
            Ok((sock, peer)) => (self.on_accept)(sock, peer),
            Err(e) => {
                error!("acceptor: accept: {}", e);
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.recover_from_emfile();
                }
            }
        }
    }

    // Close the spare fd, accept-and-close the pending connection so it does
    // not keep the listener hot, then re-open the spare.
    fn recover_from_emfile(&self) {
        let mut slot = self.idle_fd.borrow_mut();
        slot.take();
        unsafe {
            let fd = libc::accept(self.sock.fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if fd >= 0 {
                libc::close(fd);
            }
        }
        *slot = open_idle_fd();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if reactor::is_reactor_thread() {
            self.handle.disable_all();
            self.handle.remove();
        } else {
            warn!("acceptor dropped off its reactor thread, poll handle leaked");
        }
    }
}

fn open_idle_fd() -> Option<File> {
    match File::open("/dev/null") {
        Ok(f) => Some(f),
        Err(e) => {
            error!("open /dev/null: {}", e);
            None
        }
    }
}
