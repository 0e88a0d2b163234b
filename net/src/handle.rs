use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use nix::sys::epoll::EpollFlags;

use crate::reactor;

/// Registration state in the owning reactor's poller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Registration {
    /// Never registered
    New,
    /// In the epoll set
    Added,
    /// Known to the poller but removed from the epoll set
    Detached,
}

pub(crate) fn read_events() -> EpollFlags {
    EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI
}

pub(crate) fn write_events() -> EpollFlags {
    EpollFlags::EPOLLOUT
}

struct HandleState {
    fd: RawFd,
    events: EpollFlags,
    revents: EpollFlags,
    index: Registration,
    read_cb: Option<Rc<dyn Fn()>>,
    write_cb: Option<Rc<dyn Fn()>>,
    close_cb: Option<Rc<dyn Fn()>>,
    error_cb: Option<Rc<dyn Fn()>>,
}

/// The binding of one fd to its interest set and event callbacks.
///
/// A handle belongs to the reactor of the thread it is first registered on
/// and must only be touched from that thread; every interest mutation goes
/// through the thread-current reactor and panics elsewhere. Lifecycle:
/// created detached, registered once interests turn non-empty, detached
/// again (`disable_all` + `remove`) before the fd goes away.
#[derive(Clone)]
pub struct Handle(Rc<RefCell<HandleState>>);

impl Handle {
    pub fn new(fd: RawFd) -> Handle {
        Handle(Rc::new(RefCell::new(HandleState {
            fd,
            events: EpollFlags::empty(),
            revents: EpollFlags::empty(),
            index: Registration::New,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        })))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn set_read_callback(&self, f: impl Fn() + 'static) {
        self.0.borrow_mut().read_cb = Some(Rc::new(f));
    }

    pub fn set_write_callback(&self, f: impl Fn() + 'static) {
        self.0.borrow_mut().write_cb = Some(Rc::new(f));
    }

    pub fn set_close_callback(&self, f: impl Fn() + 'static) {
        self.0.borrow_mut().close_cb = Some(Rc::new(f));
    }

    pub fn set_error_callback(&self, f: impl Fn() + 'static) {
        self.0.borrow_mut().error_cb = Some(Rc::new(f));
    }

    pub fn enable_reading(&self) {
        self.0.borrow_mut().events.insert(read_events());
        reactor::update_handle(self);
    }

    pub fn disable_reading(&self) {
        self.0.borrow_mut().events.remove(read_events());
        reactor::update_handle(self);
    }

    pub fn enable_writing(&self) {
        self.0.borrow_mut().events.insert(write_events());
        reactor::update_handle(self);
    }

    pub fn disable_writing(&self) {
        self.0.borrow_mut().events.remove(write_events());
        reactor::update_handle(self);
    }

    pub fn disable_all(&self) {
        self.0.borrow_mut().events = EpollFlags::empty();
        reactor::update_handle(self);
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.0.borrow().events.intersects(write_events())
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.0.borrow().events.intersects(read_events())
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.0.borrow().events.is_empty()
    }

    /// Drop the registration. Interests must already be cleared.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        reactor::remove_handle(self);
    }

    pub(crate) fn events(&self) -> EpollFlags {
        self.0.borrow().events
    }

    pub(crate) fn set_revents(&self, revents: EpollFlags) {
        self.0.borrow_mut().revents = revents;
    }

    pub(crate) fn index(&self) -> Registration {
        self.0.borrow().index
    }

    pub(crate) fn set_index(&self, index: Registration) {
        self.0.borrow_mut().index = index;
    }

    /// Dispatch the last-observed event set to the installed callbacks.
    ///
    /// The callback refs are cloned out first so a callback may freely
    /// mutate this handle (or remove it) while running.
    pub(crate) fn handle_event(&self) {
        let (revents, read_cb, write_cb, close_cb, error_cb) = {
            let s = self.0.borrow();
            (s.revents, s.read_cb.clone(), s.write_cb.clone(), s.close_cb.clone(), s.error_cb.clone())
        };
        if revents.contains(EpollFlags::EPOLLHUP) && !revents.contains(EpollFlags::EPOLLIN) {
            if let Some(cb) = close_cb {
                cb();
            }
        }
        if revents
            .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLRDHUP)
        {
            if let Some(cb) = read_cb {
                cb();
            }
        }
        if revents.contains(EpollFlags::EPOLLOUT) {
            if let Some(cb) = write_cb {
                cb();
            }
        }
        if revents.contains(EpollFlags::EPOLLERR) {
            if let Some(cb) = error_cb {
                cb();
            }
        }
    }
}
