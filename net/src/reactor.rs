//! A single-threaded event loop multiplexing file descriptors, with a
//! cross-thread task queue and an eventfd wakeup.
//!
//! Exactly one [`Reactor`] may live on an OS thread. The thread that builds
//! it owns it: only that thread may run the loop, mutate the poll registry
//! or touch registered handles. Other threads talk to it through the
//! cloneable [`ReactorHandle`], which posts tasks and wakes the loop.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::handle::{Handle, Registration};
use crate::sockets;

pub type Task = Box<dyn FnOnce() + Send>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_EVENT_LIST_SIZE: usize = 16;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = RefCell::new(None);
}

pub(crate) fn with_current<R>(f: impl FnOnce(&Core) -> R) -> R {
    CURRENT.with(|c| {
        let b = c.borrow();
        match b.as_ref() {
            Some(core) => f(core),
            None => panic!("not on a reactor thread"),
        }
    })
}

pub(crate) fn is_reactor_thread() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

pub(crate) fn update_handle(h: &Handle) {
    with_current(|core| core.poller.borrow_mut().update(h));
}

pub(crate) fn remove_handle(h: &Handle) {
    with_current(|core| core.poller.borrow_mut().remove(h));
}

struct Shared {
    quit: AtomicBool,
    calling_pending: AtomicBool,
    owner_tid: AtomicI32,
    wakeup: EventFd,
    pending: Mutex<Vec<Task>>,
}

/// Cross-thread face of a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.owner_tid.load(Ordering::Relaxed) == sockets::tid()
    }

    /// Run `f` on the reactor: immediately when called on its own thread,
    /// queued otherwise.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue(f);
        }
    }

    /// Append `f` to the pending list for the next drain.
    pub fn queue(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(f));
        }
        // The drain runs unlocked, so a task queued while draining must
        // force another wake to be observed promptly.
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Run `f` on the reactor after `delay`.
    pub fn run_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let deadline = Instant::now() + delay;
        self.post(move || {
            with_current(|core| core.arm_timer(deadline, Box::new(f)));
        });
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    pub fn wake(&self) {
        // an 8-byte counter bump; the wakeup handle's read callback drains it
        if let Err(e) = self.shared.wakeup.write(1) {
            error!("reactor wakeup write: {}", e);
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Option<Box<dyn FnOnce()>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // min-heap on (deadline, seq)
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline).then(other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Core {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    event_handling: Cell<bool>,
}

impl Core {
    pub(crate) fn arm_timer(&self, deadline: Instant, task: Box<dyn FnOnce()>) {
        let seq = self.timer_seq.get() + 1;
        self.timer_seq.set(seq);
        self.timers.borrow_mut().push(TimerEntry { deadline, seq, task: Some(task) });
    }

    fn next_timeout(&self) -> EpollTimeout {
        let timers = self.timers.borrow();
        let dur = match timers.peek() {
            Some(t) => t.deadline.saturating_duration_since(Instant::now()).min(POLL_TIMEOUT),
            None => POLL_TIMEOUT,
        };
        // the wait window is capped at 10 s, which fits comfortably in the
        // u16-milliseconds form of EpollTimeout; round up so a near-due
        // timer does not degrade into a zero-timeout spin
        let ms = (dur.as_micros() + 999) / 1000;
        EpollTimeout::from(ms.min(u16::MAX as u128) as u16)
    }

    fn take_expired(&self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut due = Vec::new();
        let mut timers = self.timers.borrow_mut();
        while let Some(t) = timers.peek() {
            if t.deadline > now {
                break;
            }
            let mut entry = timers.pop().unwrap();
            if let Some(task) = entry.task.take() {
                due.push(task);
            }
        }
        due
    }
}

struct Poller {
    epoll: Epoll,
    registry: HashMap<RawFd, Handle>,
    events: Vec<EpollEvent>,
}

fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // registered fds outlive their registration; the poller only touches
    // them between add and delete
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl Poller {
    fn new() -> Poller {
        let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
            Ok(ep) => ep,
            Err(e) => panic!("epoll_create1: {}", e),
        };
        Poller {
            epoll,
            registry: HashMap::new(),
            events: vec![EpollEvent::empty(); INIT_EVENT_LIST_SIZE],
        }
    }

    fn poll(&mut self, timeout: EpollTimeout, active: &mut Vec<Handle>) {
        match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => {
                trace!("{} events happened", n);
                for ev in &self.events[..n] {
                    let fd = ev.data() as RawFd;
                    if let Some(h) = self.registry.get(&fd) {
                        h.set_revents(ev.events());
                        active.push(h.clone());
                    }
                }
                if n == self.events.len() {
                    self.events.resize(self.events.len() * 2, EpollEvent::empty());
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => error!("epoll_wait: {}", e),
        }
    }

    fn update(&mut self, h: &Handle) {
        let index = h.index();
        let fd = h.fd();
        trace!("update fd={} events={:?} index={:?}", fd, h.events(), index);
        match index {
            Registration::New | Registration::Detached => {
                if index == Registration::New {
                    self.registry.insert(fd, h.clone());
                } else {
                    debug_assert!(self.registry.contains_key(&fd));
                }
                h.set_index(Registration::Added);
                self.ctl_add(h);
            }
            Registration::Added => {
                debug_assert!(self.registry.contains_key(&fd));
                if h.is_none_event() {
                    self.ctl_del(fd);
                    h.set_index(Registration::Detached);
                } else {
                    self.ctl_mod(h);
                }
            }
        }
    }

    fn remove(&mut self, h: &Handle) {
        let fd = h.fd();
        trace!("remove fd={}", fd);
        debug_assert!(h.is_none_event());
        let index = h.index();
        debug_assert!(index == Registration::Added || index == Registration::Detached);
        self.registry.remove(&fd);
        if index == Registration::Added {
            self.ctl_del(fd);
        }
        h.set_index(Registration::New);
    }

    fn ctl_add(&self, h: &Handle) {
        let event = EpollEvent::new(h.events(), h.fd() as u64);
        if let Err(e) = self.epoll.add(borrow_fd(h.fd()), event) {
            panic!("epoll_ctl ADD fd={}: {}", h.fd(), e);
        }
    }

    fn ctl_mod(&self, h: &Handle) {
        let mut event = EpollEvent::new(h.events(), h.fd() as u64);
        if let Err(e) = self.epoll.modify(borrow_fd(h.fd()), &mut event) {
            panic!("epoll_ctl MOD fd={}: {}", h.fd(), e);
        }
    }

    fn ctl_del(&self, fd: RawFd) {
        if let Err(e) = self.epoll.delete(borrow_fd(fd)) {
            error!("epoll_ctl DEL fd={}: {}", fd, e);
        }
    }
}

/// The thread-owned event loop.
pub struct Reactor {
    core: Rc<Core>,
    handle: ReactorHandle,
    wakeup_handle: Handle,
    looping: Cell<bool>,
}

impl Reactor {
    /// Build the reactor owned by the current thread. Panics if this thread
    /// already has one, or when the eventfd/epoll descriptors cannot be
    /// created.
    pub fn new() -> Reactor {
        let wakeup = match EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        ) {
            Ok(fd) => fd,
            Err(e) => panic!("eventfd: {}", e),
        };
        let shared = Arc::new(Shared {
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            owner_tid: AtomicI32::new(sockets::tid()),
            wakeup,
            pending: Mutex::new(Vec::new()),
        });
        let core = Rc::new(Core {
            shared: shared.clone(),
            poller: RefCell::new(Poller::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            event_handling: Cell::new(false),
        });
        CURRENT.with(|c| {
            let mut b = c.borrow_mut();
            if b.is_some() {
                panic!("another reactor already exists in this thread");
            }
            *b = Some(core.clone());
        });

        let wakeup_fd = shared.wakeup.as_fd().as_raw_fd();
        let wakeup_handle = Handle::new(wakeup_fd);
        wakeup_handle.set_read_callback(move || {
            let mut buf = [0u8; 8];
            match sockets::read_fd(wakeup_fd, &mut buf) {
                Ok(n) if n != 8 => error!("reactor wakeup reads {} bytes instead of 8", n),
                Err(e) if e != Errno::EAGAIN => error!("reactor wakeup read: {}", e),
                _ => {}
            }
        });
        wakeup_handle.enable_reading();

        debug!("reactor created on tid {}", sockets::tid());
        Reactor {
            core,
            handle: ReactorHandle { shared },
            wakeup_handle,
            looping: Cell::new(false),
        }
    }

    #[inline]
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Loop until [`ReactorHandle::quit`]: poll, dispatch ready handles,
    /// drain posted tasks, fire expired timers.
    pub fn run(&self) {
        assert!(self.handle.is_in_loop_thread());
        assert!(!self.looping.get());
        self.looping.set(true);
        debug!("reactor start looping");

        let mut active: Vec<Handle> = Vec::new();
        while !self.core.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let timeout = self.core.next_timeout();
            self.core.poller.borrow_mut().poll(timeout, &mut active);

            self.core.event_handling.set(true);
            for h in &active {
                h.handle_event();
            }
            self.core.event_handling.set(false);

            self.drain_pending();
            self.run_expired_timers();
        }

        self.looping.set(false);
        debug!("reactor stop looping");
    }

    fn drain_pending(&self) {
        self.core.shared.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<Task> = {
            let mut pending = self.core.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.core.shared.calling_pending.store(false, Ordering::Release);
    }

    fn run_expired_timers(&self) {
        let due = self.core.take_expired(Instant::now());
        for task in due {
            task();
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.wakeup_handle.disable_all();
        self.wakeup_handle.remove();
        CURRENT.with(|c| {
            *c.borrow_mut() = None;
        });
        debug!("reactor destroyed on tid {}", sockets::tid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_post_from_other_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let th = thread::spawn(move || {
            let reactor = Reactor::new();
            tx.send(reactor.handle()).unwrap();
            reactor.run();
        });
        let handle = rx.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            handle.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let h2 = handle.clone();
        handle.post(move || h2.quit());
        th.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_run_after_ordering() {
        let (tx, rx) = std::sync::mpsc::channel();
        let th = thread::spawn(move || {
            let reactor = Reactor::new();
            tx.send(reactor.handle()).unwrap();
            reactor.run();
        });
        let handle = rx.recv().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        handle.run_after(Duration::from_millis(80), move || o1.lock().unwrap().push(2));
        let o2 = order.clone();
        handle.run_after(Duration::from_millis(20), move || o2.lock().unwrap().push(1));
        let h2 = handle.clone();
        handle.run_after(Duration::from_millis(150), move || h2.quit());
        th.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_two_reactors_per_thread_panics() {
        let th = thread::spawn(|| {
            let _r1 = Reactor::new();
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(Reactor::new));
            assert!(caught.is_err());
        });
        th.join().unwrap();
    }
}
