use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use log::*;

use crate::reactor::{Reactor, ReactorHandle};

/// N worker reactors, each on its own thread, assigned round-robin or by
/// hash. With zero workers the base reactor serves I/O itself.
pub struct ReactorPool {
    base: ReactorHandle,
    name: String,
    handles: Vec<ReactorHandle>,
    threads: Vec<thread::JoinHandle<()>>,
    next: AtomicUsize,
    started: bool,
}

impl ReactorPool {
    pub fn new(base: ReactorHandle, name: &str) -> Self {
        Self {
            base,
            name: name.to_string(),
            handles: Vec::new(),
            threads: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    /// Spawn `num` worker threads, each running its own reactor. Blocks
    /// until every worker loop is up.
    pub fn start(&mut self, num: usize) {
        assert!(!self.started);
        self.started = true;
        for i in 0..num {
            let (tx, rx) = std::sync::mpsc::channel();
            let tname = format!("{}-io-{}", self.name, i);
            let th = match thread::Builder::new().name(tname.clone()).spawn(move || {
                let reactor = Reactor::new();
                let _ = tx.send(reactor.handle());
                reactor.run();
            }) {
                Ok(th) => th,
                Err(e) => panic!("spawn {}: {}", tname, e),
            };
            match rx.recv() {
                Ok(handle) => self.handles.push(handle),
                Err(e) => panic!("{} startup: {}", tname, e),
            }
            self.threads.push(th);
        }
        info!("reactor pool {} started with {} workers", self.name, num);
    }

    /// Round-robin pick; the base reactor when the pool is empty.
    pub fn get_next(&self) -> ReactorHandle {
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// Stable assignment by hash code.
    pub fn get_for_hash(&self, hash: usize) -> ReactorHandle {
        if self.handles.is_empty() {
            return self.base.clone();
        }
        self.handles[hash % self.handles.len()].clone()
    }

    pub fn stop(&mut self) {
        for h in &self.handles {
            h.quit();
        }
        for th in self.threads.drain(..) {
            let _ = th.join();
        }
        self.handles.clear();
        debug!("reactor pool {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_round_robin() {
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let reactor = Reactor::new();
            let _ = tx.send(reactor.handle());
            reactor.run();
        });
        let base = rx.recv().unwrap();

        let mut pool = ReactorPool::new(base.clone(), "test");
        pool.start(2);

        let tid_of = |h: &ReactorHandle| {
            let (tx, rx) = mpsc::channel();
            h.post(move || {
                let _ = tx.send(crate::sockets::tid());
            });
            rx.recv().unwrap()
        };
        let a = tid_of(&pool.get_next());
        let b = tid_of(&pool.get_next());
        let c = tid_of(&pool.get_next());
        // two distinct workers, then wrap-around
        assert_ne!(a, b);
        assert_eq!(a, c);

        pool.stop();
        base.quit();
        th.join().unwrap();
    }
}
