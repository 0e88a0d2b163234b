//! Reactor-per-thread non-blocking TCP networking.
//!
//! One [`Reactor`] per thread multiplexes poll handles and runs posted
//! tasks; [`TcpServer`]/[`TcpClient`] wire accepted and connected sockets
//! into [`Conn`] state machines whose events land on the embedder's
//! [`ConnEvents`].

mod addr;
pub use addr::Addr;
mod buffer;
pub use buffer::Buffer;
pub mod sockets;
mod handle;
pub use handle::Handle;
mod reactor;
pub use reactor::{Reactor, ReactorHandle, Task};
mod pool;
pub use pool::ReactorPool;
mod acceptor;
mod connector;
pub use connector::{Connector, RetryPolicy};
mod conn;
pub use conn::{Conn, ConnEvents, ConnState};
mod server;
pub use server::TcpServer;
mod client;
pub use client::TcpClient;

/// A host process embedding this crate must not die on `SIGPIPE`; writes
/// already use `MSG_NOSIGNAL`, this covers anything else in the process.
pub fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}
