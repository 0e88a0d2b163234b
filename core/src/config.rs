/// Knobs of a server or client endpoint.
#[derive(Clone)]
pub struct NetConfig {
    /// Worker reactors for connection I/O. 0 means the main reactor
    /// also serves connections.
    pub workers: usize,
    /// SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,
    /// TCP_NODELAY on accepted/connected sockets.
    pub tcp_no_delay: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self { workers: 0, reuse_port: false, tcp_no_delay: false }
    }
}
