//! Multiplexed RPC over TCP on a reactor-per-thread core.
//!
//! Many calls are in flight concurrently on one connection, correlated by
//! monotonically increasing ids. Payloads are opaque to the framework and
//! described by the embedder's message runtime (see
//! `heron_rpc_core::message`).

mod envelope;
pub use envelope::{Envelope, Kind};
mod frame;
pub use frame::{FrameCodec, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN, TAG};
mod channel;
pub use channel::{CallDone, RpcChannel, ServiceMap};
mod server;
pub use server::RpcServer;
mod client;
pub use client::RpcClient;

pub use heron_net as net;
pub use heron_rpc_core::error;
pub use heron_rpc_core::message;
pub use heron_rpc_core::{Codec, NetConfig};
