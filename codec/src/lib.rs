mod msgpack;
pub use msgpack::MsgpCodec;
