use serde::{Deserialize, Serialize};

/*
 * There is no unified output interface across serde implementations;
 * whatever we serialize into (std::io::Write / Vec<u8>), the codec
 * implementation has to match.
 */

/// Interface for the pluggable envelope/payload serializer
/// (see [heron-rpc-codec](https://docs.rs/heron-rpc-codec)).
///
/// The codec is immutable; if it ever needs runtime state (like a cipher),
/// it should use inner mutability.
pub trait Codec: Default + Send + Sync + Sized + 'static {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()>;

    /// Serialize the msg into buf and return the number of bytes written.
    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}
