//! Length-prefixed, tagged, checksummed wire frames.
//!
//! ```text
//! offset  length  field
//!  0       4      total_len = 4 (tag) + N (payload) + 4 (checksum)
//!  4       4      tag = "RPC0"
//!  8       N      payload (schema-encoded envelope)
//!  8+N     4      checksum = Adler32(tag || payload)
//! ```
//! All integers big-endian. `8 <= total_len <= 64 MiB`.

use adler2::Adler32;
use log::*;

use heron_net::{Buffer, Conn};
use heron_rpc_core::error::FrameError;
use heron_rpc_core::Codec;

use crate::envelope::Envelope;

pub const HEADER_LEN: usize = 4;
pub const TAG: &[u8; 4] = b"RPC0";
pub const TAG_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 4;
/// Floor of the length field: an empty payload still carries tag+checksum.
pub const MIN_MESSAGE_LEN: u32 = (TAG_LEN + CHECKSUM_LEN) as u32;
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024 * 1024;

fn adler32(data: &[u8]) -> u32 {
    let mut a = Adler32::new();
    a.write_slice(data);
    a.checksum()
}

/// Frames envelopes onto connections and peels them back off the inbound
/// byte stream, tolerating arbitrary TCP fragmentation.
pub struct FrameCodec<C: Codec> {
    codec: C,
}

impl<C: Codec> Default for FrameCodec<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> FrameCodec<C> {
    pub fn new() -> Self {
        Self { codec: C::default() }
    }

    #[inline]
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Fill an empty buffer with one complete frame.
    pub fn encode(&self, env: &Envelope, buf: &mut Buffer) -> Result<(), FrameError> {
        debug_assert_eq!(buf.readable_bytes(), 0);
        buf.append(TAG);
        let payload = self.codec.encode(env).map_err(|_| FrameError::Parse)?;
        buf.append(&payload);
        buf.append_u32(adler32(&buf.peek()[..TAG_LEN + payload.len()]));
        buf.prepend_u32(buf.readable_bytes() as u32);
        Ok(())
    }

    /// Frame `env` and hand the bytes to the connection.
    pub fn send(&self, conn: &Conn, env: &Envelope) {
        let mut buf = Buffer::new();
        match self.encode(env, &mut buf) {
            Ok(()) => conn.send(buf.peek()),
            Err(e) => error!("{}: frame encode: {}", conn.name(), e),
        }
    }

    /// Peel one frame off the stream.
    ///
    /// `Ok(None)` means more bytes are needed; the reader only advances on a
    /// successful parse. On error nothing is consumed and the stream is
    /// frozen: the caller decides whether to close.
    pub fn try_split(&self, input: &mut Buffer) -> Result<Option<Envelope>, FrameError> {
        if input.readable_bytes() < HEADER_LEN + MIN_MESSAGE_LEN as usize {
            return Ok(None);
        }
        let len = input.peek_u32();
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(FrameError::InvalidLength);
        }
        if input.readable_bytes() < HEADER_LEN + len as usize {
            return Ok(None);
        }
        let env = self.parse(&input.peek()[HEADER_LEN..HEADER_LEN + len as usize])?;
        input.retrieve(HEADER_LEN + len as usize);
        Ok(Some(env))
    }

    /// Validate checksum and tag, then decode the envelope.
    pub fn parse(&self, body: &[u8]) -> Result<Envelope, FrameError> {
        if body.len() < MIN_MESSAGE_LEN as usize {
            return Err(FrameError::InvalidLength);
        }
        let (data, trailer) = body.split_at(body.len() - CHECKSUM_LEN);
        let mut be = [0u8; 4];
        be.copy_from_slice(trailer);
        let expected = u32::from_be_bytes(be);
        if adler32(data) != expected {
            return Err(FrameError::Checksum);
        }
        if &data[..TAG_LEN] != TAG {
            return Err(FrameError::UnknownMessageType);
        }
        self.codec.decode::<Envelope>(&data[TAG_LEN..]).map_err(|_| FrameError::Parse)
    }
}
