use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Dispatch faults carried on the wire inside a response envelope.
///
/// A request that cannot be routed to user code comes back with one of
/// these instead of response bytes.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum WireFault {
    /// No registry on the receiving channel, or service name unknown
    #[strum(serialize = "rpc_no_service")]
    NoService = 1,
    /// Method name not in the service descriptor
    #[strum(serialize = "rpc_no_method")]
    NoMethod = 2,
    /// Request bytes failed to parse into the request prototype
    #[strum(serialize = "rpc_invalid_request")]
    InvalidRequest = 3,
    /// Envelope was structurally unusable for dispatch
    #[strum(serialize = "rpc_wrong_proto")]
    WrongProto = 4,
}

// The default Debug derive ignores the strum-customized string.
impl fmt::Debug for WireFault {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Errors surfaced by the framing codec on the inbound byte stream.
///
/// On anything but a short read the codec stops consuming; the stream is
/// frozen rather than re-synchronized and the channel decides whether to
/// close the connection.
#[derive(strum::Display, strum::AsRefStr, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum FrameError {
    /// Length header below the tag+checksum floor or above the 64 MiB cap
    #[strum(serialize = "frame_invalid_length")]
    InvalidLength,
    /// Adler-32 over tag||payload did not match the trailer
    #[strum(serialize = "frame_checksum")]
    Checksum,
    /// A name field inside the payload had an impossible length
    #[strum(serialize = "frame_invalid_name_len")]
    InvalidNameLen,
    /// Tag bytes were not "RPC0"
    #[strum(serialize = "frame_unknown_type")]
    UnknownMessageType,
    /// Envelope bytes failed to decode
    #[strum(serialize = "frame_parse")]
    Parse,
}

impl fmt::Debug for FrameError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What a caller's `done` continuation observes when a call does not
/// complete with a response.
#[derive(PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum RpcError {
    /// The peer answered with a dispatch fault
    Fault(WireFault),
    /// Response bytes arrived but failed to parse into the response slot
    Decode,
    /// The channel was torn down while the call was outstanding
    Canceled,
    /// The call was issued on a channel with no live connection
    Disconnected,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Fault(e) => fmt::Display::fmt(e, f),
            Self::Decode => write!(f, "rpc_decode"),
            Self::Canceled => write!(f, "rpc_canceled"),
            Self::Disconnected => write!(f, "rpc_disconnected"),
        }
    }
}

impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<WireFault> for RpcError {
    #[inline]
    fn from(e: WireFault) -> Self {
        Self::Fault(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_wire_fault_strings() {
        let s = WireFault::NoService.as_ref();
        assert_eq!(s, "rpc_no_service");
        let e = WireFault::from_str(s).expect("parse");
        assert_eq!(e, WireFault::NoService);
        assert!(WireFault::from_str("no_such_fault").is_err());
        println!("{} {:?}", WireFault::NoMethod, WireFault::NoMethod);
    }

    #[test]
    fn test_rpc_error_from_fault() {
        let e: RpcError = WireFault::InvalidRequest.into();
        assert_eq!(e, RpcError::Fault(WireFault::InvalidRequest));
        println!("err {} {:?}", e, RpcError::Canceled);
    }
}
