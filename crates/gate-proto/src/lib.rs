// gate-proto: Wire dialects and binary codecs for the gateway.
//
// Two framed dialects share the same length-prefix framing and the
// segmentation layer:
//
// - the *user* dialect, spoken between end-user connections and the
//   gateway (`user`), and
// - the *backend* dialect, spoken on the persistent uplinks between the
//   gateway and backend service instances (`backend`).
//
// Every frame on the wire is `len:u16 || body`, where `len` counts body
// bytes only and never exceeds [`MAX_FRAME`].  A body begins with a one
// byte type tag; the remaining bytes are tag specific.  Backend-dialect
// bodies larger than the ceiling are carried as a run of `Segment` frames
// (see [`segment`]); the user dialect rejects oversized bodies outright.

pub mod framing;
pub mod segment;
pub mod transfer;
pub mod user;
pub mod wire;

use thiserror::Error;

/// Largest legal frame body in bytes.
pub const MAX_FRAME: usize = i16::MAX as usize;

/// Longest string field either dialect will encode.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Longest service-name field either dialect will encode.
pub const MAX_SERVICE_LEN: usize = u8::MAX as usize;

/// Byte order of the multi-byte fields of one channel.
///
/// The order is fixed per channel by configuration: the user channel
/// defaults to little-endian, the backend channel to big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Codec failures for both dialects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input held no body at all.
    #[error("empty frame body")]
    ShortBuffer,
    /// A field ran past the end of the body.
    #[error("truncated frame body")]
    Truncated,
    /// The type tag is not part of the dialect.
    #[error("unknown message tag {0}")]
    InvalidMessage(u8),
    /// A string, array, or body exceeded its wire limit.
    #[error("message too large")]
    MessageTooLarge,
    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidString,
}
