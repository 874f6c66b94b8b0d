//! Length-prefix framing for the TCP transports.
//!
//! [`FrameCodec`] is a `tokio_util` codec producing one frame *body* per
//! item; the two byte length prefix is consumed here and never reaches
//! the dialect decoders.  The encoder side accepts pre-encoded bodies
//! and prefixes them, which suits the user channel; the backend uplink
//! writes pre-framed byte runs directly (segmentation can produce more
//! than one frame per message).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ByteOrder, CodecError, MAX_FRAME};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    order: ByteOrder,
}

impl FrameCodec {
    pub fn new(order: ByteOrder) -> Self {
        FrameCodec { order }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = match self.order {
            ByteOrder::Big => u16::from_be_bytes([src[0], src[1]]),
            ByteOrder::Little => u16::from_le_bytes([src[0], src[1]]),
        } as usize;
        if len > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds ceiling {MAX_FRAME}"),
            ));
        }
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                CodecError::MessageTooLarge.to_string(),
            ));
        }
        dst.reserve(2 + body.len());
        let len = body.len() as u16;
        match self.order {
            ByteOrder::Big => dst.put_slice(&len.to_be_bytes()),
            ByteOrder::Little => dst.put_slice(&len.to_le_bytes()),
        }
        dst.put_slice(&body);
        Ok(())
    }
}
