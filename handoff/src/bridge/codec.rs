//! Framed codec for the control channel.
//!
//! Frame layout: `tag: u8 | len: u32 (big-endian) | payload: [u8; len]`.
//! A whole frame is capped at [`MAX_MESSAGE_SIZE`] bytes. Anything larger is rejected
//! with [`CodecError::Oversized`] on both sides; nothing is truncated.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::protocol::{ControlMessage, MessageType};

/// Largest frame (header included) either side will produce or accept.
pub const MAX_MESSAGE_SIZE: usize = 1024;

const TAG_LEN: usize = 1;
const LENGTH_FIELD_LEN: usize = 4;
const HEADER_LEN: usize = TAG_LEN + LENGTH_FIELD_LEN;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_MESSAGE_SIZE - HEADER_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control channel i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown control message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control message payload of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
}

/// Codec for [`ControlMessage`] frames.
///
/// The tag byte is handled here; the length prefix and payload are framed by an inner
/// [`LengthDelimitedCodec`].
#[derive(Debug, Clone)]
pub struct ControlCodec {
    framing: LengthDelimitedCodec,
    /// Tag of a frame whose payload has not fully arrived yet.
    pending: Option<MessageType>,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_LEN)
                .max_frame_length(MAX_PAYLOAD_LEN)
                .big_endian()
                .new_codec(),
            pending: None,
        }
    }
}

/// Map the inner codec's length-limit error onto [`CodecError::Oversized`], reading the
/// declared length from the still-unconsumed length field.
fn framing_error(err: io::Error, src: &BytesMut) -> CodecError {
    let oversized = err
        .get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
    if !oversized {
        return CodecError::Io(err);
    }
    let mut field = &src[..];
    let len = if field.len() >= LENGTH_FIELD_LEN {
        field.get_u32() as usize
    } else {
        0
    };
    CodecError::Oversized {
        len,
        max: MAX_PAYLOAD_LEN,
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let kind = match self.pending {
            Some(kind) => kind,
            None => {
                let Some(&tag) = src.first() else {
                    return Ok(None);
                };
                let kind = MessageType::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;
                src.advance(TAG_LEN);
                self.pending = Some(kind);
                kind
            }
        };

        // The inner codec rejects an oversized length before buffering the payload.
        match self.framing.decode(src) {
            Ok(Some(payload)) => {
                self.pending = None;
                Ok(Some(ControlMessage {
                    kind,
                    value: payload.freeze(),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(framing_error(e, src)),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.value.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::Oversized {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        tracing::trace!(kind = %item.kind, payload_bytes = len, "Encoding control frame");

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(item.kind.tag());
        self.framing.encode(item.value, dst)?;
        Ok(())
    }
}
