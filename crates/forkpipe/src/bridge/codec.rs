//! Binary codecs for the three message shapes.
//!
//! Every frame is self-delimiting and uses native byte order (all peers run
//! on the same host):
//! - `IntegerVector`: `count: i32` then `count × i32`
//! - `CommandDescriptor`: `length: i32` then `length` raw bytes (no NUL)
//! - `AggregateResult`: a bare `i32`
//!
//! Decoders return `Ok(None)` until a whole frame is buffered, so an empty
//! read is never a protocol failure on its own. The blocking helpers at the
//! bottom drive a codec over a [`ChannelEnd`].

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{AggregateResult, CommandDescriptor, IntegerVector};
use super::transport::{ChannelEnd, Interrupts, TransportError, pause};
use crate::config::PollPolicy;
use crate::error::Error;

const FIELD_LEN: usize = 4;

/// Upper bound on a decoded vector, to keep a corrupt header from
/// triggering a huge allocation.
pub const MAX_VECTOR_LEN: usize = 65_536;
pub const MAX_COMMAND_LEN: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("negative element count {0}")]
    NegativeCount(i32),

    #[error("element count {count} exceeds limit of {limit}")]
    CountTooLarge { count: i64, limit: usize },

    #[error("invalid command length {0}")]
    InvalidCommandLength(i64),

    #[error("command tag is not valid UTF-8")]
    NonUtf8Tag,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("codec I/O error: {0}")]
    Io(#[from] io::Error),
}

fn peek_i32(src: &BytesMut) -> Option<i32> {
    let head: [u8; FIELD_LEN] = src.get(..FIELD_LEN)?.try_into().ok()?;
    Some(i32::from_ne_bytes(head))
}

/// Reserves room for the rest of a frame and reports whether it is complete.
fn frame_ready(src: &mut BytesMut, needed: usize) -> bool {
    if src.len() < needed {
        src.reserve(needed - src.len());
        return false;
    }
    true
}

/// Codec for count-prefixed integer vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorCodec;

impl Decoder for VectorCodec {
    type Item = IntegerVector;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(count) = peek_i32(src) else {
            return Ok(None);
        };
        if count < 0 {
            return Err(ProtocolError::NegativeCount(count));
        }
        let count = count as usize;
        if count > MAX_VECTOR_LEN {
            return Err(ProtocolError::CountTooLarge {
                count: count as i64,
                limit: MAX_VECTOR_LEN,
            });
        }
        if !frame_ready(src, FIELD_LEN + count * FIELD_LEN) {
            return Ok(None);
        }

        src.advance(FIELD_LEN);
        let values = (0..count).map(|_| src.get_i32_ne()).collect();
        Ok(Some(IntegerVector::new(values)))
    }
}

impl Encoder<&IntegerVector> for VectorCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &IntegerVector, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let count = i32::try_from(item.len()).map_err(|_| ProtocolError::CountTooLarge {
            count: item.len() as i64,
            limit: i32::MAX as usize,
        })?;
        dst.reserve(FIELD_LEN * (item.len() + 1));
        dst.put_i32_ne(count);
        for &value in item.values() {
            dst.put_i32_ne(value);
        }
        Ok(())
    }
}

/// Codec for length-prefixed command tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = CommandDescriptor;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = peek_i32(src) else {
            return Ok(None);
        };
        if length <= 0 || length as usize > MAX_COMMAND_LEN {
            return Err(ProtocolError::InvalidCommandLength(length as i64));
        }
        let length = length as usize;
        if !frame_ready(src, FIELD_LEN + length) {
            return Ok(None);
        }

        src.advance(FIELD_LEN);
        let raw = src.split_to(length);
        let tag = String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::NonUtf8Tag)?;
        Ok(Some(CommandDescriptor::new(tag)))
    }
}

impl Encoder<&CommandDescriptor> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &CommandDescriptor, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = item.tag().as_bytes();
        let length = i32::try_from(tag.len())
            .map_err(|_| ProtocolError::InvalidCommandLength(tag.len() as i64))?;
        dst.reserve(FIELD_LEN + tag.len());
        dst.put_i32_ne(length);
        dst.put_slice(tag);
        Ok(())
    }
}

/// Codec for the bare aggregate integer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateCodec;

impl Decoder for AggregateCodec {
    type Item = AggregateResult;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !frame_ready(src, FIELD_LEN) {
            return Ok(None);
        }
        Ok(Some(AggregateResult(src.get_i32_ne())))
    }
}

impl Encoder<AggregateResult> for AggregateCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: AggregateResult, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_i32_ne(item.value());
        Ok(())
    }
}

/// Blocks until `codec` yields one frame from `end`.
///
/// End of stream before the frame is complete is a transport failure.
pub fn recv<D>(end: &mut ChannelEnd, codec: &mut D, intr: &mut dyn Interrupts) -> Result<D::Item, Error>
where
    D: Decoder<Error = ProtocolError>,
{
    loop {
        if let Some(item) = codec.decode(end.pending_mut())? {
            return Ok(item);
        }
        if end.fill(intr)? == 0 {
            return Err(TransportError::Closed {
                channel: end.label().to_string(),
                buffered: end.buffered(),
            }
            .into());
        }
    }
}

/// Like [`recv`], but treats an empty read as "not written yet" and retries
/// with exponential backoff, up to `policy.max_attempts` empty reads.
///
/// This is the only ordering guarantee between the Sum Worker's aggregate
/// and the Command Worker: if the upstream writer is slower than the bound,
/// the caller fails with `PollExhausted`.
pub fn poll_recv<D>(
    end: &mut ChannelEnd,
    codec: &mut D,
    policy: &PollPolicy,
    intr: &mut dyn Interrupts,
) -> Result<D::Item, Error>
where
    D: Decoder<Error = ProtocolError>,
{
    let mut empty_reads = 0u32;
    let mut delay = policy.initial_backoff;
    loop {
        if let Some(item) = codec.decode(end.pending_mut())? {
            if empty_reads > 0 {
                tracing::debug!(channel = end.label(), empty_reads, "Frame arrived after polling");
            }
            return Ok(item);
        }
        if end.fill(intr)? > 0 {
            continue;
        }

        empty_reads += 1;
        if empty_reads >= policy.max_attempts {
            return Err(TransportError::PollExhausted {
                channel: end.label().to_string(),
                attempts: empty_reads,
            }
            .into());
        }
        tracing::trace!(channel = end.label(), empty_reads, ?delay, "Empty read, backing off");
        pause(delay, intr)?;
        delay = delay.saturating_mul(2).min(policy.max_backoff);
    }
}

/// Encodes `item` and writes the whole frame to `end`.
pub fn send<T, E>(end: &mut ChannelEnd, codec: &mut E, item: T, intr: &mut dyn Interrupts) -> Result<(), Error>
where
    E: Encoder<T, Error = ProtocolError>,
{
    let mut frame = BytesMut::new();
    codec.encode(item, &mut frame)?;
    end.send_bytes(&frame, intr)?;
    Ok(())
}
