//! Delimiter framing codec
//!
//! Splits a byte stream on [`COMMAND_DELIMITER`] and parses each non-empty
//! segment into a [`CommandRecord`]. Records are only yielded once their
//! delimiter has fully arrived, so the output does not depend on how the
//! transport fragments its reads.

use crate::command::{CommandRecord, COMMAND_DELIMITER};
use crate::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default bound on bytes buffered without seeing a delimiter
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DelimiterCodec {
    max_length: usize,
    /// Offset into the buffer where the previous delimiter search stopped
    next_index: usize,
    /// Dropping an oversized segment until its delimiter shows up
    is_discarding: bool,
}

impl DelimiterCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            is_discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn find_delimiter(&self, src: &[u8]) -> Option<usize> {
        // a delimiter may straddle the previous search boundary
        let start = self
            .next_index
            .saturating_sub(COMMAND_DELIMITER.len() - 1)
            .min(src.len());

        src[start..]
            .windows(COMMAND_DELIMITER.len())
            .position(|window| window == COMMAND_DELIMITER)
            .map(|offset| start + offset)
    }

    /// Drop everything except a possible delimiter prefix at the tail
    fn discard_buffered(&mut self, src: &mut BytesMut) {
        let keep = COMMAND_DELIMITER.len() - 1;
        if src.len() > keep {
            src.advance(src.len() - keep);
        }
        self.next_index = src.len();
    }
}

impl Default for DelimiterCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DelimiterCodec {
    type Item = CommandRecord;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(position) = self.find_delimiter(src) else {
                if self.is_discarding {
                    self.discard_buffered(src);
                    return Ok(None);
                }

                if src.len() > self.max_length {
                    let buffered = src.len();
                    self.is_discarding = true;
                    self.discard_buffered(src);
                    return Err(ProtocolError::PacketSizeExceeded(buffered, self.max_length));
                }

                self.next_index = src.len();
                return Ok(None);
            };

            let frame = src.split_to(position + COMMAND_DELIMITER.len());
            self.next_index = 0;

            if self.is_discarding {
                self.is_discarding = false;
                continue;
            }

            let segment = &frame[..position];
            if segment.is_empty() {
                continue;
            }

            if segment.len() > self.max_length {
                return Err(ProtocolError::PacketSizeExceeded(
                    segment.len(),
                    self.max_length,
                ));
            }

            let text = std::str::from_utf8(segment).map_err(|e| {
                ProtocolError::InvalidPacket(format!("record is not valid UTF-8: {}", e))
            })?;

            if let Some(record) = CommandRecord::parse(text) {
                return Ok(Some(record));
            }
        }
    }
}

impl Encoder<CommandRecord> for DelimiterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: CommandRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();

        if wire
            .as_bytes()
            .windows(COMMAND_DELIMITER.len())
            .any(|window| window == COMMAND_DELIMITER)
        {
            return Err(ProtocolError::InvalidPacket(format!(
                "'{}' payload contains the record delimiter",
                item.keyword
            )));
        }

        dst.reserve(wire.len() + COMMAND_DELIMITER.len());
        dst.put_slice(wire.as_bytes());
        dst.put_slice(COMMAND_DELIMITER);
        Ok(())
    }
}
