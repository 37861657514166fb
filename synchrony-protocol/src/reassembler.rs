//! Chunk Reassembler
//!
//! Contact photos are too large for one record, so the phone sends them as a
//! sequence of `incoming_contact_photo_part` records sharing a transfer id:
//!
//! ```text
//! incoming_contact_photo_part: 12 | START 99871``;
//! incoming_contact_photo_part: 12 | iVBORw0KGgoAAAANSUhEUgAA``;
//! incoming_contact_photo_part: 12 | AAEAAAABCAYAAAAfFcSJAAAA``;
//! incoming_contact_photo_part: 12 | END``;
//! ```
//!
//! Each session owns one [`ChunkReassembler`]. Buffers are keyed by transfer
//! id; a `START` for an id that already has a buffer resets it. Buffers that
//! stop receiving chunks are evicted once they are older than the TTL.

use crate::command::PhotoPart;
use crate::models::ContactPhoto;
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const START_PREFIX: &str = "START ";
const END_MARKER: &str = "END";

/// Meaning of the data half of a photo part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMarker<'a> {
    Start(i64),
    Data(&'a str),
    End,
}

impl<'a> ChunkMarker<'a> {
    /// Classify a part's data
    ///
    /// `START` needs a following space and integer hash. The space never
    /// occurs in base64 text, so a data chunk can't be mistaken for a marker.
    pub fn parse(data: &'a str) -> Result<Self> {
        if data == END_MARKER {
            return Ok(ChunkMarker::End);
        }

        if let Some(hash) = data.strip_prefix(START_PREFIX) {
            let hash = hash.trim().parse().map_err(|_| {
                ProtocolError::InvalidPacket(format!("START marker with bad hash '{}'", hash))
            })?;
            return Ok(ChunkMarker::Start(hash));
        }

        Ok(ChunkMarker::Data(data))
    }
}

/// In-flight transfer
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    pub transfer_id: String,
    pub expected_hash: i64,
    pub accumulated: Vec<u8>,
    last_update: Instant,
}

/// A transfer whose `END` marker has arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub transfer_id: String,
    pub expected_hash: i64,
    /// Concatenation of every data chunk, still base64 text
    pub data: Vec<u8>,
}

impl CompletedTransfer {
    /// Decode into a photo for the store
    ///
    /// The transfer id is the contact's primary key.
    pub fn into_photo(self) -> Result<ContactPhoto> {
        let contact_id = self.transfer_id.trim().parse().map_err(|_| {
            ProtocolError::InvalidPacket(format!(
                "photo transfer id '{}' is not a contact id",
                self.transfer_id
            ))
        })?;

        Ok(ContactPhoto {
            contact_id,
            hash: self.expected_hash,
            data: STANDARD.decode(&self.data)?,
        })
    }
}

#[derive(Debug, Default)]
pub struct ChunkReassembler {
    buffers: HashMap<String, ChunkBuffer>,
    /// `None` keeps abandoned buffers forever
    ttl: Option<Duration>,
}

impl ChunkReassembler {
    /// Create a reassembler; a zero `ttl` disables eviction
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    /// Apply one part; returns the finished transfer on `END`
    pub fn feed(&mut self, part: &PhotoPart) -> Result<Option<CompletedTransfer>> {
        let now = Instant::now();

        match ChunkMarker::parse(&part.data)? {
            ChunkMarker::Start(hash) => {
                if self.buffers.contains_key(&part.transfer_id) {
                    warn!(
                        "Restarting photo transfer {} before it finished",
                        part.transfer_id
                    );
                }

                self.buffers.insert(
                    part.transfer_id.clone(),
                    ChunkBuffer {
                        transfer_id: part.transfer_id.clone(),
                        expected_hash: hash,
                        accumulated: Vec::new(),
                        last_update: now,
                    },
                );
                debug!("Photo transfer {} started", part.transfer_id);
                Ok(None)
            }
            ChunkMarker::Data(chunk) => {
                let buffer = self
                    .buffers
                    .get_mut(&part.transfer_id)
                    .ok_or_else(|| unknown_transfer(&part.transfer_id))?;
                buffer.accumulated.extend_from_slice(chunk.as_bytes());
                buffer.last_update = now;
                Ok(None)
            }
            ChunkMarker::End => {
                let buffer = self
                    .buffers
                    .remove(&part.transfer_id)
                    .ok_or_else(|| unknown_transfer(&part.transfer_id))?;
                debug!(
                    "Photo transfer {} complete ({} bytes)",
                    buffer.transfer_id,
                    buffer.accumulated.len()
                );
                Ok(Some(CompletedTransfer {
                    transfer_id: buffer.transfer_id,
                    expected_hash: buffer.expected_hash,
                    data: buffer.accumulated,
                }))
            }
        }
    }

    /// Drop buffers idle for longer than the TTL, returning their ids
    pub fn evict_stale(&mut self) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut evicted = Vec::new();
        self.buffers.retain(|id, buffer| {
            let keep = now.duration_since(buffer.last_update) <= ttl;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });

        for id in &evicted {
            warn!("Evicted abandoned photo transfer {}", id);
        }
        evicted
    }

    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, transfer_id: &str) -> Option<&ChunkBuffer> {
        self.buffers.get(transfer_id)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

fn unknown_transfer(transfer_id: &str) -> ProtocolError {
    ProtocolError::InvalidState(format!(
        "photo part for transfer {} without START",
        transfer_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(id: &str, data: &str) -> PhotoPart {
        PhotoPart {
            transfer_id: id.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_marker_parsing() {
        assert_eq!(ChunkMarker::parse("START -12").unwrap(), ChunkMarker::Start(-12));
        assert_eq!(ChunkMarker::parse("END").unwrap(), ChunkMarker::End);
        assert_eq!(ChunkMarker::parse("ENDING").unwrap(), ChunkMarker::Data("ENDING"));
        assert_eq!(
            ChunkMarker::parse("STARTabc").unwrap(),
            ChunkMarker::Data("STARTabc")
        );
        assert!(ChunkMarker::parse("START abc").is_err());
    }

    #[tokio::test]
    async fn test_reassembles_in_order() {
        let mut reassembler = ChunkReassembler::new(Duration::from_secs(300));
        let chunks = ["aGVs", "bG8g", "d29y", "bGQ="];

        assert!(reassembler.feed(&part("7", "START 42")).unwrap().is_none());
        for chunk in chunks {
            assert!(reassembler.feed(&part("7", chunk)).unwrap().is_none());
        }
        let done = reassembler.feed(&part("7", "END")).unwrap().unwrap();

        assert_eq!(done.data, chunks.concat().into_bytes());
        assert_eq!(done.expected_hash, 42);
        assert_eq!(reassembler.in_flight(), 0);

        let photo = done.into_photo().unwrap();
        assert_eq!(photo.contact_id, 7);
        assert_eq!(photo.data, b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_start_resets_existing_buffer() {
        let mut reassembler = ChunkReassembler::new(Duration::ZERO);
        reassembler.feed(&part("1", "START 1")).unwrap();
        reassembler.feed(&part("1", "stale")).unwrap();
        reassembler.feed(&part("1", "START 2")).unwrap();
        reassembler.feed(&part("1", "QQ==")).unwrap();

        let done = reassembler.feed(&part("1", "END")).unwrap().unwrap();
        assert_eq!(done.expected_hash, 2);
        assert_eq!(done.data, b"QQ==".to_vec());
    }

    #[tokio::test]
    async fn test_transfers_are_independent() {
        let mut reassembler = ChunkReassembler::new(Duration::ZERO);
        reassembler.feed(&part("1", "START 1")).unwrap();
        reassembler.feed(&part("2", "START 2")).unwrap();
        reassembler.feed(&part("1", "AA")).unwrap();
        reassembler.feed(&part("2", "BB")).unwrap();

        let two = reassembler.feed(&part("2", "END")).unwrap().unwrap();
        assert_eq!(two.data, b"BB".to_vec());
        assert_eq!(reassembler.buffer("1").unwrap().accumulated, b"AA".to_vec());
    }

    #[tokio::test]
    async fn test_chunk_without_start_is_rejected() {
        let mut reassembler = ChunkReassembler::default();
        let err = reassembler.feed(&part("9", "AAAA")).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
        assert!(reassembler.feed(&part("9", "END")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_buffers_are_evicted() {
        let mut reassembler = ChunkReassembler::new(Duration::from_secs(300));
        reassembler.feed(&part("old", "START 1")).unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        reassembler.feed(&part("new", "START 2")).unwrap();
        assert!(reassembler.evict_stale().is_empty());

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(reassembler.evict_stale(), vec!["old".to_string()]);
        assert!(reassembler.buffer("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_evicts() {
        let mut reassembler = ChunkReassembler::new(Duration::ZERO);
        reassembler.feed(&part("1", "START 1")).unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(reassembler.evict_stale().is_empty());
    }

    #[test]
    fn test_bad_base64_fails_decode() {
        let done = CompletedTransfer {
            transfer_id: "3".into(),
            expected_hash: 0,
            data: b"***".to_vec(),
        };
        assert!(matches!(done.into_photo(), Err(ProtocolError::Base64(_))));
    }
}
