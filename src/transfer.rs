//! Chunked transfer protocol carried over the data channel.
//!
//! Two message shapes travel over the single ordered, reliable channel:
//! structured JSON control messages (metadata and caption updates) and
//! binary chunk frames. The sender splits an artifact into fixed-size
//! chunks and streams them in index order, pausing whenever the
//! channel's outbound buffer exceeds the high watermark. The receiver
//! reassembles chunks into slots keyed by transfer id and materializes
//! the artifact exactly once when every slot is filled.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::{Artifact, ArtifactMeta};
use crate::error::TransferError;

/// Fixed chunk payload size.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Backpressure ceiling: the sender never queues a chunk while the
/// channel reports more than this many buffered outbound bytes.
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// Width of the fixed id slot at the front of every chunk frame.
pub const ID_SLOT_LEN: usize = 8;

/// Chunk frame header: 8-byte id slot + 4-byte big-endian index.
pub const CHUNK_HEADER_LEN: usize = ID_SLOT_LEN + 4;

// ============================================================================
// Control messages
// ============================================================================

/// Structured messages exchanged as text on the data channel. The tag
/// set is closed: unrecognized tags fail to decode and are dropped with
/// a warning rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Announces an incoming artifact. Chunk count is derived from the
    /// declared byte size: ceil(size / CHUNK_SIZE).
    #[serde(rename = "META")]
    Meta {
        id: String,
        size: u64,
        #[serde(rename = "mimeType")]
        mime_type: String,
        sender: String,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },

    /// Out-of-band caption change for an already-materialized artifact.
    /// Routed to the application, never to the transfer buffer.
    #[serde(rename = "CAPTION_UPDATE")]
    CaptionUpdate { id: String, text: String },
}

/// Upper bound on the chunk count a single META may declare (32 GiB of
/// payload). Slot storage is allocated from the remote-declared size
/// before any payload arrives, so the count is capped rather than
/// trusted.
pub const MAX_CHUNKS_PER_TRANSFER: u64 = 1 << 20;

/// Number of chunks needed to cover `size` bytes.
pub fn num_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

// ============================================================================
// Chunk framing
// ============================================================================

/// The 8-character wire form of an artifact id: space-padded, truncated,
/// trailing padding stripped. Both sides key transfers by this form so
/// metadata and chunk frames agree even for ids longer than the slot.
pub fn wire_id(id: &str) -> String {
    String::from_utf8_lossy(&id_slot(id)).trim_end().to_string()
}

fn id_slot(id: &str) -> [u8; ID_SLOT_LEN] {
    let mut slot = [b' '; ID_SLOT_LEN];
    for (i, b) in id.bytes().take(ID_SLOT_LEN).enumerate() {
        slot[i] = b;
    }
    slot
}

/// Encode one chunk frame: id slot, big-endian index, payload.
pub fn encode_chunk_frame(id: &str, index: u32, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&id_slot(id));
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// A parsed chunk frame borrowing its payload from the wire buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub id: String,
    pub index: u32,
    pub payload: &'a [u8],
}

/// Parse a binary frame. Frames shorter than the fixed header are
/// malformed; anything past the header is payload.
pub fn parse_chunk_frame(data: &[u8]) -> Result<ChunkFrame<'_>, TransferError> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(TransferError::FrameTooShort { len: data.len() });
    }
    let id = String::from_utf8_lossy(&data[..ID_SLOT_LEN])
        .trim_end()
        .to_string();
    let index = u32::from_be_bytes([
        data[ID_SLOT_LEN],
        data[ID_SLOT_LEN + 1],
        data[ID_SLOT_LEN + 2],
        data[ID_SLOT_LEN + 3],
    ]);
    Ok(ChunkFrame {
        id,
        index,
        payload: &data[CHUNK_HEADER_LEN..],
    })
}

// ============================================================================
// Sender
// ============================================================================

/// Outbound side of the data channel, as the sender loop sees it.
///
/// The seam exists so the chunking/backpressure logic is testable
/// without a live peer; the production implementation wraps an
/// `RTCDataChannel`.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Whether the channel is currently open for sends.
    fn is_open(&self) -> bool;

    /// Send a structured message as text.
    async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError>;

    /// Send a binary chunk frame.
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransferError>;

    /// Bytes currently queued in the channel's outbound buffer.
    async fn buffered_amount(&self) -> usize;

    /// Resolves once the outbound buffer has drained below the channel's
    /// low threshold. Used instead of fixed-interval polling.
    async fn drained(&self);
}

/// Stream one artifact: metadata first, then chunks in strictly
/// increasing index order on the ordered, reliable channel.
///
/// A send attempted before the channel is open is a silent no-op - the
/// UI may attempt sends speculatively. Before every chunk the outbound
/// buffer is checked against [`MAX_BUFFERED_AMOUNT`]; while it is above
/// the ceiling the loop suspends on the drain signal.
pub async fn send_artifact<C>(channel: &C, artifact: &Artifact) -> Result<(), TransferError>
where
    C: OutboundChannel + ?Sized,
{
    if !channel.is_open() {
        log::debug!(
            "dropping send of artifact {} - channel not open",
            artifact.meta.id
        );
        return Ok(());
    }

    let meta = &artifact.meta;
    channel
        .send_control(&ControlMessage::Meta {
            id: meta.id.clone(),
            size: meta.size,
            mime_type: meta.mime_type.clone(),
            sender: meta.sender.clone(),
            timestamp: meta.timestamp,
            caption: meta.caption.clone(),
        })
        .await?;

    for (index, chunk) in artifact.bytes.chunks(CHUNK_SIZE).enumerate() {
        while channel.buffered_amount().await > MAX_BUFFERED_AMOUNT {
            channel.drained().await;
        }
        channel
            .send_frame(encode_chunk_frame(&meta.id, index as u32, chunk))
            .await?;
    }

    Ok(())
}

/// Broadcast a caption change for an already-delivered artifact.
/// Silent no-op if the channel is not open.
pub async fn send_caption<C>(channel: &C, id: &str, text: &str) -> Result<(), TransferError>
where
    C: OutboundChannel + ?Sized,
{
    if !channel.is_open() {
        log::debug!("dropping caption update for {} - channel not open", id);
        return Ok(());
    }
    channel
        .send_control(&ControlMessage::CaptionUpdate {
            id: id.to_string(),
            text: text.to_string(),
        })
        .await
}

/// Wait until the channel's outbound buffer is fully drained. Called
/// before teardown so queued chunks are not discarded with the channel.
pub async fn flush_outbound<C>(channel: &C)
where
    C: OutboundChannel + ?Sized,
{
    while channel.buffered_amount().await > 0 {
        channel.drained().await;
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// What the reassembly buffer produced for one inbound message.
#[derive(Debug)]
pub enum InboundEvent {
    /// All chunks arrived; the artifact is complete and byte-identical
    /// to the sender's payload. Emitted at most once per transfer id.
    Completed(Artifact),

    /// A chunk landed in a previously empty slot.
    Progress {
        id: String,
        received_chunks: u32,
        total_chunks: u32,
    },

    /// Caption update for the application layer.
    Caption { id: String, text: String },
}

/// One in-flight inbound transfer.
struct IncomingTransfer {
    meta: ArtifactMeta,
    slots: Vec<Option<Bytes>>,
    filled: u32,
}

impl IncomingTransfer {
    fn expected(&self) -> u32 {
        self.slots.len() as u32
    }

    fn is_complete(&self) -> bool {
        self.filled == self.expected()
    }

    fn materialize(self) -> Artifact {
        let mut bytes = Vec::with_capacity(self.meta.size as usize);
        for chunk in self.slots.into_iter().flatten() {
            bytes.extend_from_slice(&chunk);
        }
        Artifact {
            meta: self.meta,
            bytes: Bytes::from(bytes),
        }
    }
}

/// Receiver-side reassembly of interleaved inbound transfers, keyed by
/// the 8-character wire id. Purely synchronous: the session feeds it one
/// message at a time, so slot mutation is never concurrent with itself.
#[derive(Default)]
pub struct ReassemblyBuffer {
    transfers: HashMap<String, IncomingTransfer>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight transfers, for teardown logging.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Handle an inbound text payload. Undecodable messages (including
    /// unrecognized tags) are rejected with a warning.
    pub fn handle_text(&mut self, text: &str) -> Option<InboundEvent> {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(msg) => self.handle_control(msg),
            Err(e) => {
                log::warn!("rejecting undecodable control message: {e}");
                None
            }
        }
    }

    /// Handle a decoded control message.
    pub fn handle_control(&mut self, msg: ControlMessage) -> Option<InboundEvent> {
        match msg {
            ControlMessage::Meta {
                id,
                size,
                mime_type,
                sender,
                timestamp,
                caption,
            } => {
                let key = wire_id(&id);
                if self.transfers.contains_key(&key) {
                    // Idempotent against signaling retries: keep the
                    // existing buffer, ignore the duplicate.
                    log::debug!("ignoring duplicate META for in-flight transfer {key}");
                    return None;
                }
                let total = num_chunks(size);
                if total > MAX_CHUNKS_PER_TRANSFER {
                    log::warn!(
                        "rejecting META for {key}: declared size {size} exceeds the transfer bound"
                    );
                    return None;
                }
                let transfer = IncomingTransfer {
                    meta: ArtifactMeta {
                        id,
                        mime_type,
                        sender,
                        timestamp,
                        caption,
                        size,
                    },
                    slots: vec![None; total as usize],
                    filled: 0,
                };
                if transfer.is_complete() {
                    // Zero-byte artifact: no chunks will follow.
                    return Some(InboundEvent::Completed(transfer.materialize()));
                }
                self.transfers.insert(key, transfer);
                None
            }
            ControlMessage::CaptionUpdate { id, text } => {
                Some(InboundEvent::Caption { id, text })
            }
        }
    }

    /// Handle an inbound binary frame.
    ///
    /// Frames for unknown ids are dropped silently - a chunk racing
    /// ahead of its metadata or trailing a completed transfer is a lost
    /// race, not a protocol error. Duplicate delivery of an already
    /// filled index never double-counts toward completion.
    pub fn handle_binary(&mut self, data: &[u8]) -> Option<InboundEvent> {
        let frame = match parse_chunk_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping malformed chunk frame: {e}");
                return None;
            }
        };

        let transfer = match self.transfers.get_mut(&frame.id) {
            Some(t) => t,
            None => {
                log::debug!(
                    "dropping orphan chunk {} for unknown transfer {}",
                    frame.index,
                    frame.id
                );
                return None;
            }
        };

        let index = frame.index as usize;
        if index >= transfer.slots.len() {
            log::warn!(
                "dropping out-of-range chunk {} for transfer {} ({} expected)",
                frame.index,
                frame.id,
                transfer.expected()
            );
            return None;
        }

        if transfer.slots[index].is_none() {
            transfer.slots[index] = Some(Bytes::copy_from_slice(frame.payload));
            transfer.filled += 1;
        }

        if transfer.is_complete() {
            let transfer = self
                .transfers
                .remove(&frame.id)
                .expect("transfer present by construction");
            return Some(InboundEvent::Completed(transfer.materialize()));
        }

        Some(InboundEvent::Progress {
            id: transfer.meta.id.clone(),
            received_chunks: transfer.filled,
            total_chunks: transfer.expected(),
        })
    }

    /// Discard every in-flight transfer. Partial artifacts are never
    /// surfaced.
    pub fn discard_all(&mut self) {
        if !self.transfers.is_empty() {
            log::info!(
                "discarding {} incomplete inbound transfer(s)",
                self.transfers.len()
            );
        }
        self.transfers.clear();
    }
}
