use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use snaplink::artifact::Artifact;
use snaplink::error::TransferError;
use snaplink::transfer::{
    flush_outbound, send_artifact, send_caption, ControlMessage, InboundEvent, OutboundChannel,
    ReassemblyBuffer, CHUNK_SIZE, MAX_BUFFERED_AMOUNT,
};

// =============================================================================
// Mock channel
// =============================================================================

/// Everything the sender pushed through the channel, in order.
#[derive(Debug)]
enum Sent {
    Control(ControlMessage),
    Frame(Bytes),
}

/// In-memory channel with a simulated outbound buffer. Each frame adds
/// its length to the buffered amount; each drain wait removes a fixed
/// step, the way a live channel empties between low-watermark events.
struct MockChannel {
    open: bool,
    drain_step: usize,
    sent: Mutex<Vec<Sent>>,
    buffered: AtomicUsize,
    drain_waits: AtomicUsize,
    max_buffered_at_send: AtomicUsize,
}

impl MockChannel {
    fn new(open: bool, drain_step: usize) -> Self {
        Self {
            open,
            drain_step,
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            drain_waits: AtomicUsize::new(0),
            max_buffered_at_send: AtomicUsize::new(0),
        }
    }

    fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[async_trait]
impl OutboundChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        self.sent.lock().unwrap().push(Sent::Control(msg.clone()));
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransferError> {
        let before = self.buffered.load(Ordering::SeqCst);
        self.max_buffered_at_send.fetch_max(before, Ordering::SeqCst);
        self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
        self.sent.lock().unwrap().push(Sent::Frame(frame));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn drained(&self) {
        self.drain_waits.fetch_add(1, Ordering::SeqCst);
        let step = self.drain_step;
        self.buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(step))
            })
            .unwrap();
    }
}

fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

// =============================================================================
// Sender-to-receiver pipeline
// =============================================================================

#[tokio::test]
async fn test_send_then_reassemble_is_byte_identical() {
    let channel = MockChannel::new(true, usize::MAX);
    let payload = patterned_payload(70_000);
    let artifact = Artifact::new(
        Bytes::from(payload.clone()),
        "image/jpeg",
        "alice",
        Some("beach".to_string()),
    );

    send_artifact(&channel, &artifact).await.unwrap();

    let sent = channel.take_sent();
    // metadata first, then exactly ceil(70000 / 32768) = 3 frames
    assert_eq!(sent.len(), 4);
    match &sent[0] {
        Sent::Control(ControlMessage::Meta { id, size, .. }) => {
            assert_eq!(id, &artifact.meta.id);
            assert_eq!(*size, 70_000);
        }
        other => panic!("expected META first, got {other:?}"),
    }

    // replay the wire traffic into a receiver
    let mut buffer = ReassemblyBuffer::new();
    let mut completed = None;
    for item in &sent {
        let event = match item {
            Sent::Control(msg) => buffer.handle_control(msg.clone()),
            Sent::Frame(frame) => buffer.handle_binary(frame),
        };
        if let Some(InboundEvent::Completed(artifact)) = event {
            completed = Some(artifact);
        }
    }

    let received = completed.expect("transfer should complete");
    assert_eq!(received.bytes, payload);
    assert_eq!(received.meta.id, artifact.meta.id);
    assert_eq!(received.meta.caption.as_deref(), Some("beach"));
    assert_eq!(received.meta.size, 70_000);
}

#[tokio::test]
async fn test_chunks_sent_in_index_order() {
    let channel = MockChannel::new(true, usize::MAX);
    let artifact = Artifact::new(
        Bytes::from(patterned_payload(CHUNK_SIZE * 4)),
        "video/mp4",
        "bob",
        None,
    );

    send_artifact(&channel, &artifact).await.unwrap();

    let indices: Vec<u32> = channel
        .take_sent()
        .iter()
        .filter_map(|item| match item {
            Sent::Frame(frame) => {
                Some(u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]))
            }
            Sent::Control(_) => None,
        })
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_sender_waits_when_buffer_exceeds_ceiling() {
    // 2 MiB payload against a 1 MiB ceiling forces drain waits partway
    // through; each wait drains two chunks' worth.
    let channel = MockChannel::new(true, CHUNK_SIZE * 2);
    let artifact = Artifact::new(
        Bytes::from(patterned_payload(2 * MAX_BUFFERED_AMOUNT)),
        "video/mp4",
        "alice",
        None,
    );

    send_artifact(&channel, &artifact).await.unwrap();

    assert!(
        channel.drain_waits.load(Ordering::SeqCst) > 0,
        "sender never waited for drain"
    );
    // the ceiling check happens before every send: no chunk may be
    // queued while the buffer is already above the high watermark
    assert!(
        channel.max_buffered_at_send.load(Ordering::SeqCst) <= MAX_BUFFERED_AMOUNT,
        "chunk queued while buffer was above the ceiling"
    );
    // every chunk still went out
    let frames = channel
        .take_sent()
        .iter()
        .filter(|s| matches!(s, Sent::Frame(_)))
        .count();
    assert_eq!(frames, 2 * MAX_BUFFERED_AMOUNT / CHUNK_SIZE);
}

#[tokio::test]
async fn test_flush_waits_for_empty_outbound_buffer() {
    let channel = MockChannel::new(true, CHUNK_SIZE);
    let artifact = Artifact::new(
        Bytes::from(patterned_payload(CHUNK_SIZE * 3)),
        "image/png",
        "alice",
        None,
    );

    send_artifact(&channel, &artifact).await.unwrap();
    assert!(channel.buffered_amount().await > 0);

    flush_outbound(&channel).await;
    assert_eq!(channel.buffered_amount().await, 0);
    assert!(channel.drain_waits.load(Ordering::SeqCst) > 0);
}

// =============================================================================
// Channel-state edge cases
// =============================================================================

#[tokio::test]
async fn test_send_on_closed_channel_is_silent_noop() {
    let channel = MockChannel::new(false, usize::MAX);
    let artifact = Artifact::new(Bytes::from_static(b"data"), "image/png", "alice", None);

    send_artifact(&channel, &artifact).await.unwrap();
    assert!(channel.take_sent().is_empty());

    send_caption(&channel, "someid", "text").await.unwrap();
    assert!(channel.take_sent().is_empty());
}

#[tokio::test]
async fn test_caption_update_wire_shape() {
    let channel = MockChannel::new(true, usize::MAX);
    send_caption(&channel, "photo001", "golden hour")
        .await
        .unwrap();

    let sent = channel.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Control(ControlMessage::CaptionUpdate { id, text }) => {
            assert_eq!(id, "photo001");
            assert_eq!(text, "golden hour");
        }
        other => panic!("expected caption update, got {other:?}"),
    }
}
