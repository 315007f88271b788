//! Connection session: the one object the surrounding application
//! touches.
//!
//! Composes the handshake coordinator and the transfer protocol behind
//! a single lifecycle (create -> connect -> open -> send/receive ->
//! close) and emits everything the application needs on one event
//! channel - no UI callbacks, no process-wide state. Inbound messages
//! are pumped by a single task, one message handled to completion at a
//! time, so the reassembly buffer is never mutated concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::artifact::Artifact;
use crate::error::{SignalError, TransferError};
use crate::handshake::{
    setup_channel_handlers, ChannelMessage, HandshakeCoordinator, HandshakeState, SessionStatus,
};
use crate::transfer::{
    self, ControlMessage, InboundEvent, ReassemblyBuffer, MAX_BUFFERED_AMOUNT,
};

/// Buffered-amount level at which the channel signals drain.
const BUFFERED_LOW_THRESHOLD: usize = MAX_BUFFERED_AMOUNT / 2;

/// Everything the session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    Status(SessionStatus),
    ArtifactReceived(Artifact),
    Progress {
        id: String,
        received_chunks: u32,
        total_chunks: u32,
    },
    CaptionUpdate {
        id: String,
        text: String,
    },
}

/// One peer-to-peer session: a single connection, a single data channel,
/// owned by the caller and torn down with [`ConnectionSession::close`].
pub struct ConnectionSession {
    coordinator: Arc<Mutex<HandshakeCoordinator>>,
    outbound: Arc<Mutex<Option<Arc<ChannelOutbound>>>>,
    message_tx: mpsc::Sender<ChannelMessage>,
    status_tx: mpsc::UnboundedSender<SessionStatus>,
    pump_task: JoinHandle<()>,
    status_task: JoinHandle<()>,
    attach_task: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Create an idle session and the event stream it reports on.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let (message_tx, mut message_rx) = mpsc::channel::<ChannelMessage>(128);

        let coordinator = Arc::new(Mutex::new(
            HandshakeCoordinator::new(status_tx.clone()).await?,
        ));

        // Status forwarder: mirrors channel-open/-failure into the
        // handshake state machine and republishes on the event stream.
        let status_coordinator = coordinator.clone();
        let status_event_tx = event_tx.clone();
        let status_task = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                match status {
                    SessionStatus::Connected => status_coordinator.lock().await.mark_connected(),
                    SessionStatus::Error => status_coordinator.lock().await.mark_failed(),
                    _ => {}
                }
                if status_event_tx.send(SessionEvent::Status(status)).is_err() {
                    break;
                }
            }
        });

        // Inbound pump: the only place the reassembly buffer is touched.
        let pump_task = tokio::spawn(async move {
            let mut buffer = ReassemblyBuffer::new();
            while let Some(msg) = message_rx.recv().await {
                let event = match msg {
                    ChannelMessage::Text(text) => buffer.handle_text(&text),
                    ChannelMessage::Binary(data) => buffer.handle_binary(&data),
                };
                let Some(event) = event else { continue };
                let event = match event {
                    InboundEvent::Completed(artifact) => SessionEvent::ArtifactReceived(artifact),
                    InboundEvent::Progress {
                        id,
                        received_chunks,
                        total_chunks,
                    } => SessionEvent::Progress {
                        id,
                        received_chunks,
                        total_chunks,
                    },
                    InboundEvent::Caption { id, text } => SessionEvent::CaptionUpdate { id, text },
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            buffer.discard_all();
        });

        Ok((
            Self {
                coordinator,
                outbound: Arc::new(Mutex::new(None)),
                message_tx,
                status_tx,
                pump_task,
                status_task,
                attach_task: None,
            },
            event_rx,
        ))
    }

    /// Offer side: allocate the channel, return the compacted offer code
    /// to show as QR / paste text / link parameter.
    pub async fn create_offer(&mut self) -> Result<String, SignalError> {
        let mut coordinator = self.coordinator.lock().await;
        let code = coordinator.create_offer().await?;
        if let Some(dc) = coordinator.take_local_channel() {
            drop(coordinator);
            self.attach_channel(dc).await;
        }
        Ok(code)
    }

    /// Answer side: install the remote offer code and return the answer
    /// code for the return trip.
    pub async fn create_answer(&mut self, remote_offer: &str) -> Result<String, SignalError> {
        let mut coordinator = self.coordinator.lock().await;
        let code = coordinator.create_answer(remote_offer).await?;
        let channel_rx = coordinator.take_data_channel_rx();
        drop(coordinator);

        // The offerer's channel announces itself once connectivity is
        // up; attach it as soon as it arrives.
        if let Some(mut channel_rx) = channel_rx {
            let outbound = self.outbound.clone();
            let message_tx = self.message_tx.clone();
            let status_tx = self.status_tx.clone();
            self.attach_task = Some(tokio::spawn(async move {
                if let Some(dc) = channel_rx.recv().await {
                    setup_channel_handlers(&dc, message_tx, status_tx);
                    let channel = Arc::new(ChannelOutbound::new(dc).await);
                    *outbound.lock().await = Some(channel);
                }
            }));
        }
        Ok(code)
    }

    /// Offer side: install the pasted/scanned answer code.
    pub async fn accept_answer(&mut self, remote_answer: &str) -> Result<(), SignalError> {
        self.coordinator.lock().await.accept_answer(remote_answer).await
    }

    /// Stream an artifact to the peer. A send before the channel is
    /// open, or against a channel that died mid-transfer, is dropped
    /// silently - the UI may attempt sends speculatively.
    pub async fn send(&self, artifact: &Artifact) {
        let Some(channel) = self.outbound.lock().await.clone() else {
            log::debug!("send of {} before channel attached - dropped", artifact.meta.id);
            return;
        };
        if let Err(e) = transfer::send_artifact(channel.as_ref(), artifact).await {
            log::warn!("transfer of {} aborted: {e}", artifact.meta.id);
        }
    }

    /// Broadcast a caption change for an already-delivered artifact.
    pub async fn broadcast_caption(&self, id: &str, text: &str) {
        let Some(channel) = self.outbound.lock().await.clone() else {
            log::debug!("caption update for {id} before channel attached - dropped");
            return;
        };
        if let Err(e) = transfer::send_caption(channel.as_ref(), id, text).await {
            log::warn!("caption update for {id} failed: {e}");
        }
    }

    /// Wait until everything queued on the data channel has left its
    /// outbound buffer. Call after a send, before `close`, so buffered
    /// chunks are not discarded with the channel.
    pub async fn flush(&self) {
        let Some(channel) = self.outbound.lock().await.clone() else {
            return;
        };
        transfer::flush_outbound(channel.as_ref()).await;
    }

    /// Current handshake state.
    pub async fn state(&self) -> HandshakeState {
        self.coordinator.lock().await.state()
    }

    /// Tear down channel and connection. In-flight inbound transfers
    /// are discarded; partial artifacts are never surfaced.
    pub async fn close(&mut self) {
        if let Some(task) = self.attach_task.take() {
            task.abort();
        }
        if let Some(channel) = self.outbound.lock().await.take() {
            channel.close().await;
        }
        if let Err(e) = self.coordinator.lock().await.close().await {
            log::warn!("error closing peer connection: {e}");
        }
        self.pump_task.abort();
        self.status_task.abort();
    }

    async fn attach_channel(&mut self, dc: Arc<RTCDataChannel>) {
        setup_channel_handlers(&dc, self.message_tx.clone(), self.status_tx.clone());
        let channel = Arc::new(ChannelOutbound::new(dc).await);
        *self.outbound.lock().await = Some(channel);
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(task) = &self.attach_task {
            task.abort();
        }
        self.pump_task.abort();
        self.status_task.abort();
    }
}

// ============================================================================
// Outbound channel wrapper
// ============================================================================

/// The live data channel as the sender loop sees it: sends, buffered
/// byte count, and a drain signal driven by the channel's
/// buffered-amount-low callback.
pub struct ChannelOutbound {
    dc: Arc<RTCDataChannel>,
    drained: Arc<Notify>,
}

impl ChannelOutbound {
    pub async fn new(dc: Arc<RTCDataChannel>) -> Self {
        let drained = Arc::new(Notify::new());
        dc.set_buffered_amount_low_threshold(BUFFERED_LOW_THRESHOLD)
            .await;
        let notify = drained.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            notify.notify_waiters();
            Box::pin(async {})
        }))
        .await;
        Self { dc, drained }
    }

    pub async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            log::warn!("error closing data channel: {e}");
        }
    }
}

#[async_trait]
impl transfer::OutboundChannel for ChannelOutbound {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        let json = serde_json::to_string(msg)?;
        self.dc
            .send_text(json)
            .await
            .map_err(TransferError::ChannelSend)?;
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransferError> {
        self.dc
            .send(&frame)
            .await
            .map_err(TransferError::ChannelSend)?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn drained(&self) {
        // Bounded wait: the low-watermark event may fire between the
        // caller's buffer check and this registration, so re-check the
        // ceiling periodically rather than parking forever.
        let _ = tokio::time::timeout(Duration::from_millis(250), self.drained.notified()).await;
    }
}
