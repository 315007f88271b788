//! Handshake coordination: one peer connection, one data channel,
//! driven from an out-of-band code exchange.
//!
//! The coordinator wraps a single `RTCPeerConnection` and walks it
//! through offer or answer creation with vanilla (non-trickle) ICE:
//! local candidate gathering is awaited, bounded by a short timeout,
//! so all candidates ride inside the compacted code and no further
//! signaling round-trips are needed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::SignalError;
use crate::signaling::{self, SignalRole};

/// STUN servers for NAT traversal (server-reflexive candidates).
const STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Label of the single data channel carrying the transfer protocol.
const DATA_CHANNEL_LABEL: &str = "snap-sync";

/// Bound on the vanilla-ICE gathering wait. Host and server-reflexive
/// candidates usually arrive within milliseconds; a short cutoff keeps
/// the code-generation step responsive for a QR interaction.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_millis(1500);

/// Where the handshake currently stands. One coordinator walks exactly
/// one path: offer side or answer side, never both. The answer side has
/// no intermediate state after `AnswerCreated`: nothing further is
/// expected out-of-band, so it moves straight to `Connected` when the
/// data channel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    OfferCreated,
    AwaitingRemote,
    AnswerCreated,
    Connected,
    Failed,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::OfferCreated => "offer_created",
            HandshakeState::AwaitingRemote => "awaiting_remote",
            HandshakeState::AnswerCreated => "answer_created",
            HandshakeState::Connected => "connected",
            HandshakeState::Failed => "failed",
        }
    }
}

/// Connection status reported asynchronously to the session owner.
/// `Connected` means the data channel itself is open, not merely that
/// ICE connectivity was established - the channel is what carries the
/// transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Gathering,
    Ready,
    Connected,
    Disconnected,
    Error,
}

/// An inbound data-channel message, with the text/binary distinction
/// the wire contract depends on.
#[derive(Debug)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Drives one peer connection through the two-step handshake.
pub struct HandshakeCoordinator {
    peer_connection: Arc<RTCPeerConnection>,
    state: HandshakeState,
    gathering_rx: watch::Receiver<RTCIceGathererState>,
    data_channel_rx: Option<mpsc::Receiver<Arc<RTCDataChannel>>>,
    local_channel: Option<Arc<RTCDataChannel>>,
    status_tx: mpsc::UnboundedSender<SessionStatus>,
}

impl HandshakeCoordinator {
    /// Create a fresh coordinator around a new peer connection.
    /// Status transitions are delivered on `status_tx`.
    pub async fn new(status_tx: mpsc::UnboundedSender<SessionStatus>) -> Result<Self, SignalError> {
        let ice_servers = vec![RTCIceServer {
            urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }];
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let (gathering_tx, gathering_rx) = watch::channel(RTCIceGathererState::New);
        let (data_channel_tx, data_channel_rx) = mpsc::channel(1);

        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            if gathering_tx.send(state).is_err() {
                log::warn!("failed to forward ICE gathering state - receiver dropped");
            }
            Box::pin(async {})
        }));

        // Incoming data channel (answer side: the offerer allocates it).
        peer_connection.on_data_channel(Box::new(move |dc| {
            let data_channel_tx = data_channel_tx.clone();
            let label = dc.label().to_string();
            Box::pin(async move {
                if data_channel_tx.send(dc).await.is_err() {
                    log::warn!("failed to forward data channel '{}' - receiver dropped", label);
                }
            })
        }));

        let pc_status_tx = status_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let pc_status_tx = pc_status_tx.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        log::info!("peer connection established");
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        let _ = pc_status_tx.send(SessionStatus::Disconnected);
                    }
                    RTCPeerConnectionState::Failed => {
                        log::error!("peer connection failed");
                        let _ = pc_status_tx.send(SessionStatus::Error);
                    }
                    _ => {}
                }
            })
        }));

        Ok(Self {
            peer_connection,
            state: HandshakeState::Idle,
            gathering_rx,
            data_channel_rx: Some(data_channel_rx),
            local_channel: None,
            status_tx,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Allocate the data channel, generate a local offer, wait for
    /// candidate gathering and return the compacted `o|` code.
    pub async fn create_offer(&mut self) -> Result<String, SignalError> {
        self.ensure_idle("create_offer")?;
        self.emit(SessionStatus::Gathering);

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await?;
        self.local_channel = Some(dc);

        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.wait_for_gathering().await;

        let local = self.local_description().await?;
        self.state = HandshakeState::OfferCreated;
        self.emit(SessionStatus::Ready);
        Ok(signaling::encode(SignalRole::Offer, &local.sdp))
    }

    /// Install a remote offer code, generate the local answer and return
    /// the compacted `a|` code.
    pub async fn create_answer(&mut self, remote_offer: &str) -> Result<String, SignalError> {
        self.ensure_idle("create_answer")?;
        let sdp = signaling::expand_as(remote_offer, SignalRole::Offer)?;
        self.emit(SessionStatus::Gathering);

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|_| SignalError::MalformedCode("payload is not a session description"))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(SignalError::HandshakeRejected)?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        self.wait_for_gathering().await;

        let local = self.local_description().await?;
        self.state = HandshakeState::AnswerCreated;
        self.emit(SessionStatus::Ready);
        Ok(signaling::encode(SignalRole::Answer, &local.sdp))
    }

    /// Install the remote answer onto the offering side's connection.
    pub async fn accept_answer(&mut self, remote_answer: &str) -> Result<(), SignalError> {
        if self.state != HandshakeState::OfferCreated {
            return Err(SignalError::InvalidState {
                op: "accept_answer",
                state: self.state.name(),
            });
        }
        let sdp = signaling::expand_as(remote_answer, SignalRole::Answer)?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|_| SignalError::MalformedCode("payload is not a session description"))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(SignalError::HandshakeRejected)?;
        self.state = HandshakeState::AwaitingRemote;
        Ok(())
    }

    /// The locally allocated data channel (offer side only).
    pub fn take_local_channel(&mut self) -> Option<Arc<RTCDataChannel>> {
        self.local_channel.take()
    }

    /// Receiver yielding the remotely allocated data channel (answer
    /// side only).
    pub fn take_data_channel_rx(&mut self) -> Option<mpsc::Receiver<Arc<RTCDataChannel>>> {
        self.data_channel_rx.take()
    }

    /// Record that the data channel opened.
    pub fn mark_connected(&mut self) {
        self.state = HandshakeState::Connected;
    }

    /// Record a terminal failure.
    pub fn mark_failed(&mut self) {
        self.state = HandshakeState::Failed;
    }

    /// Tear down the underlying connection.
    pub async fn close(&mut self) -> Result<(), SignalError> {
        self.peer_connection.close().await?;
        Ok(())
    }

    fn ensure_idle(&self, op: &'static str) -> Result<(), SignalError> {
        if self.state != HandshakeState::Idle {
            return Err(SignalError::InvalidState {
                op,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn emit(&self, status: SessionStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Wait until local candidate gathering completes, or the bounded
    /// timeout elapses - whatever host/srflx candidates arrived by then
    /// are almost always enough for a direct connection.
    async fn wait_for_gathering(&mut self) {
        let mut gathering_rx = self.gathering_rx.clone();
        let complete = async move {
            loop {
                if *gathering_rx.borrow() == RTCIceGathererState::Complete {
                    break;
                }
                if gathering_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, complete).await.is_err() {
            log::debug!(
                "ICE gathering still incomplete after {:?}, proceeding with partial candidates",
                ICE_GATHER_TIMEOUT
            );
        }
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, SignalError> {
        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                SignalError::Transport(webrtc::Error::new(
                    "local description missing after gathering".to_owned(),
                ))
            })
    }
}

/// Wire a data channel's callbacks into tokio channels: open/close onto
/// the status stream, inbound messages onto `message_tx` preserving the
/// text/binary distinction.
pub fn setup_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    message_tx: mpsc::Sender<ChannelMessage>,
    status_tx: mpsc::UnboundedSender<SessionStatus>,
) {
    let label = dc.label().to_string();

    {
        let status_tx = status_tx.clone();
        let label = label.clone();
        dc.on_open(Box::new(move || {
            log::info!("data channel '{}' open", label);
            let _ = status_tx.send(SessionStatus::Connected);
            Box::pin(async {})
        }));
    }

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            let msg = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelMessage::Text(text),
                    Err(_) => {
                        log::warn!("dropping non-UTF-8 text message");
                        return;
                    }
                }
            } else {
                ChannelMessage::Binary(msg.data)
            };
            if message_tx.send(msg).await.is_err() {
                log::warn!("failed to forward data channel message - receiver dropped");
            }
        })
    }));

    {
        let label = label.clone();
        dc.on_error(Box::new(move |err| {
            log::error!("data channel '{}' error: {}", label, err);
            Box::pin(async {})
        }));
    }

    dc.on_close(Box::new(move || {
        log::info!("data channel '{}' closed", label);
        let _ = status_tx.send(SessionStatus::Disconnected);
        Box::pin(async {})
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling;

    fn status_sink() -> mpsc::UnboundedSender<SessionStatus> {
        // receiver dropped on purpose: emitted statuses are ignored
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[tokio::test]
    async fn test_compacted_codes_accepted_end_to_end() {
        let mut offerer = HandshakeCoordinator::new(status_sink()).await.unwrap();
        let mut answerer = HandshakeCoordinator::new(status_sink()).await.unwrap();

        // both compacted codes must survive the transport stack's own
        // session-description validation on the receiving side
        let offer_code = offerer.create_offer().await.unwrap();
        assert!(offer_code.starts_with("o|"));
        assert_eq!(offerer.state(), HandshakeState::OfferCreated);

        let answer_code = answerer.create_answer(&offer_code).await.unwrap();
        assert!(answer_code.starts_with("a|"));
        assert_eq!(answerer.state(), HandshakeState::AnswerCreated);

        offerer.accept_answer(&answer_code).await.unwrap();
        assert_eq!(offerer.state(), HandshakeState::AwaitingRemote);

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_answer_rejects_answer_code() {
        let mut coordinator = HandshakeCoordinator::new(status_sink()).await.unwrap();
        let code = format!("{}|v=0", SignalRole::Answer.marker());
        let err = coordinator.create_answer(&code).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::ProtocolMismatch {
                expected: "offer",
                found: "answer"
            }
        ));
        // the failed attempt must not advance the state machine
        assert_eq!(coordinator.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn test_accept_answer_requires_prior_offer() {
        let mut coordinator = HandshakeCoordinator::new(status_sink()).await.unwrap();
        let code = signaling::encode(SignalRole::Answer, "v=0\r\n");
        let err = coordinator.accept_answer(&code).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::InvalidState {
                op: "accept_answer",
                state: "idle"
            }
        ));
    }

    #[tokio::test]
    async fn test_create_answer_rejects_malformed_code() {
        let mut coordinator = HandshakeCoordinator::new(status_sink()).await.unwrap();
        let err = coordinator.create_answer("not-a-code").await.unwrap_err();
        assert!(matches!(err, SignalError::MalformedCode(_)));
    }
}
