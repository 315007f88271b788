pub mod artifact;
pub mod error;
pub mod handshake;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transfer;

pub use artifact::{Artifact, ArtifactMeta};
pub use error::{SignalError, TransferError};
pub use session::{ConnectionSession, SessionEvent};
