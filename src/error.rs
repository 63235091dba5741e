use thiserror::Error;

use crate::context::ContextHandle;
use crate::fifo::FifoError;
use crate::listen::ListenHandle;
use crate::session::SessionHandle;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Context {0} is not allocated")]
    UnknownContext(ContextHandle),

    #[error("Context {0} belongs to another worker")]
    WrongThread(ContextHandle),

    #[error("Context {0} has no crypto session")]
    NotInitialized(ContextHandle),

    #[error("Listener {0} is not registered")]
    UnknownListener(ListenHandle),

    #[error("Session {0} not found")]
    UnknownSession(SessionHandle),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("Crypto engine error: {0}")]
    Engine(#[from] crate::crypto::EngineError),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Offload engine is already configured")]
    OffloadLocked,

    #[error("Offload engine registration failed: {0}")]
    Offload(String),

    #[error("Resume requested for {0} while no handshake is outstanding")]
    NotHandshaking(ContextHandle),

    #[error("Context {0} has async operations in flight")]
    AsyncInFlight(ContextHandle),

    #[error("Datagram of {0} bytes exceeds scratch capacity {1}")]
    DatagramTooLarge(usize, usize),

    #[error("Fifo error: {0}")]
    Fifo(#[from] FifoError),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}
