//! Interface to the transport/session layer.
//!
//! The engine never owns sockets. It looks sessions up by handle, moves bytes
//! through their fifos and reports back through [`Transport`].

use std::fmt;

use crate::alpn::AlpnProto;
use crate::context::ContextHandle;
use crate::fifo::FifoRef;

/// Stable handle of a session: owning thread and index in that thread's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle {
    pub thread: u32,
    pub index: u32,
}

impl SessionHandle {
    /// Placeholder for a session that is not bound yet.
    pub const INVALID: SessionHandle = SessionHandle::new(u32::MAX, u32::MAX);

    pub const fn new(thread: u32, index: u32) -> Self {
        SessionHandle { thread, index }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.thread, self.index)
    }
}

/// Session states in the order the session layer moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Listening,
    Connecting,
    Accepting,
    Ready,
    Closing,
    Closed,
}

/// Byte framing used on a session's fifos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProto {
    /// TLS over a reliable byte stream.
    Stream,
    /// DTLS over datagrams framed with [`crate::bio::DgramHeader`].
    Datagram,
}

/// Snapshot of a session as seen by the engine.
///
/// Fifos are shared handles so a snapshot can be held while other sessions
/// are looked up.
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: SessionHandle,
    pub state: SessionState,
    pub rx_fifo: FifoRef,
    pub tx_fifo: FifoRef,
}

/// Per-call send parameters handed to the write pump by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendParams {
    /// Most bytes the pump may move in one call.
    pub max_burst: usize,
    /// Set by the pump when it descheduled the connection.
    pub descheduled: bool,
}

impl SendParams {
    pub fn new(max_burst: usize) -> Self {
        SendParams {
            max_burst,
            descheduled: false,
        }
    }
}

/// Identity of a TLS connection as reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ctx: ContextHandle,
    pub transport: SessionHandle,
    pub app: Option<SessionHandle>,
    pub proto: TransportProto,
    pub alpn: Option<AlpnProto>,
}

/// Why a client connect did not produce an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The crypto engine rejected the handshake.
    Protocol(String),
    /// The peer certificate did not verify and strict checking was on.
    Verification(String),
    /// The transport closed before the handshake finished.
    TransportClosed,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFailure::Protocol(e) => write!(f, "handshake failed: {}", e),
            HandshakeFailure::Verification(e) => write!(f, "certificate verification failed: {}", e),
            HandshakeFailure::TransportClosed => write!(f, "transport closed during handshake"),
        }
    }
}

/// The application refused a connect/accept notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

/// Services the session layer provides to the engine.
///
/// All calls happen on the worker that owns the connection.
pub trait Transport {
    /// Look a session up by handle.
    fn session(&self, handle: SessionHandle) -> Option<Session>;

    /// Ask the transport to send what was enqueued on the session's tx fifo.
    fn program_tx(&mut self, transport: SessionHandle);

    /// Queue another receive event so the read pump runs again.
    fn rearm_rx(&mut self, transport: SessionHandle);

    /// Stop offering this connection send opportunities.
    fn deschedule(&mut self, conn: &ConnectionInfo);

    /// Offer the application session another send opportunity.
    fn reschedule_tx(&mut self, app: SessionHandle);

    /// Close the transport session in both directions.
    fn disconnect_transport(&mut self, transport: SessionHandle);

    /// Half-close the transport session.
    fn shutdown_transport(&mut self, transport: SessionHandle);

    /// The client handshake finished. Returns the application session.
    fn app_connected(&mut self, conn: &ConnectionInfo) -> Result<SessionHandle, NotifyError>;

    /// The client handshake failed. Releases any pre-allocated app session.
    fn app_connect_failed(&mut self, conn: &ConnectionInfo, reason: HandshakeFailure);

    /// The server handshake finished. Returns the application session.
    fn app_accepted(&mut self, conn: &ConnectionInfo) -> Result<SessionHandle, NotifyError>;

    /// New data is in the app session's rx fifo.
    fn app_rx(&mut self, app: SessionHandle);

    /// Data was dequeued from the app session's tx fifo.
    fn app_dequeued(&mut self, app: SessionHandle);

    /// An unrecoverable error hit an established connection.
    fn app_io_error(&mut self, conn: &ConnectionInfo);

    /// The peer is closing.
    fn closing(&mut self, conn: &ConnectionInfo);

    /// The transport was reset.
    fn reset(&mut self, conn: &ConnectionInfo);

    /// The connection is closed on the transport side.
    fn closed(&mut self, conn: &ConnectionInfo);
}
