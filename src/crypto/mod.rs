//! Interface to the crypto engine that runs the TLS/DTLS state machine.
//!
//! The engine is external. A [`CryptoProvider`] builds sessions: servers go
//! through a per-listener [`ServerSetup`], clients get a session per connect.
//! Every [`CryptoSession`] call is non-blocking and reports suspension as
//! [`Progress::Blocked`] instead of failing.

use std::sync::Arc;

use thiserror::Error;

use crate::alpn::AlpnProto;
use crate::bio::FifoIo;
use crate::certificate::CertKeyPair;
use crate::config::{Config, OffloadSettings};
use crate::listen::ListenParams;
use crate::offload::AsyncNotifier;
use crate::session::TransportProto;
use crate::trust::TrustStore;
use crate::Error;

mod rustls_provider;

pub use rustls_provider::RustlsProvider;

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// What a blocked operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// More ciphertext from the transport.
    Read,
    /// Room in the transport tx fifo.
    Write,
    /// An offloaded operation to complete. The session signals completion
    /// through its [`AsyncNotifier`].
    Async,
}

/// Outcome of a non-blocking engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    Blocked(Want),
}

impl<T> Progress<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }
}

/// Fatal engine errors. Transient conditions are [`Progress::Blocked`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(String),
}

/// Per-connect parameters for a client session.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub proto: TransportProto,
    /// Name to verify the server certificate against. `None` relaxes the
    /// verification policy.
    pub hostname: Option<String>,
    /// Protocols to advertise, in preference order.
    pub alpn: Vec<AlpnProto>,
    /// Optional client certificate.
    pub cert_key: Option<Arc<CertKeyPair>>,
}

impl ClientParams {
    pub fn new(proto: TransportProto) -> Self {
        ClientParams {
            proto,
            hostname: None,
            alpn: Vec::new(),
            cert_key: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_alpn(mut self, alpn: &[AlpnProto]) -> Self {
        self.alpn = alpn.to_vec();
        self
    }

    pub fn with_cert_key(mut self, cert_key: Arc<CertKeyPair>) -> Self {
        self.cert_key = Some(cert_key);
        self
    }
}

/// Engine session for one connection.
pub trait CryptoSession: Send {
    fn role(&self) -> Role;

    /// Whether a handshake (initial or renegotiation) is in progress.
    fn in_init(&self) -> bool;

    /// Run one handshake step.
    fn handshake(&mut self, io: &mut FifoIo) -> Result<Progress<()>, EngineError>;

    /// Decrypt into `buf`. `Ready(0)` means the peer sent close_notify.
    fn read(&mut self, io: &mut FifoIo, buf: &mut [u8]) -> Result<Progress<usize>, EngineError>;

    /// Encrypt from `data`. May accept fewer bytes than offered.
    fn write(&mut self, io: &mut FifoIo, data: &[u8]) -> Result<Progress<usize>, EngineError>;

    /// Send close_notify, best effort.
    fn shutdown(&mut self, io: &mut FifoIo) -> Result<(), EngineError>;

    /// Plaintext already decrypted and buffered inside the engine.
    fn pending(&self) -> usize;

    /// Whether the engine holds ciphertext it could not hand to the transport.
    fn has_pending_output(&self) -> bool;

    /// Wire id of the negotiated application protocol.
    fn alpn_selected(&self) -> Option<Vec<u8>>;

    /// Outcome of peer certificate verification. Servers report `Ok`.
    fn verify_result(&self) -> Result<(), String>;

    /// Name of the negotiated cipher suite.
    fn cipher_name(&self) -> Option<String>;

    /// Point async completions at a (possibly different) worker.
    fn set_async_notifier(&mut self, notifier: Option<AsyncNotifier>);
}

/// Shared server configuration built once per listener.
pub trait ServerSetup: Send + Sync {
    fn new_session(
        &self,
        notifier: Option<AsyncNotifier>,
    ) -> Result<Box<dyn CryptoSession>, Error>;
}

/// Factory for engine sessions.
pub trait CryptoProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn server_setup(
        &self,
        config: &Config,
        params: &ListenParams,
    ) -> Result<Arc<dyn ServerSetup>, Error>;

    fn client_session(
        &self,
        config: &Config,
        trust: Option<&TrustStore>,
        params: &ClientParams,
        notifier: Option<AsyncNotifier>,
    ) -> Result<Box<dyn CryptoSession>, Error>;

    /// Bind a hardware offload engine. Called once per process.
    fn register_offload(&self, settings: &OffloadSettings) -> Result<(), Error> {
        let _ = settings;
        Err(Error::Unsupported("async offload"))
    }
}
