//! TLS/DTLS termination over transport fifos.
//!
//! The engine sits between a session layer and an external crypto library.
//! It never touches sockets: ciphertext moves through the transport
//! session's fifos and plaintext through the application session's fifos.
//!
//! * [`TlsMain`] is the process state: configuration, crypto provider, trust
//!   store and listeners.
//! * [`Worker`] is the per-thread engine. It owns a pool of
//!   [`ConnectionContext`]s and implements [`TlsEngine`], the calls the
//!   session layer makes.
//! * The session layer implements [`Transport`] so the engine can find
//!   sessions and report events upward.
//!
//! Engine calls never block. A handshake or record operation that cannot
//! proceed returns and is driven again by the next transport event or by an
//! async offload completion ([`Worker::poll_async`]).

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

pub mod alpn;
pub mod bio;
pub mod buffer;
pub mod certificate;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod fifo;
mod handshake;
pub mod listen;
pub mod offload;
pub mod pool;
mod pump;
pub mod session;
pub mod trust;

mod error;

pub use alpn::AlpnProto;
pub use certificate::CertKeyPair;
pub use config::{Config, ConfigBuilder, OffloadSettings};
pub use context::{ConnFlags, ConnectionContext, ContextHandle, HandshakeState};
pub use crypto::{ClientParams, CryptoProvider, CryptoSession, Progress, Role, ServerSetup, Want};
pub use engine::{TlsEngine, TlsMain, Worker};
pub use error::Error;
pub use listen::{ListenHandle, ListenParams};
pub use pool::DetachedContext;
pub use pump::{CTRL_BYTES, MAX_READ_LEN, MIN_ENQ_SPACE};
pub use session::{
    ConnectionInfo, HandshakeFailure, NotifyError, SendParams, Session, SessionHandle,
    SessionState, Transport, TransportProto,
};
