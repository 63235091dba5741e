//! Per-connection state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::alpn::AlpnProto;
use crate::bio::{Bio, FifoIo};
use crate::certificate::CertKeyPair;
use crate::crypto::{CryptoSession, Role};
use crate::listen::ListenContext;
use crate::offload::{AsyncEvent, AsyncKind};
use crate::session::{ConnectionInfo, SessionHandle, Transport, TransportProto};

/// Stable handle of a context: owning worker and slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle {
    pub thread: u32,
    pub index: u32,
}

impl ContextHandle {
    pub const fn new(thread: u32, index: u32) -> Self {
        ContextHandle { thread, index }
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.thread, self.index)
    }
}

/// Connection flags.
///
/// All bits are sticky except `RESUME`, and `MIGRATED` which attach clears.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnFlags(u16);

impl ConnFlags {
    pub const HS_DONE: ConnFlags = ConnFlags(1 << 0);
    pub const PASSIVE_CLOSE: ConnFlags = ConnFlags(1 << 1);
    pub const APP_CLOSED: ConnFlags = ConnFlags(1 << 2);
    pub const SHUTDOWN_TRANSPORT: ConnFlags = ConnFlags(1 << 3);
    pub const MIGRATED: ConnFlags = ConnFlags(1 << 4);
    pub const RESUME: ConnFlags = ConnFlags(1 << 5);
    pub const NO_APP_SESSION: ConnFlags = ConnFlags(1 << 6);
    pub const CLOSE_CONFIRMED: ConnFlags = ConnFlags(1 << 7);
    pub const CLOSE_DEFERRED: ConnFlags = ConnFlags(1 << 8);
    pub const FREE_DEFERRED: ConnFlags = ConnFlags(1 << 9);

    const NAMES: [(ConnFlags, &'static str); 10] = [
        (Self::HS_DONE, "HS_DONE"),
        (Self::PASSIVE_CLOSE, "PASSIVE_CLOSE"),
        (Self::APP_CLOSED, "APP_CLOSED"),
        (Self::SHUTDOWN_TRANSPORT, "SHUTDOWN_TRANSPORT"),
        (Self::MIGRATED, "MIGRATED"),
        (Self::RESUME, "RESUME"),
        (Self::NO_APP_SESSION, "NO_APP_SESSION"),
        (Self::CLOSE_CONFIRMED, "CLOSE_CONFIRMED"),
        (Self::CLOSE_DEFERRED, "CLOSE_DEFERRED"),
        (Self::FREE_DEFERRED, "FREE_DEFERRED"),
    ];

    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Complete,
    Renegotiating,
    Failed,
}

/// State of one TLS/DTLS connection, owned by a worker's pool.
pub struct ConnectionContext {
    pub(crate) handle: ContextHandle,
    pub(crate) engine: &'static str,
    pub(crate) session: Option<Box<dyn CryptoSession>>,
    pub(crate) rbio: Option<Bio>,
    pub(crate) wbio: Option<Bio>,
    pub(crate) transport: SessionHandle,
    pub(crate) app: Option<SessionHandle>,
    pub(crate) flags: ConnFlags,
    pub(crate) alpn_list: Vec<AlpnProto>,
    pub(crate) alpn_selected: Option<AlpnProto>,
    pub(crate) cert_key: Option<Arc<CertKeyPair>>,
    pub(crate) hostname: Option<String>,
    pub(crate) listener: Option<Arc<ListenContext>>,
    pub(crate) proto: TransportProto,
    pub(crate) role: Option<Role>,
    pub(crate) hs_state: HandshakeState,
    pub(crate) async_events: VecDeque<AsyncEvent>,
}

impl ConnectionContext {
    pub(crate) fn new(handle: ContextHandle, engine: &'static str) -> Self {
        ConnectionContext {
            handle,
            engine,
            session: None,
            rbio: None,
            wbio: None,
            transport: SessionHandle::INVALID,
            app: None,
            flags: ConnFlags::default(),
            alpn_list: Vec::new(),
            alpn_selected: None,
            cert_key: None,
            hostname: None,
            listener: None,
            proto: TransportProto::Stream,
            role: None,
            hs_state: HandshakeState::NotStarted,
            async_events: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Name of the engine the context was allocated for.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    pub fn transport(&self) -> SessionHandle {
        self.transport
    }

    pub fn app(&self) -> Option<SessionHandle> {
        self.app
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn is_hs_done(&self) -> bool {
        self.flags.contains(ConnFlags::HS_DONE)
    }

    pub fn hs_state(&self) -> HandshakeState {
        self.hs_state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn proto(&self) -> TransportProto {
        self.proto
    }

    pub fn alpn_selected(&self) -> Option<AlpnProto> {
        self.alpn_selected
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn cipher_name(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.cipher_name())
    }

    /// Number of offloaded operations not yet completed.
    pub fn async_pending(&self) -> usize {
        self.async_events.len()
    }

    pub(crate) fn has_async_pending(&self) -> bool {
        !self.async_events.is_empty()
    }

    /// Whether an offloaded operation of `kind` is still in flight.
    pub(crate) fn waits_for(&self, kind: AsyncKind) -> bool {
        self.async_events.iter().any(|e| e.kind == kind)
    }

    /// Remove the in-flight event of `kind`, if there is one.
    pub(crate) fn take_async(&mut self, kind: AsyncKind) -> Option<AsyncEvent> {
        let pos = self.async_events.iter().position(|e| e.kind == kind)?;
        self.async_events.remove(pos)
    }

    /// Bind both byte interfaces to `transport`.
    pub(crate) fn bind(&mut self, transport: SessionHandle) {
        self.transport = transport;
        match (&mut self.rbio, &mut self.wbio) {
            (Some(r), Some(w)) => {
                r.rebind(transport);
                w.rebind(transport);
            }
            _ => {
                self.rbio = Some(Bio::new(transport));
                self.wbio = Some(Bio::new(transport));
            }
        }
    }

    /// Resolve the byte interfaces through the transport.
    pub(crate) fn open_io(&self, tp: &dyn Transport) -> Option<FifoIo> {
        let (rbio, wbio) = (self.rbio.as_ref()?, self.wbio.as_ref()?);
        FifoIo::open(tp, rbio, wbio, self.proto)
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            ctx: self.handle,
            transport: self.transport,
            app: self.app,
            proto: self.proto,
            alpn: self.alpn_selected,
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("handle", &self.handle)
            .field("engine", &self.engine)
            .field("transport", &self.transport)
            .field("app", &self.app)
            .field("flags", &self.flags)
            .field("hs_state", &self.hs_state)
            .field("role", &self.role)
            .field("proto", &self.proto)
            .field("async_events", &self.async_events.len())
            .finish()
    }
}
