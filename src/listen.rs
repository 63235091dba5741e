//! Listener registry.
//!
//! Each listener carries the server configuration built by the provider. It
//! is shared read-only with every context accepted on it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::alpn::AlpnProto;
use crate::certificate::CertKeyPair;
use crate::config::Config;
use crate::crypto::{CryptoProvider, ServerSetup};
use crate::session::TransportProto;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub u32);

impl fmt::Display for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// What a listener is started with.
#[derive(Debug, Clone)]
pub struct ListenParams {
    pub proto: TransportProto,
    pub cert_key: Arc<CertKeyPair>,
    /// Protocols the server selects from, in preference order.
    pub alpn: Vec<AlpnProto>,
}

impl ListenParams {
    pub fn new(proto: TransportProto, cert_key: Arc<CertKeyPair>) -> Self {
        ListenParams {
            proto,
            cert_key,
            alpn: Vec::new(),
        }
    }

    pub fn with_alpn(mut self, alpn: &[AlpnProto]) -> Self {
        self.alpn = alpn.to_vec();
        self
    }
}

pub struct ListenContext {
    handle: ListenHandle,
    proto: TransportProto,
    alpn: Vec<AlpnProto>,
    cert_key: ArcSwapOption<CertKeyPair>,
    setup: Arc<dyn ServerSetup>,
}

impl ListenContext {
    pub fn handle(&self) -> ListenHandle {
        self.handle
    }

    pub fn proto(&self) -> TransportProto {
        self.proto
    }

    pub fn alpn(&self) -> &[AlpnProto] {
        &self.alpn
    }

    /// Certificate/key material, until the listener is stopped.
    pub fn cert_key(&self) -> Option<Arc<CertKeyPair>> {
        self.cert_key.load_full()
    }

    pub(crate) fn setup(&self) -> &Arc<dyn ServerSetup> {
        &self.setup
    }
}

impl fmt::Debug for ListenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenContext")
            .field("handle", &self.handle)
            .field("proto", &self.proto)
            .field("alpn", &self.alpn)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ListenRegistry {
    listeners: DashMap<u32, Arc<ListenContext>>,
    next: AtomicU32,
}

impl ListenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the server configuration and register a listener.
    pub fn start(
        &self,
        provider: &dyn CryptoProvider,
        config: &Config,
        params: ListenParams,
    ) -> Result<ListenHandle, Error> {
        let setup = provider.server_setup(config, &params)?;
        let handle = ListenHandle(self.next.fetch_add(1, Ordering::Relaxed));

        let ctx = ListenContext {
            handle,
            proto: params.proto,
            alpn: params.alpn,
            cert_key: ArcSwapOption::new(Some(params.cert_key)),
            setup,
        };
        self.listeners.insert(handle.0, Arc::new(ctx));
        debug!("Start listener {} ({:?})", handle, params.proto);
        Ok(handle)
    }

    /// Unregister a listener, releasing its certificate/key material first.
    ///
    /// Contexts already accepted keep their engine sessions.
    pub fn stop(&self, handle: ListenHandle) -> Result<(), Error> {
        let ctx = self
            .listeners
            .get(&handle.0)
            .map(|l| l.clone())
            .ok_or(Error::UnknownListener(handle))?;
        ctx.cert_key.store(None);
        self.listeners.remove(&handle.0);
        debug!("Stop listener {}", handle);
        Ok(())
    }

    pub fn get(&self, handle: ListenHandle) -> Option<Arc<ListenContext>> {
        self.listeners.get(&handle.0).map(|l| l.clone())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
