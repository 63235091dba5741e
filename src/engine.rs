//! Process state and per-worker engine.
//!
//! [`TlsMain`] is built once per process and shared by all workers. It owns
//! the configuration, the crypto provider, the trust store and the listener
//! registry. Each worker thread owns a [`Worker`], which holds that thread's
//! context pool and serves the [`TlsEngine`] calls the session layer makes.

use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;

use crate::buffer::BufferPool;
use crate::config::{Config, OffloadSettings};
use crate::context::{ConnFlags, ConnectionContext, ContextHandle, HandshakeState};
use crate::crypto::{ClientParams, CryptoProvider, Role, RustlsProvider};
use crate::handshake;
use crate::listen::{ListenContext, ListenHandle, ListenParams, ListenRegistry};
use crate::offload::{AsyncKind, AsyncNotifier, Completions};
use crate::pool::{ContextPool, DetachedContext};
use crate::pump;
use crate::session::{SendParams, SessionHandle, Transport, TransportProto};
use crate::trust::{TrustManager, TrustStore};
use crate::Error;

/// Process-wide engine state.
pub struct TlsMain {
    config: ArcSwap<Config>,
    provider: Arc<dyn CryptoProvider>,
    trust: TrustManager,
    listeners: ListenRegistry,
    offload: OnceCell<OffloadSettings>,
}

impl TlsMain {
    /// Set up process state. The trust store is loaded before anything else;
    /// a failure is logged and leaves strict clients unable to verify.
    pub fn new(config: Config, provider: Arc<dyn CryptoProvider>) -> Arc<Self> {
        let trust = TrustManager::new();
        if let Err(e) = trust.init_ca_chain(&config) {
            warn!("Trust store not loaded: {}", e);
        }
        info!("TLS engine {} ready", provider.name());
        Arc::new(TlsMain {
            config: ArcSwap::from_pointee(config),
            provider,
            trust,
            listeners: ListenRegistry::new(),
            offload: OnceCell::new(),
        })
    }

    /// Process state backed by rustls.
    pub fn with_rustls(config: Config) -> Arc<Self> {
        Self::new(config, Arc::new(RustlsProvider::new()))
    }

    /// Create the engine for worker `thread`.
    pub fn worker(self: &Arc<Self>, thread: u32) -> Worker {
        Worker {
            main: self.clone(),
            pool: ContextPool::new(thread),
            buffers: BufferPool::default(),
            completions: Completions::new(),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    /// Current trust store, if one is loaded.
    pub fn trust(&self) -> Option<Arc<TrustStore>> {
        self.trust.current()
    }

    pub fn start_listen(&self, params: ListenParams) -> Result<ListenHandle, Error> {
        self.listeners
            .start(self.provider.as_ref(), &self.config(), params)
    }

    pub fn stop_listen(&self, handle: ListenHandle) -> Result<(), Error> {
        self.listeners.stop(handle)
    }

    pub fn listener(&self, handle: ListenHandle) -> Option<Arc<ListenContext>> {
        self.listeners.get(handle)
    }

    /// Reload the trust store from the configured CA path.
    ///
    /// Not synchronised with connection setup.
    pub fn reinit_ca_chain(&self) -> Result<(), Error> {
        self.trust.reinit_ca_chain(&self.config())
    }

    /// Replace the cipher list used by connections set up from now on.
    pub fn set_ciphers(&self, list: &str) -> Result<(), Error> {
        let config = self.config().to_builder().ciphers(list).build()?;
        debug!("Cipher list set to {:?}", config.ciphers());
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Replace record size tuning for connections set up from now on.
    pub fn set_record_tuning(
        &self,
        record_size: Option<usize>,
        record_split_size: Option<usize>,
        max_pipelines: Option<usize>,
    ) -> Result<(), Error> {
        let mut builder = self.config().to_builder();
        if let Some(n) = record_size {
            builder = builder.record_size(n);
        }
        if let Some(n) = record_split_size {
            builder = builder.record_split_size(n);
        }
        if let Some(n) = max_pipelines {
            builder = builder.max_pipelines(n);
        }
        self.config.store(Arc::new(builder.build()?));
        Ok(())
    }

    /// Bind the offload engine.
    ///
    /// Settings without an engine name leave async off and lock nothing. Once
    /// an engine is registered, later calls fail with `OffloadLocked`.
    pub fn configure_offload(&self, settings: OffloadSettings) -> Result<(), Error> {
        if self.offload.get().is_some() {
            return Err(Error::OffloadLocked);
        }
        if settings.engine().is_none() {
            debug!("No offload engine named, async stays off");
            return Ok(());
        }
        self.provider.register_offload(&settings)?;
        self.offload
            .set(settings)
            .map_err(|_| Error::OffloadLocked)?;
        info!("Offload configured: {:?}", self.offload.get());
        Ok(())
    }

    pub fn offload(&self) -> Option<&OffloadSettings> {
        self.offload.get()
    }

    /// Whether engine operations may complete asynchronously.
    pub fn async_enabled(&self) -> bool {
        self.offload.get().map_or(false, |s| s.async_mode())
    }
}

/// Calls the session layer makes into the engine.
pub trait TlsEngine {
    fn alloc(&mut self) -> ContextHandle;
    fn free(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<(), Error>;
    fn get(&self, ctx: ContextHandle) -> Option<&ConnectionContext>;
    fn detach(&mut self, ctx: ContextHandle) -> Result<DetachedContext, Error>;
    fn attach(&mut self, detached: DetachedContext, transport: SessionHandle) -> ContextHandle;
    fn init_client(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        transport: SessionHandle,
        params: ClientParams,
    ) -> Result<(), Error>;
    fn init_server(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        transport: SessionHandle,
        listener: ListenHandle,
    ) -> Result<(), Error>;
    fn read(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<usize, Error>;
    fn write(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        sp: &mut SendParams,
    ) -> Result<usize, Error>;
    fn transport_close(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<(), Error>;
    fn transport_reset(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<(), Error>;
    fn app_close(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        shutdown_transport: bool,
    ) -> Result<(), Error>;
    fn resume(&mut self, ctx: ContextHandle) -> Result<(), Error>;
    fn poll_async(&mut self, tp: &mut dyn Transport) -> usize;
}

/// Engine instance owned by one worker thread.
pub struct Worker {
    main: Arc<TlsMain>,
    pool: ContextPool,
    buffers: BufferPool,
    completions: Completions,
}

impl Worker {
    pub fn thread(&self) -> u32 {
        self.pool.thread()
    }

    pub fn main(&self) -> &Arc<TlsMain> {
        &self.main
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    fn ctx_mut(&mut self, ctx: ContextHandle) -> Result<&mut ConnectionContext, Error> {
        if ctx.thread != self.pool.thread() {
            return Err(Error::WrongThread(ctx));
        }
        self.pool.get_mut(ctx).ok_or(Error::UnknownContext(ctx))
    }

    fn notifier(&self, ctx: ContextHandle) -> Option<AsyncNotifier> {
        self.main
            .async_enabled()
            .then(|| self.completions.notifier(ctx))
    }

    /// Drop a context, sending close_notify first if the peer is still there.
    fn teardown(&mut self, tp: &mut dyn Transport, handle: ContextHandle) -> Result<(), Error> {
        let mut ctx = self.pool.remove(handle)?;
        if !ctx.flags.contains(ConnFlags::MIGRATED)
            && ctx.flags.contains(ConnFlags::HS_DONE)
            && !ctx.flags.contains(ConnFlags::PASSIVE_CLOSE)
            && !ctx.flags.contains(ConnFlags::CLOSE_CONFIRMED)
        {
            if let (Some(mut io), Some(session)) = (ctx.open_io(tp), ctx.session.as_mut()) {
                if let Err(e) = session.shutdown(&mut io) {
                    trace!("Best effort shutdown of {} failed: {}", handle, e);
                }
                if io.bytes_written() > 0 {
                    tp.program_tx(ctx.transport);
                }
            }
        }
        debug!("Free context {}", handle);
        Ok(())
    }

    fn run_read(&mut self, tp: &mut dyn Transport, handle: ContextHandle) -> Result<usize, Error> {
        let max_dgram = self.main.config().max_dgram();
        let ctx = self.pool.get_mut(handle).ok_or(Error::UnknownContext(handle))?;
        if ctx.session.is_none() {
            return Err(Error::NotInitialized(handle));
        }
        Ok(match ctx.proto {
            TransportProto::Stream => pump::stream::read(ctx, tp),
            TransportProto::Datagram => pump::dgram::read(ctx, tp, &mut self.buffers, max_dgram),
        })
    }

    fn run_write(
        &mut self,
        tp: &mut dyn Transport,
        handle: ContextHandle,
        sp: &mut SendParams,
    ) -> Result<usize, Error> {
        let max_dgram = self.main.config().max_dgram();
        let ctx = self.pool.get_mut(handle).ok_or(Error::UnknownContext(handle))?;
        if ctx.session.is_none() {
            return Err(Error::NotInitialized(handle));
        }
        match ctx.proto {
            TransportProto::Stream => Ok(pump::stream::write(ctx, tp, sp)),
            TransportProto::Datagram => {
                pump::dgram::write(ctx, tp, sp, &mut self.buffers, max_dgram)
            }
        }
    }

    /// Run deferred close/free once a context has no async events left.
    fn settle(&mut self, tp: &mut dyn Transport, handle: ContextHandle) {
        let Some(ctx) = self.pool.get_mut(handle) else {
            return;
        };
        if ctx.has_async_pending() {
            return;
        }
        if ctx.flags.contains(ConnFlags::CLOSE_DEFERRED) {
            ctx.flags.remove(ConnFlags::CLOSE_DEFERRED);
            handshake::transport_close(ctx, tp);
        }
        if ctx.flags.contains(ConnFlags::FREE_DEFERRED) {
            if let Err(e) = self.teardown(tp, handle) {
                warn!("Deferred free of {} failed: {}", handle, e);
            }
        }
    }
}

impl TlsEngine for Worker {
    fn alloc(&mut self) -> ContextHandle {
        self.pool.alloc(self.main.provider.name())
    }

    fn free(&mut self, tp: &mut dyn Transport, handle: ContextHandle) -> Result<(), Error> {
        let ctx = self.ctx_mut(handle)?;
        if ctx.has_async_pending() {
            trace!("Defer free of {}", handle);
            ctx.flags.insert(ConnFlags::FREE_DEFERRED);
            return Ok(());
        }
        self.teardown(tp, handle)
    }

    fn get(&self, ctx: ContextHandle) -> Option<&ConnectionContext> {
        self.pool.get(ctx)
    }

    fn detach(&mut self, ctx: ContextHandle) -> Result<DetachedContext, Error> {
        self.pool.detach(ctx)
    }

    fn attach(&mut self, detached: DetachedContext, transport: SessionHandle) -> ContextHandle {
        let handle = self.pool.attach(detached, transport);
        let notifier = self.notifier(handle);
        if let Some(ctx) = self.pool.get_mut(handle) {
            if let Some(session) = ctx.session.as_mut() {
                session.set_async_notifier(notifier);
            }
        }
        handle
    }

    fn init_client(
        &mut self,
        tp: &mut dyn Transport,
        handle: ContextHandle,
        transport: SessionHandle,
        params: ClientParams,
    ) -> Result<(), Error> {
        let config = self.main.config();
        let trust = self.main.trust();
        let notifier = self.notifier(handle);
        let async_mode = self.main.async_enabled();
        let session = self.main.provider.client_session(
            &config,
            trust.as_deref(),
            &params,
            notifier,
        );

        let ctx = self.ctx_mut(handle)?;
        let session = match session {
            Ok(s) => s,
            Err(e) => {
                ctx.hs_state = HandshakeState::Failed;
                return Err(e);
            }
        };
        ctx.session = Some(session);
        ctx.proto = params.proto;
        ctx.hostname = params.hostname;
        ctx.alpn_list = params.alpn;
        ctx.cert_key = params.cert_key;
        ctx.role = Some(Role::Client);
        ctx.bind(transport);
        debug!(
            "Init client {} on {} (hostname {:?})",
            handle, transport, ctx.hostname
        );

        if async_mode {
            ctx.hs_state = HandshakeState::InProgress;
            ctx.flags.insert(ConnFlags::RESUME);
            handshake::handshake_rx(ctx, tp);
        } else {
            handshake::start(ctx, tp);
        }
        Ok(())
    }

    fn init_server(
        &mut self,
        tp: &mut dyn Transport,
        handle: ContextHandle,
        transport: SessionHandle,
        listener: ListenHandle,
    ) -> Result<(), Error> {
        let lctx = self
            .main
            .listener(listener)
            .ok_or(Error::UnknownListener(listener))?;
        let notifier = self.notifier(handle);
        let async_mode = self.main.async_enabled();
        let session = lctx.setup().new_session(notifier);

        let ctx = self.ctx_mut(handle)?;
        let session = match session {
            Ok(s) => s,
            Err(e) => {
                ctx.hs_state = HandshakeState::Failed;
                return Err(e);
            }
        };
        ctx.session = Some(session);
        ctx.proto = lctx.proto();
        ctx.alpn_list = lctx.alpn().to_vec();
        ctx.cert_key = lctx.cert_key();
        ctx.listener = Some(lctx);
        ctx.role = Some(Role::Server);
        ctx.bind(transport);
        debug!("Init server {} on {} for {}", handle, transport, listener);

        if async_mode {
            ctx.hs_state = HandshakeState::InProgress;
            handshake::handshake_rx(ctx, tp);
        } else {
            handshake::start(ctx, tp);
        }
        Ok(())
    }

    fn read(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<usize, Error> {
        self.ctx_mut(ctx)?;
        self.run_read(tp, ctx)
    }

    fn write(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        sp: &mut SendParams,
    ) -> Result<usize, Error> {
        self.ctx_mut(ctx)?;
        self.run_write(tp, ctx, sp)
    }

    fn transport_close(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<(), Error> {
        handshake::transport_close(self.ctx_mut(ctx)?, tp);
        Ok(())
    }

    fn transport_reset(&mut self, tp: &mut dyn Transport, ctx: ContextHandle) -> Result<(), Error> {
        handshake::transport_reset(self.ctx_mut(ctx)?, tp);
        Ok(())
    }

    fn app_close(
        &mut self,
        tp: &mut dyn Transport,
        ctx: ContextHandle,
        shutdown_transport: bool,
    ) -> Result<(), Error> {
        handshake::app_close(self.ctx_mut(ctx)?, tp, shutdown_transport);
        Ok(())
    }

    fn resume(&mut self, handle: ContextHandle) -> Result<(), Error> {
        let ctx = self.ctx_mut(handle)?;
        let in_init = ctx.session.as_ref().map_or(false, |s| s.in_init());
        if !in_init {
            return Err(Error::NotHandshaking(handle));
        }
        ctx.flags.insert(ConnFlags::RESUME);
        Ok(())
    }

    fn poll_async(&mut self, tp: &mut dyn Transport) -> usize {
        let mut handled = 0;
        while let Some(done) = self.completions.try_next() {
            let handle = done.ctx;
            let Some(ctx) = self.pool.get_mut(handle) else {
                debug!("Async completion for released context {}", handle);
                continue;
            };
            let Some(event) = ctx.take_async(done.kind) else {
                debug!("Async {:?} completion without pending event on {}", done.kind, handle);
                continue;
            };
            handled += 1;
            trace!("Replay {:?} on {}", event.kind, handle);

            let res = match event.kind {
                AsyncKind::Init => {
                    ctx.flags.insert(ConnFlags::RESUME);
                    handshake::handshake_rx(ctx, tp);
                    Ok(0)
                }
                AsyncKind::Read => self.run_read(tp, handle),
                AsyncKind::Write => {
                    let mut sp = SendParams::new(event.max_burst);
                    self.run_write(tp, handle, &mut sp)
                }
            };
            if let Err(e) = res {
                debug!("Replay on {} failed: {}", handle, e);
            }
            self.settle(tp, handle);
        }
        handled
    }
}
