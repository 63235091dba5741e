//! Handshake driver and close paths.
//!
//! Everything here runs on the worker owning the context and never blocks.
//! A suspended handshake is resumed by the read pump when ciphertext arrives,
//! by the resume flag after migration, or by an async completion.

use crate::alpn::AlpnProto;
use crate::context::{ConnFlags, ConnectionContext, HandshakeState};
use crate::crypto::{Progress, Role, Want};
use crate::offload::{AsyncEvent, AsyncKind};
use crate::session::{HandshakeFailure, Transport};

/// Where a handshake call left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HsOutcome {
    /// Still negotiating. Nothing was reported upward.
    WouldBlock,
    /// Handshake is over and the application was told.
    Done,
    /// Failure handling ran.
    Failed,
}

/// Drive a freshly initialised handshake as far as it goes without input.
pub(crate) fn start(ctx: &mut ConnectionContext, tp: &mut dyn Transport) -> HsOutcome {
    ctx.hs_state = HandshakeState::InProgress;
    let Some(mut io) = ctx.open_io(tp) else {
        debug!("No transport for {} at handshake start", ctx.handle);
        return HsOutcome::WouldBlock;
    };
    let Some(session) = ctx.session.as_mut() else {
        return HsOutcome::WouldBlock;
    };

    let result = loop {
        let before = io.bytes_written();
        match session.handshake(&mut io) {
            Ok(Progress::Blocked(Want::Write)) if io.bytes_written() > before => continue,
            other => break other,
        }
    };
    if io.bytes_written() > 0 {
        tp.program_tx(ctx.transport);
    }

    match result {
        Err(e) => {
            handle_failure(ctx, tp, HandshakeFailure::Protocol(e.to_string()));
            HsOutcome::Failed
        }
        Ok(Progress::Blocked(Want::Async)) => {
            register_init(ctx);
            HsOutcome::WouldBlock
        }
        Ok(Progress::Ready(())) => complete(ctx, tp),
        Ok(Progress::Blocked(_)) => HsOutcome::WouldBlock,
    }
}

/// Continue the handshake with what the transport delivered.
pub(crate) fn handshake_rx(ctx: &mut ConnectionContext, tp: &mut dyn Transport) -> HsOutcome {
    if ctx.waits_for(AsyncKind::Init) {
        return HsOutcome::WouldBlock;
    }
    let Some(mut io) = ctx.open_io(tp) else {
        return HsOutcome::WouldBlock;
    };
    let Some(session) = ctx.session.as_mut() else {
        return HsOutcome::WouldBlock;
    };

    let mut failure = None;
    let mut suspended = false;
    while session.in_init() {
        let resume = ctx.flags.contains(ConnFlags::RESUME);
        if io.pending_input() == 0 && !resume {
            break;
        }
        ctx.flags.remove(ConnFlags::RESUME);

        let consumed = io.bytes_read();
        match session.handshake(&mut io) {
            Ok(Progress::Ready(())) => break,
            Ok(Progress::Blocked(Want::Async)) => {
                suspended = true;
                break;
            }
            Ok(Progress::Blocked(Want::Write)) => break,
            Ok(Progress::Blocked(Want::Read)) => {
                if io.bytes_read() == consumed {
                    break;
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let in_init = session.in_init();
    if io.bytes_written() > 0 {
        tp.program_tx(ctx.transport);
    }

    if let Some(e) = failure {
        handle_failure(ctx, tp, HandshakeFailure::Protocol(e.to_string()));
        return HsOutcome::Failed;
    }
    if suspended {
        register_init(ctx);
        return HsOutcome::WouldBlock;
    }
    if in_init {
        if ctx.hs_state == HandshakeState::Complete {
            debug!("Renegotiation started on {}", ctx.handle);
            ctx.hs_state = HandshakeState::Renegotiating;
        }
        return HsOutcome::WouldBlock;
    }
    complete(ctx, tp)
}

fn register_init(ctx: &mut ConnectionContext) {
    trace!("Handshake of {} waits for async completion", ctx.handle);
    ctx.async_events.push_back(AsyncEvent::init(ctx.transport));
}

fn complete(ctx: &mut ConnectionContext, tp: &mut dyn Transport) -> HsOutcome {
    if ctx.flags.contains(ConnFlags::HS_DONE) {
        if ctx.hs_state == HandshakeState::Renegotiating {
            debug!("Renegotiation done on {}", ctx.handle);
        }
        ctx.hs_state = HandshakeState::Complete;
        return HsOutcome::Done;
    }
    if ctx.hs_state == HandshakeState::Failed {
        return HsOutcome::Failed;
    }
    let Some(session) = ctx.session.as_ref() else {
        return HsOutcome::WouldBlock;
    };

    if !ctx.alpn_list.is_empty() {
        ctx.alpn_selected = session
            .alpn_selected()
            .and_then(|id| AlpnProto::from_bytes(&id));
        trace!("ALPN for {}: {:?}", ctx.handle, ctx.alpn_selected);
    }
    let verify = session.verify_result();
    let cipher = session.cipher_name();

    match ctx.role {
        Some(Role::Client) => {
            if let Err(e) = verify {
                if ctx.hostname.is_some() {
                    warn!("Certificate verification failed for {}: {}", ctx.handle, e);
                    handle_failure(ctx, tp, HandshakeFailure::Verification(e));
                    return HsOutcome::Failed;
                }
                debug!("Ignoring verification result without hostname on {}: {}", ctx.handle, e);
            }
            match tp.app_connected(&ctx.info()) {
                Ok(app) => ctx.app = Some(app),
                Err(e) => {
                    warn!("Application refused connect on {}: {}", ctx.handle, e.0);
                    ctx.hs_state = HandshakeState::Failed;
                    tp.disconnect_transport(ctx.transport);
                    return HsOutcome::Failed;
                }
            }
        }
        Some(Role::Server) => {
            if ctx.flags.contains(ConnFlags::PASSIVE_CLOSE) {
                handle_failure(ctx, tp, HandshakeFailure::TransportClosed);
                return HsOutcome::Failed;
            }
            match tp.app_accepted(&ctx.info()) {
                Ok(app) => ctx.app = Some(app),
                Err(e) => {
                    warn!("Application refused accept on {}: {}", ctx.handle, e.0);
                    ctx.app = None;
                    ctx.flags.insert(ConnFlags::NO_APP_SESSION);
                    ctx.hs_state = HandshakeState::Failed;
                    tp.disconnect_transport(ctx.transport);
                    return HsOutcome::Failed;
                }
            }
        }
        None => return HsOutcome::WouldBlock,
    }

    ctx.flags.insert(ConnFlags::HS_DONE);
    ctx.hs_state = HandshakeState::Complete;
    debug!(
        "Handshake complete on {} ({:?}, cipher {:?})",
        ctx.handle, ctx.role, cipher
    );
    HsOutcome::Done
}

/// Report a failed handshake and drop the transport.
pub(crate) fn handle_failure(
    ctx: &mut ConnectionContext,
    tp: &mut dyn Transport,
    reason: HandshakeFailure,
) {
    if ctx.flags.contains(ConnFlags::HS_DONE) {
        // Renegotiation on an established connection.
        warn!("Renegotiation failed on {}: {}", ctx.handle, reason);
        ctx.hs_state = HandshakeState::Failed;
        tp.app_io_error(&ctx.info());
        tp.disconnect_transport(ctx.transport);
        return;
    }
    if ctx.hs_state == HandshakeState::Failed {
        return;
    }
    ctx.hs_state = HandshakeState::Failed;
    debug!("Handshake failed on {}: {}", ctx.handle, reason);

    match ctx.role {
        Some(Role::Server) => {
            ctx.flags.insert(ConnFlags::NO_APP_SESSION);
        }
        Some(Role::Client) | None => {
            tp.app_connect_failed(&ctx.info(), reason);
        }
    }
    tp.disconnect_transport(ctx.transport);
}

/// The application closed its session.
pub(crate) fn app_close(ctx: &mut ConnectionContext, tp: &mut dyn Transport, shutdown_transport: bool) {
    ctx.flags.insert(ConnFlags::APP_CLOSED);
    if shutdown_transport {
        ctx.flags.insert(ConnFlags::SHUTDOWN_TRANSPORT);
    }
    let engine_idle = ctx
        .session
        .as_ref()
        .map_or(true, |s| !s.has_pending_output());
    if engine_idle && app_tx_empty(ctx, tp) {
        confirm_app_close(ctx, tp);
    } else {
        trace!("Close of {} waits for pending data", ctx.handle);
    }
}

pub(crate) fn app_tx_empty(ctx: &ConnectionContext, tp: &dyn Transport) -> bool {
    ctx.app
        .and_then(|app| tp.session(app))
        .map_or(true, |s| s.tx_fifo.borrow().is_empty())
}

/// Finish an application close. Runs once per context.
pub(crate) fn confirm_app_close(ctx: &mut ConnectionContext, tp: &mut dyn Transport) {
    if ctx.flags.contains(ConnFlags::CLOSE_CONFIRMED) {
        return;
    }
    ctx.flags.insert(ConnFlags::CLOSE_CONFIRMED);

    if ctx.flags.contains(ConnFlags::HS_DONE) {
        if let (Some(mut io), Some(session)) = (ctx.open_io(tp), ctx.session.as_mut()) {
            if let Err(e) = session.shutdown(&mut io) {
                debug!("Shutdown of {} failed: {}", ctx.handle, e);
            }
            if io.bytes_written() > 0 {
                tp.program_tx(ctx.transport);
            }
        }
    }
    if ctx.flags.contains(ConnFlags::SHUTDOWN_TRANSPORT) {
        tp.shutdown_transport(ctx.transport);
    } else {
        tp.disconnect_transport(ctx.transport);
    }
    tp.closed(&ctx.info());
    debug!("Close confirmed on {}", ctx.handle);
}

/// The transport peer closed.
pub(crate) fn transport_close(ctx: &mut ConnectionContext, tp: &mut dyn Transport) {
    ctx.flags.insert(ConnFlags::PASSIVE_CLOSE);
    if ctx.has_async_pending() {
        trace!("Defer transport close of {}", ctx.handle);
        ctx.flags.insert(ConnFlags::CLOSE_DEFERRED);
        return;
    }
    if !ctx.flags.contains(ConnFlags::HS_DONE) {
        handle_failure(ctx, tp, HandshakeFailure::TransportClosed);
        return;
    }
    tp.closing(&ctx.info());
}

/// The transport was reset.
pub(crate) fn transport_reset(ctx: &mut ConnectionContext, tp: &mut dyn Transport) {
    if !ctx.flags.contains(ConnFlags::HS_DONE) {
        handle_failure(ctx, tp, HandshakeFailure::TransportClosed);
        return;
    }
    let info = ctx.info();
    tp.reset(&info);
    tp.closed(&info);
    tp.disconnect_transport(ctx.transport);
}
