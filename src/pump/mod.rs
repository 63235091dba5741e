//! Record pumps between application fifos and the crypto engine.
//!
//! Both pumps first let a pending handshake make progress, then move as much
//! data as the fifos allow. They never block and report failures through the
//! transport notifications, not through their return value.

use crate::context::{ConnFlags, ConnectionContext};
use crate::handshake::{self, HsOutcome};
use crate::offload::{AsyncEvent, AsyncKind};
use crate::session::Transport;

pub(crate) mod dgram;
pub(crate) mod stream;

/// Transport tx space kept free for records the engine emits on its own.
pub const CTRL_BYTES: usize = 1000;

/// Cap on the free space a writer needs before it deschedules.
pub const MIN_ENQ_SPACE: usize = 1 << 16;

/// Most plaintext the stream read pump moves per call.
pub const MAX_READ_LEN: usize = 128 * 1024;

/// Run the handshake if it is not over. Returns true if records may flow.
///
/// A read already waiting on the offload engine is left to its replay.
fn handshake_first(ctx: &mut ConnectionContext, tp: &mut dyn Transport) -> bool {
    if ctx.waits_for(AsyncKind::Read) {
        return false;
    }
    let in_init = ctx.session.as_ref().map_or(false, |s| s.in_init());
    if ctx.is_hs_done() && !in_init {
        return true;
    }
    match handshake::handshake_rx(ctx, tp) {
        HsOutcome::Done => ctx.is_hs_done(),
        HsOutcome::WouldBlock | HsOutcome::Failed => false,
    }
}

fn register_read(ctx: &mut ConnectionContext) {
    trace!("Read on {} waits for async completion", ctx.handle);
    ctx.async_events.push_back(AsyncEvent::read(ctx.transport));
}

/// Whether the write pump may run. A suspended write is finished by its replay.
fn may_write(ctx: &ConnectionContext) -> bool {
    ctx.is_hs_done() && !ctx.waits_for(AsyncKind::Write)
}

fn register_write(ctx: &mut ConnectionContext, max_burst: usize) {
    trace!("Write on {} waits for async completion", ctx.handle);
    ctx.async_events
        .push_back(AsyncEvent::write(ctx.transport, max_burst));
}

/// Confirm a pending application close once the engine has flushed.
fn check_close(ctx: &mut ConnectionContext, tp: &mut dyn Transport) {
    if !ctx.flags.contains(ConnFlags::APP_CLOSED) {
        return;
    }
    let engine_idle = ctx
        .session
        .as_ref()
        .map_or(true, |s| !s.has_pending_output());
    if engine_idle && handshake::app_tx_empty(ctx, tp) {
        handshake::confirm_app_close(ctx, tp);
    }
}
