//! Record pump for TLS over byte streams.

use super::{
    check_close, handshake_first, may_write, register_read, register_write, CTRL_BYTES,
    MAX_READ_LEN, MIN_ENQ_SPACE,
};
use crate::context::ConnectionContext;
use crate::crypto::{Progress, Want};
use crate::session::{SendParams, Transport};

/// Encrypt application data onto the transport. Returns plaintext bytes consumed.
pub(crate) fn write(ctx: &mut ConnectionContext, tp: &mut dyn Transport, sp: &mut SendParams) -> usize {
    if !may_write(ctx) {
        return 0;
    }
    let Some(app) = ctx.app else {
        return 0;
    };
    let (Some(app_s), Some(ts)) = (tp.session(app), tp.session(ctx.transport)) else {
        return 0;
    };
    let Some(mut io) = ctx.open_io(tp) else {
        return 0;
    };

    let space = ts.tx_fifo.borrow().max_enqueue().saturating_sub(CTRL_BYTES);
    let deq_max = app_s
        .tx_fifo
        .borrow()
        .max_dequeue()
        .min(space)
        .min(sp.max_burst);

    let mut wrote = 0;
    let mut fatal = None;
    let mut suspended = false;
    let provisioned = deq_max > 0
        && match ts.tx_fifo.borrow_mut().provision_chunks(deq_max + CTRL_BYTES) {
            Ok(()) => true,
            Err(e) => {
                debug!("Provisioning for {} failed: {}", ctx.handle, e);
                false
            }
        };

    if provisioned {
        if let Some(session) = ctx.session.as_mut() {
            let app_tx = app_s.tx_fifo.borrow();
            let (a, b) = app_tx.segments(deq_max);
            for seg in [a, b] {
                if seg.is_empty() {
                    break;
                }
                match session.write(&mut io, seg) {
                    Ok(Progress::Ready(n)) => {
                        wrote += n;
                        if n < seg.len() {
                            break;
                        }
                    }
                    Ok(Progress::Blocked(Want::Async)) => {
                        suspended = true;
                        break;
                    }
                    Ok(Progress::Blocked(_)) => break,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
    }

    if io.bytes_written() > 0 {
        tp.program_tx(ctx.transport);
    }
    if let Some(e) = fatal {
        debug!("Encrypt failed on {}: {}", ctx.handle, e);
        tp.app_io_error(&ctx.info());
        return 0;
    }
    if suspended {
        register_write(ctx, sp.max_burst);
    }

    if wrote > 0 {
        let notify = {
            let mut app_tx = app_s.tx_fifo.borrow_mut();
            app_tx.dequeue_drop(wrote);
            let notify = app_tx.needs_deq_ntf(wrote);
            if notify {
                app_tx.take_deq_ntf();
            }
            notify
        };
        if notify {
            tp.app_dequeued(app);
        }
        trace!("Wrote {} bytes on {}", wrote, ctx.handle);
    }

    check_close(ctx, tp);

    let tx_size = ts.tx_fifo.borrow().size();
    if space < wrote + (tx_size / 2).min(MIN_ENQ_SPACE) {
        ts.tx_fifo.borrow_mut().add_want_deq_ntf();
        tp.deschedule(&ctx.info());
        sp.descheduled = true;
    } else if wrote > 0 {
        tp.reschedule_tx(app);
    }
    wrote
}

/// Decrypt transport data into the application rx fifo. Returns plaintext
/// bytes delivered.
pub(crate) fn read(ctx: &mut ConnectionContext, tp: &mut dyn Transport) -> usize {
    if !handshake_first(ctx, tp) {
        return 0;
    }
    // The handshake may have notified the application; look sessions up again.
    let Some(app) = ctx.app else {
        return 0;
    };
    let Some(app_s) = tp.session(app) else {
        return 0;
    };
    let Some(mut io) = ctx.open_io(tp) else {
        return 0;
    };

    let mut read = 0;
    let mut fatal = None;
    let mut suspended = false;
    if let Some(session) = ctx.session.as_mut() {
        let mut app_rx = app_s.rx_fifo.borrow_mut();
        let max = app_rx.max_enqueue().min(MAX_READ_LEN);
        if max > 0 && app_rx.provision_chunks(max).is_ok() {
            let (a, b) = app_rx.free_segments(max);
            for seg in [a, b] {
                if seg.is_empty() {
                    break;
                }
                let len = seg.len();
                match session.read(&mut io, seg) {
                    Ok(Progress::Ready(0)) => {
                        trace!("Peer sent close_notify on {}", ctx.handle);
                        break;
                    }
                    Ok(Progress::Ready(n)) => {
                        read += n;
                        // Second segment only once the first is full.
                        if n < len {
                            break;
                        }
                    }
                    Ok(Progress::Blocked(Want::Async)) => {
                        suspended = true;
                        break;
                    }
                    Ok(Progress::Blocked(_)) => break,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
            app_rx.enqueue_nocopy(read);
        }
    }

    if io.bytes_written() > 0 {
        tp.program_tx(ctx.transport);
    }
    if let Some(e) = fatal {
        debug!("Decrypt failed on {}: {}", ctx.handle, e);
        tp.app_io_error(&ctx.info());
        return 0;
    }
    if read > 0 {
        tp.app_rx(app);
    }
    if suspended {
        register_read(ctx);
        return read;
    }

    let buffered = ctx.session.as_ref().map_or(0, |s| s.pending());
    if buffered > 0 || io.pending_input() > 0 {
        tp.rearm_rx(ctx.transport);
    }
    read
}
