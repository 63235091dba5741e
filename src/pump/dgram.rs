//! Record pump for DTLS over datagrams.
//!
//! Application fifos hold one datagram per record, each behind a
//! [`DgramHeader`]. Every record is handed to the engine in a single call.

use super::{check_close, handshake_first, may_write, register_read, register_write, CTRL_BYTES};
use crate::bio::{DgramHeader, DGRAM_HDR_LEN};
use crate::buffer::BufferPool;
use crate::context::ConnectionContext;
use crate::crypto::{Progress, Want};
use crate::session::{SendParams, SessionState, Transport};
use crate::Error;

/// Encrypt queued application datagrams. Returns payload bytes consumed.
///
/// A datagram larger than `max_dgram` is refused before anything is copied.
pub(crate) fn write(
    ctx: &mut ConnectionContext,
    tp: &mut dyn Transport,
    sp: &mut SendParams,
    buffers: &mut BufferPool,
    max_dgram: usize,
) -> Result<usize, Error> {
    if !may_write(ctx) {
        return Ok(0);
    }
    let Some(app) = ctx.app else {
        return Ok(0);
    };
    let (Some(app_s), Some(ts)) = (tp.session(app), tp.session(ctx.transport)) else {
        return Ok(0);
    };
    let Some(mut io) = ctx.open_io(tp) else {
        return Ok(0);
    };

    let mut scratch = buffers.pop_sized(max_dgram);
    let mut wrote = 0;
    let mut records = 0;
    let mut dropped = 0;
    let mut fatal = None;
    let mut too_large = None;
    let mut suspended = false;

    if let Some(session) = ctx.session.as_mut() {
        loop {
            let mut app_tx = app_s.tx_fifo.borrow_mut();
            let Some(hdr) = DgramHeader::peek(&app_tx) else {
                break;
            };
            let len = hdr.data_length as usize;
            if len > max_dgram {
                too_large = Some(len);
                break;
            }
            if app_tx.max_dequeue() < hdr.framed_len() {
                break;
            }
            if wrote + len > sp.max_burst && records > 0 {
                break;
            }
            let mut tx = ts.tx_fifo.borrow_mut();
            if let Err(e) = tx.provision_chunks(len + DGRAM_HDR_LEN + CTRL_BYTES) {
                trace!("Transport tx of {} full: {}", ctx.handle, e);
                tx.add_want_deq_ntf();
                sp.descheduled = true;
                break;
            }
            drop(tx);

            let payload = len.saturating_sub(hdr.data_offset as usize);
            app_tx.peek(DGRAM_HDR_LEN + hdr.data_offset as usize, &mut scratch[..payload]);
            match session.write(&mut io, &scratch[..payload]) {
                Ok(Progress::Ready(_)) => {
                    dropped += app_tx.dequeue_drop(hdr.framed_len());
                    wrote += payload;
                    records += 1;
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
    buffers.push(scratch);

    if sp.descheduled {
        tp.deschedule(&ctx.info());
    }
    if let Some(len) = too_large {
        debug!("Datagram of {} bytes on {} exceeds {}", len, ctx.handle, max_dgram);
        tp.app_io_error(&ctx.info());
        return Err(Error::DatagramTooLarge(len, max_dgram));
    }
    if let Some(e) = fatal {
        debug!("Encrypt failed on {}: {}", ctx.handle, e);
        tp.app_io_error(&ctx.info());
        return Ok(0);
    }
    if suspended {
        register_write(ctx, sp.max_burst);
    }

    if records > 0 {
        let notify = {
            let mut app_tx = app_s.tx_fifo.borrow_mut();
            let notify = app_tx.needs_deq_ntf(dropped);
            if notify {
                app_tx.take_deq_ntf();
            }
            notify
        };
        if notify {
            tp.app_dequeued(app);
        }
        tp.program_tx(ctx.transport);
        trace!("Wrote {} datagrams ({} bytes) on {}", records, wrote, ctx.handle);
    }

    check_close(ctx, tp);
    Ok(wrote)
}

/// Decrypt transport datagrams into the application rx fifo. Returns payload
/// bytes delivered.
pub(crate) fn read(
    ctx: &mut ConnectionContext,
    tp: &mut dyn Transport,
    buffers: &mut BufferPool,
    max_dgram: usize,
) -> usize {
    if !handshake_first(ctx, tp) {
        return 0;
    }
    let Some(app) = ctx.app else {
        return 0;
    };
    let Some(app_s) = tp.session(app) else {
        return 0;
    };
    let Some(mut io) = ctx.open_io(tp) else {
        return 0;
    };

    let needed = max_dgram + DGRAM_HDR_LEN;
    if let Err(e) = app_s.rx_fifo.borrow_mut().provision_chunks(needed) {
        trace!("App rx of {} not ready: {}", ctx.handle, e);
        if io.pending_input() > 0 {
            tp.rearm_rx(ctx.transport);
        }
        return 0;
    }

    let mut scratch = buffers.pop_sized(max_dgram);
    let mut read = 0;
    let mut rearm = false;
    let mut suspended = false;

    if let Some(session) = ctx.session.as_mut() {
        while io.pending_input() > 0 {
            let mut app_rx = app_s.rx_fifo.borrow_mut();
            if app_rx.max_enqueue() < needed {
                rearm = true;
                break;
            }
            match session.read(&mut io, &mut scratch) {
                Ok(Progress::Ready(0)) => break,
                Ok(Progress::Ready(n)) => {
                    let hdr = DgramHeader::new(n).to_bytes();
                    // Room was checked above.
                    if let Err(e) = app_rx.enqueue_segments(&[&hdr[..], &scratch[..n]], false) {
                        warn!("Lost datagram of {} bytes on {}: {}", n, ctx.handle, e);
                        rearm = true;
                        break;
                    }
                    read += n;
                }
                Ok(Progress::Blocked(Want::Async)) => {
                    suspended = true;
                    break;
                }
                Ok(Progress::Blocked(_)) => {
                    rearm = true;
                    break;
                }
                Err(e) => {
                    // Bad datagrams are dropped, the association stays up.
                    debug!("Dropping undecryptable datagram on {}: {}", ctx.handle, e);
                    rearm = true;
                    break;
                }
            }
        }
    }
    buffers.push(scratch);

    if io.bytes_written() > 0 {
        tp.program_tx(ctx.transport);
    }
    if suspended {
        register_read(ctx);
    } else if rearm && io.pending_input() > 0 {
        tp.rearm_rx(ctx.transport);
    }

    if read > 0 && app_s.state >= SessionState::Ready {
        tp.app_rx(app);
    }
    read
}
