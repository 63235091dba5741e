//! Byte interfaces between the crypto engine and transport fifos.
//!
//! A context holds a read and a write [`Bio`], each bound to a transport
//! session handle. For every engine call the bindings are resolved into a
//! [`FifoIo`], which implements `io::Read` over the session's rx fifo and
//! `io::Write` over its tx fifo. An empty or full fifo shows up as
//! `ErrorKind::WouldBlock`, never as end of stream.

use std::io;

use crate::fifo::{Fifo, FifoRef};
use crate::session::{SessionHandle, Transport, TransportProto};

/// Length of the header framing each datagram inside a fifo.
pub const DGRAM_HDR_LEN: usize = 8;

/// Header in front of every datagram stored in a fifo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgramHeader {
    /// Payload bytes following the header.
    pub data_length: u32,
    /// Payload bytes already consumed by a previous partial read.
    pub data_offset: u32,
}

impl DgramHeader {
    pub fn new(data_length: usize) -> Self {
        DgramHeader {
            data_length: data_length as u32,
            data_offset: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; DGRAM_HDR_LEN] {
        let mut out = [0; DGRAM_HDR_LEN];
        out[..4].copy_from_slice(&self.data_length.to_be_bytes());
        out[4..].copy_from_slice(&self.data_offset.to_be_bytes());
        out
    }

    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < DGRAM_HDR_LEN {
            return None;
        }
        Some(DgramHeader {
            data_length: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            data_offset: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        })
    }

    /// Read the header at the head of `fifo` without consuming it.
    pub fn peek(fifo: &Fifo) -> Option<Self> {
        let mut b = [0; DGRAM_HDR_LEN];
        if fifo.peek(0, &mut b) < DGRAM_HDR_LEN {
            return None;
        }
        Self::parse(&b)
    }

    /// Size of header plus payload as stored in the fifo.
    pub fn framed_len(&self) -> usize {
        DGRAM_HDR_LEN + self.data_length as usize
    }
}

/// Binding of a byte interface to a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bio {
    session: SessionHandle,
}

impl Bio {
    pub fn new(session: SessionHandle) -> Self {
        Bio { session }
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    /// Point the interface at a (possibly renumbered) session.
    pub fn rebind(&mut self, session: SessionHandle) {
        self.session = session;
    }
}

/// Resolved byte interfaces handed to a crypto session for one call.
#[derive(Debug)]
pub struct FifoIo {
    rx: FifoRef,
    tx: FifoRef,
    proto: TransportProto,
    read: usize,
    written: usize,
}

impl FifoIo {
    pub fn new(rx: FifoRef, tx: FifoRef, proto: TransportProto) -> Self {
        FifoIo {
            rx,
            tx,
            proto,
            read: 0,
            written: 0,
        }
    }

    /// Resolve read and write bindings through the transport.
    pub fn open(
        transport: &dyn Transport,
        rbio: &Bio,
        wbio: &Bio,
        proto: TransportProto,
    ) -> Option<FifoIo> {
        let rx = transport.session(rbio.session())?.rx_fifo;
        let tx = transport.session(wbio.session())?.tx_fifo;
        Some(FifoIo::new(rx, tx, proto))
    }

    pub fn proto(&self) -> TransportProto {
        self.proto
    }

    /// Ciphertext bytes waiting in the rx fifo.
    pub fn pending_input(&self) -> usize {
        self.rx.borrow().max_dequeue()
    }

    /// Free space in the tx fifo.
    pub fn tx_space(&self) -> usize {
        self.tx.borrow().max_enqueue()
    }

    /// Bytes consumed from the rx fifo through this interface.
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Bytes enqueued on the tx fifo through this interface.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    fn read_dgram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.borrow_mut();
        let Some(hdr) = DgramHeader::peek(&rx) else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let framed = hdr.framed_len();
        if rx.max_dequeue() < framed {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let avail = hdr.data_length.saturating_sub(hdr.data_offset) as usize;
        let n = avail.min(buf.len());
        let offset = DGRAM_HDR_LEN + hdr.data_offset as usize;
        rx.peek(offset, &mut buf[..n]);
        // Anything that did not fit is dropped, like a short UDP read.
        rx.dequeue_drop(framed);
        self.read += framed;
        Ok(n)
    }

    fn write_dgram(&mut self, data: &[u8]) -> io::Result<usize> {
        let hdr = DgramHeader::new(data.len()).to_bytes();
        let mut tx = self.tx.borrow_mut();
        match tx.enqueue_segments(&[&hdr[..], data], false) {
            Ok(n) => {
                self.written += n;
                Ok(data.len())
            }
            Err(_) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl io::Read for FifoIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.proto == TransportProto::Datagram {
            return self.read_dgram(buf);
        }
        let n = self.rx.borrow_mut().dequeue(buf);
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.read += n;
        Ok(n)
    }
}

impl io::Write for FifoIo {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.proto == TransportProto::Datagram {
            return self.write_dgram(data);
        }
        let n = self.tx.borrow_mut().enqueue(data);
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
