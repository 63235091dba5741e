//! Byte ring shared between a session and its consumer.
//!
//! The transport owns the real shared-memory fifos. This type models the
//! operations the engine relies on: bounded enqueue/dequeue, zero-copy access
//! through at most two contiguous segments, chunk provisioning, peeking, and
//! dequeue notifications.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// Shared handle to a fifo. Fifos are owned by the thread that owns the session.
pub type FifoRef = Rc<RefCell<Fifo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FifoError {
    #[error("not enough free space for {0} bytes")]
    NoSpace(usize),

    #[error("could not provision chunks for {0} bytes")]
    NoMemory(usize),
}

pub struct Fifo {
    data: Box<[u8]>,
    head: usize,
    len: usize,
    chunk_limit: Option<usize>,
    want_deq_ntf: bool,
    low_water: Option<usize>,
}

impl Fifo {
    pub fn new(size: usize) -> Self {
        Fifo {
            data: vec![0; size].into_boxed_slice(),
            head: 0,
            len: 0,
            chunk_limit: None,
            want_deq_ntf: false,
            low_water: None,
        }
    }

    /// Create a fifo already wrapped for sharing.
    pub fn shared(size: usize) -> FifoRef {
        Rc::new(RefCell::new(Fifo::new(size)))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn max_dequeue(&self) -> usize {
        self.len
    }

    pub fn max_enqueue(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn tail(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            (self.head + self.len) % self.data.len()
        }
    }

    /// Limit how many bytes can be provisioned in one go.
    ///
    /// Models a fifo segment under memory pressure. `None` removes the limit.
    pub fn set_chunk_limit(&mut self, limit: Option<usize>) {
        self.chunk_limit = limit;
    }

    /// Make sure `len` bytes can be enqueued without further allocation.
    pub fn provision_chunks(&mut self, len: usize) -> Result<(), FifoError> {
        if len > self.max_enqueue() {
            return Err(FifoError::NoSpace(len));
        }
        if let Some(limit) = self.chunk_limit {
            if len > limit {
                return Err(FifoError::NoMemory(len));
            }
        }
        Ok(())
    }

    /// Readable bytes as at most two contiguous segments, bounded by `max`.
    pub fn segments(&self, max: usize) -> (&[u8], &[u8]) {
        let n = self.len.min(max);
        let first = n.min(self.data.len() - self.head);
        (
            &self.data[self.head..self.head + first],
            &self.data[..n - first],
        )
    }

    /// Writable space as at most two contiguous segments, bounded by `max`.
    ///
    /// Bytes written into the segments become visible after [`Fifo::enqueue_nocopy`].
    pub fn free_segments(&mut self, max: usize) -> (&mut [u8], &mut [u8]) {
        let free = self.max_enqueue().min(max);
        let tail = self.tail();
        let first = free.min(self.data.len() - tail);
        let (front, back) = self.data.split_at_mut(tail);
        (&mut back[..first], &mut front[..free - first])
    }

    /// Commit `n` bytes previously written through [`Fifo::free_segments`].
    pub fn enqueue_nocopy(&mut self, n: usize) {
        self.len += n.min(self.max_enqueue());
    }

    /// Discard up to `n` bytes from the head.
    pub fn dequeue_drop(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }
        self.head = (self.head + n) % self.data.len();
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }

    pub fn enqueue(&mut self, src: &[u8]) -> usize {
        let (a, b) = self.free_segments(src.len());
        let first = a.len();
        a.copy_from_slice(&src[..first]);
        let second = b.len();
        b.copy_from_slice(&src[first..first + second]);
        let n = first + second;
        self.enqueue_nocopy(n);
        n
    }

    /// Enqueue several slices as one record.
    ///
    /// Without `allow_partial` either all bytes are enqueued or none.
    pub fn enqueue_segments(&mut self, segs: &[&[u8]], allow_partial: bool) -> Result<usize, FifoError> {
        let total: usize = segs.iter().map(|s| s.len()).sum();
        if total > self.max_enqueue() && !allow_partial {
            return Err(FifoError::NoSpace(total));
        }
        let mut n = 0;
        for seg in segs {
            let wrote = self.enqueue(seg);
            n += wrote;
            if wrote < seg.len() {
                break;
            }
        }
        Ok(n)
    }

    /// Copy bytes starting `offset` bytes past the head without consuming them.
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let (a, b) = self.segments(self.len);
        let mut copied = 0;
        let mut skip = offset;
        for seg in [a, b] {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let seg = &seg[skip..];
            skip = 0;
            let n = seg.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&seg[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    pub fn dequeue(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(0, dst);
        self.dequeue_drop(n)
    }

    /// Ask the consumer to signal once it dequeues from this fifo.
    pub fn add_want_deq_ntf(&mut self) {
        self.want_deq_ntf = true;
    }

    pub fn wants_deq_ntf(&self) -> bool {
        self.want_deq_ntf
    }

    /// Consume the dequeue-notification request, if any.
    pub fn take_deq_ntf(&mut self) -> bool {
        std::mem::take(&mut self.want_deq_ntf)
    }

    /// Notify the producer when the fill level drops to `mark` bytes or below.
    pub fn set_low_water_mark(&mut self, mark: Option<usize>) {
        self.low_water = mark;
    }

    /// Whether dequeuing `n` bytes should be reported to the producer.
    pub fn needs_deq_ntf(&self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        if self.want_deq_ntf {
            return true;
        }
        match self.low_water {
            Some(mark) => self.len <= mark && self.len + n > mark,
            None => false,
        }
    }
}

impl fmt::Debug for Fifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("size", &self.data.len())
            .field("len", &self.len)
            .field("head", &self.head)
            .finish()
    }
}
