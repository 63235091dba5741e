//! Bridge between offloaded crypto operations and the owning worker.
//!
//! When an engine dispatches work to hardware it returns
//! [`Want::Async`](crate::crypto::Want::Async) and the pump records an
//! [`AsyncEvent`] on the context. The engine later signals completion through
//! its [`AsyncNotifier`], from any thread. The notifier posts the context
//! handle and the kind of the finished operation to the worker's channel; the
//! worker replays the matching event on its own thread when it polls.
//!
//! A context holds at most one event per kind, so the pair identifies the
//! event even when operations finish out of order.

use std::sync::mpsc;

use crate::context::ContextHandle;
use crate::session::SessionHandle;

/// Entry point an async event resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// Handshake (initial or resumed).
    Init,
    /// Read pump.
    Read,
    /// Write pump.
    Write,
}

/// A suspended operation waiting for its offload completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    pub kind: AsyncKind,
    /// Transport session to re-signal when the event is replayed.
    pub transport: SessionHandle,
    /// Burst limit for a resumed write.
    pub max_burst: usize,
}

impl AsyncEvent {
    pub fn init(transport: SessionHandle) -> Self {
        AsyncEvent {
            kind: AsyncKind::Init,
            transport,
            max_burst: 0,
        }
    }

    pub fn read(transport: SessionHandle) -> Self {
        AsyncEvent {
            kind: AsyncKind::Read,
            transport,
            max_burst: 0,
        }
    }

    pub fn write(transport: SessionHandle, max_burst: usize) -> Self {
        AsyncEvent {
            kind: AsyncKind::Write,
            transport,
            max_burst,
        }
    }
}

/// Completion handle given to an engine session.
#[derive(Debug, Clone)]
pub struct AsyncNotifier {
    tx: mpsc::Sender<Completion>,
    ctx: ContextHandle,
}

/// A finished offloaded operation, as posted to the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub ctx: ContextHandle,
    pub kind: AsyncKind,
}

impl AsyncNotifier {
    pub(crate) fn new(tx: mpsc::Sender<Completion>, ctx: ContextHandle) -> Self {
        AsyncNotifier { tx, ctx }
    }

    /// Context the notifier completes.
    pub fn context(&self) -> ContextHandle {
        self.ctx
    }

    /// Signal that the offloaded operation of `kind` finished.
    ///
    /// Returns false if the owning worker is gone.
    pub fn notify(&self, kind: AsyncKind) -> bool {
        self.tx
            .send(Completion {
                ctx: self.ctx,
                kind,
            })
            .is_ok()
    }
}

/// Receiving side of a worker's completion channel.
#[derive(Debug)]
pub(crate) struct Completions {
    tx: mpsc::Sender<Completion>,
    rx: mpsc::Receiver<Completion>,
}

impl Completions {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Completions { tx, rx }
    }

    pub fn notifier(&self, ctx: ContextHandle) -> AsyncNotifier {
        AsyncNotifier::new(self.tx.clone(), ctx)
    }

    /// Next completion, without blocking.
    pub fn try_next(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn completions_cross_threads() {
        let completions = Completions::new();
        let ctx = ContextHandle::new(0, 3);
        let notifier = completions.notifier(ctx);

        assert_eq!(completions.try_next(), None);
        thread::spawn(move || {
            assert!(notifier.notify(AsyncKind::Write));
            assert!(notifier.notify(AsyncKind::Read));
        })
        .join()
        .unwrap();
        let next = completions.try_next().unwrap();
        assert_eq!((next.ctx, next.kind), (ctx, AsyncKind::Write));
        let next = completions.try_next().unwrap();
        assert_eq!((next.ctx, next.kind), (ctx, AsyncKind::Read));
        assert_eq!(completions.try_next(), None);
    }
}
