//! Per-worker arena of connection contexts.
//!
//! Slots are reused by index and never compacted, so `(thread, index)` stays a
//! valid handle for as long as the context lives. Only the owning worker
//! touches its pool.

use crate::context::{ConnFlags, ConnectionContext, ContextHandle};
use crate::session::SessionHandle;
use crate::Error;

#[derive(Debug)]
pub struct ContextPool {
    thread: u32,
    slots: Vec<Option<Box<ConnectionContext>>>,
    free: Vec<u32>,
}

/// A context moved out of its pool, on its way to another worker.
#[derive(Debug)]
pub struct DetachedContext(Box<ConnectionContext>);

impl DetachedContext {
    /// Handle the context had before it was detached.
    pub fn old_handle(&self) -> ContextHandle {
        self.0.handle
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.0
    }
}

impl ContextPool {
    pub fn new(thread: u32) -> Self {
        ContextPool {
            thread,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn thread(&self) -> u32 {
        self.thread
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_index(&mut self) -> u32 {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn install(&mut self, index: u32, ctx: Box<ConnectionContext>) {
        // A slot handed out by next_index is always empty.
        self.slots[index as usize] = Some(ctx);
    }

    /// Allocate a fresh context, reusing a freed slot if there is one.
    pub fn alloc(&mut self, engine: &'static str) -> ContextHandle {
        let index = self.next_index();
        let handle = ContextHandle::new(self.thread, index);
        self.install(index, Box::new(ConnectionContext::new(handle, engine)));
        trace!("Alloc context {}", handle);
        handle
    }

    fn check(&self, handle: ContextHandle) -> Result<(), Error> {
        if handle.thread != self.thread {
            return Err(Error::WrongThread(handle));
        }
        Ok(())
    }

    pub fn get(&self, handle: ContextHandle) -> Option<&ConnectionContext> {
        if handle.thread != self.thread {
            return None;
        }
        self.slots.get(handle.index as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, handle: ContextHandle) -> Option<&mut ConnectionContext> {
        if handle.thread != self.thread {
            return None;
        }
        self.slots.get_mut(handle.index as usize)?.as_deref_mut()
    }

    /// Take the context out of its slot and release the slot.
    ///
    /// Fails if the slot is empty, so a context is never freed twice.
    pub fn remove(&mut self, handle: ContextHandle) -> Result<Box<ConnectionContext>, Error> {
        self.check(handle)?;
        let ctx = self
            .slots
            .get_mut(handle.index as usize)
            .and_then(Option::take)
            .ok_or(Error::UnknownContext(handle))?;
        self.free.push(handle.index);
        trace!("Release slot {}", handle);
        Ok(ctx)
    }

    /// Move a context out of the pool for migration. The slot is released.
    pub fn detach(&mut self, handle: ContextHandle) -> Result<DetachedContext, Error> {
        let in_flight = self
            .get(handle)
            .ok_or(Error::UnknownContext(handle))?
            .has_async_pending();
        if in_flight {
            return Err(Error::AsyncInFlight(handle));
        }
        let mut ctx = self.remove(handle)?;
        ctx.flags.insert(ConnFlags::MIGRATED);
        trace!("Detach context {}", handle);
        Ok(DetachedContext(ctx))
    }

    /// Install a detached context and bind it to `transport`.
    ///
    /// The context gets a new handle in this pool.
    pub fn attach(&mut self, detached: DetachedContext, transport: SessionHandle) -> ContextHandle {
        let mut ctx = detached.0;
        let old = ctx.handle;
        let index = self.next_index();
        let handle = ContextHandle::new(self.thread, index);

        ctx.handle = handle;
        ctx.bind(transport);
        ctx.flags.remove(ConnFlags::MIGRATED);
        if ctx.session.as_ref().map_or(false, |s| s.in_init()) {
            ctx.flags.insert(ConnFlags::RESUME);
        }

        self.install(index, ctx);
        trace!("Attach context {} as {} on {}", old, handle, transport);
        handle
    }
}
