//! Per-coroutine RPC context (spec §4.G). Pairs one [`Coroutine`] with the
//! bookkeeping a dispatched call needs: transaction hooks, the pending
//! timer (if suspended in a timed wait), and the outcome a resumer hands
//! back through [`Context::call_yield`]. Grounded on
//! `original_source/.../context.cpp`.

use crate::coroutine::{Coroutine, CoroutineManager};
use crate::error::{CallError, CallCancelled, ServletError};
use crate::obstack::Obstack;
use crate::page::PageAllocator;
use crate::timer::{TimeMs, Timer, TimerManager};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Transaction hooks a servlet-hosting application can override. The
/// default implementation treats every call as auto-committing.
pub trait DbHooks {
    fn db_begin(&self) -> bool {
        true
    }
    fn db_commit(&self) -> bool {
        true
    }
    fn db_rollback(&self) {}
}

/// No-op hooks, used where no transactional storage is wired in.
pub struct NoopDbHooks;
impl DbHooks for NoopDbHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallResult {
    Ok,
    Cancel,
    TimedOut,
}

pub struct Context {
    coroutine: Coroutine,
    manager: CoroutineManager,
    timer_mgr: Rc<TimerManager>,
    hooks: RefCell<Box<dyn DbHooks>>,
    servlet_id: Cell<u32>,
    peer_id: Cell<u64>,
    seq: Cell<u32>,
    call_result: Cell<CallResult>,
    timer: RefCell<Option<Timer>>,
    /// Response body stashed by the network layer's `response_handler`
    /// just before resuming this context via `call_ok()`, read back out
    /// by `Network::call` once `call_yield()` returns.
    pending_payload: RefCell<Option<Vec<u8>>>,
    /// Per-call scratch arena (spec §3: "optional per-call scratch
    /// arena"). Fresh for every spawned coroutine; reset (its pages
    /// returned to the page allocator) when this `Context` is dropped.
    arena: Obstack,
}

impl Context {
    pub fn new(
        coroutine: Coroutine,
        manager: CoroutineManager,
        timer_mgr: Rc<TimerManager>,
        page_allocator: Rc<PageAllocator>,
    ) -> Self {
        Self::with_hooks(coroutine, manager, timer_mgr, page_allocator, Box::new(NoopDbHooks))
    }

    pub fn with_hooks(
        coroutine: Coroutine,
        manager: CoroutineManager,
        timer_mgr: Rc<TimerManager>,
        page_allocator: Rc<PageAllocator>,
        hooks: Box<dyn DbHooks>,
    ) -> Self {
        Self {
            coroutine,
            manager,
            timer_mgr,
            hooks: RefCell::new(hooks),
            servlet_id: Cell::new(0),
            peer_id: Cell::new(0),
            seq: Cell::new(0),
            call_result: Cell::new(CallResult::Ok),
            timer: RefCell::new(None),
            pending_payload: RefCell::new(None),
            arena: Obstack::new(page_allocator),
        }
    }

    /// The per-call scratch arena (spec §3, §4.B; SPEC_FULL.md §8.1).
    /// Used by `Network::call` to stage a parsed response body; available
    /// to servlet code for its own request-scoped scratch allocations.
    pub fn arena(&self) -> &Obstack {
        &self.arena
    }

    /// Install the timer guarding an in-flight call so `clear()`/`finish()`
    /// can close it. Replaces (and closes) any previously installed timer.
    pub fn install_timer(&self, timer: Timer) {
        if let Some(old) = self.timer.borrow_mut().replace(timer) {
            old.close();
        }
    }

    pub fn set_pending_payload(&self, payload: Vec<u8>) {
        *self.pending_payload.borrow_mut() = Some(payload);
    }

    pub fn take_pending_payload(&self) -> Option<Vec<u8>> {
        self.pending_payload.borrow_mut().take()
    }

    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    /// Route this context at the start of a dispatched call and run the
    /// storage layer's begin-transaction hook.
    pub fn begin(&self, servlet_id: u32, peer_id: u64) -> bool {
        self.servlet_id.set(servlet_id);
        self.peer_id.set(peer_id);
        self.hooks.borrow().db_begin()
    }

    pub fn commit(&self) -> bool {
        self.hooks.borrow().db_commit()
    }

    pub fn rollback(&self) {
        self.hooks.borrow().db_rollback();
    }

    /// Close any pending timer without touching routing state (used when
    /// a call finishes but the context will be reused for a follow-up
    /// request on the same coroutine).
    pub fn clear(&self) {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.close();
        }
    }

    /// Reset all routing state. Called once the coroutine running this
    /// context goes back to the free list.
    pub fn finish(&self) {
        self.servlet_id.set(0);
        self.peer_id.set(0);
        self.seq.set(0);
        self.clear();
    }

    pub fn servlet_id(&self) -> u32 {
        self.servlet_id.get()
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id.get()
    }

    pub fn seq(&self) -> u32 {
        self.seq.get()
    }

    pub fn set_seq(&self, seq: u32) {
        self.seq.set(seq);
    }

    /// Resume this context's coroutine with a successful call outcome.
    pub fn call_ok(&self) {
        self.call_result.set(CallResult::Ok);
        self.manager.resume(&self.coroutine);
    }

    /// Resume with cancellation — the waiting servlet sees
    /// [`CallCancelled`], not a [`ServletError`].
    pub fn call_cancel(&self) {
        self.call_result.set(CallResult::Cancel);
        self.manager.resume(&self.coroutine);
    }

    /// Resume with a timeout — the waiting servlet sees
    /// `ServletError::Timeout`.
    pub fn call_timedout(&self) {
        self.call_result.set(CallResult::TimedOut);
        self.manager.resume(&self.coroutine);
    }

    /// Suspend the running coroutine until one of `call_ok`/`call_cancel`/
    /// `call_timedout` resumes it, then translate the outcome into a
    /// `Result`. Must be called from the coroutine this context is
    /// attached to.
    pub fn call_yield(&self) -> Result<(), CallError> {
        self.call_result.set(CallResult::Ok);
        if !self.manager.yield_now() {
            return Err(CallCancelled.into());
        }
        match self.call_result.get() {
            CallResult::Ok => Ok(()),
            CallResult::TimedOut => Err(ServletError::Timeout.into()),
            CallResult::Cancel => Err(CallCancelled.into()),
        }
    }

    /// Suspend the running coroutine for `ms` milliseconds, then resume
    /// it automatically. `ms == 0` returns immediately without yielding.
    pub fn sleep(&self, ms: TimeMs) {
        if ms == 0 {
            return;
        }
        let co = self.coroutine.clone();
        let manager = self.manager.clone();
        let timer = self.timer_mgr.schedule(ms, move |_now| {
            manager.resume(&co);
            0
        });
        *self.timer.borrow_mut() = Some(timer);
        self.manager.yield_now();
    }
}
