//! Stackful coroutine pool (spec §4.F). Grounded on
//! `original_source/.../coroutine.{h,cpp}`: a fixed-capacity pool of
//! reusable fiber slots, each with its own `ucontext_t` and stack, switched
//! with `swapcontext` rather than preemption or OS threads.

pub mod context_switch;

use crate::page::{Page, PageAllocator};
use context_switch::{make_context, switch_context, RawContext};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::rc::Rc;

/// Pool capacity (spec: bounded, grows in batches up to this ceiling).
pub const CO_CAP: usize = 4096;
/// Per-coroutine stack size, including the interpreter/servlet call depth
/// a single RPC handler is expected to need.
pub const CO_MEMSIZE: usize = 64 * 1024;
/// Slots added per pool growth.
pub const CO_GROW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Dead,
    Ready,
    Running,
    Suspend,
}

struct Slot {
    status: Cell<Status>,
    /// `UnsafeCell`, not `RefCell`: a `switch_context` call through this
    /// field does not return to its own call site until something
    /// switches back — by which point the coroutine on the other end has
    /// typically taken further context switches of its own. A `RefCell`
    /// guard held across that span would conflict with itself. Exclusive
    /// access is instead guaranteed by the cooperative scheduler's own
    /// invariant: at most one coroutine runs at a time, and only the
    /// manager touches a slot's context.
    ctx: UnsafeCell<RawContext>,
    stack: Page,
    routine: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// A handle to one pool slot. Cloning shares the same coroutine; the slot
/// itself is only reused once `status()` is `Dead` and the manager has
/// moved it back onto the free list.
#[derive(Clone)]
pub struct Coroutine {
    slot: Rc<Slot>,
}

impl Coroutine {
    pub fn status(&self) -> Status {
        self.slot.status.get()
    }

    pub fn running(&self) -> bool {
        self.status() == Status::Running
    }

    fn ptr_eq(&self, other: &Coroutine) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

struct ManagerInner {
    page_allocator: Rc<PageAllocator>,
    slots: RefCell<Vec<Rc<Slot>>>,
    free_list: RefCell<Vec<Rc<Slot>>>,
    /// The active resume() call chain; the last entry is the currently
    /// running coroutine (original's `_busy_list.front()`).
    busy_stack: RefCell<Vec<Rc<Slot>>>,
    main_slot: Rc<Slot>,
}

/// Owns the coroutine pool for one OS thread. Not `Send`/`Sync`: the pool,
/// like the rest of the core, runs on a single thread. Built with explicit
/// construction rather than a process-wide static, per the page allocator
/// and timer manager's pattern.
#[derive(Clone)]
pub struct CoroutineManager {
    inner: Rc<ManagerInner>,
}

thread_local! {
    static CURRENT_MANAGER: RefCell<Option<CoroutineManager>> = RefCell::new(None);
}

extern "C" fn trampoline() {
    let mgr = CURRENT_MANAGER.with(|cell| {
        cell.borrow()
            .clone()
            .expect("trampoline invoked without an installed coroutine manager")
    });

    let slot = mgr
        .inner
        .busy_stack
        .borrow()
        .last()
        .cloned()
        .expect("trampoline invoked with no running coroutine");

    let routine = slot
        .routine
        .borrow_mut()
        .take()
        .expect("coroutine started with no routine");
    routine();

    slot.status.set(Status::Dead);
    mgr.inner.busy_stack.borrow_mut().pop();
    mgr.inner.free_list.borrow_mut().push(slot.clone());

    let caller = mgr
        .inner
        .busy_stack
        .borrow()
        .last()
        .cloned()
        .expect("coroutine exit with no caller to return to");

    // SAFETY: both contexts belong to slots owned by `mgr`, which outlives
    // this call (it is reachable from the thread-local and from whoever
    // called resume()). This switch never returns to this frame (the
    // dying slot's saved context is never resumed again), so the targets
    // must be raw pointers rather than `RefCell` guards: a guard's `Drop`
    // would never run, permanently poisoning the `RefCell` for both the
    // dead slot (on its next reuse) and the caller (on its next switch).
    unsafe {
        switch_context(&mut *slot.ctx.get(), &mut *caller.ctx.get());
    }
}

impl CoroutineManager {
    /// Build a pool and install it as this thread's current manager. Only
    /// one manager should be installed per thread.
    pub fn new(page_allocator: Rc<PageAllocator>) -> Self {
        let main_slot = Rc::new(Slot {
            status: Cell::new(Status::Running),
            ctx: UnsafeCell::new(RawContext::empty()),
            // The main coroutine never runs on a pooled stack; this page is
            // unused but keeps `Slot` uniform.
            stack: page_allocator.alloc().expect("initial page for main slot"),
            routine: RefCell::new(None),
        });

        let mgr = Self {
            inner: Rc::new(ManagerInner {
                page_allocator,
                slots: RefCell::new(Vec::new()),
                free_list: RefCell::new(Vec::new()),
                busy_stack: RefCell::new(vec![main_slot.clone()]),
                main_slot,
            }),
        };
        CURRENT_MANAGER.with(|cell| *cell.borrow_mut() = Some(mgr.clone()));
        mgr
    }

    fn grow(&self) -> bool {
        let mut slots = self.inner.slots.borrow_mut();
        if slots.len() + CO_GROW > CO_CAP {
            return false;
        }
        for i in 0..CO_GROW {
            let stack = match self.inner.page_allocator.alloc() {
                Some(p) => p,
                None => return i > 0,
            };
            let slot = Rc::new(Slot {
                status: Cell::new(Status::Dead),
                ctx: UnsafeCell::new(RawContext::empty()),
                stack,
                routine: RefCell::new(None),
            });
            self.inner.free_list.borrow_mut().push(slot.clone());
            slots.push(slot);
        }
        true
    }

    /// Reserve a slot and prime it with `routine`, but don't run it yet —
    /// matches the original's `spawn()`, which just marks the coroutine
    /// `READY`; the first `resume()` performs `set_context`.
    pub fn spawn(&self, routine: impl FnOnce() + 'static) -> Option<Coroutine> {
        let popped = self.inner.free_list.borrow_mut().pop();
        let slot = match popped {
            Some(s) => s,
            None => {
                if !self.grow() {
                    return None;
                }
                self.inner.free_list.borrow_mut().pop()?
            }
        };
        *slot.routine.borrow_mut() = Some(Box::new(routine));
        slot.status.set(Status::Ready);
        Some(Coroutine { slot })
    }

    /// Resume `co`. Returns `false` if `co` is the caller itself, or not
    /// in a resumable state (`READY`/`SUSPEND`).
    pub fn resume(&self, co: &Coroutine) -> bool {
        let caller = self
            .inner
            .busy_stack
            .borrow()
            .last()
            .cloned()
            .expect("resume called with an empty busy stack");
        if Rc::ptr_eq(&caller, &co.slot) {
            return false;
        }

        match co.slot.status.get() {
            Status::Ready => {
                let stack_ptr = co.slot.stack.start();
                let stack_len = co.slot.stack.size();
                // SAFETY: the slot's page is exclusively owned by this
                // coroutine for as long as it is not DEAD, and outlives
                // the switch below.
                let stack = unsafe { std::slice::from_raw_parts_mut(stack_ptr, stack_len) };
                // SAFETY: no other borrow of this slot's context is live;
                // the slot was just taken off the free list.
                unsafe {
                    make_context(&mut *co.slot.ctx.get(), trampoline, stack);
                }
            }
            Status::Suspend => {}
            _ => return false,
        }

        self.inner.busy_stack.borrow_mut().push(co.slot.clone());
        co.slot.status.set(Status::Running);

        // SAFETY: `caller` and `co.slot` are distinct, live slots owned by
        // this manager. Raw pointers, not `RefCell` guards: this call does
        // not return to this statement until something switches back into
        // `caller`'s context, which may be long after `co` (and anything
        // `co` itself resumes) has taken further borrows of its own
        // context — a `RefMut` held open across that span would falsely
        // conflict with `co`'s own subsequent `yield_now()`.
        unsafe {
            switch_context(&mut *caller.ctx.get(), &mut *co.slot.ctx.get());
        }
        true
    }

    /// Suspend the currently running coroutine and return control to
    /// whoever resumed it. Returns `false` if called from the main
    /// coroutine (nothing to yield from).
    pub fn yield_now(&self) -> bool {
        let co = self
            .inner
            .busy_stack
            .borrow()
            .last()
            .cloned()
            .expect("yield called with an empty busy stack");
        if Rc::ptr_eq(&co, &self.inner.main_slot) {
            return false;
        }

        co.status.set(Status::Suspend);
        self.inner.busy_stack.borrow_mut().pop();
        let caller = self
            .inner
            .busy_stack
            .borrow()
            .last()
            .cloned()
            .expect("yield with no caller to return to");

        // SAFETY: both slots are owned by this manager and remain alive —
        // `co` stays referenced by whoever holds its `Coroutine` handle.
        // Raw pointers rather than `RefCell` guards, for the same reason
        // as `resume()`: this call does not return until `co` is resumed
        // again, by which point `resume()` itself has already taken (and
        // must be able to take) a fresh borrow of the same cell.
        unsafe {
            switch_context(&mut *co.ctx.get(), &mut *caller.ctx.get());
        }
        true
    }

    /// The coroutine currently executing on this thread.
    pub fn current(&self) -> Coroutine {
        let slot = self
            .inner
            .busy_stack
            .borrow()
            .last()
            .cloned()
            .expect("current() called with an empty busy stack");
        Coroutine { slot }
    }

    pub fn is_main_routine(&self) -> bool {
        Rc::ptr_eq(
            &self
                .inner
                .busy_stack
                .borrow()
                .last()
                .cloned()
                .expect("is_main_routine called with an empty busy stack"),
            &self.inner.main_slot,
        )
    }

    pub fn pool_size(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.free_list.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn manager() -> CoroutineManager {
        CoroutineManager::new(Rc::new(PageAllocator::new(CO_MEMSIZE)))
    }

    #[test]
    fn resume_runs_the_routine_to_completion() {
        let mgr = manager();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        let co = mgr.spawn(move || ran_clone.set(true)).unwrap();
        assert_eq!(co.status(), Status::Ready);

        let resumed = mgr.resume(&co);
        assert!(resumed);
        assert!(ran.get());
        assert_eq!(co.status(), Status::Dead);
    }

    #[test]
    fn yield_suspends_and_a_second_resume_continues() {
        let mgr = manager();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let order_clone = order.clone();
        let mgr_clone = mgr.clone();

        let co = mgr
            .spawn(move || {
                order_clone.borrow_mut().push("a");
                mgr_clone.yield_now();
                order_clone.borrow_mut().push("b");
            })
            .unwrap();

        mgr.resume(&co);
        assert_eq!(*order.borrow(), vec!["a"]);
        assert_eq!(co.status(), Status::Suspend);

        mgr.resume(&co);
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(co.status(), Status::Dead);
    }

    #[test]
    fn resuming_the_current_coroutine_is_rejected() {
        let mgr = manager();
        let mgr_clone = mgr.clone();
        let result = Rc::new(Cell::new(None));
        let result_clone = result.clone();

        let co_cell: Rc<RefCell<Option<Coroutine>>> = Rc::new(RefCell::new(None));
        let co_cell_for_closure = co_cell.clone();
        let co = mgr
            .spawn(move || {
                let self_handle = co_cell_for_closure.borrow().clone().unwrap();
                result_clone.set(Some(mgr_clone.resume(&self_handle)));
            })
            .unwrap();
        *co_cell.borrow_mut() = Some(co.clone());

        mgr.resume(&co);
        assert_eq!(result.get(), Some(false));
    }

    #[test]
    fn freed_slots_are_reused_on_the_next_spawn() {
        let mgr = manager();
        let co1 = mgr.spawn(|| {}).unwrap();
        mgr.resume(&co1);
        assert_eq!(mgr.free_count(), CO_GROW - 1);

        let co2 = mgr.spawn(|| {}).unwrap();
        assert!(co1.ptr_eq(&co2), "dead slot should be recycled before growing the pool");
    }

    #[test]
    fn is_main_routine_true_outside_any_coroutine() {
        let mgr = manager();
        assert!(mgr.is_main_routine());
        let co = mgr.spawn(|| {}).unwrap();
        mgr.resume(&co);
        assert!(mgr.is_main_routine());
    }
}
