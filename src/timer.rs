//! Timer manager (spec §4.C).
//!
//! Schedules one-shot and recurring callbacks keyed by absolute monotonic
//! deadline in milliseconds. A timer is pending (in the heap), firing
//! (callback executing), or closed (cannot fire again). Recurring timers
//! re-schedule iff their callback returns a non-zero next delay.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Instant;

pub type TimeMs = u64;

/// Callback signature: `(actual_fire_time_ms) -> next_delay_ms`. A return
/// of 0 closes the timer; non-zero reschedules at `now + return value`.
pub type TimerCallback = Box<dyn FnMut(TimeMs) -> TimeMs>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Firing,
    Closed,
}

struct TimerInner {
    deadline: Cell<TimeMs>,
    state: Cell<TimerState>,
    callback: RefCell<TimerCallback>,
    /// Insertion order, used to break deadline ties (spec §4.C: "firing
    /// order among timers with equal deadlines is insertion order").
    seq: u64,
}

/// Handle to a scheduled timer. Cloning shares the same underlying timer;
/// `close()` is idempotent.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn is_pending(&self) -> bool {
        self.inner.state.get() == TimerState::Pending
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == TimerState::Closed
    }

    /// Close the timer so it can never fire again. Safe to call from
    /// inside or outside the firing callback, any number of times.
    pub fn close(&self) {
        self.inner.state.set(TimerState::Closed);
    }

    pub fn deadline(&self) -> TimeMs {
        self.inner.deadline.get()
    }
}

/// Heap entry: min-heap on deadline, tie-broken by insertion order (older
/// first), via a reversed `Ord` so `BinaryHeap` (a max-heap) pops the
/// smallest.
struct HeapEntry(Rc<TimerInner>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline.get() == other.0.deadline.get() && self.0.seq == other.0.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller deadline / smaller seq sorts "greater" so it
        // pops first from the max-heap.
        other
            .0
            .deadline
            .get()
            .cmp(&self.0.deadline.get())
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Far-future sentinel returned by `loop()` when no timer is pending.
pub const NO_DEADLINE: TimeMs = TimeMs::MAX;

pub struct TimerManager {
    heap: RefCell<BinaryHeap<HeapEntry>>,
    next_seq: Cell<u64>,
    epoch: Instant,
    now: Cell<TimeMs>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        let mgr = Self {
            heap: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            epoch: Instant::now(),
            now: Cell::new(0),
        };
        mgr.adjust_time();
        mgr
    }

    /// Read the monotonic clock once; callbacks observe a consistent value
    /// for the duration of one `loop()` call (spec §4.C).
    pub fn adjust_time(&self) -> TimeMs {
        let ms = self.epoch.elapsed().as_millis() as TimeMs;
        self.now.set(ms);
        ms
    }

    pub fn now(&self) -> TimeMs {
        self.now.get()
    }

    fn push(&self, deadline: TimeMs, callback: TimerCallback) -> Timer {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let inner = Rc::new(TimerInner {
            deadline: Cell::new(deadline),
            state: Cell::new(TimerState::Pending),
            callback: RefCell::new(callback),
            seq,
        });
        self.heap.borrow_mut().push(HeapEntry(inner.clone()));
        Timer { inner }
    }

    /// Fire once at `now + delay_ms`.
    pub fn schedule(&self, delay_ms: TimeMs, callback: impl FnMut(TimeMs) -> TimeMs + 'static) -> Timer {
        self.schedule_abs(self.now() + delay_ms, callback)
    }

    /// Fire at an absolute deadline; `0` fires on the very next `loop()`.
    pub fn schedule_abs(
        &self,
        deadline_ms: TimeMs,
        callback: impl FnMut(TimeMs) -> TimeMs + 'static,
    ) -> Timer {
        self.push(deadline_ms, Box::new(callback))
    }

    /// Fire every timer whose deadline is `<= now`. Each timer fires at
    /// most once per call, even if its callback reschedules it due again
    /// immediately. Returns the next pending deadline, or [`NO_DEADLINE`].
    pub fn loop_once(&self) -> TimeMs {
        let now = self.adjust_time();

        // Drain due timers into a batch first so a reschedule landing
        // back at `now` doesn't get a second chance this call.
        let mut due = Vec::new();
        {
            let mut heap = self.heap.borrow_mut();
            while let Some(top) = heap.peek() {
                if top.0.state.get() == TimerState::Closed {
                    heap.pop();
                    continue;
                }
                if top.0.deadline.get() > now {
                    break;
                }
                due.push(heap.pop().unwrap().0);
            }
        }

        for inner in due {
            if inner.state.get() == TimerState::Closed {
                continue;
            }
            inner.state.set(TimerState::Firing);
            let next_delay = (inner.callback.borrow_mut())(now);
            if inner.state.get() == TimerState::Closed {
                continue;
            }
            if next_delay == 0 {
                inner.state.set(TimerState::Closed);
            } else {
                let next_deadline = now + next_delay;
                inner.deadline.set(next_deadline);
                inner.state.set(TimerState::Pending);
                self.heap.borrow_mut().push(HeapEntry(inner));
            }
        }

        self.heap
            .borrow()
            .peek()
            .map(|e| e.0.deadline.get())
            .unwrap_or(NO_DEADLINE)
    }

    /// Close every pending timer.
    pub fn clear(&self) {
        for entry in self.heap.borrow_mut().drain() {
            entry.0.state.set(TimerState::Closed);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.heap
            .borrow()
            .iter()
            .filter(|e| e.0.state.get() == TimerState::Pending)
            .count()
    }
}
