//! Spec §8, scenario 6 ("Stack isolation"): many coroutines filling a
//! stack-local buffer with a distinct pattern, yielding while another
//! coroutine runs, and resuming to find their own buffer untouched —
//! proving each pooled slot's `ucontext_t` stack (spec §4.F) is truly
//! private, not aliased or wrapped by the allocator.

use coronet::coroutine::{CoroutineManager, CO_MEMSIZE};
use coronet::page::PageAllocator;
use std::cell::RefCell;
use std::rc::Rc;

const COROUTINE_COUNT: usize = 200;
const PATTERN_LEN: usize = 4096;

#[test]
fn each_coroutine_keeps_its_own_stack_buffer_across_yield_and_resume() {
    let mgr = CoroutineManager::new(Rc::new(PageAllocator::new(CO_MEMSIZE)));
    let outcomes: Rc<RefCell<Vec<Option<bool>>>> =
        Rc::new(RefCell::new(vec![None; COROUTINE_COUNT]));

    let mut coroutines = Vec::with_capacity(COROUTINE_COUNT);
    for i in 0..COROUTINE_COUNT {
        let mgr_clone = mgr.clone();
        let outcomes_clone = outcomes.clone();
        let byte = (i % 251) as u8;
        let co = mgr
            .spawn(move || {
                // A stack-local buffer, not heap-allocated: if two
                // coroutines' ucontext stacks overlapped, writes made here
                // by a later coroutine would corrupt this one's copy while
                // it sits suspended.
                let mut buf = [0u8; PATTERN_LEN];
                for (j, slot) in buf.iter_mut().enumerate() {
                    *slot = byte.wrapping_add(j as u8);
                }

                mgr_clone.yield_now();

                let intact = buf
                    .iter()
                    .enumerate()
                    .all(|(j, &v)| v == byte.wrapping_add(j as u8));
                outcomes_clone.borrow_mut()[i] = Some(intact);
            })
            .unwrap();
        coroutines.push(co);
    }

    for co in &coroutines {
        mgr.resume(co);
    }
    for co in &coroutines {
        assert_eq!(
            co.status(),
            coronet::coroutine::Status::Suspend,
            "every coroutine should be parked at its yield point"
        );
    }

    for co in &coroutines {
        mgr.resume(co);
    }
    for co in &coroutines {
        assert_eq!(co.status(), coronet::coroutine::Status::Dead);
    }

    let results = outcomes.borrow();
    for (i, outcome) in results.iter().enumerate() {
        assert_eq!(
            *outcome,
            Some(true),
            "coroutine {i}'s stack buffer was corrupted by another coroutine's stack"
        );
    }
}
