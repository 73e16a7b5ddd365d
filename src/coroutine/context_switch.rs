//! Raw `ucontext_t` plumbing. Grounded on
//! `original_source/.../coroutine.cpp`'s `set_context`/`switch_context`,
//! which use `getcontext`/`makecontext`/`swapcontext` on POSIX rather than
//! hand-written assembly.

use std::mem::MaybeUninit;

/// One saved CPU/stack context. Opaque outside this module; callers pass
/// it by mutable reference to [`make_context`] and [`switch_context`].
pub struct RawContext(libc::ucontext_t);

impl RawContext {
    /// An empty context, suitable only as the `from` side of the very
    /// first `switch_context` call (its contents are overwritten by
    /// `swapcontext` before anyone reads them).
    pub fn empty() -> Self {
        // SAFETY: ucontext_t is a plain-old-data struct; zero-init is a
        // valid (if meaningless) bit pattern until getcontext/swapcontext
        // fills it in.
        let ctx = unsafe { MaybeUninit::<libc::ucontext_t>::zeroed().assume_init() };
        Self(ctx)
    }
}

/// Build a fresh context that, when switched to, starts executing `func`
/// on `stack` (entirely replacing the current call stack for that
/// coroutine — `func` must never return via a normal `ret`, only via
/// another `switch_context`).
///
/// # Safety
/// `stack` must remain valid and unmoved for as long as any context built
/// from it can still be switched to.
pub unsafe fn make_context(ctx: &mut RawContext, func: extern "C" fn(), stack: &mut [u8]) {
    libc::getcontext(&mut ctx.0);
    ctx.0.uc_link = std::ptr::null_mut();
    ctx.0.uc_stack.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
    ctx.0.uc_stack.ss_size = stack.len();
    ctx.0.uc_stack.ss_flags = 0;
    libc::makecontext(&mut ctx.0, func, 0);
}

/// Save the caller's state into `from` and resume `to`. Returns only once
/// some later `switch_context` targets `from` again.
///
/// # Safety
/// Both contexts must have been produced by [`make_context`] or
/// [`RawContext::empty`], and their backing stacks (if any) must still be
/// alive.
pub unsafe fn switch_context(from: &mut RawContext, to: &mut RawContext) {
    libc::swapcontext(&mut from.0, &mut to.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal end-to-end smoke test of the raw switch primitive,
    // independent of the coroutine pool built on top of it.
    static mut SIDE_EFFECT: u32 = 0;
    static mut RETURN_CTX: Option<*mut RawContext> = None;

    extern "C" fn bump_and_return() {
        unsafe {
            SIDE_EFFECT += 1;
            let ret = RETURN_CTX.take().expect("return context must be set");
            let mut dummy = RawContext::empty();
            switch_context(&mut dummy, &mut *ret);
        }
    }

    #[test]
    fn switches_into_a_fresh_stack_and_back() {
        unsafe {
            SIDE_EFFECT = 0;
            let mut stack = vec![0u8; 64 * 1024];
            let mut callee = RawContext::empty();
            make_context(&mut callee, bump_and_return, &mut stack);

            let mut caller = RawContext::empty();
            RETURN_CTX = Some(&mut caller as *mut RawContext);
            switch_context(&mut caller, &mut callee);

            assert_eq!(SIDE_EFFECT, 1);
        }
    }
}
