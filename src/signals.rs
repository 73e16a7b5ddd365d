//! POSIX signal wiring (spec §6): SIGTERM/SIGHUP request a graceful
//! shutdown, SIGPIPE is ignored, and SIGSEGV/SIGABRT print a backtrace
//! before falling through to the default action. Grounded on
//! `original_source/.../application.cpp`'s `__sig_handler`/
//! `__sig_term_handler` — same four behaviors, `signal-hook`'s safe flag
//! registration standing in for the raw `signal()` calls where that's
//! sufficient, and a raw `sigaction` only for the two signals whose handler
//! needs to do more than flip a flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared with the main loop: observed via [`Termination::requested`].
#[derive(Clone)]
pub struct Termination(Arc<AtomicBool>);

impl Termination {
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Exposed for `Application::term()` — programmatic shutdown requests
    /// go through the same flag signals set.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Install SIGTERM/SIGHUP (graceful), SIGPIPE (ignore), and SIGSEGV/SIGABRT
/// (backtrace then default action) for this process. Must be called once,
/// before the reactor starts polling.
pub fn install() -> std::io::Result<Termination> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, flag.clone())?;

    // SAFETY: sigaction with SIG_IGN is always valid; no-op that loses no
    // state anyone depends on.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    install_fatal_handler(libc::SIGSEGV)?;
    install_fatal_handler(libc::SIGABRT)?;

    Ok(Termination(flag))
}

fn install_fatal_handler(signum: libc::c_int) -> std::io::Result<()> {
    // SAFETY: `fatal_signal_handler` is a valid `extern "C" fn(c_int)`;
    // installing it via sigaction with SA_RESETHAND means a second
    // delivery of the same signal (e.g. while printing the backtrace)
    // falls through to the OS default instead of recursing.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fatal_signal_handler as usize;
        action.sa_flags = libc::SA_RESETHAND;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

extern "C" fn fatal_signal_handler(signum: libc::c_int) {
    // Not async-signal-safe (matches the original's `print_back_trace`
    // before `SIG_DFL`), but this handler only runs once before
    // `SA_RESETHAND` restores the default action, which then re-raises
    // and terminates the process.
    eprintln!("fatal signal {signum}, backtrace:");
    eprintln!("{}", std::backtrace::Backtrace::force_capture());
    unsafe {
        libc::raise(signum);
    }
}
