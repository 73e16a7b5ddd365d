//! I/O reactor (spec §4.D): readiness multiplexing over sockets, driving
//! send/recv and linger-close semantics. Built on `mio`, the idiomatic
//! Rust equivalent of the original's epoll wrapper
//! (`original_source/.../reactor.cpp`).

pub mod connector;
pub mod listener;

use crate::timer::{Timer, TimerManager};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Readiness bitmask delivered to socket handlers.
pub const POLL_IN: u32 = 1 << 0;
pub const POLL_OUT: u32 = 1 << 1;
pub const POLL_ERR: u32 = 1 << 2;
/// Synthesized on hang-up, or when `close()` removes a non-lingering socket.
pub const POLL_CLOSE: u32 = 1 << 3;
/// Delivered once to a listener after bind/listen.
pub const POLL_OPEN: u32 = 1 << 4;

pub type Handler = Box<dyn FnMut(&Socket, u32) -> bool>;

/// One TCP endpoint: fd, interest flags, input/output byte buffers, and
/// the handler invoked on readiness (spec §3 Socket).
pub struct Socket {
    fd: RawFd,
    token: Token,
    flags: Cell<u32>,
    edge_triggered: bool,
    input: RefCell<Vec<u8>>,
    output: RefCell<Vec<u8>>,
    handler: RefCell<Handler>,
    linger_timer: RefCell<Option<Timer>>,
    reactor: Weak<ReactorInner>,
    /// Set to `false` once deregistered; guards against double-close.
    registered: Cell<bool>,
}

impl Socket {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    /// Growable input buffer. Handlers read from the front as frames are
    /// consumed and leave the remainder for the next readiness event.
    pub fn input(&self) -> std::cell::RefMut<'_, Vec<u8>> {
        self.input.borrow_mut()
    }

    /// Growable output buffer. Append-only from handler code; the
    /// reactor drains it on the next `loop()`'s flush pass.
    pub fn output(&self) -> std::cell::RefMut<'_, Vec<u8>> {
        self.output.borrow_mut()
    }

    /// Equivalent of the original's `socket->send()`: enqueue this socket
    /// on the reactor's pending-output list.
    pub fn request_send(&self) {
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.enqueue_send(self.token);
        }
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }
}

struct ReactorInner {
    poll: RefCell<Poll>,
    timer_mgr: Rc<TimerManager>,
    /// Slot `i` backs `Token(i)`; a slab reuses freed slots instead of
    /// growing the token space without bound across the socket's churn.
    sockets: RefCell<Slab<Rc<Socket>>>,
    fd_to_token: RefCell<HashMap<RawFd, Token>>,
    pending_output: RefCell<Vec<Token>>,
    pending_output_set: RefCell<std::collections::HashSet<Token>>,
    max_events: usize,
}

impl ReactorInner {
    fn enqueue_send(&self, token: Token) {
        let mut set = self.pending_output_set.borrow_mut();
        if set.insert(token) {
            self.pending_output.borrow_mut().push(token);
        }
    }
}

/// Readiness-based socket multiplexer (spec §4.D).
#[derive(Clone)]
pub struct Reactor(Rc<ReactorInner>);

impl Reactor {
    pub fn new(timer_mgr: Rc<TimerManager>, max_events: usize) -> Result<Self, crate::error::GxError> {
        let poll = Poll::new().map_err(crate::error::GxError::ReactorInit)?;
        Ok(Self(Rc::new(ReactorInner {
            poll: RefCell::new(poll),
            timer_mgr,
            sockets: RefCell::new(Slab::new()),
            fd_to_token: RefCell::new(HashMap::new()),
            pending_output: RefCell::new(Vec::new()),
            pending_output_set: RefCell::new(std::collections::HashSet::new()),
            max_events,
        })))
    }

    fn interest_for(flags: u32) -> Option<Interest> {
        let readable = flags & POLL_IN != 0;
        let writable = flags & POLL_OUT != 0;
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Register an already-open, non-blocking-capable OS socket fd.
    /// Fails if the fd is invalid or already registered.
    pub fn open(
        &self,
        fd: RawFd,
        flags: u32,
        handler: Handler,
        edge_triggered: bool,
    ) -> Option<Rc<Socket>> {
        if fd < 0 {
            return None;
        }
        if self.0.fd_to_token.borrow().contains_key(&fd) {
            return None;
        }

        set_nonblocking(fd);
        set_nodelay(fd);

        let mut sockets = self.0.sockets.borrow_mut();
        let entry = sockets.vacant_entry();
        let token = Token(entry.key());

        let interest = Self::interest_for(flags).unwrap_or(Interest::READABLE);
        let mut source = SourceFd(&fd);
        if self
            .0
            .poll
            .borrow_mut()
            .registry()
            .register(&mut source, token, interest)
            .is_err()
        {
            return None;
        }

        let socket = Rc::new(Socket {
            fd,
            token,
            flags: Cell::new(flags),
            edge_triggered,
            input: RefCell::new(Vec::new()),
            output: RefCell::new(Vec::new()),
            handler: RefCell::new(handler),
            linger_timer: RefCell::new(None),
            reactor: Rc::downgrade(&self.0),
            registered: Cell::new(true),
        });

        entry.insert(socket.clone());
        drop(sockets);
        self.0.fd_to_token.borrow_mut().insert(fd, token);
        Some(socket)
    }

    /// Re-apply a socket's current interest flags to the OS poll mechanism.
    pub fn modify(&self, socket: &Socket) -> bool {
        if !socket.registered.get() {
            return false;
        }
        let interest = Self::interest_for(socket.flags()).unwrap_or(Interest::READABLE);
        let mut source = SourceFd(&socket.fd);
        self.0
            .poll
            .borrow_mut()
            .registry()
            .reregister(&mut source, socket.token, interest)
            .is_ok()
    }

    /// Enqueue `socket` for output; does not block.
    pub fn send(&self, socket: &Socket) {
        self.0.enqueue_send(socket.token);
    }

    /// Deregister and close `fd`. With `linger_ms == 0`, this happens
    /// immediately and the handler is invoked once with `POLL_CLOSE`.
    /// Otherwise the handler is replaced with a drain-only one that
    /// discards inbound bytes, and a timer finalizes the close after
    /// `linger_ms`.
    pub fn close(&self, fd: RawFd, linger_ms: u64) {
        let token = match self.0.fd_to_token.borrow().get(&fd).copied() {
            Some(t) => t,
            None => return,
        };
        let socket = match self.0.sockets.borrow().get(token.0).cloned() {
            Some(s) => s,
            None => return,
        };

        if linger_ms == 0 {
            self.finalize_close(&socket, true);
            return;
        }

        // Replace the handler with a drain-only one (spec §4.D / §9: reads
        // and discards, never re-delivers the bytes to the old handler).
        *socket.handler.borrow_mut() = Box::new(|socket: &Socket, flags: u32| {
            if flags & POLL_CLOSE != 0 {
                return false;
            }
            if flags & POLL_ERR != 0 {
                return false;
            }
            if flags & POLL_IN != 0 {
                socket.input().clear();
            }
            true
        });
        socket.set_flags(POLL_IN);
        self.modify(&socket);

        let reactor = self.clone();
        let fd_copy = fd;
        let timer = self.0.timer_mgr.schedule(linger_ms, move |_now| {
            reactor.finalize_linger(fd_copy);
            0
        });
        *socket.linger_timer.borrow_mut() = Some(timer);
    }

    fn finalize_linger(&self, fd: RawFd) {
        let token = match self.0.fd_to_token.borrow().get(&fd).copied() {
            Some(t) => t,
            None => return,
        };
        if let Some(socket) = self.0.sockets.borrow().get(token.0).cloned() {
            self.finalize_close(&socket, false);
        }
    }

    /// Deregister the socket, run its handler with `POLL_CLOSE` (unless
    /// the caller already ran it, i.e. a non-lingering path driven from
    /// `loop_once`), and drop it from the fd table.
    fn finalize_close(&self, socket: &Rc<Socket>, invoke_handler: bool) {
        if !socket.registered.replace(false) {
            return;
        }
        if let Some(timer) = socket.linger_timer.borrow_mut().take() {
            timer.close();
        }
        let mut source = SourceFd(&socket.fd);
        let _ = self.0.poll.borrow_mut().registry().deregister(&mut source);
        self.0.sockets.borrow_mut().try_remove(socket.token.0);
        self.0.fd_to_token.borrow_mut().remove(&socket.fd);
        self.0
            .pending_output_set
            .borrow_mut()
            .remove(&socket.token);

        if invoke_handler {
            (socket.handler.borrow_mut())(socket, POLL_CLOSE);
        }
        unsafe {
            libc::close(socket.fd);
        }
    }

    /// Flush pending output, poll for readiness up to `timeout_ms`, and
    /// dispatch handlers. Returns an io error only on a poll failure that
    /// isn't `EINTR`.
    pub fn loop_once(&self, timeout_ms: u64) -> std::io::Result<()> {
        self.flush_pending_output();

        let mut events = Events::with_capacity(self.0.max_events);
        let timeout = std::time::Duration::from_millis(timeout_ms);
        loop {
            match self.0.poll.borrow_mut().poll(&mut events, Some(timeout)) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        for event in events.iter() {
            let token = event.token();
            let socket = match self.0.sockets.borrow().get(token.0).cloned() {
                Some(s) => s,
                None => continue,
            };

            let mut flags = 0u32;
            if event.is_readable() {
                flags |= POLL_IN;
            }
            if event.is_writable() {
                flags |= POLL_OUT;
            }
            if event.is_error() {
                flags |= POLL_ERR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                flags |= POLL_CLOSE;
            }

            // Per spec §4.D: the handler always sees the full combined
            // flags bitmask (poll_close included) and decides whether the
            // socket stays open — it is not force-closed ahead of the
            // handler, or data that arrived alongside the hang-up would
            // never be delivered.
            let keep_open = (socket.handler.borrow_mut())(&socket, flags);
            if !keep_open {
                self.finalize_close(&socket, false);
            }
        }

        Ok(())
    }

    fn flush_pending_output(&self) {
        let tokens: Vec<Token> = self.0.pending_output.borrow_mut().drain(..).collect();
        self.0.pending_output_set.borrow_mut().clear();

        for token in tokens {
            let socket = match self.0.sockets.borrow().get(token.0).cloned() {
                Some(s) => s,
                None => continue,
            };
            if !socket.registered.get() {
                continue;
            }

            let wrote_ok = write_pending(&socket);
            if !wrote_ok {
                let keep_open = (socket.handler.borrow_mut())(&socket, POLL_ERR);
                if !keep_open {
                    self.finalize_close(&socket, false);
                    continue;
                }
            }

            let remaining = !socket.output.borrow().is_empty();
            let mut flags = socket.flags();
            if remaining {
                flags |= POLL_OUT;
            } else {
                flags &= !POLL_OUT;
                if socket.linger_timer.borrow().is_some() {
                    // Every queued byte has been sent and a linger timer is
                    // active: half-close so the peer sees EOF promptly.
                    unsafe {
                        libc::shutdown(socket.fd, libc::SHUT_WR);
                    }
                }
            }
            socket.set_flags(flags);
            self.modify(&socket);
        }
    }

    pub fn socket_count(&self) -> usize {
        self.0.sockets.borrow().len()
    }
}

/// Write as much of `socket`'s output buffer as the OS will accept right
/// now (one write attempt per `loop()` flush pass, per spec §4.D).
fn write_pending(socket: &Socket) -> bool {
    let mut output = socket.output.borrow_mut();
    if output.is_empty() {
        return true;
    }
    loop {
        let n = unsafe { libc::write(socket.fd, output.as_ptr() as *const libc::c_void, output.len()) };
        if n >= 0 {
            output.drain(0..n as usize);
            return true;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINTR {
            continue;
        }
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return true;
        }
        return false;
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn set_nodelay(fd: RawFd) {
    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Read from `fd` into `buf`, appending until `EAGAIN`. Mirrors the
/// original's `Socket::load()`. Returns the number of bytes read, or a
/// negative value on a hard error.
pub fn load_into(fd: RawFd, buf: &mut Vec<u8>) -> i64 {
    let mut total: i64 = 0;
    let mut chunk = [0u8; 8192];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n > 0 {
            buf.extend_from_slice(&chunk[..n as usize]);
            total += n as i64;
            continue;
        }
        if n == 0 {
            // Peer performed an orderly shutdown.
            return if total > 0 { total } else { -1 };
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINTR {
            continue;
        }
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return total;
        }
        return -1;
    }
}
