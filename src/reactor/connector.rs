//! Active (outbound) connection attempts with retry (spec §4.E).
//! Grounded on `NetworkInstance::connect`/`on_connection` in
//! `original_source/.../network.cpp`, which re-arms a zero-delay timer to
//! drive reconnects rather than blocking or spinning in place.

use super::{Reactor, POLL_ERR, POLL_OUT};
use crate::timer::{Timer, TimerManager};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Dead,
}

/// Drives one outbound address through connect/retry until it either
/// succeeds (`on_connected` fires once) or the connector is explicitly
/// stopped.
pub struct Connector {
    inner: Rc<ConnectorInner>,
}

struct ConnectorInner {
    addr: SocketAddr,
    state: Cell<ConnectorState>,
    retry_delay_ms: u64,
    connect_timeout_ms: u64,
    /// Guards the in-flight connect attempt registered in `attempt()`;
    /// closed (and replaced) whenever that attempt resolves one way or
    /// the other, so a stale timeout never fires against a later attempt.
    connect_timer: RefCell<Option<Timer>>,
}

impl Connector {
    /// Start connecting to `addr`, retrying every `retry_delay_ms` on
    /// failure until `on_connected` runs or `stop()` is called. A connect
    /// attempt that hasn't resolved within `connect_timeout_ms` is closed
    /// and retried (spec §4.E).
    pub fn start(
        reactor: Reactor,
        timer_mgr: Rc<TimerManager>,
        addr: SocketAddr,
        retry_delay_ms: u64,
        connect_timeout_ms: u64,
        on_connected: impl Fn(&Reactor, RawFd) + 'static,
    ) -> Self {
        let inner = Rc::new(ConnectorInner {
            addr,
            state: Cell::new(ConnectorState::Idle),
            retry_delay_ms,
            connect_timeout_ms,
            connect_timer: RefCell::new(None),
        });
        let connector = Self { inner: inner.clone() };
        let on_connected = Rc::new(on_connected);
        attempt(reactor, timer_mgr, inner, on_connected);
        connector
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.state.get()
    }

    /// Give up; a future `Connecting` completion or retry timer becomes a
    /// no-op once it observes `Dead`.
    pub fn stop(&self) {
        self.inner.state.set(ConnectorState::Dead);
    }
}

fn attempt(
    reactor: Reactor,
    timer_mgr: Rc<TimerManager>,
    inner: Rc<ConnectorInner>,
    on_connected: Rc<dyn Fn(&Reactor, RawFd)>,
) {
    if inner.state.get() == ConnectorState::Dead {
        return;
    }
    inner.state.set(ConnectorState::Connecting);

    match raw_nonblocking_connect(inner.addr) {
        Ok(fd) => {
            let reactor_for_handler = reactor.clone();
            let inner_for_handler = inner.clone();
            let timer_mgr_for_handler = timer_mgr.clone();
            let on_connected_for_handler = on_connected.clone();

            let registered = reactor.open(
                fd,
                POLL_OUT,
                Box::new(move |socket, flags| {
                    if inner_for_handler.state.get() != ConnectorState::Connecting {
                        return false;
                    }
                    if let Some(timer) = inner_for_handler.connect_timer.borrow_mut().take() {
                        timer.close();
                    }
                    if flags & POLL_ERR != 0 || !connect_succeeded(socket.fd()) {
                        inner_for_handler.state.set(ConnectorState::Idle);
                        schedule_retry(
                            reactor_for_handler.clone(),
                            timer_mgr_for_handler.clone(),
                            inner_for_handler.clone(),
                            on_connected_for_handler.clone(),
                        );
                        return false;
                    }
                    inner_for_handler.state.set(ConnectorState::Connected);
                    (on_connected_for_handler)(&reactor_for_handler, socket.fd());
                    false // handed off: a fresh handler takes over registration for fd
                }),
                true,
            );

            if registered.is_none() {
                unsafe {
                    libc::close(fd);
                }
                schedule_retry(reactor, timer_mgr, inner, on_connected);
                return;
            }

            let reactor_for_timeout = reactor.clone();
            let inner_for_timeout = inner.clone();
            let timer_mgr_for_timeout = timer_mgr.clone();
            let on_connected_for_timeout = on_connected.clone();
            let timer = timer_mgr.schedule(inner.connect_timeout_ms, move |_now| {
                if inner_for_timeout.state.get() == ConnectorState::Connecting {
                    inner_for_timeout.state.set(ConnectorState::Idle);
                    reactor_for_timeout.close(fd, 0);
                    schedule_retry(
                        reactor_for_timeout.clone(),
                        timer_mgr_for_timeout.clone(),
                        inner_for_timeout.clone(),
                        on_connected_for_timeout.clone(),
                    );
                }
                0
            });
            *inner.connect_timer.borrow_mut() = Some(timer);
        }
        Err(_) => {
            schedule_retry(reactor, timer_mgr, inner, on_connected);
        }
    }
}

fn schedule_retry(
    reactor: Reactor,
    timer_mgr: Rc<TimerManager>,
    inner: Rc<ConnectorInner>,
    on_connected: Rc<dyn Fn(&Reactor, RawFd)>,
) {
    let delay = inner.retry_delay_ms;
    let timer_mgr_for_cb = timer_mgr.clone();
    timer_mgr.schedule(delay, move |_now| {
        attempt(
            reactor.clone(),
            timer_mgr_for_cb.clone(),
            inner.clone(),
            on_connected.clone(),
        );
        0
    });
}

fn connect_succeeded(fd: RawFd) -> bool {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    rc == 0 && err == 0
}

fn raw_nonblocking_connect(addr: SocketAddr) -> std::io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    let result = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };

    if result == 0 {
        return Ok(fd);
    }
    let errno = std::io::Error::last_os_error();
    if errno.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok(fd);
    }
    unsafe {
        libc::close(fd);
    }
    Err(errno)
}
