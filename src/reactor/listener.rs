//! Passive listening socket (spec §4.E). Grounded on
//! `NetworkInstance::listen`/`on_accept` in
//! `original_source/.../network.cpp`.

use super::{Reactor, POLL_IN};
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

/// Binds and accepts inbound connections, handing each accepted fd to an
/// `on_accept` callback so the caller can register it with the reactor
/// under its own handler.
pub struct Listener {
    fd: RawFd,
    reactor: Reactor,
}

impl Listener {
    /// Bind, start listening, and register with `reactor`. `on_accept` is
    /// invoked once per accepted connection with the new peer fd and its
    /// address; it decides what handler the new socket gets.
    pub fn bind(
        reactor: &Reactor,
        addr: &str,
        mut on_accept: impl FnMut(&Reactor, RawFd, std::net::SocketAddr) + 'static,
    ) -> std::io::Result<Self> {
        let std_listener = StdTcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let fd = std_listener.into_raw_fd();

        let reactor_clone = reactor.clone();
        reactor
            .open(
                fd,
                POLL_IN,
                Box::new(move |socket, flags| {
                    if flags & super::POLL_ERR != 0 {
                        return false;
                    }
                    if flags & POLL_IN == 0 {
                        return true;
                    }
                    loop {
                        let mut sockaddr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                        let accepted = unsafe {
                            libc::accept(
                                socket.fd(),
                                &mut sockaddr as *mut _ as *mut libc::sockaddr,
                                &mut len,
                            )
                        };
                        if accepted < 0 {
                            break;
                        }
                        if let Some(addr) = sockaddr_to_std(&sockaddr) {
                            on_accept(&reactor_clone, accepted, addr);
                        } else {
                            unsafe {
                                libc::close(accepted);
                            }
                        }
                    }
                    true
                }),
                true,
            )
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "listener registration failed"))?;

        Ok(Self {
            fd,
            reactor: reactor.clone(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    /// Dropping a `Listener` (e.g. via `shutdown_servlets()` clearing
    /// `NetworkInstance::listener`) must stop the OS from accepting new
    /// connections immediately, not just forget the handle — close the
    /// underlying fd through the reactor so it is deregistered and the
    /// kernel backlog is torn down.
    fn drop(&mut self) {
        self.reactor.close(self.fd, 0);
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<std::net::SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr_in6: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerManager;
    use std::cell::RefCell;
    use std::net::TcpStream;

    #[test]
    fn accepts_a_connection_and_invokes_callback() {
        let reactor = Reactor::new(Rc::new(TimerManager::new()), 64).unwrap();
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let accepted_clone = accepted.clone();

        let listener = Listener::bind(&reactor, "127.0.0.1:0", move |_reactor, fd, _addr| {
            accepted_clone.borrow_mut().push(fd);
        })
        .unwrap();

        let local_addr = {
            let sock: std::net::TcpListener = unsafe {
                use std::os::unix::io::FromRawFd;
                std::net::TcpListener::from_raw_fd(listener.fd())
            };
            let addr = sock.local_addr().unwrap();
            std::mem::forget(sock);
            addr
        };

        let _client = TcpStream::connect(local_addr).unwrap();
        for _ in 0..10 {
            reactor.loop_once(50).unwrap();
            if !accepted.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(accepted.borrow().len(), 1);
    }
}
