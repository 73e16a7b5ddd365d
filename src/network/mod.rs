//! Instance/node/servlet tables, connection lifecycle, call correlation,
//! and graceful shutdown (spec §4.H). Grounded line-for-line on
//! `original_source/.../network.cpp`.

pub mod config;

use crate::context::Context;
use crate::coroutine::CoroutineManager;
use crate::error::GxError;
use crate::frame;
use crate::page::PageAllocator;
use crate::reactor::connector::{Connector, ConnectorState};
use crate::reactor::listener::Listener;
use crate::reactor::{Reactor, Socket, POLL_IN, POLL_OUT};
use crate::servlet::ServletManager;
use crate::timer::TimerManager;
use config::NetworkConfig;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// One TCP endpoint bound to a [`NetworkInstance`]: the live connection, a
/// parse cursor over the socket's input, and the calls currently
/// suspended waiting on a reply through it.
pub struct Peer {
    socket: Rc<Socket>,
    is_ap: bool,
    /// True for the network's single outbound connector peer to some
    /// instance; false for an accepted (inbound) peer. Determines whether
    /// an arriving frame is routed to `response_handler` or
    /// `request_handler` (original: `peer.get() == _peer`).
    is_connector: Cell<bool>,
    calls: RefCell<Vec<Rc<Context>>>,
}

impl Peer {
    fn new(socket: Rc<Socket>, is_ap: bool, is_connector: bool) -> Rc<Self> {
        Rc::new(Self {
            socket,
            is_ap,
            is_connector: Cell::new(is_connector),
            calls: RefCell::new(Vec::new()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    fn send_frame(&self, reactor: &Reactor, servlet_id: u32, seq: u32, payload: &[u8]) {
        frame::encode(&mut self.socket.output(), servlet_id, seq, payload);
        reactor.send(&self.socket);
    }

    fn close(&self, reactor: &Reactor, linger_ms: u64) {
        reactor.close(self.fd(), linger_ms);
    }
}

/// One remote (or local) address hosting a share of a node's servlets.
pub struct NetworkInstance {
    host: String,
    port: u16,
    node_type: u32,
    /// Index within its node's instance (or AP) list — the load-balance
    /// bucket number.
    id: u32,
    ap: bool,
    servlets: RefCell<Vec<u32>>,
    timeout_ms: u64,
    interval_ms: u64,
    peer: RefCell<Option<Rc<Peer>>>,
    listener: RefCell<Option<Listener>>,
    connector: RefCell<Option<Connector>>,
    is_local: Cell<bool>,
}

impl NetworkInstance {
    pub fn is_ap(&self) -> bool {
        self.ap
    }

    pub fn is_local(&self) -> bool {
        self.is_local.get()
    }

    pub fn peer(&self) -> Option<Rc<Peer>> {
        self.peer.borrow().clone()
    }

    fn addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unresolvable host"))
    }
}

/// One cluster node: a named group of instances sharing a node_type,
/// split into AP instances (external clients dial these) and regular
/// instances (other nodes dial these, and they host servlets).
pub struct NetworkNode {
    pub node_type: u32,
    pub name: String,
    pub instances: RefCell<Vec<Rc<NetworkInstance>>>,
    pub aps: RefCell<Vec<Rc<NetworkInstance>>>,
    servlets: RefCell<HashMap<u16, Vec<Rc<NetworkInstance>>>>,
}

struct NetworkInner {
    reactor: Reactor,
    timer_mgr: Rc<TimerManager>,
    coroutine_mgr: CoroutineManager,
    page_allocator: Rc<PageAllocator>,
    servlet_mgr: Rc<ServletManager>,
    nodes: RefCell<HashMap<u32, Rc<NetworkNode>>>,
    /// Network-wide servlet table: servlet type -> hosting instances.
    servlets: RefCell<HashMap<u16, Vec<Rc<NetworkInstance>>>>,
    instances: RefCell<Vec<Rc<NetworkInstance>>>,
    seq: Cell<u32>,
    call_map: RefCell<HashMap<u32, Rc<Context>>>,
    call_count: Cell<u64>,
    accept_list: RefCell<Vec<Rc<Peer>>>,
    rpc_timeout_ms: Cell<u64>,
    connect_retry_ms: Cell<u64>,
    connect_timeout_ms: Cell<u64>,
    own_type: Cell<u32>,
    own_id: Cell<u32>,
}

/// Connection lifecycle, servlet-based load balancing, request/response
/// correlation, call timeouts, cancellation, and graceful shutdown.
#[derive(Clone)]
pub struct Network(Rc<NetworkInner>);

impl Network {
    pub fn new(
        reactor: Reactor,
        timer_mgr: Rc<TimerManager>,
        coroutine_mgr: CoroutineManager,
        page_allocator: Rc<PageAllocator>,
    ) -> Self {
        Self(Rc::new(NetworkInner {
            reactor,
            timer_mgr,
            coroutine_mgr,
            page_allocator,
            servlet_mgr: Rc::new(ServletManager::new()),
            nodes: RefCell::new(HashMap::new()),
            servlets: RefCell::new(HashMap::new()),
            instances: RefCell::new(Vec::new()),
            seq: Cell::new(0),
            call_map: RefCell::new(HashMap::new()),
            call_count: Cell::new(0),
            accept_list: RefCell::new(Vec::new()),
            rpc_timeout_ms: Cell::new(3000),
            connect_retry_ms: Cell::new(1000),
            connect_timeout_ms: Cell::new(3000),
            own_type: Cell::new(0),
            own_id: Cell::new(0),
        }))
    }

    pub fn servlet_manager(&self) -> Rc<ServletManager> {
        self.0.servlet_mgr.clone()
    }

    /// Populate the node/instance/servlet tables from a parsed config
    /// (spec §4.H.1; table shape mirrors the Lua `the_network` loader).
    pub fn load_config(&self, cfg: &NetworkConfig) {
        self.0.rpc_timeout_ms.set(cfg.rpc_timeout_ms);
        self.0.connect_retry_ms.set(cfg.connect_retry_ms);
        self.0.connect_timeout_ms.set(cfg.connect_timeout_ms);

        for entry in &cfg.instances {
            let node = self.node_or_create(entry.node_type, &entry.node_name);
            let instance = Rc::new(NetworkInstance {
                host: entry.host.clone(),
                port: entry.port,
                node_type: entry.node_type,
                id: entry.node_id,
                ap: entry.ap,
                servlets: RefCell::new(entry.servlets.clone()),
                timeout_ms: self.0.connect_timeout_ms.get(),
                interval_ms: self.0.connect_retry_ms.get(),
                peer: RefCell::new(None),
                listener: RefCell::new(None),
                connector: RefCell::new(None),
                is_local: Cell::new(false),
            });

            self.0.instances.borrow_mut().push(instance.clone());

            if instance.ap {
                node.aps.borrow_mut().push(instance.clone());
            } else {
                node.instances.borrow_mut().push(instance.clone());
            }

            if !entry.ap {
                for &servlet_id in &entry.servlets {
                    let ty = frame::servlet_type(servlet_id);
                    self.0
                        .servlets
                        .borrow_mut()
                        .entry(ty)
                        .or_default()
                        .push(instance.clone());
                    node.servlets.borrow_mut().entry(ty).or_default().push(instance.clone());
                }
            }
        }
    }

    fn node_or_create(&self, node_type: u32, name: &str) -> Rc<NetworkNode> {
        let mut nodes = self.0.nodes.borrow_mut();
        nodes
            .entry(node_type)
            .or_insert_with(|| {
                Rc::new(NetworkNode {
                    node_type,
                    name: name.to_string(),
                    instances: RefCell::new(Vec::new()),
                    aps: RefCell::new(Vec::new()),
                    servlets: RefCell::new(HashMap::new()),
                })
            })
            .clone()
    }

    fn node(&self, node_type: u32) -> Option<Rc<NetworkNode>> {
        self.0.nodes.borrow().get(&node_type).cloned()
    }

    /// Resolve a node type name (as given on the CLI, spec §10.4) to its
    /// integer `node_type`, mirroring the name-matching fallback in
    /// `Application::init` when no explicit numeric type is given.
    pub fn resolve_node_type(&self, name: &str) -> Option<u32> {
        self.0
            .nodes
            .borrow()
            .values()
            .find(|node| node.name == name)
            .map(|node| node.node_type)
    }

    /// Bind the local instance(s) for `(type, id)`, then start connecting
    /// to every non-AP instance in the cluster (spec §4.H.2).
    pub fn startup(&self, node_type: u32, id: u32) -> Result<(), GxError> {
        self.0.own_type.set(node_type);
        self.0.own_id.set(id);

        let node = self
            .node(node_type)
            .ok_or(GxError::UnknownNodeType)?;

        if let Some(instance) = node.aps.borrow().get(id as usize) {
            instance.is_local.set(true);
            self.listen(instance)?;
        }
        if let Some(instance) = node.instances.borrow().get(id as usize) {
            instance.is_local.set(true);
            self.listen(instance)?;
        }

        let instances: Vec<Rc<NetworkInstance>> = self.0.instances.borrow().clone();
        for instance in instances {
            if !instance.is_ap() {
                self.connect(&instance);
            }
        }
        Ok(())
    }

    fn listen(&self, instance: &Rc<NetworkInstance>) -> Result<(), GxError> {
        if instance.listener.borrow().is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", instance.host, instance.port);
        let net = self.clone();
        let listener = Listener::bind(&self.0.reactor, &addr, move |reactor, fd, _peer_addr| {
            net.on_accept(reactor, fd);
        })
        .map_err(GxError::Io)?;
        *instance.listener.borrow_mut() = Some(listener);
        Ok(())
    }

    fn connect(&self, instance: &Rc<NetworkInstance>) {
        if instance.connector.borrow().is_some() {
            return;
        }
        let addr = match instance.addr() {
            Ok(a) => a,
            Err(_) => return,
        };
        let net = self.clone();
        let instance_clone = instance.clone();
        let connector = Connector::start(
            self.0.reactor.clone(),
            self.0.timer_mgr.clone(),
            addr,
            instance.interval_ms,
            instance.timeout_ms,
            move |reactor, fd| {
                net.on_connection(reactor, &instance_clone, fd);
            },
        );
        *instance.connector.borrow_mut() = Some(connector);
    }

    fn on_connection(&self, reactor: &Reactor, instance: &Rc<NetworkInstance>, fd: RawFd) {
        let net = self.clone();
        let instance_for_handler = instance.clone();
        let peer_cell: Rc<RefCell<Option<Rc<Peer>>>> = Rc::new(RefCell::new(None));
        let peer_cell_for_handler = peer_cell.clone();

        let socket = match reactor.open(
            fd,
            POLL_IN,
            Box::new(move |socket, flags| {
                let peer = peer_cell_for_handler.borrow().clone();
                if let Some(peer) = peer {
                    net.on_data(&instance_for_handler, &peer, socket, flags)
                } else {
                    true
                }
            }),
            true,
        ) {
            Some(s) => s,
            None => return,
        };

        let peer = Peer::new(socket, false, true);
        *peer_cell.borrow_mut() = Some(peer.clone());
        *instance.peer.borrow_mut() = Some(peer);
        instance.connector.borrow_mut().take();
    }

    fn on_accept(&self, reactor: &Reactor, fd: RawFd) {
        let net = self.clone();
        let peer_cell: Rc<RefCell<Option<Rc<Peer>>>> = Rc::new(RefCell::new(None));
        let peer_cell_for_handler = peer_cell.clone();

        let socket = match reactor.open(
            fd,
            POLL_IN,
            Box::new(move |socket, flags| {
                let peer = peer_cell_for_handler.borrow().clone();
                match peer {
                    Some(peer) => net.on_data_accepted(&peer, socket, flags),
                    None => true,
                }
            }),
            true,
        ) {
            Some(s) => s,
            None => return,
        };

        let peer = Peer::new(socket, false, false);
        *peer_cell.borrow_mut() = Some(peer.clone());
        self.0.accept_list.borrow_mut().push(peer);
    }

    fn on_data_accepted(&self, peer: &Rc<Peer>, socket: &Socket, flags: u32) -> bool {
        self.on_data_common(peer, socket, flags, true)
    }

    fn on_data(&self, instance: &Rc<NetworkInstance>, peer: &Rc<Peer>, socket: &Socket, flags: u32) -> bool {
        let keep = self.on_data_common(peer, socket, flags, false);
        if !keep && instance.peer.borrow().as_ref().map(Rc::as_ptr) == Some(Rc::as_ptr(peer)) {
            instance.peer.borrow_mut().take();
            let net = self.clone();
            let instance_clone = instance.clone();
            self.0.timer_mgr.schedule_abs(0, move |_now| {
                net.connect(&instance_clone);
                0
            });
        }
        keep
    }

    fn on_data_common(&self, peer: &Rc<Peer>, socket: &Socket, flags: u32, is_accepted: bool) -> bool {
        use crate::reactor::{POLL_CLOSE, POLL_ERR};

        if flags & POLL_ERR != 0 {
            self.cancel_peer_calls(peer);
            return false;
        }
        if flags & POLL_OUT != 0 {
            socket.request_send();
        }
        if flags & POLL_IN != 0 {
            let n = crate::reactor::load_into(socket.fd(), &mut socket.input());
            if n < 0 {
                self.cancel_peer_calls(peer);
                return false;
            }
            loop {
                let frame = {
                    let mut input = socket.input();
                    if input.is_empty() {
                        break;
                    }
                    frame::try_parse(&mut input)
                };
                match frame {
                    None => break,
                    Some((header, payload)) => {
                        if is_accepted || !peer.is_connector.get() {
                            self.request_handler(header, peer, payload);
                        } else {
                            self.response_handler(header, payload);
                        }
                    }
                }
            }
        }
        // A hang-up alongside (or instead of) readable data still ends the
        // peer, once any frames that arrived with it are drained above.
        if flags & POLL_CLOSE != 0 {
            self.cancel_peer_calls(peer);
            return false;
        }
        true
    }

    fn cancel_peer_calls(&self, peer: &Rc<Peer>) {
        for ctx in peer.calls.borrow_mut().drain(..) {
            ctx.call_cancel();
        }
    }

    /// Dispatch an inbound request to its servlet, on a freshly spawned
    /// coroutine bound to a fresh [`Context`] (spec §4.H.5).
    fn request_handler(&self, header: frame::FrameHeader, peer: &Rc<Peer>, payload: Vec<u8>) {
        let handler = match self.0.servlet_mgr.get(header.servlet_id) {
            Some(h) => h,
            None => return,
        };

        let net = self.clone();
        let peer = peer.clone();
        let co = match self.0.coroutine_mgr.spawn(move || {
            let ctx = Context::new(
                net.0.coroutine_mgr.current(),
                net.0.coroutine_mgr.clone(),
                net.0.timer_mgr.clone(),
                net.0.page_allocator.clone(),
            );
            if !ctx.begin(header.servlet_id, peer.fd() as u64) {
                return;
            }
            ctx.set_seq(header.seq);

            let result = handler.call(&ctx, &payload);
            let response_payload = match &result {
                Ok(body) => frame::encode_response(0, body),
                Err(rc) => frame::encode_response(*rc, &[]),
            };
            if result.is_ok() {
                ctx.commit();
            } else {
                ctx.rollback();
            }
            peer.send_frame(&net.0.reactor, header.servlet_id, header.seq, &response_payload);
            ctx.finish();
        }) {
            Some(c) => c,
            None => return,
        };
        self.0.coroutine_mgr.resume(&co);
    }

    /// Route a response frame to the `Context` that is suspended waiting
    /// on its seq, or drop it if stale (spec §4.H.5).
    fn response_handler(&self, header: frame::FrameHeader, payload: Vec<u8>) {
        let ctx = self.0.call_map.borrow().get(&header.seq).cloned();
        if let Some(ctx) = ctx {
            ctx.set_pending_payload(payload);
            ctx.call_ok();
        }
        // absent: stale reply after timeout — payload already drained by
        // try_parse, nothing further to do.
    }

    fn servlet_lb(&self, servlet_type: u16, target_id: u64) -> Option<Rc<NetworkInstance>> {
        let table = self.0.servlets.borrow();
        let instances = table.get(&servlet_type)?;
        if instances.is_empty() {
            return None;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        target_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % instances.len();
        Some(instances[index].clone())
    }

    fn next_seq(&self) -> u32 {
        let seq = self.0.seq.get().wrapping_add(1);
        let seq = if seq == 0 { 1 } else { seq };
        self.0.seq.set(seq);
        seq
    }

    /// Enqueue a frame on the instance's connector peer. Returns the
    /// allocated seq and the peer it was sent on, or `None` if there's no
    /// route (spec §4.H.3).
    pub fn send(
        &self,
        target_id: u64,
        servlet_id: u32,
        payload: &[u8],
        instance: Option<Rc<NetworkInstance>>,
    ) -> Option<(u32, Rc<Peer>)> {
        let instance = instance.or_else(|| self.servlet_lb(frame::servlet_type(servlet_id), target_id))?;
        let peer = instance.peer()?;
        let seq = self.next_seq();
        peer.send_frame(&self.0.reactor, servlet_id, seq, payload);
        Some((seq, peer))
    }

    /// Enqueue one frame, with one shared seq, to every peer hosting
    /// `servlet_id`'s type (spec §4.H.3).
    pub fn broadcast(&self, servlet_id: u32, payload: &[u8]) {
        let instances = {
            let table = self.0.servlets.borrow();
            table.get(&frame::servlet_type(servlet_id)).cloned()
        };
        let Some(instances) = instances else { return };
        let seq = self.next_seq();
        for instance in instances {
            if let Some(peer) = instance.peer() {
                peer.send_frame(&self.0.reactor, servlet_id, seq, payload);
            }
        }
    }

    /// Blocking RPC call. Must run inside a coroutine (spec §4.H.4).
    pub fn call(
        &self,
        target_id: u64,
        servlet_id: u32,
        request: &[u8],
        instance: Option<Rc<NetworkInstance>>,
    ) -> Result<(i32, Vec<u8>), crate::error::CallError> {
        use crate::error::{CallError, ServletError, SYSTEM_THRESHOLD};

        assert!(
            !self.0.coroutine_mgr.is_main_routine(),
            "Network::call must run inside a coroutine"
        );

        let (seq, peer) = self
            .send(target_id, servlet_id, request, instance)
            .ok_or(CallError::Servlet(ServletError::Busy))?;

        let ctx = Rc::new(Context::new(
            self.0.coroutine_mgr.current(),
            self.0.coroutine_mgr.clone(),
            self.0.timer_mgr.clone(),
            self.0.page_allocator.clone(),
        ));
        ctx.set_seq(seq);

        {
            let mut map = self.0.call_map.borrow_mut();
            if map.contains_key(&seq) {
                return Err(CallError::Servlet(ServletError::Busy));
            }
            map.insert(seq, ctx.clone());
        }

        let net = self.clone();
        let ctx_for_timeout = ctx.clone();
        let timeout_timer = self.0.timer_mgr.schedule(self.0.rpc_timeout_ms.get(), move |_now| {
            ctx_for_timeout.call_timedout();
            let _ = &net;
            0
        });
        ctx.install_timer(timeout_timer);

        peer.calls.borrow_mut().push(ctx.clone());
        self.0.call_count.set(self.0.call_count.get() + 1);

        let yield_result = ctx.call_yield();

        self.0.call_count.set(self.0.call_count.get() - 1);
        peer.calls.borrow_mut().retain(|c| !Rc::ptr_eq(c, &ctx));
        self.0.call_map.borrow_mut().remove(&seq);

        yield_result?;

        let payload = ctx.take_pending_payload().unwrap_or_default();
        let (rc, body) = frame::read_rc(&payload).ok_or_else(|| {
            peer.close(&self.0.reactor, 0);
            CallError::Cancelled
        })?;
        if rc >= SYSTEM_THRESHOLD {
            return Err(CallError::Servlet(ServletError::from_rc(rc)));
        }
        // Stage the body in the call's scratch arena (spec §4.H.4 step 7)
        // before copying it into the owned `Vec` the caller gets back —
        // the arena itself dies with `ctx` at the end of this call. A
        // body too big for one arena page (or a page allocator under
        // true exhaustion) falls back to copying straight out of
        // `payload` rather than failing an otherwise-successful call.
        let body = if body.is_empty() {
            Vec::new()
        } else {
            match ctx.arena().alloc_copy(body) {
                Some(ptr) => unsafe { std::slice::from_raw_parts(ptr, body.len()) }.to_vec(),
                None => body.to_vec(),
            }
        };
        Ok((rc, body))
    }

    /// Close the local listener(s) and every accepted peer. Outstanding
    /// outbound calls survive until they complete or time out (spec
    /// §4.H.6) — the caller drains `call_count()` itself.
    pub fn shutdown_servlets(&self) {
        if let Some(node) = self.node(self.0.own_type.get()) {
            if let Some(instance) = node.instances.borrow().get(self.0.own_id.get() as usize) {
                instance.listener.borrow_mut().take();
            }
        }
        self.close_accepted_peers();
    }

    /// Hard-close every currently accepted peer (any outstanding outbound
    /// calls they carry are cancelled via [`Peer`]'s close path) without
    /// touching the local listener — unlike [`Self::shutdown_servlets`],
    /// new connections keep being accepted afterward. Useful for kicking
    /// every connected client, and for exercising peer-close cancellation
    /// without also tearing down accept.
    pub fn close_accepted_peers(&self) {
        for peer in self.0.accept_list.borrow_mut().drain(..) {
            peer.close(&self.0.reactor, 0);
        }
    }

    pub fn call_count(&self) -> u64 {
        self.0.call_count.get()
    }

    /// True once every non-AP instance in the cluster has a live
    /// connector peer.
    pub fn ready(&self) -> bool {
        self.0
            .instances
            .borrow()
            .iter()
            .filter(|i| !i.is_ap())
            .all(|i| i.peer().is_some())
    }

    pub fn connector_state(&self, instance: &NetworkInstance) -> Option<ConnectorState> {
        instance.connector.borrow().as_ref().map(|c| c.state())
    }
}
