//! Shared harness for the end-to-end scenarios in spec §8: two in-process
//! nodes, each with its own reactor/timer/coroutine manager (a real
//! process would be one OS process per node; the tests run both on one
//! thread and drive them in round-robin, same as a single `loop()` would
//! for either node alone) talking over real loopback TCP — no socket
//! mocks, per SPEC_FULL.md §10.5.

#![allow(dead_code)]

use coronet::coroutine::CoroutineManager;
use coronet::network::config::{InstanceConfig, NetworkConfig};
use coronet::network::Network;
use coronet::page::PageAllocator;
use coronet::reactor::Reactor;
use coronet::timer::TimerManager;
use std::net::TcpListener;
use std::rc::Rc;

pub struct TestNode {
    pub reactor: Reactor,
    pub timer_mgr: Rc<TimerManager>,
    pub coroutine_mgr: CoroutineManager,
    pub network: Network,
}

impl TestNode {
    pub fn new() -> Self {
        let timer_mgr = Rc::new(TimerManager::new());
        let reactor = Reactor::new(timer_mgr.clone(), 64).expect("reactor init");
        let coroutine_mgr =
            CoroutineManager::new(Rc::new(PageAllocator::new(coronet::coroutine::CO_MEMSIZE)));
        let page_allocator = Rc::new(PageAllocator::new(coronet::page::DEFAULT_PAGE_SIZE));
        let network = Network::new(
            reactor.clone(),
            timer_mgr.clone(),
            coroutine_mgr.clone(),
            page_allocator,
        );
        Self {
            reactor,
            timer_mgr,
            coroutine_mgr,
            network,
        }
    }

    /// One timer+reactor tick, matching `Application::loop_once`.
    pub fn tick(&self) {
        let next = self.timer_mgr.loop_once();
        let now = self.timer_mgr.now();
        let timeout = next.saturating_sub(now).min(20);
        self.reactor.loop_once(timeout).expect("reactor loop_once");
    }
}

/// Tick every node once per iteration, up to `max_iters` times, stopping
/// as soon as `done` reports success. Returns whether `done` was ever
/// satisfied.
pub fn pump(nodes: &[&TestNode], max_iters: usize, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..max_iters {
        if done() {
            return true;
        }
        for node in nodes {
            node.tick();
        }
    }
    done()
}

/// Tick every node a fixed number of times, regardless of outcome — used
/// to let a stale reply or a reconnect actually happen before asserting.
pub fn drive(nodes: &[&TestNode], iters: usize) {
    for _ in 0..iters {
        for node in nodes {
            node.tick();
        }
    }
}

/// An OS-assigned free loopback port. Racy in principle (the port could
/// be taken between the bind above and the real bind the test performs),
/// but adequate for a single-process test suite.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local_addr")
        .port()
}

/// Build a two-instance, single-node-type topology: id 0 and id 1 of node
/// type 1, both non-AP, id 1 hosting `servlets_on_y`. Matches the shape
/// spec §8's scenarios use (a caller node and a servlet-hosting node).
pub fn two_node_config(
    node_name: &str,
    port_x: u16,
    port_y: u16,
    servlets_on_y: Vec<u32>,
    rpc_timeout_ms: u64,
    connect_retry_ms: u64,
    connect_timeout_ms: u64,
) -> NetworkConfig {
    NetworkConfig {
        instances: vec![
            InstanceConfig {
                host: "127.0.0.1".to_string(),
                port: port_x,
                node_type: 1,
                node_name: node_name.to_string(),
                node_id: 0,
                ap: false,
                servlets: Vec::new(),
            },
            InstanceConfig {
                host: "127.0.0.1".to_string(),
                port: port_y,
                node_type: 1,
                node_name: node_name.to_string(),
                node_id: 1,
                ap: false,
                servlets: servlets_on_y,
            },
        ],
        rpc_timeout_ms,
        connect_retry_ms,
        connect_timeout_ms,
    }
}

/// Three-instance topology for the broadcast scenario (spec §8.4): three
/// peers all hosting the same servlet type, none of them the caller.
pub fn broadcast_config(
    node_name: &str,
    ports: [u16; 3],
    servlet: u32,
    rpc_timeout_ms: u64,
    connect_retry_ms: u64,
    connect_timeout_ms: u64,
) -> NetworkConfig {
    NetworkConfig {
        instances: ports
            .iter()
            .enumerate()
            .map(|(i, &port)| InstanceConfig {
                host: "127.0.0.1".to_string(),
                port,
                node_type: 1,
                node_name: node_name.to_string(),
                node_id: i as u32,
                ap: false,
                servlets: vec![servlet],
            })
            .collect(),
        rpc_timeout_ms,
        connect_retry_ms,
        connect_timeout_ms,
    }
}
