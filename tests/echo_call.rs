//! Spec §8, scenario 1 ("Echo call"): a request/response round trip
//! across two nodes, driven entirely through the public `Network`/
//! `CoroutineManager` API over real loopback TCP.

mod support;

use coronet::context::Context;
use coronet::error::CallError;
use coronet::servlet::ServletHandler;
use std::cell::RefCell;
use std::rc::Rc;
use support::{free_port, pump, two_node_config, TestNode};

const ECHO_SERVLET: u32 = 0x0001_0001;

struct Echo;
impl ServletHandler for Echo {
    fn call(&self, _ctx: &Context, request: &[u8]) -> Result<Vec<u8>, i32> {
        Ok(request.iter().rev().copied().collect())
    }
}

#[test]
fn echo_round_trip_reverses_the_request_body() {
    let port_x = free_port();
    let port_y = free_port();

    let node_x = TestNode::new();
    let node_y = TestNode::new();

    let cfg = two_node_config("echo", port_x, port_y, vec![ECHO_SERVLET], 3000, 200, 1000);
    node_x.network.load_config(&cfg);
    node_y.network.load_config(&cfg);
    node_y
        .network
        .servlet_manager()
        .register(ECHO_SERVLET, Rc::new(Echo));

    node_x.network.startup(1, 0).unwrap();
    node_y.network.startup(1, 1).unwrap();

    let connected = pump(&[&node_x, &node_y], 500, || {
        node_x.network.ready() && node_y.network.ready()
    });
    assert!(connected, "both nodes should establish their connector peers");

    let result: Rc<RefCell<Option<Result<(i32, Vec<u8>), CallError>>>> = Rc::new(RefCell::new(None));
    let result_clone = result.clone();
    let network = node_x.network.clone();
    let co = node_x
        .coroutine_mgr
        .spawn(move || {
            let r = network.call(42, ECHO_SERVLET, b"hello coronet", None);
            *result_clone.borrow_mut() = Some(r);
        })
        .unwrap();
    node_x.coroutine_mgr.resume(&co);

    let completed = pump(&[&node_x, &node_y], 500, || result.borrow().is_some());
    assert!(completed, "the call should complete within the pump budget");

    let (rc, response) = result
        .borrow_mut()
        .take()
        .unwrap()
        .expect("call should succeed with rc == 0");
    assert_eq!(rc, 0);
    let expected: Vec<u8> = b"hello coronet".iter().rev().copied().collect();
    assert_eq!(response, expected);

    assert_eq!(
        node_x.network.call_count(),
        0,
        "the call-seq map must be empty once the call has returned"
    );
}
