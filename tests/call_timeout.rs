//! Spec §8, scenario 2 ("Timeout"), scaled down from the spec's 10s
//! sleep / 500ms timeout to keep the test fast while preserving the
//! ordering it exercises: the call must raise TIMEOUT before the slow
//! servlet replies, and the late reply must be dropped as stale without
//! resurrecting a call-seq entry.

mod support;

use coronet::context::Context;
use coronet::error::{CallError, ServletError};
use coronet::servlet::ServletHandler;
use std::cell::RefCell;
use std::rc::Rc;
use support::{drive, free_port, pump, two_node_config, TestNode};

const SLOW_SERVLET: u32 = 0x0002_0001;

struct Slow;
impl ServletHandler for Slow {
    fn call(&self, ctx: &Context, _request: &[u8]) -> Result<Vec<u8>, i32> {
        ctx.sleep(300);
        Ok(b"too late".to_vec())
    }
}

#[test]
fn call_times_out_before_the_slow_reply_and_the_stale_reply_is_dropped() {
    let port_x = free_port();
    let port_y = free_port();
    let node_x = TestNode::new();
    let node_y = TestNode::new();

    let cfg = two_node_config("slow", port_x, port_y, vec![SLOW_SERVLET], 50, 20, 200);
    node_x.network.load_config(&cfg);
    node_y.network.load_config(&cfg);
    node_y
        .network
        .servlet_manager()
        .register(SLOW_SERVLET, Rc::new(Slow));

    node_x.network.startup(1, 0).unwrap();
    node_y.network.startup(1, 1).unwrap();
    assert!(pump(&[&node_x, &node_y], 500, || node_x.network.ready()
        && node_y.network.ready()));

    let result: Rc<RefCell<Option<Result<(i32, Vec<u8>), CallError>>>> = Rc::new(RefCell::new(None));
    let result_clone = result.clone();
    let network = node_x.network.clone();
    let co = node_x
        .coroutine_mgr
        .spawn(move || {
            *result_clone.borrow_mut() = Some(network.call(7, SLOW_SERVLET, b"req", None));
        })
        .unwrap();
    node_x.coroutine_mgr.resume(&co);

    let timed_out = pump(&[&node_x, &node_y], 200, || result.borrow().is_some());
    assert!(timed_out, "call should time out, not hang");

    let outcome = result.borrow_mut().take().unwrap();
    assert!(
        matches!(outcome, Err(CallError::Servlet(ServletError::Timeout))),
        "expected a TIMEOUT error, got {outcome:?}"
    );
    assert_eq!(node_x.network.call_count(), 0, "seq must be freed on timeout");

    // Let Y's slow reply actually arrive on X well after the timeout.
    drive(&[&node_x, &node_y], 200);
    assert_eq!(
        node_x.network.call_count(),
        0,
        "a stale reply arriving after timeout must not resurrect a call-seq entry"
    );
}
