//! Spec §8, scenario 4 ("Broadcast"): one call to `Network::broadcast`
//! must reach every peer hosting the servlet's type, all tagged with the
//! same seq, and must not register any call-seq map entry (it is
//! fire-and-forget, unlike `call`).

mod support;

use coronet::context::Context;
use coronet::servlet::ServletHandler;
use std::cell::RefCell;
use std::rc::Rc;
use support::{broadcast_config, drive, free_port, TestNode};

const FANOUT_SERVLET: u32 = 0x0004_0001;

struct RecordSeq(Rc<RefCell<Vec<u32>>>);
impl ServletHandler for RecordSeq {
    fn call(&self, ctx: &Context, _request: &[u8]) -> Result<Vec<u8>, i32> {
        self.0.borrow_mut().push(ctx.seq());
        Ok(Vec::new())
    }
}

#[test]
fn broadcast_reaches_every_hosting_peer_with_one_shared_seq() {
    let ports = [free_port(), free_port(), free_port()];
    let node_0 = TestNode::new();
    let node_1 = TestNode::new();
    let node_2 = TestNode::new();
    let nodes = [&node_0, &node_1, &node_2];

    let cfg = broadcast_config("fanout", ports, FANOUT_SERVLET, 3000, 50, 1000);
    for node in &nodes {
        node.network.load_config(&cfg);
    }

    let seen: [Rc<RefCell<Vec<u32>>>; 3] = [
        Rc::new(RefCell::new(Vec::new())),
        Rc::new(RefCell::new(Vec::new())),
        Rc::new(RefCell::new(Vec::new())),
    ];
    for (node, record) in nodes.iter().zip(seen.iter()) {
        node.network
            .servlet_manager()
            .register(FANOUT_SERVLET, Rc::new(RecordSeq(record.clone())));
    }

    for (i, node) in nodes.iter().enumerate() {
        node.network.startup(1, i as u32).unwrap();
    }

    // Every instance both hosts the servlet and dials every peer (three
    // non-AP instances, all of the same node_type), so `ready()` requires
    // a connector to each of the other two.
    let connected = support::pump(&nodes, 500, || nodes.iter().all(|n| n.network.ready()));
    assert!(connected, "all three instances should interconnect");

    // Broadcast from node_0; it has a connector peer to node_1 and node_2
    // (every non-AP instance connects to every non-AP instance, spec
    // §4.H.2), so the one call below reaches both of them.
    node_0.network.broadcast(FANOUT_SERVLET, b"fanout payload");
    drive(&nodes, 100);

    assert!(
        node_0.network.call_count() == 0,
        "broadcast is fire-and-forget and must never register a call"
    );

    let seq_1 = seen[1].borrow().clone();
    let seq_2 = seen[2].borrow().clone();
    assert_eq!(seq_1.len(), 1, "node_1 should receive exactly one frame");
    assert_eq!(seq_2.len(), 1, "node_2 should receive exactly one frame");
    assert_eq!(
        seq_1[0], seq_2[0],
        "both recipients must see the same broadcast seq"
    );
}
