//! Servlet dispatch table (SPEC_FULL.md §11). The original names concrete
//! business servlets and their persistence hooks out of scope; what stays
//! in scope is the mechanism `ServletManager::instance()->execute(...)`
//! drives in `original_source/.../network.cpp`'s `request_handler` — a
//! table from servlet id to handler, invoked on a freshly spawned
//! coroutine bound to a fresh [`Context`].

use crate::context::Context;
use std::collections::HashMap;
use std::rc::Rc;

/// A request handler hosted at one or more [`crate::network::NetworkInstance`]s.
/// Implementations run entirely inside the coroutine the dispatcher spawns
/// for them — blocking-looking code via `ctx.call_yield()` is safe here.
pub trait ServletHandler {
    /// Handle one request. `Ok(body)` sends back `rc=0` and `body` as the
    /// response payload; `Err(rc)` sends back that `rc` with an empty
    /// body (spec §7: response codes at/above the system threshold are
    /// raised as exceptions on the caller's side).
    fn call(&self, ctx: &Context, request: &[u8]) -> Result<Vec<u8>, i32>;
}

/// Table from servlet id to its handler. One process can host several
/// servlet ids, each possibly backed by a distinct handler instance.
#[derive(Default)]
pub struct ServletManager {
    handlers: std::cell::RefCell<HashMap<u32, Rc<dyn ServletHandler>>>,
}

impl ServletManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, servlet_id: u32, handler: Rc<dyn ServletHandler>) {
        self.handlers.borrow_mut().insert(servlet_id, handler);
    }

    pub fn get(&self, servlet_id: u32) -> Option<Rc<dyn ServletHandler>> {
        self.handlers.borrow().get(&servlet_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl ServletHandler for Echo {
        fn call(&self, _ctx: &Context, request: &[u8]) -> Result<Vec<u8>, i32> {
            Ok(request.iter().rev().copied().collect())
        }
    }

    #[test]
    fn registered_handler_is_retrievable_by_id() {
        let mgr = ServletManager::new();
        mgr.register(0x0001_0001, Rc::new(Echo));
        assert!(mgr.get(0x0001_0001).is_some());
        assert!(mgr.get(0x0002_0001).is_none());
    }
}
