//! coronet — a single-threaded, cooperative-coroutine RPC runtime for
//! clustered game/service nodes. See `SPEC_FULL.md` for the full
//! requirements this crate implements; this module just wires the pieces
//! together in dependency order (leaves first, matching the component
//! table in spec §2).

pub mod app;
pub mod cli;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod frame;
pub mod network;
pub mod obstack;
pub mod page;
pub mod reactor;
pub mod servlet;
pub mod signals;
pub mod timer;

pub use app::Application;
pub use context::Context;
pub use coroutine::{Coroutine, CoroutineManager};
pub use error::{CallCancelled, CallError, GxError, ServletError};
pub use network::Network;
pub use obstack::Obstack;
pub use page::PageAllocator;
pub use reactor::Reactor;
pub use servlet::{ServletHandler, ServletManager};
pub use timer::TimerManager;
