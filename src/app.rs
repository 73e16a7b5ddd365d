//! Process entry-point glue: home-directory layout, CLI-driven startup,
//! and the exact shutdown sequencing spec §4.H.6 and the graceful-shutdown
//! scenario (§8.5) depend on. Named "CLI/daemonization entry point" as out
//! of scope by spec §1, but its *sequencing* is in scope per SPEC_FULL.md
//! §11 — grounded line-for-line on
//! `original_source/.../application.cpp`'s `Application::init_env`/`run`.

use crate::cli::Args;
use crate::coroutine::CoroutineManager;
use crate::error::GxError;
use crate::network::config::NetworkConfig;
use crate::network::Network;
use crate::page::PageAllocator;
use crate::reactor::Reactor;
use crate::signals::Termination;
use crate::timer::TimerManager;
use std::path::PathBuf;
use std::rc::Rc;

/// Directory layout derived from `home` (spec §6): `etc/`, `script/`,
/// `script/var/`, `var/`, `image/`, `log/`.
pub struct Layout {
    pub home: PathBuf,
    pub etc: PathBuf,
    pub script: PathBuf,
    pub script_var: PathBuf,
    pub var: PathBuf,
    pub image: PathBuf,
    pub log: PathBuf,
}

impl Layout {
    fn new(home: PathBuf) -> Self {
        Self {
            etc: home.join("etc"),
            script: home.join("script"),
            script_var: home.join("script").join("var"),
            var: home.join("var"),
            image: home.join("image"),
            log: home.join("log"),
            home,
        }
    }
}

/// Ties the reactor, timer manager, coroutine manager, and network
/// together into one runnable process, matching `the_app` singleton's
/// role in the original — built explicitly here rather than as a global
/// (design notes §9).
pub struct Application {
    pub layout: Layout,
    pub page_allocator: Rc<PageAllocator>,
    pub timer_mgr: Rc<TimerManager>,
    pub reactor: Reactor,
    pub coroutine_mgr: CoroutineManager,
    pub network: Network,
    termination: Termination,
    node_type: u32,
    node_id: u32,
    shutdown_hook: Option<Box<dyn FnOnce()>>,
}

/// Upper bound on how long a single `loop_once` may block waiting for
/// readiness, so a termination request is never more than this far from
/// being observed even when no timer is due sooner.
const MAX_POLL_MS: u64 = 1000;

impl Application {
    /// Resolve the home directory, read the topology file, build the
    /// reactor/timer/coroutine stack, and resolve the CLI's `--node-type`
    /// name to its integer id. Fatal on a missing own node type (spec
    /// §7), exactly as `Application::init` is.
    pub fn init(args: &Args, termination: Termination) -> Result<Self, GxError> {
        let layout = Layout::new(args.home_dir());
        let page_allocator = Rc::new(PageAllocator::new(crate::page::DEFAULT_PAGE_SIZE));
        let timer_mgr = Rc::new(TimerManager::new());
        let reactor = Reactor::new(timer_mgr.clone(), 1024)?;
        let coroutine_mgr = CoroutineManager::new(Rc::new(PageAllocator::new(
            crate::coroutine::CO_MEMSIZE,
        )));
        let network = Network::new(
            reactor.clone(),
            timer_mgr.clone(),
            coroutine_mgr.clone(),
            page_allocator.clone(),
        );

        let config_path = if args.config.is_absolute() {
            args.config.clone()
        } else {
            layout.home.join(&args.config)
        };
        let config = NetworkConfig::load(&config_path)?;
        network.load_config(&config);

        let node_type = network
            .resolve_node_type(&args.node_type)
            .ok_or(GxError::UnknownNodeType)?;

        Ok(Self {
            layout,
            page_allocator,
            timer_mgr,
            reactor,
            coroutine_mgr,
            network,
            termination,
            node_type,
            node_id: args.node,
            shutdown_hook: None,
        })
    }

    /// Register the embedder callback the shutdown coroutine invokes once
    /// every accepted peer is closed and every outstanding call has
    /// resolved (spec §4.H.6, §8.5).
    pub fn on_shutdown(&mut self, hook: impl FnOnce() + 'static) {
        self.shutdown_hook = Some(Box::new(hook));
    }

    /// One reactor/timer tick: fire due timers, then poll for readiness
    /// for no longer than the next timer deadline (capped so termination
    /// is never missed for more than [`MAX_POLL_MS`]).
    pub fn loop_once(&self) -> std::io::Result<()> {
        let next_deadline = self.timer_mgr.loop_once();
        let now = self.timer_mgr.now();
        let timeout = next_deadline.saturating_sub(now).min(MAX_POLL_MS);
        self.reactor.loop_once(timeout)
    }

    /// Detach from the controlling terminal (fork + setsid, close stdio)
    /// before the main loop starts, matching `Application::daemon`.
    ///
    /// # Safety
    /// Must be called before any other threads exist and before the
    /// reactor has registered any fd the child shouldn't inherit twice —
    /// i.e. as the very first step of `run()`, which is the only caller.
    unsafe fn daemonize() {
        let pid = libc::fork();
        if pid < 0 {
            std::process::exit(1);
        } else if pid > 0 {
            std::process::exit(0);
        }
        libc::setsid();
        libc::umask(0);
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }

    /// Bind/connect per spec §4.H.2, run the main loop until termination,
    /// then drain outstanding calls and run the shutdown coroutine (spec
    /// §4.H.6, §8.5) — the exact sequence `Application::run` performs.
    pub fn run(mut self, daemon: bool) -> std::io::Result<()> {
        if daemon {
            // SAFETY: called before startup() registers any fd, as the
            // first action of run().
            unsafe { Self::daemonize() };
        }

        self.network
            .startup(self.node_type, self.node_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        while !self.termination.requested() {
            self.loop_once()?;
        }

        tracing::info!("termination requested, draining outstanding calls");
        self.timer_mgr.clear();
        self.network.shutdown_servlets();
        while self.network.call_count() > 0 {
            self.loop_once()?;
        }

        let hook = self.shutdown_hook.take();
        let mgr = self.coroutine_mgr.clone();
        let co = mgr
            .spawn(move || {
                if let Some(hook) = hook {
                    hook();
                }
            })
            .expect("coroutine pool has capacity for the shutdown routine");
        mgr.resume(&co);
        while co.status() != crate::coroutine::Status::Dead {
            self.loop_once()?;
        }

        tracing::info!("shutdown complete");
        Ok(())
    }
}
