//! Cooperative event loop multiplexing timers, descriptors and message
//! dispatch.
//!
//! One reactor serves one handle.  Every watcher callback runs inside the
//! single [`Reactor::run`] task, so callbacks are serialized and must not
//! block; they interact with the world through more watchers or futures.
//! The loop keeps running while at least one started-and-referenced
//! watcher or completion reference exists, and exits otherwise.  An
//! unreferenced watcher still fires but does not hold the loop open.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::handle::{Handle, HandleError};
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorError {
    message: String,
}

impl ReactorError {
    pub fn new(message: impl Into<String>) -> Self {
        ReactorError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor error: {}", self.message)
    }
}

impl std::error::Error for ReactorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Runs before the loop goes to sleep.
    Prepare,
    /// Runs after the loop wakes.
    Check,
    /// Runs every loop iteration and keeps the loop from sleeping.
    Idle,
}

struct ReactorState {
    /// Started-and-referenced watchers plus completion references.
    keepalive: usize,
    completions: HashSet<String>,
    stopped: Option<Result<(), ReactorError>>,
    new_drivers: Vec<BoxFuture<'static, ()>>,
    hooks: Vec<Weak<HookCore>>,
    now: std::time::Instant,
}

pub(crate) struct ReactorInner {
    state: Mutex<ReactorState>,
    wake: Notify,
}

/// The event loop.  Cheap to clone; all clones share the loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Self {
        Reactor {
            inner: Arc::new(ReactorInner {
                state: Mutex::new(ReactorState {
                    keepalive: 0,
                    completions: HashSet::new(),
                    stopped: None,
                    new_drivers: Vec::new(),
                    hooks: Vec::new(),
                    now: std::time::Instant::now(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Loop time, refreshed once per iteration.
    pub fn now(&self) -> std::time::Instant {
        self.inner.state.lock().now
    }

    /// Stop the loop; `run` returns success.  Idempotent.
    pub fn stop(&self) {
        let mut st = self.inner.state.lock();
        if st.stopped.is_none() {
            st.stopped = Some(Ok(()));
        }
        drop(st);
        self.inner.wake.notify_one();
    }

    /// Stop the loop with an error; `run` returns failure.
    pub fn stop_with_error(&self, err: ReactorError) {
        self.inner.state.lock().stopped = Some(Err(err));
        self.inner.wake.notify_one();
    }

    /// Take a named completion reference, keeping the loop alive across
    /// asynchronous work independent of watcher refcounts.
    pub fn completion_ref(&self, name: &str) {
        let mut st = self.inner.state.lock();
        if st.completions.insert(name.to_string()) {
            st.keepalive += 1;
        }
        drop(st);
        self.inner.wake.notify_one();
    }

    pub fn completion_unref(&self, name: &str) {
        let mut st = self.inner.state.lock();
        if st.completions.remove(name) {
            st.keepalive -= 1;
        }
        drop(st);
        self.inner.wake.notify_one();
    }

    /// Run until stopped, or until no referenced watcher or completion
    /// reference remains.
    pub async fn run(&self) -> Result<(), ReactorError> {
        let mut drivers: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        loop {
            for driver in self.take_new_drivers() {
                drivers.push(driver);
            }
            if let Some(result) = self.take_stop() {
                return result;
            }
            if self.keepalive_count() == 0 {
                return Ok(());
            }
            self.update_now();
            self.run_hooks(HookKind::Prepare);
            let has_idle = self.has_started_hook(HookKind::Idle);
            tokio::select! {
                biased;
                Some(_) = drivers.next(), if !drivers.is_empty() => {}
                _ = self.inner.wake.notified() => {}
                _ = tokio::task::yield_now(), if has_idle => {}
            }
            self.update_now();
            self.run_hooks(HookKind::Check);
            self.run_hooks(HookKind::Idle);
        }
    }

    /// Run on a private current-thread runtime, blocking the caller.
    pub fn run_blocking(&self) -> Result<(), ReactorError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ReactorError::new(e.to_string()))?;
        rt.block_on(self.run())
    }

    fn take_new_drivers(&self) -> Vec<BoxFuture<'static, ()>> {
        std::mem::take(&mut self.inner.state.lock().new_drivers)
    }

    fn take_stop(&self) -> Option<Result<(), ReactorError>> {
        self.inner.state.lock().stopped.take()
    }

    fn keepalive_count(&self) -> usize {
        self.inner.state.lock().keepalive
    }

    fn update_now(&self) {
        self.inner.state.lock().now = std::time::Instant::now();
    }

    fn run_hooks(&self, kind: HookKind) {
        let hooks: Vec<Arc<HookCore>> = {
            let mut st = self.inner.state.lock();
            st.hooks.retain(|h| h.strong_count() > 0);
            st.hooks.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in hooks {
            if hook.kind == kind && hook.shared.is_started() {
                (hook.cb.lock())(self);
            }
        }
    }

    fn has_started_hook(&self, kind: HookKind) -> bool {
        let st = self.inner.state.lock();
        st.hooks
            .iter()
            .filter_map(Weak::upgrade)
            .any(|h| h.kind == kind && h.shared.is_started())
    }

    /// Create a timer watcher firing `after` from start, then every
    /// `repeat` (one-shot when `repeat` is zero).  Created stopped.
    pub fn timer(
        &self,
        after: Duration,
        repeat: Duration,
        cb: impl FnMut(&Reactor) + Send + 'static,
    ) -> TimerWatcher {
        TimerWatcher {
            core: Arc::new(TimerCore {
                shared: WatcherShared::new(&self.inner),
                cfg: Mutex::new(TimerCfg {
                    after,
                    repeat,
                    deadline: tokio::time::Instant::now(),
                }),
                cb: Mutex::new(Box::new(cb)),
            }),
        }
    }

    /// Create a watcher that pumps a handle's messages through its
    /// dispatch table.  Created stopped.
    pub fn handle_watcher(&self, handle: Handle) -> HandleWatcher {
        HandleWatcher {
            core: Arc::new(HandleCore {
                shared: WatcherShared::new(&self.inner),
                handle,
            }),
        }
    }

    /// Create a file-descriptor watcher.  Created stopped.
    #[cfg(unix)]
    pub fn fd_watcher(
        &self,
        fd: std::os::fd::RawFd,
        events: Revents,
        cb: impl FnMut(&Reactor, Revents) + Send + 'static,
    ) -> FdWatcher {
        FdWatcher {
            core: Arc::new(FdCore {
                shared: WatcherShared::new(&self.inner),
                fd,
                events,
                cb: Mutex::new(Box::new(cb)),
            }),
        }
    }

    fn hook(&self, kind: HookKind, cb: impl FnMut(&Reactor) + Send + 'static) -> HookWatcher {
        let core = Arc::new(HookCore {
            shared: WatcherShared::new(&self.inner),
            kind,
            cb: Mutex::new(Box::new(cb)),
        });
        self.inner.state.lock().hooks.push(Arc::downgrade(&core));
        HookWatcher { core }
    }

    pub fn prepare(&self, cb: impl FnMut(&Reactor) + Send + 'static) -> HookWatcher {
        self.hook(HookKind::Prepare, cb)
    }

    pub fn check(&self, cb: impl FnMut(&Reactor) + Send + 'static) -> HookWatcher {
        self.hook(HookKind::Check, cb)
    }

    pub fn idle(&self, cb: impl FnMut(&Reactor) + Send + 'static) -> HookWatcher {
        self.hook(HookKind::Idle, cb)
    }

    fn push_driver(&self, driver: BoxFuture<'static, ()>) {
        self.inner.state.lock().new_drivers.push(driver);
        self.inner.wake.notify_one();
    }

    pub(crate) fn from_inner(inner: Arc<ReactorInner>) -> Reactor {
        Reactor { inner }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// State common to every watcher kind: start/stop, ref/unref, and the
/// keepalive contribution (started && referenced).
struct WatcherShared {
    reactor: Weak<ReactorInner>,
    flags: Mutex<WatcherFlags>,
    restart: Notify,
}

#[derive(Clone, Copy)]
struct WatcherFlags {
    started: bool,
    referenced: bool,
}

impl WatcherShared {
    fn new(reactor: &Arc<ReactorInner>) -> Self {
        WatcherShared {
            reactor: Arc::downgrade(reactor),
            flags: Mutex::new(WatcherFlags {
                started: false,
                referenced: true,
            }),
            restart: Notify::new(),
        }
    }

    fn is_started(&self) -> bool {
        self.flags.lock().started
    }

    fn is_referenced(&self) -> bool {
        self.flags.lock().referenced
    }

    fn set_started(&self, started: bool) -> bool {
        self.transition(|fl| fl.started = started)
    }

    fn set_referenced(&self, referenced: bool) {
        self.transition(|fl| fl.referenced = referenced);
    }

    /// Apply a flag change, adjusting the reactor keepalive count when
    /// the contribution (started && referenced) flips.  Returns true if
    /// the flags changed at all.
    fn transition(&self, f: impl FnOnce(&mut WatcherFlags)) -> bool {
        let (before, after, changed) = {
            let mut fl = self.flags.lock();
            let old = *fl;
            f(&mut fl);
            (
                old.started && old.referenced,
                fl.started && fl.referenced,
                old.started != fl.started || old.referenced != fl.referenced,
            )
        };
        if let Some(reactor) = self.reactor.upgrade() {
            if before != after {
                let mut st = reactor.state.lock();
                if after {
                    st.keepalive += 1;
                } else {
                    st.keepalive -= 1;
                }
            }
            reactor.wake.notify_one();
        }
        self.restart.notify_one();
        changed
    }

    fn reactor(&self) -> Option<Reactor> {
        self.reactor.upgrade().map(Reactor::from_inner)
    }
}

struct TimerCfg {
    after: Duration,
    repeat: Duration,
    deadline: tokio::time::Instant,
}

struct TimerCore {
    shared: WatcherShared,
    cfg: Mutex<TimerCfg>,
    cb: Mutex<Box<dyn FnMut(&Reactor) + Send>>,
}

/// Timer watcher: fires no earlier than its programmed instant.
#[derive(Clone)]
pub struct TimerWatcher {
    core: Arc<TimerCore>,
}

impl TimerWatcher {
    pub fn start(&self) {
        if self.core.shared.is_started() {
            return;
        }
        {
            let mut cfg = self.core.cfg.lock();
            let after = cfg.after;
            cfg.deadline = tokio::time::Instant::now() + after;
        }
        if !self.core.shared.set_started(true) {
            return;
        }
        let Some(reactor) = self.core.shared.reactor() else {
            return;
        };
        let core = self.core.clone();
        reactor.push_driver(Box::pin(drive_timer(core)));
    }

    pub fn stop(&self) {
        self.core.shared.set_started(false);
    }

    /// Re-arm with a new delay and repeat.
    pub fn reset(&self, after: Duration, repeat: Duration) {
        {
            let mut cfg = self.core.cfg.lock();
            cfg.after = after;
            cfg.repeat = repeat;
            cfg.deadline = tokio::time::Instant::now() + after;
        }
        self.core.shared.restart.notify_one();
    }

    pub fn ref_(&self) {
        self.core.shared.set_referenced(true);
    }

    pub fn unref(&self) {
        self.core.shared.set_referenced(false);
    }

    pub fn is_active(&self) -> bool {
        self.core.shared.is_started()
    }

    pub fn is_referenced(&self) -> bool {
        self.core.shared.is_referenced()
    }
}

async fn drive_timer(core: Arc<TimerCore>) {
    loop {
        if !core.shared.is_started() {
            return;
        }
        let deadline = core.cfg.lock().deadline;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if !core.shared.is_started() {
                    return;
                }
                let Some(reactor) = core.shared.reactor() else {
                    return;
                };
                (core.cb.lock())(&reactor);
                let repeat = core.cfg.lock().repeat;
                if repeat.is_zero() {
                    core.shared.set_started(false);
                    return;
                }
                core.cfg.lock().deadline = tokio::time::Instant::now() + repeat;
            }
            _ = core.shared.restart.notified() => {
                // stopped or re-armed; loop re-reads the configuration
            }
        }
    }
}

struct HandleCore {
    shared: WatcherShared,
    handle: Handle,
}

/// Watcher driving a handle's message pump on this reactor.
#[derive(Clone)]
pub struct HandleWatcher {
    core: Arc<HandleCore>,
}

impl HandleWatcher {
    pub fn start(&self) {
        if !self.core.shared.set_started(true) {
            return;
        }
        let Some(reactor) = self.core.shared.reactor() else {
            return;
        };
        let core = self.core.clone();
        reactor.push_driver(Box::pin(drive_handle(core)));
    }

    pub fn stop(&self) {
        self.core.shared.set_started(false);
    }

    pub fn ref_(&self) {
        self.core.shared.set_referenced(true);
    }

    pub fn unref(&self) {
        self.core.shared.set_referenced(false);
    }

    pub fn is_active(&self) -> bool {
        self.core.shared.is_started()
    }

    pub fn handle(&self) -> &Handle {
        &self.core.handle
    }
}

async fn drive_handle(core: Arc<HandleCore>) {
    loop {
        tokio::select! {
            result = core.handle.run_dispatch() => {
                match result {
                    Ok(()) => {}
                    Err(HandleError::Transport(TransportError::Closed)) => {
                        trace!("handle watcher: transport closed");
                    }
                    Err(e) => warn!("handle watcher: {}", e),
                }
                core.shared.set_started(false);
                return;
            }
            _ = core.shared.restart.notified() => {
                if !core.shared.is_started() {
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
bitflags::bitflags! {
    /// Readiness events reported to fd watcher callbacks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Revents: u8 {
        const READABLE = 1;
        const WRITABLE = 2;
    }
}

#[cfg(unix)]
struct FdCore {
    shared: WatcherShared,
    fd: std::os::fd::RawFd,
    events: Revents,
    cb: Mutex<Box<dyn FnMut(&Reactor, Revents) + Send>>,
}

/// File-descriptor readiness watcher.
#[cfg(unix)]
#[derive(Clone)]
pub struct FdWatcher {
    core: Arc<FdCore>,
}

#[cfg(unix)]
impl FdWatcher {
    pub fn start(&self) {
        if !self.core.shared.set_started(true) {
            return;
        }
        let Some(reactor) = self.core.shared.reactor() else {
            return;
        };
        let core = self.core.clone();
        reactor.push_driver(Box::pin(drive_fd(core)));
    }

    pub fn stop(&self) {
        self.core.shared.set_started(false);
    }

    pub fn ref_(&self) {
        self.core.shared.set_referenced(true);
    }

    pub fn unref(&self) {
        self.core.shared.set_referenced(false);
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        self.core.fd
    }
}

#[cfg(unix)]
async fn drive_fd(core: Arc<FdCore>) {
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;

    struct RawIo(std::os::fd::RawFd);
    impl std::os::fd::AsRawFd for RawIo {
        fn as_raw_fd(&self) -> std::os::fd::RawFd {
            self.0
        }
    }

    let mut interest = Interest::READABLE;
    if core.events.contains(Revents::WRITABLE) && !core.events.contains(Revents::READABLE) {
        interest = Interest::WRITABLE;
    } else if core.events.contains(Revents::WRITABLE) {
        interest = Interest::READABLE | Interest::WRITABLE;
    }

    let afd = match AsyncFd::with_interest(RawIo(core.fd), interest) {
        Ok(afd) => afd,
        Err(e) => {
            warn!("fd watcher: failed to register fd {}: {}", core.fd, e);
            core.shared.set_started(false);
            return;
        }
    };
    loop {
        if !core.shared.is_started() {
            return;
        }
        tokio::select! {
            ready = afd.ready(interest) => {
                match ready {
                    Ok(mut guard) => {
                        let mut revents = Revents::empty();
                        if guard.ready().is_readable() {
                            revents |= Revents::READABLE;
                        }
                        if guard.ready().is_writable() {
                            revents |= Revents::WRITABLE;
                        }
                        guard.clear_ready();
                        if let Some(reactor) = core.shared.reactor() {
                            (core.cb.lock())(&reactor, revents);
                        }
                    }
                    Err(e) => {
                        warn!("fd watcher: fd {}: {}", core.fd, e);
                        core.shared.set_started(false);
                        return;
                    }
                }
            }
            _ = core.shared.restart.notified() => {}
        }
    }
}

struct HookCore {
    shared: WatcherShared,
    kind: HookKind,
    cb: Mutex<Box<dyn FnMut(&Reactor) + Send>>,
}

/// Prepare, check, or idle hook.
#[derive(Clone)]
pub struct HookWatcher {
    core: Arc<HookCore>,
}

impl HookWatcher {
    pub fn start(&self) {
        self.core.shared.set_started(true);
    }

    pub fn stop(&self) {
        self.core.shared.set_started(false);
    }

    pub fn ref_(&self) {
        self.core.shared.set_referenced(true);
    }

    pub fn unref(&self) {
        self.core.shared.set_referenced(false);
    }
}
