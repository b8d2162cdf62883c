//! Single-shot or streaming asynchronous results.
//!
//! A [`FluxFuture`] starts pending and is fulfilled with a payload or an
//! error.  Streaming producers fulfill repeatedly; results queue and the
//! consumer alternates [`FluxFuture::get`] and [`FluxFuture::reset`].
//!
//! Continuations registered with [`FluxFuture::then`] run inline on the
//! task that fulfills the future.  For RPC futures that is the handle's
//! message pump, so all continuations attached to one handle's futures are
//! serialized on its reactor, never concurrent with each other.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use flux_msg::errnum;

use crate::composite::ChainState;

/// Outcome of a fulfilled future: optional payload bytes, or an error
/// number with optional human-readable text.
pub type FutureResult = Result<Option<Bytes>, FutureError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureError {
    pub errnum: i32,
    pub text: Option<String>,
}

impl FutureError {
    pub fn new(errnum: i32, text: impl Into<String>) -> Self {
        FutureError {
            errnum,
            text: Some(text.into()),
        }
    }

    pub fn from_errnum(errnum: i32) -> Self {
        FutureError { errnum, text: None }
    }

    pub fn timeout() -> Self {
        FutureError::new(errnum::ETIMEDOUT, "timed out")
    }

    /// The diagnostic string tools surface to users: the error text when
    /// present, otherwise a generic rendering of the error number.
    pub fn to_display_string(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None => format!("error {}", self.errnum),
        }
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} (error {})", text, self.errnum),
            None => write!(f, "error {}", self.errnum),
        }
    }
}

impl std::error::Error for FutureError {}

type InitFn = Box<dyn FnOnce(&FluxFuture) + Send>;
type ContinuationFn = Box<dyn FnMut(&FluxFuture) + Send>;

pub(crate) struct FutureInner {
    state: Mutex<FutureState>,
    notify: Notify,
}

struct FutureState {
    results: VecDeque<FutureResult>,
    continuations: Vec<ContinuationFn>,
    init: Option<InitFn>,
    cbs_running: bool,
    pending_cb_runs: u32,
    aux: HashMap<String, Arc<dyn Any + Send + Sync>>,
    /// Back-reference from a chained `prev` to its chain record.
    chain: Weak<ChainState>,
    /// A chained `next` owns its chain record (and through it, `prev`).
    chain_owner: Option<Arc<ChainState>>,
}

/// A pending, fulfillable result.  Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct FluxFuture {
    inner: Arc<FutureInner>,
}

impl FluxFuture {
    /// Create a pending future.
    pub fn new() -> Self {
        FluxFuture {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState {
                    results: VecDeque::new(),
                    continuations: Vec::new(),
                    init: None,
                    cbs_running: false,
                    pending_cb_runs: 0,
                    aux: HashMap::new(),
                    chain: Weak::new(),
                    chain_owner: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a pending future with a deferred initializer, run once at the
    /// first `get`/`then`.  Composite futures use this so that children are
    /// attached only when someone actually waits.
    pub fn with_init(init: impl FnOnce(&FluxFuture) + Send + 'static) -> Self {
        let f = FluxFuture::new();
        f.inner.state.lock().init = Some(Box::new(init));
        f
    }

    pub(crate) fn set_init_internal(&self, init: impl FnOnce(&FluxFuture) + Send + 'static) {
        self.inner.state.lock().init = Some(Box::new(init));
    }

    pub(crate) fn downgrade(&self) -> Weak<FutureInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<FutureInner>) -> Option<FluxFuture> {
        weak.upgrade().map(|inner| FluxFuture { inner })
    }

    pub(crate) fn chain_backref(&self) -> Option<Arc<ChainState>> {
        self.inner.state.lock().chain.upgrade()
    }

    pub(crate) fn set_chain_backref(&self, chain: &Arc<ChainState>) {
        self.inner.state.lock().chain = Arc::downgrade(chain);
    }

    pub(crate) fn set_chain_owner(&self, chain: Arc<ChainState>) {
        self.inner.state.lock().chain_owner = Some(chain);
    }

    /// Run the deferred initializer if it has not run yet.
    fn arm(&self) {
        let init = self.inner.state.lock().init.take();
        if let Some(init) = init {
            init(self);
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.inner.state.lock().results.is_empty()
    }

    /// The current head result, if fulfilled.
    pub fn result(&self) -> Option<FutureResult> {
        self.inner.state.lock().results.front().cloned()
    }

    /// Error text of the head result, if it is an error with text.
    pub fn error_string(&self) -> Option<String> {
        match self.result() {
            Some(Err(e)) => e.text,
            _ => None,
        }
    }

    /// Fulfill with a payload.  Repeated fulfillments queue (streaming).
    pub fn fulfill(&self, payload: Option<Bytes>) {
        self.fulfill_result(Ok(payload));
    }

    /// Fulfill with an error.
    pub fn fulfill_error(&self, errnum: i32, text: Option<&str>) {
        self.fulfill_result(Err(FutureError {
            errnum,
            text: text.map(str::to_owned),
        }));
    }

    pub(crate) fn fulfill_err(&self, err: FutureError) {
        self.fulfill_result(Err(err));
    }

    /// Fulfill with another future's head result.  Fulfilling with a
    /// pending future is an error outcome.
    pub fn fulfill_with(&self, other: &FluxFuture) {
        match other.result() {
            Some(r) => self.fulfill_result(r),
            None => self.fulfill_result(Err(FutureError::new(
                errnum::EINVAL,
                "fulfill_with: source future is not fulfilled",
            ))),
        }
    }

    fn fulfill_result(&self, result: FutureResult) {
        self.inner.state.lock().results.push_back(result);
        self.inner.notify.notify_waiters();
        self.run_continuations();
    }

    /// Run queued continuations, serialized against reentrant fulfillment
    /// from inside a continuation.
    fn run_continuations(&self) {
        {
            let mut st = self.inner.state.lock();
            st.pending_cb_runs += 1;
            if st.cbs_running {
                return;
            }
            st.cbs_running = true;
        }
        loop {
            {
                let mut st = self.inner.state.lock();
                if st.pending_cb_runs == 0 {
                    st.cbs_running = false;
                    return;
                }
                st.pending_cb_runs -= 1;
            }
            let mut cbs = std::mem::take(&mut self.inner.state.lock().continuations);
            for cb in cbs.iter_mut() {
                cb(self);
            }
            let mut st = self.inner.state.lock();
            let added = std::mem::take(&mut st.continuations);
            cbs.extend(added);
            st.continuations = cbs;
        }
    }

    /// Register a continuation.  It runs immediately if the future is
    /// already fulfilled, and again on every later fulfillment.
    pub fn then(&self, cb: impl FnMut(&FluxFuture) + Send + 'static) {
        self.arm();
        let mut cb: ContinuationFn = Box::new(cb);
        if self.is_ready() {
            cb(self);
        }
        self.inner.state.lock().continuations.push(cb);
    }

    /// Await the head result.
    pub async fn get(&self) -> FutureResult {
        self.arm();
        loop {
            // register as a waiter before checking, so a fulfillment
            // racing in from another task is not lost
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(r) = self.result() {
                return r;
            }
            notified.await;
        }
    }

    /// Await the head result for at most `timeout`.  On expiry the future
    /// is fulfilled with a timeout error, so continuations observe the
    /// failure and later waiters see the same outcome.
    pub async fn wait_within(&self, timeout: std::time::Duration) -> FutureResult {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(r) => r,
            Err(_) => {
                let err = FutureError::timeout();
                self.fulfill_err(err.clone());
                Err(err)
            }
        }
    }

    /// Block the calling thread on a private reactor until fulfilled.
    ///
    /// Must not be called from async context; use [`FluxFuture::get`]
    /// there.
    pub fn get_blocking(&self) -> FutureResult {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(FutureError::new(
                errnum::EINVAL,
                "get_blocking called from async context; use get().await",
            ));
        }
        match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt.block_on(self.get()),
            Err(e) => Err(FutureError::new(errnum::EINVAL, e.to_string())),
        }
    }

    /// Pop the head result, returning the future to pending unless more
    /// fulfillments are queued.  Streaming consumers call this between
    /// responses.
    pub fn reset(&self) {
        let still_ready = {
            let mut st = self.inner.state.lock();
            st.results.pop_front();
            !st.results.is_empty()
        };
        if still_ready {
            self.inner.notify.notify_waiters();
            self.run_continuations();
        }
    }

    pub fn aux_set(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.inner.state.lock().aux.insert(name.to_string(), value);
    }

    pub fn aux_get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.state.lock().aux.get(name).cloned()
    }
}

impl Default for FluxFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FluxFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("FluxFuture")
            .field("ready", &!st.results.is_empty())
            .field("queued", &st.results.len())
            .field("continuations", &st.continuations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fulfill_then_get() {
        let f = FluxFuture::new();
        f.fulfill(Some(Bytes::from_static(b"hello")));
        assert!(f.is_ready());
        assert_eq!(f.get().await.unwrap(), Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn get_awaits_fulfillment() {
        let f = FluxFuture::new();
        let f2 = f.clone();
        let task = tokio::spawn(async move { f2.get().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.fulfill(None);
        assert_eq!(task.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn error_carries_text() {
        let f = FluxFuture::new();
        f.fulfill_error(71, Some("stream is broken"));
        let err = f.get().await.unwrap_err();
        assert_eq!(err.errnum, 71);
        assert_eq!(f.error_string().as_deref(), Some("stream is broken"));
    }

    #[tokio::test]
    async fn streaming_queue_and_reset() {
        let f = FluxFuture::new();
        f.fulfill(Some(Bytes::from_static(b"1")));
        f.fulfill(Some(Bytes::from_static(b"2")));

        assert_eq!(f.get().await.unwrap(), Some(Bytes::from_static(b"1")));
        f.reset();
        assert_eq!(f.get().await.unwrap(), Some(Bytes::from_static(b"2")));
        f.reset();
        assert!(!f.is_ready());
    }

    #[tokio::test]
    async fn then_runs_on_each_fulfillment() {
        let f = FluxFuture::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        f.then(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        f.fulfill(None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        f.reset();
        f.fulfill(None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn then_on_fulfilled_future_runs_immediately() {
        let f = FluxFuture::new();
        f.fulfill(None);
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        f.then(move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fulfill_from_inside_continuation_does_not_recurse() {
        let f = FluxFuture::new();
        let f2 = f.clone();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        f.then(move |_| {
            if count2.fetch_add(1, Ordering::SeqCst) == 0 {
                f2.fulfill(None); // queues a second run instead of recursing
            }
        });
        f.fulfill(None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_within_expiry_fails_the_future() {
        let f = FluxFuture::new();
        let err = f.wait_within(Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(err.errnum, errnum::ETIMEDOUT);
        // the timeout marks the future failed rather than leaving it
        // pending; later waiters observe the same outcome
        assert!(f.is_ready());
        assert_eq!(f.get().await.unwrap_err().errnum, errnum::ETIMEDOUT);
    }

    #[tokio::test]
    async fn wait_within_passes_through_a_fulfilled_result() {
        let f = FluxFuture::new();
        f.fulfill(Some(Bytes::from_static(b"fast")));
        assert_eq!(
            f.wait_within(Duration::from_millis(5)).await.unwrap(),
            Some(Bytes::from_static(b"fast"))
        );
    }

    #[tokio::test]
    async fn wait_within_timeout_runs_continuations() {
        let f = FluxFuture::new();
        let observed = Arc::new(AtomicU32::new(0));
        let observed2 = observed.clone();
        f.then(move |fut| {
            if matches!(fut.result(), Some(Err(e)) if e.errnum == errnum::ETIMEDOUT) {
                observed2.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _ = f.wait_within(Duration::from_millis(5)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_runs_once_at_first_use() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let f = FluxFuture::with_init(move |fut| {
            count2.fetch_add(1, Ordering::SeqCst);
            fut.fulfill(None);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(f.get().await.is_ok());
        assert!(f.get().await.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_blocking_outside_runtime() {
        let f = FluxFuture::new();
        f.fulfill(Some(Bytes::from_static(b"sync")));
        assert_eq!(f.get_blocking().unwrap(), Some(Bytes::from_static(b"sync")));
    }

    #[tokio::test]
    async fn get_blocking_inside_runtime_is_an_error() {
        let f = FluxFuture::new();
        f.fulfill(None);
        assert!(f.get_blocking().is_err());
    }

    #[tokio::test]
    async fn fulfill_with_copies_head_result() {
        let src = FluxFuture::new();
        src.fulfill(Some(Bytes::from_static(b"x")));
        let dst = FluxFuture::new();
        dst.fulfill_with(&src);
        assert_eq!(dst.get().await.unwrap(), Some(Bytes::from_static(b"x")));

        let pending = FluxFuture::new();
        let dst2 = FluxFuture::new();
        dst2.fulfill_with(&pending);
        assert!(dst2.get().await.is_err());
    }
}
