//! Composite futures: wait-all, wait-any, and chained continuations.
//!
//! A composite holds a named map of child futures and fulfills according
//! to its policy.  A chain created with [`FluxFuture::and_then`] /
//! [`FluxFuture::or_then`] returns a placeholder "next" future whose
//! fulfillment is decided when "prev" resolves: the registered callback
//! may transfer fulfillment to a newly created future, fail the chain, or
//! do nothing and let "next" inherit "prev"'s outcome.
//!
//! Ownership runs from next to prev: the next future owns the chain
//! record, which owns prev; prev keeps only weak references back.
//! Dropping every handle to next therefore detaches the chain, and a late
//! fulfillment of prev finds nobody to notify.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use flux_msg::ProtoError;

use crate::FutureResult;

use crate::future::{FluxFuture, FutureError, FutureInner};

struct CompositeInner {
    any: bool,
    children: Mutex<Vec<(String, FluxFuture)>>,
    anon_seq: Mutex<u32>,
}

/// A wait-all or wait-any future over named children.
///
/// Children attach when the composite is first waited on (`get`/`then`);
/// push all children before waiting.
#[derive(Clone)]
pub struct CompositeFuture {
    future: FluxFuture,
    inner: Arc<CompositeInner>,
}

impl CompositeFuture {
    fn new(any: bool) -> Self {
        let inner = Arc::new(CompositeInner {
            any,
            children: Mutex::new(Vec::new()),
            anon_seq: Mutex::new(0),
        });
        let init_inner = inner.clone();
        let future = FluxFuture::with_init(move |f| composite_init(f, &init_inner));
        CompositeFuture { future, inner }
    }

    /// Add a named child.  Names must be unique within the composite.
    pub fn push(&self, name: &str, child: FluxFuture) -> Result<(), ProtoError> {
        let mut children = self.inner.children.lock();
        if children.iter().any(|(n, _)| n == name) {
            return Err(ProtoError::invalid(format!(
                "composite already has a child named {:?}",
                name
            )));
        }
        children.push((name.to_string(), child));
        Ok(())
    }

    /// Add an anonymous child; returns the generated name.
    pub fn push_anon(&self, child: FluxFuture) -> String {
        let mut seq = self.inner.anon_seq.lock();
        let name = seq.to_string();
        *seq += 1;
        self.inner
            .children
            .lock()
            .push((name.clone(), child));
        name
    }

    pub fn child(&self, name: &str) -> Option<FluxFuture> {
        self.inner
            .children
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f.clone())
    }

    pub fn child_names(&self) -> Vec<String> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn future(&self) -> &FluxFuture {
        &self.future
    }

    pub async fn get(&self) -> FutureResult {
        self.future.get().await
    }

    pub fn is_ready(&self) -> bool {
        self.future.is_ready()
    }
}

impl FluxFuture {
    /// A composite fulfilled once every child is; carries the first
    /// observed child error, else success.  An empty wait-all fulfills
    /// immediately when waited on.
    pub fn wait_all() -> CompositeFuture {
        CompositeFuture::new(false)
    }

    /// A composite fulfilled by the first child to resolve, mirroring that
    /// child's outcome.
    pub fn wait_any() -> CompositeFuture {
        CompositeFuture::new(true)
    }
}

fn composite_init(parent: &FluxFuture, inner: &Arc<CompositeInner>) {
    let children = inner.children.lock().clone();
    if children.is_empty() {
        // logically, "all" of zero children are fulfilled
        if !inner.any {
            parent.fulfill(None);
        }
        return;
    }
    for (_, child) in children {
        let parent = parent.clone();
        let inner = inner.clone();
        child.then(move |resolved| {
            if parent.is_ready() {
                return;
            }
            if inner.any {
                parent.fulfill_with(resolved);
                return;
            }
            let mut first_err: Option<FutureError> = None;
            {
                let children = inner.children.lock();
                for (_, c) in children.iter() {
                    match c.result() {
                        None => return, // still waiting on this child
                        Some(Err(e)) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
            match first_err {
                Some(e) => parent.fulfill_err(e),
                None => parent.fulfill(None),
            }
        });
    }
}

type ChainFn = Box<dyn FnMut(&FluxFuture, &ChainLink) + Send>;

pub(crate) struct ChainState {
    prev: FluxFuture,
    next: Weak<FutureInner>,
    and_then: Mutex<Option<ChainFn>>,
    or_then: Mutex<Option<ChainFn>>,
    continued: Mutex<bool>,
}

/// Handed to and-then / or-then callbacks to steer the chain.
pub struct ChainLink {
    chain: Arc<ChainState>,
}

impl ChainLink {
    /// Transfer fulfillment of the next future to `f`: when `f` resolves,
    /// next resolves with `f`'s outcome.
    pub fn continue_with(&self, f: &FluxFuture) {
        *self.chain.continued.lock() = true;
        let next = self.chain.next.clone();
        f.then(move |resolved| {
            if let Some(next) = FluxFuture::upgrade(&next) {
                next.fulfill_with(resolved);
            }
        });
    }

    /// Fulfill the next future with an error.
    pub fn continue_error(&self, errnum: i32, text: Option<&str>) {
        *self.chain.continued.lock() = true;
        if let Some(next) = FluxFuture::upgrade(&self.chain.next) {
            next.fulfill_error(errnum, text);
        }
    }

    /// Mark the chain handled without fulfilling next, e.g. while waiting
    /// for a later fulfillment of a streaming prev.
    pub fn defer(&self) {
        *self.chain.continued.lock() = true;
    }
}

fn chained_continuation(prev: &FluxFuture, chain: &Arc<ChainState>) {
    // reset for each fulfillment of a streaming prev
    *chain.continued.lock() = false;

    let Some(result) = prev.result() else {
        return;
    };
    let link = ChainLink {
        chain: chain.clone(),
    };
    let slot = if result.is_err() {
        &chain.or_then
    } else {
        &chain.and_then
    };
    // run the callback outside the slot lock so it may re-register
    if let Some(mut cb) = slot.lock().take() {
        cb(prev, &link);
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(cb);
        }
    }

    // prev was reset during the callback; wait for refulfillment
    if !prev.is_ready() {
        return;
    }
    if !*chain.continued.lock()
        && let Some(next) = FluxFuture::upgrade(&chain.next)
    {
        next.fulfill_with(prev);
    }
}

impl FluxFuture {
    fn chained(&self) -> (Arc<ChainState>, FluxFuture) {
        if let Some(chain) = self.chain_backref()
            && let Some(next) = FluxFuture::upgrade(&chain.next)
        {
            return (chain, next);
        }
        let next = FluxFuture::new();
        let chain = Arc::new(ChainState {
            prev: self.clone(),
            next: next.downgrade(),
            and_then: Mutex::new(None),
            or_then: Mutex::new(None),
            continued: Mutex::new(false),
        });
        next.set_chain_owner(chain.clone());
        let chain_weak = Arc::downgrade(&chain);
        next.set_init_internal(move |_| {
            if let Some(chain) = chain_weak.upgrade() {
                let prev = chain.prev.clone();
                let weak = Arc::downgrade(&chain);
                prev.then(move |p| {
                    if let Some(chain) = weak.upgrade() {
                        chained_continuation(p, &chain);
                    }
                });
            }
        });
        self.set_chain_backref(&chain);
        (chain, next)
    }

    /// Chain a callback onto successful fulfillment of this future; the
    /// returned future resolves when the callback decides (or by
    /// inheriting this future's outcome).
    pub fn and_then(&self, cb: impl FnMut(&FluxFuture, &ChainLink) + Send + 'static) -> FluxFuture {
        let (chain, next) = self.chained();
        *chain.and_then.lock() = Some(Box::new(cb));
        next
    }

    /// Chain a callback onto failed fulfillment of this future.  Calling
    /// both `and_then` and `or_then` on one future returns the same next
    /// future.
    pub fn or_then(&self, cb: impl FnMut(&FluxFuture, &ChainLink) + Send + 'static) -> FluxFuture {
        let (chain, next) = self.chained();
        *chain.or_then.lock() = Some(Box::new(cb));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flux_msg::errnum;

    fn fulfilled(s: &'static str) -> FluxFuture {
        let f = FluxFuture::new();
        f.fulfill(Some(Bytes::from_static(s.as_bytes())));
        f
    }

    fn failed(errnum: i32, text: &str) -> FluxFuture {
        let f = FluxFuture::new();
        f.fulfill_error(errnum, Some(text));
        f
    }

    #[tokio::test]
    async fn wait_all_success() {
        let all = FluxFuture::wait_all();
        all.push("a", fulfilled("A")).unwrap();
        all.push("b", fulfilled("B")).unwrap();
        assert!(all.get().await.is_ok());

        let a = all.child("a").unwrap();
        assert_eq!(a.get().await.unwrap(), Some(Bytes::from_static(b"A")));
        let b = all.child("b").unwrap();
        assert_eq!(b.get().await.unwrap(), Some(Bytes::from_static(b"B")));
    }

    #[tokio::test]
    async fn wait_all_fulfills_after_last_child() {
        let all = FluxFuture::wait_all();
        let pending = FluxFuture::new();
        all.push("first", fulfilled("x")).unwrap();
        all.push("second", pending.clone()).unwrap();

        let fut = all.future().clone();
        let waiter = tokio::spawn(async move { fut.get().await });
        tokio::task::yield_now().await;
        assert!(!all.is_ready());

        pending.fulfill(None);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_all_carries_first_error() {
        let all = FluxFuture::wait_all();
        all.push("ok", fulfilled("x")).unwrap();
        all.push("bad", failed(5, "first failure")).unwrap();
        all.push("worse", failed(6, "second failure")).unwrap();
        let err = all.get().await.unwrap_err();
        assert_eq!(err.errnum, 5);
        assert_eq!(err.text.as_deref(), Some("first failure"));
    }

    #[tokio::test]
    async fn empty_wait_all_fulfills_immediately() {
        let all = FluxFuture::wait_all();
        assert!(all.get().await.is_ok());
    }

    #[tokio::test]
    async fn wait_any_mirrors_first_resolved_child() {
        let any = FluxFuture::wait_any();
        let slow = FluxFuture::new();
        any.push("slow", slow).unwrap();
        any.push("fast", fulfilled("winner")).unwrap();
        assert_eq!(
            any.get().await.unwrap(),
            Some(Bytes::from_static(b"winner"))
        );
    }

    #[tokio::test]
    async fn wait_any_mirrors_error_outcome() {
        let any = FluxFuture::wait_any();
        any.push("only", failed(7, "boom")).unwrap();
        let err = any.get().await.unwrap_err();
        assert_eq!(err.errnum, 7);
    }

    #[tokio::test]
    async fn duplicate_child_name_rejected() {
        let all = FluxFuture::wait_all();
        all.push("a", FluxFuture::new()).unwrap();
        assert!(all.push("a", FluxFuture::new()).is_err());
        assert_eq!(all.push_anon(FluxFuture::new()), "0");
        assert_eq!(all.push_anon(FluxFuture::new()), "1");
    }

    #[tokio::test]
    async fn chained_continue_with_new_future() {
        let prev = fulfilled("ok");
        let next = prev.and_then(|p, link| {
            assert_eq!(p.result().unwrap().unwrap(), Some(Bytes::from_static(b"ok")));
            link.continue_with(&fulfilled("transformed"));
        });
        assert_eq!(
            next.get().await.unwrap(),
            Some(Bytes::from_static(b"transformed"))
        );
    }

    #[tokio::test]
    async fn chained_inherits_prev_without_continue() {
        let prev = fulfilled("inherited");
        let next = prev.and_then(|_p, _link| {
            // no continue call
        });
        assert_eq!(
            next.get().await.unwrap(),
            Some(Bytes::from_static(b"inherited"))
        );
    }

    #[tokio::test]
    async fn chained_continue_error() {
        let prev = fulfilled("ok");
        let next = prev.and_then(|_p, link| {
            link.continue_error(errnum::ENODATA, Some("gave up"));
        });
        let err = next.get().await.unwrap_err();
        assert_eq!(err.errnum, errnum::ENODATA);
        assert_eq!(err.text.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn or_then_handles_error_path() {
        let prev = failed(13, "broken");
        let recovered = prev.or_then(|p, link| {
            assert_eq!(p.result().unwrap().unwrap_err().errnum, 13);
            link.continue_with(&fulfilled("recovered"));
        });
        assert_eq!(
            recovered.get().await.unwrap(),
            Some(Bytes::from_static(b"recovered"))
        );
    }

    #[tokio::test]
    async fn error_inherited_when_no_or_then() {
        let prev = failed(13, "broken");
        let next = prev.and_then(|_p, _link| panic!("and_then must not run on error"));
        let err = next.get().await.unwrap_err();
        assert_eq!(err.errnum, 13);
        assert_eq!(err.text.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn and_then_or_then_share_next() {
        let prev = FluxFuture::new();
        let next1 = prev.and_then(|_p, _l| {});
        let next2 = prev.or_then(|_p, _l| {});
        prev.fulfill(Some(Bytes::from_static(b"v")));
        assert_eq!(next1.get().await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(next2.get().await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn chain_on_pending_prev_resolves_later() {
        let prev = FluxFuture::new();
        let next = prev.and_then(|p, link| {
            let doubled = FluxFuture::new();
            let text = match p.result().unwrap().unwrap() {
                Some(b) => format!("{}{}", String::from_utf8_lossy(&b), "!"),
                None => "!".to_string(),
            };
            doubled.fulfill(Some(Bytes::from(text)));
            link.continue_with(&doubled);
        });

        let waiter = {
            let next = next.clone();
            tokio::spawn(async move { next.get().await })
        };
        tokio::task::yield_now().await;
        prev.fulfill(Some(Bytes::from_static(b"hi")));
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Some(Bytes::from_static(b"hi!"))
        );
    }
}
