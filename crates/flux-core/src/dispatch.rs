//! Message dispatch table.
//!
//! A handle delivers each received message to the most recently registered
//! entry whose filter matches.  Registering `svc.*` and then `svc.foo`
//! therefore routes `svc.foo` to the dedicated handler and every other
//! method to the catch-all.  Responses carrying a pending matchtag bypass
//! the table; unmatched requests get a courtesy ENOSYS response so the
//! requester's timeout budget is not consumed.

use std::sync::Arc;

use futures::future::BoxFuture;

use flux_msg::{Match, Message};

use crate::handle::Handle;

/// An async message handler.  Handlers may await; the handle's pump task
/// serializes them.
pub type Handler = Arc<dyn Fn(Handle, Arc<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure or fn into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Handle, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |handle, msg| Box::pin(f(handle, msg)))
}

/// Identifies a registered dispatch entry for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchId(u64);

struct Entry {
    id: DispatchId,
    filter: Match,
    handler: Handler,
}

pub(crate) struct DispatchTable {
    entries: Vec<Entry>,
    next_id: u64,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        DispatchTable {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn register(&mut self, filter: Match, handler: Handler) -> DispatchId {
        let id = DispatchId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            filter,
            handler,
        });
        id
    }

    pub(crate) fn deregister(&mut self, id: DispatchId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Most recently registered matching entry.
    pub(crate) fn find(&self, msg: &Message) -> Option<Handler> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.filter.matches(msg))
            .map(|e| e.handler.clone())
    }

    pub(crate) fn filters(&self) -> Vec<(DispatchId, Match)> {
        self.entries
            .iter()
            .map(|e| (e.id, e.filter.clone()))
            .collect()
    }
}
