//! Per-peer façade: send/receive, dispatch, matchtags, aux data.
//!
//! A [`Handle`] wraps a [`Transport`] and owns the tag pool, the dispatch
//! table and the pending-RPC table.  It is cheap to clone; all clones
//! share state.  Exactly one task should drive [`Handle::run_dispatch`]
//! (usually through a reactor handle watcher); everything that task
//! delivers, handlers and future fulfillments alike, is serialized on it.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use flux_msg::{
    Cred, MATCHTAG_GROUP_MASK, MATCHTAG_NONE, Match, Message, MsgType, ProtoError, RoleMask,
    USERID_UNKNOWN, errnum,
};

use crate::dispatch::{DispatchId, DispatchTable, Handler};
use crate::future::FluxFuture;
use crate::tagpool::TagPool;
use crate::transport::{Transport, TransportError};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// Log every message as it is sent or received.
        const TRACE = 1;
    }
}

#[derive(Debug)]
pub enum HandleError {
    Transport(TransportError),
    Proto(ProtoError),
    /// The matchtag partition is exhausted.
    TagsExhausted,
    /// An RPC completed with an error outcome.
    Rpc(crate::future::FutureError),
    /// The handle has no value for a required attribute.
    MissingAttr(String),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Transport(e) => write!(f, "{}", e),
            HandleError::Proto(e) => write!(f, "{}", e),
            HandleError::TagsExhausted => write!(f, "matchtag pool exhausted"),
            HandleError::Rpc(e) => write!(f, "{}", e),
            HandleError::MissingAttr(name) => write!(f, "attribute {:?} is not set", name),
        }
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandleError::Transport(e) => Some(e),
            HandleError::Proto(e) => Some(e),
            HandleError::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for HandleError {
    fn from(e: TransportError) -> Self {
        HandleError::Transport(e)
    }
}

impl From<ProtoError> for HandleError {
    fn from(e: ProtoError) -> Self {
        HandleError::Proto(e)
    }
}

impl From<crate::future::FutureError> for HandleError {
    fn from(e: crate::future::FutureError) -> Self {
        HandleError::Rpc(e)
    }
}

struct HandleInner {
    transport: Transport,
    flags: Mutex<HandleFlags>,
    default_cred: Mutex<Cred>,
    attrs: Mutex<HashMap<String, String>>,
    tagpool: Mutex<TagPool>,
    pending: Mutex<HashMap<u32, FluxFuture>>,
    dispatch: Mutex<DispatchTable>,
    recv_buf: Mutex<VecDeque<Message>>,
    aux: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub fn new(transport: Transport) -> Self {
        let mut tagpool = TagPool::new();
        tagpool.on_grow(|oldsize, newsize, group| {
            debug!(
                oldsize,
                newsize, group, "matchtag pool grew; tag-indexed state unaffected"
            );
        });
        Handle {
            inner: Arc::new(HandleInner {
                transport,
                flags: Mutex::new(HandleFlags::empty()),
                default_cred: Mutex::new(Cred::default()),
                attrs: Mutex::new(HashMap::new()),
                tagpool: Mutex::new(tagpool),
                pending: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(DispatchTable::new()),
                recv_buf: Mutex::new(VecDeque::new()),
                aux: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Two connected handles over an in-process transport pair.
    pub fn pair() -> (Handle, Handle) {
        let (a, b) = Transport::mem_pair();
        (Handle::new(a), Handle::new(b))
    }

    /// Connect to a broker URI: `tcp://HOST:PORT` or `unix://PATH`.
    pub async fn connect(uri: &str) -> Result<Handle, HandleError> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(|e| HandleError::Transport(TransportError::Io(e)))?;
            return Ok(Handle::new(Transport::stream(stream)));
        }
        #[cfg(unix)]
        if let Some(path) = uri.strip_prefix("unix://") {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| HandleError::Transport(TransportError::Io(e)))?;
            return Ok(Handle::new(Transport::stream(stream)));
        }
        Err(HandleError::Proto(ProtoError::invalid(format!(
            "unsupported connector URI {:?}",
            uri
        ))))
    }

    /// A handle sharing this handle's transport and state, for running
    /// nested work; its lifetime is bounded by the parent's.
    pub fn open_child(&self) -> Handle {
        self.clone()
    }

    pub fn set_flags(&self, flags: HandleFlags) {
        *self.inner.flags.lock() = flags;
    }

    pub fn flags(&self) -> HandleFlags {
        *self.inner.flags.lock()
    }

    pub fn set_default_cred(&self, cred: Cred) {
        *self.inner.default_cred.lock() = cred;
    }

    pub fn set_attr(&self, name: &str, value: &str) {
        self.inner
            .attrs
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.inner.attrs.lock().get(name).cloned()
    }

    /// This peer's rank from the `rank` attribute.
    pub fn rank(&self) -> Result<u32, HandleError> {
        self.attr("rank")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HandleError::MissingAttr("rank".to_string()))
    }

    /// Instance size from the `size` attribute.
    pub fn size(&self) -> Result<u32, HandleError> {
        self.attr("size")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HandleError::MissingAttr("size".to_string()))
    }

    pub fn aux_set(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.inner.aux.lock().insert(name.to_string(), value);
    }

    pub fn aux_get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.aux.lock().get(name).cloned()
    }

    /// Allocate a matchtag.  Group tags come back shifted into the upper
    /// bits.
    pub fn alloc_matchtag(&self, group: bool) -> Result<u32, HandleError> {
        self.inner
            .tagpool
            .lock()
            .alloc(group)
            .ok_or(HandleError::TagsExhausted)
    }

    pub fn free_matchtag(&self, tag: u32) {
        self.inner.tagpool.lock().free(tag);
    }

    pub(crate) fn register_pending(&self, tag: u32, future: FluxFuture) {
        let key = pending_key(tag);
        self.inner.pending.lock().insert(key, future);
    }

    pub(crate) fn deregister_pending(&self, tag: u32) {
        self.inner.pending.lock().remove(&pending_key(tag));
    }

    /// Fail every pending RPC; used when the transport dies.
    fn fail_all_pending(&self, text: &str) {
        let pending: Vec<FluxFuture> = self.inner.pending.lock().drain().map(|(_, f)| f).collect();
        for future in pending {
            future.fulfill_error(errnum::ECONNRESET, Some(text));
        }
    }

    /// Send a message.  Credentials default to the handle's configured
    /// identity when the caller left them unset.
    pub async fn send(&self, msg: &Message) -> Result<(), HandleError> {
        let mut out = msg.clone();
        if out.userid() == USERID_UNKNOWN && out.rolemask() == RoleMask::NONE {
            out.set_cred(*self.inner.default_cred.lock());
        }
        if self.flags().contains(HandleFlags::TRACE) {
            trace!("> {}", msg_summary(&out));
        }
        self.inner.transport.send(out).await.map_err(Into::into)
    }

    async fn transport_recv(&self) -> Result<Message, HandleError> {
        let msg = self.inner.transport.recv().await?;
        if self.flags().contains(HandleFlags::TRACE) {
            trace!("< {}", msg_summary(&msg));
        }
        Ok(msg)
    }

    /// Receive the next message of any kind, draining the match buffer
    /// first.
    pub async fn recv_any(&self) -> Result<Message, HandleError> {
        if let Some(msg) = self.inner.recv_buf.lock().pop_front() {
            return Ok(msg);
        }
        self.transport_recv().await
    }

    /// Receive the next message satisfying `filter`.  Non-matching
    /// messages are buffered for later delivery rather than dropped.
    pub async fn recv(&self, filter: &Match) -> Result<Message, HandleError> {
        {
            let mut buf = self.inner.recv_buf.lock();
            if let Some(idx) = buf.iter().position(|m| m.matches(filter))
                && let Some(msg) = buf.remove(idx)
            {
                return Ok(msg);
            }
        }
        loop {
            let msg = self.transport_recv().await?;
            if msg.matches(filter) {
                return Ok(msg);
            }
            self.inner.recv_buf.lock().push_back(msg);
        }
    }

    /// Register a dispatch entry.  The most recently registered matching
    /// entry receives the message.
    pub fn register(&self, filter: Match, handler: Handler) -> DispatchId {
        self.inner.dispatch.lock().register(filter, handler)
    }

    /// Register a service: the handler receives every `NAME.*` request.
    pub fn register_service(&self, name: &str, handler: Handler) -> DispatchId {
        self.register(Match::request(format!("{}.*", name)), handler)
    }

    pub fn deregister(&self, id: DispatchId) -> bool {
        self.inner.dispatch.lock().deregister(id)
    }

    /// Snapshot of the registered dispatch filters, oldest first.
    pub fn dispatch_filters(&self) -> Vec<(DispatchId, Match)> {
        self.inner.dispatch.lock().filters()
    }

    /// The handle's message pump: receive and dispatch until the transport
    /// closes or fails.  On failure every pending RPC is fulfilled with an
    /// error so waiters are not stranded.
    pub async fn run_dispatch(&self) -> Result<(), HandleError> {
        loop {
            let msg = match self.recv_any().await {
                Ok(msg) => msg,
                Err(e) => {
                    self.fail_all_pending("transport closed");
                    return Err(e);
                }
            };
            self.dispatch_one(msg).await;
        }
    }

    /// Deliver one message: responses pair to pending futures by
    /// matchtag; everything else goes through the dispatch table; an
    /// unmatched request is answered ENOSYS.
    pub async fn dispatch_one(&self, msg: Message) {
        if msg.msg_type() == MsgType::Response
            && let Ok(tag) = msg.matchtag()
            && tag != MATCHTAG_NONE
        {
            let future = self.inner.pending.lock().get(&pending_key(tag)).cloned();
            if let Some(future) = future {
                fulfill_from_response(&future, &msg);
                return;
            }
        }

        let msg = Arc::new(msg);
        let handler = self.inner.dispatch.lock().find(&msg);
        if let Some(handler) = handler {
            handler(self.clone(), msg).await;
            return;
        }

        if msg.msg_type() == MsgType::Request && !msg.is_noresponse() {
            if let Err(e) = self
                .respond_error(&msg, errnum::ENOSYS, Some("service unavailable"))
                .await
            {
                warn!("failed to send ENOSYS response: {}", e);
            }
            return;
        }
        trace!("dropping unmatched {}", msg_summary(&msg));
    }

    /// Respond to a request with an optional payload.  A no-op for
    /// NORESPONSE requests.
    pub async fn respond(
        &self,
        request: &Message,
        payload: Option<bytes::Bytes>,
    ) -> Result<(), HandleError> {
        if request.is_noresponse() {
            return Ok(());
        }
        let mut resp = Message::response_for(request)?;
        if let Some(payload) = payload {
            resp.set_payload(payload);
        }
        self.send(&resp).await
    }

    /// Respond with a JSON object payload.
    pub async fn respond_pack(
        &self,
        request: &Message,
        value: &impl serde::Serialize,
    ) -> Result<(), HandleError> {
        if request.is_noresponse() {
            return Ok(());
        }
        let mut resp = Message::response_for(request)?;
        resp.pack(value)?;
        self.send(&resp).await
    }

    /// Respond with an error; optional text rides in the payload.
    pub async fn respond_error(
        &self,
        request: &Message,
        errnum: i32,
        text: Option<&str>,
    ) -> Result<(), HandleError> {
        if request.is_noresponse() {
            return Ok(());
        }
        let mut resp = Message::response_for(request)?;
        resp.set_errnum(errnum)?;
        if let Some(text) = text {
            resp.set_string(text);
        }
        self.send(&resp).await
    }

    pub fn close(&self) {
        self.inner.transport.close();
    }
}

fn pending_key(tag: u32) -> u32 {
    if tag & MATCHTAG_GROUP_MASK != 0 {
        tag & MATCHTAG_GROUP_MASK
    } else {
        tag
    }
}

fn fulfill_from_response(future: &FluxFuture, msg: &Message) {
    match msg.errnum() {
        Ok(0) => future.fulfill(msg.payload_bytes()),
        Ok(errnum) => {
            let text = msg.string().ok().flatten().map(str::to_owned);
            future.fulfill_error(errnum, text.as_deref());
        }
        Err(e) => future.fulfill_error(e.errnum(), Some(&e.to_string())),
    }
}

fn msg_summary(msg: &Message) -> String {
    let mut s = format!("{}", msg.msg_type());
    if let Ok(topic) = msg.topic() {
        s.push(' ');
        s.push_str(topic);
    }
    if let Ok(tag) = msg.matchtag() {
        s.push_str(&format!(" tag={}", tag));
    }
    if let Ok(errnum) = msg.errnum()
        && errnum != 0
    {
        s.push_str(&format!(" errnum={}", errnum));
    }
    if let Ok(count) = msg.route_count() {
        s.push_str(&format!(" hops={}", count));
    }
    s
}
