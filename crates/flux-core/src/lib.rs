//! Flux communication core.
//!
//! The pieces every broker module and tool builds on: the [`Handle`]
//! façade over a [`Transport`], the [`Reactor`] event loop, matchtag
//! allocation, request/response and event plumbing, and composable
//! [`FluxFuture`] results.

mod composite;
mod control;
mod dispatch;
mod event;
mod future;
mod handle;
mod reactor;
mod rpc;
mod tagpool;
mod transport;

pub use composite::*;
pub use control::*;
pub use dispatch::*;
pub use event::*;
pub use future::*;
pub use handle::*;
pub use reactor::*;
pub use rpc::*;
pub use tagpool::*;
pub use transport::*;

// The envelope types travel with the core API.
pub use flux_msg::{
    Cred, MATCHTAG_GROUP_MASK, MATCHTAG_GROUP_SHIFT, MATCHTAG_NONE, MSGTYPE_ANY, Match, Message,
    MsgFlags, MsgType, NODEID_ANY, NODEID_UPSTREAM, ProtoError, ProtoErrorKind, RoleMask,
    USERID_UNKNOWN, errnum, topic_match,
};
