//! Request/response origination.
//!
//! An [`Rpc`] pairs a request with its response future via a matchtag.
//! Dropping the Rpc detaches it: a late response is discarded by the
//! dispatcher.  Chains built on [`Rpc::future`] only resolve while the Rpc
//! itself is kept alive.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use flux_msg::{MATCHTAG_NONE, Message, MsgFlags, NODEID_UPSTREAM, errnum};

use crate::control::{ControlType, control_encode};
use crate::future::{FluxFuture, FutureError};
use crate::handle::{Handle, HandleError};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RpcFlags: u8 {
        /// Expect zero or more responses followed by a terminating error.
        const STREAMING = 1;
        /// Expect no response at all; no matchtag is allocated.
        const NORESPONSE = 2;
    }
}

pub struct Rpc {
    handle: Handle,
    future: FluxFuture,
    matchtag: u32,
    streaming: bool,
    /// Set once the RPC has been removed from pending dispatch and its
    /// matchtag returned (timeout expiry); Drop then has nothing to do.
    detached: AtomicBool,
}

impl Handle {
    /// Send a request with no payload.
    pub async fn rpc(
        &self,
        topic: &str,
        nodeid: u32,
        flags: RpcFlags,
    ) -> Result<Rpc, HandleError> {
        self.rpc_message(Message::request(topic)?, nodeid, flags)
            .await
    }

    /// Send a request with a JSON object payload.
    pub async fn rpc_pack(
        &self,
        topic: &str,
        value: &impl serde::Serialize,
        nodeid: u32,
        flags: RpcFlags,
    ) -> Result<Rpc, HandleError> {
        let mut msg = Message::request(topic)?;
        msg.pack(value)?;
        self.rpc_message(msg, nodeid, flags).await
    }

    /// Send a prepared request message as an RPC.
    ///
    /// [`NODEID_UPSTREAM`] is resolved here: the message carries the local
    /// rank plus the UPSTREAM flag so brokers route it away from the
    /// sender.
    pub async fn rpc_message(
        &self,
        mut msg: Message,
        nodeid: u32,
        flags: RpcFlags,
    ) -> Result<Rpc, HandleError> {
        if flags.contains(RpcFlags::STREAMING) {
            msg.set_streaming();
        }
        if flags.contains(RpcFlags::NORESPONSE) {
            msg.set_noresponse();
        }
        if nodeid == NODEID_UPSTREAM {
            msg.set_nodeid(self.rank()?)?;
            let upstream = msg.flags() | MsgFlags::UPSTREAM;
            msg.set_flags(upstream)?;
        } else {
            msg.set_nodeid(nodeid)?;
        }

        let matchtag = if msg.is_noresponse() {
            MATCHTAG_NONE
        } else {
            self.alloc_matchtag(false)?
        };
        msg.set_matchtag(matchtag)?;

        let future = FluxFuture::new();
        if matchtag != MATCHTAG_NONE {
            self.register_pending(matchtag, future.clone());
        }
        if let Err(e) = self.send(&msg).await {
            if matchtag != MATCHTAG_NONE {
                self.deregister_pending(matchtag);
                self.free_matchtag(matchtag);
            }
            return Err(e);
        }
        Ok(Rpc {
            handle: self.clone(),
            future,
            matchtag,
            streaming: msg.is_streaming(),
            detached: AtomicBool::new(false),
        })
    }
}

impl Handle {
    /// Fetch a broker attribute via `attr.get`, caching it locally.
    /// Locally seeded attributes short-circuit the RPC.
    pub async fn attr_fetch(&self, name: &str) -> Result<String, HandleError> {
        if let Some(value) = self.attr(name) {
            return Ok(value);
        }
        #[derive(serde::Deserialize)]
        struct AttrResponse {
            value: String,
        }
        let rpc = self
            .rpc_pack(
                "attr.get",
                &serde_json::json!({ "name": name }),
                flux_msg::NODEID_ANY,
                RpcFlags::empty(),
            )
            .await?;
        let resp: AttrResponse = rpc.get_unpack().await?;
        self.set_attr(name, &resp.value);
        Ok(resp.value)
    }
}

impl Rpc {
    pub fn future(&self) -> &FluxFuture {
        &self.future
    }

    pub fn matchtag(&self) -> u32 {
        self.matchtag
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Await the response payload.  An error response surfaces as
    /// [`FutureError`] with its errnum and any error text the service
    /// supplied.
    pub async fn get(&self) -> Result<Option<Bytes>, FutureError> {
        self.future.get().await
    }

    /// Await the response within a time budget.  On expiry the future is
    /// fulfilled with a timeout error and the RPC is detached from pending
    /// dispatch (entry deregistered, matchtag freed), so a response
    /// arriving after the caller gave up is discarded rather than
    /// resurrecting the call.
    pub async fn wait_within(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<Bytes>, FutureError> {
        match tokio::time::timeout(timeout, self.future.get()).await {
            Ok(r) => r,
            Err(_) => {
                let err = FutureError::timeout();
                self.future.fulfill_err(err.clone());
                self.detach();
                Err(err)
            }
        }
    }

    /// Remove this RPC from pending dispatch and return its matchtag.
    /// Idempotent; Drop skips a detached RPC.
    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.deregister_pending(self.matchtag);
        self.handle.free_matchtag(self.matchtag);
    }

    /// Await a NUL-terminated string payload.
    pub async fn get_string(&self) -> Result<Option<String>, FutureError> {
        match self.get().await? {
            None => Ok(None),
            Some(payload) => Ok(Some(payload_str(&payload)?.to_owned())),
        }
    }

    /// Await a JSON object payload projected into `T`.
    pub async fn get_unpack<T: DeserializeOwned>(&self) -> Result<T, FutureError> {
        let payload = self
            .get()
            .await?
            .ok_or_else(|| FutureError::new(errnum::EPROTO, "response has no payload"))?;
        unpack_payload(&payload)
    }

    /// Pop the current response of a streaming RPC, readying the future
    /// for the next one.
    pub fn reset(&self) {
        self.future.reset();
    }

    /// Cancel a streaming RPC: a disconnect control carrying this
    /// matchtag asks the service to terminate the stream with an error
    /// response (conventionally ENODATA).
    pub async fn cancel(&self) -> Result<(), HandleError> {
        let msg = control_encode(ControlType::Disconnect, self.matchtag as i32);
        self.handle.send(&msg).await
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        self.handle.deregister_pending(self.matchtag);
        // A streaming tag is only returned once the stream has terminated;
        // otherwise a late response could pair with a reallocated tag.
        let terminated = !self.streaming || matches!(self.future.result(), Some(Err(_)));
        if terminated {
            self.handle.free_matchtag(self.matchtag);
        }
    }
}

/// Project a NUL-terminated JSON payload into `T`, as
/// [`Rpc::get_unpack`] does for the head response.
pub fn unpack_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FutureError> {
    let body = payload_str(payload)?;
    serde_json::from_str(body).map_err(|e| FutureError::new(errnum::EPROTO, e.to_string()))
}

fn payload_str(payload: &[u8]) -> Result<&str, FutureError> {
    let Some((&0, body)) = payload.split_last() else {
        return Err(FutureError::new(
            errnum::EPROTO,
            "payload is not NUL terminated",
        ));
    };
    std::str::from_utf8(body)
        .map_err(|_| FutureError::new(errnum::EPROTO, "payload is not valid UTF-8"))
}
