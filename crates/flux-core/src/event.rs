//! Event subscription and publication.
//!
//! Events ride on dotted string topics.  Subscription management and
//! publication are RPCs to the broker's event service; delivery arrives as
//! EVENT messages matched by topic prefix against the dispatch table.  A
//! published event carries a broker-assigned sequence number in its aux
//! slot.

use serde::Deserialize;
use serde_json::json;

use flux_msg::{Message, MsgType, NODEID_ANY, ProtoError};

use crate::handle::{Handle, HandleError};
use crate::rpc::RpcFlags;

impl Handle {
    /// Subscribe to events whose topic starts with `topic`.
    pub async fn event_subscribe(&self, topic: &str) -> Result<(), HandleError> {
        let rpc = self
            .rpc_pack(
                "event.subscribe",
                &json!({ "topic": topic }),
                NODEID_ANY,
                RpcFlags::empty(),
            )
            .await?;
        rpc.get().await?;
        Ok(())
    }

    /// Drop an event subscription.
    pub async fn event_unsubscribe(&self, topic: &str) -> Result<(), HandleError> {
        let rpc = self
            .rpc_pack(
                "event.unsubscribe",
                &json!({ "topic": topic }),
                NODEID_ANY,
                RpcFlags::empty(),
            )
            .await?;
        rpc.get().await?;
        Ok(())
    }

    /// Publish an event, returning the sequence number the broker
    /// assigned.
    pub async fn event_publish(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<u32, HandleError> {
        #[derive(Deserialize)]
        struct PubResponse {
            seq: u32,
        }
        let body = match payload {
            Some(payload) => json!({ "topic": topic, "payload": payload }),
            None => json!({ "topic": topic }),
        };
        let rpc = self
            .rpc_pack("event.publish", &body, NODEID_ANY, RpcFlags::empty())
            .await?;
        let resp: PubResponse = rpc.get_unpack().await?;
        Ok(resp.seq)
    }
}

/// Split a received event into its topic and optional JSON payload.
pub fn event_decode(msg: &Message) -> Result<(String, Option<serde_json::Value>), ProtoError> {
    if msg.msg_type() != MsgType::Event {
        return Err(ProtoError::protocol("not an event message"));
    }
    let topic = msg.topic()?.to_string();
    let payload = if msg.has_payload() {
        Some(msg.unpack_value()?)
    } else {
        None
    };
    Ok((topic, payload))
}
