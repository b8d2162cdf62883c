//! The loopback broker: broker-side services over a mem transport pair.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::trace;

use flux_core::{
    ControlType, Cred, Handle, Match, Message, MsgType, RoleMask, Transport, control_decode,
    errnum, handler_fn,
};

use crate::net::TestNet;

const WAIT_STATES: &[&str] = &["full", "partial", "degraded", "offline", "lost"];

/// Userid owning the simulated instance.
pub const OWNER_USERID: u32 = 1000;

struct BrokerState {
    net: TestNet,
    subscriptions: Vec<String>,
    event_seq: u32,
    joins: Vec<String>,
    disconnects: Vec<u32>,
}

/// A broker simulator plus the client handle connected to it.
///
/// Both ends are pumped by background tasks; drop the broker to tear the
/// instance down.
pub struct TestBroker {
    client: Handle,
    state: Arc<Mutex<BrokerState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestBroker {
    pub fn start(net: TestNet) -> TestBroker {
        let (client_end, broker_end) = Transport::mem_pair();

        let client = Handle::new(client_end);
        client.set_attr("rank", "0");
        client.set_attr("size", &net.size().to_string());
        client.set_attr("hostlist", &net.hostlist());
        // a locally connected client is the instance owner
        client.set_default_cred(Cred::new(OWNER_USERID, RoleMask::OWNER | RoleMask::LOCAL));

        let broker = Handle::new(broker_end);
        let state = Arc::new(Mutex::new(BrokerState {
            net,
            subscriptions: Vec::new(),
            event_seq: 0,
            joins: Vec::new(),
            disconnects: Vec::new(),
        }));

        register_event_service(&broker, &state);
        register_overlay_service(&broker, &state);
        register_attr_service(&broker, &state);
        register_groups_service(&broker, &state);
        register_cancel_service(&broker);

        let tasks = vec![
            tokio::spawn({
                let broker = broker.clone();
                async move {
                    let _ = broker.run_dispatch().await;
                }
            }),
            tokio::spawn({
                let client = client.clone();
                async move {
                    let _ = client.run_dispatch().await;
                }
            }),
        ];

        TestBroker {
            client,
            state,
            tasks,
        }
    }

    /// The handle a test drives the instance through.
    pub fn client(&self) -> Handle {
        self.client.clone()
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.lock().joins.clone()
    }

    pub fn disconnects(&self) -> Vec<u32> {
        self.state.lock().disconnects.clone()
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn register_event_service(broker: &Handle, state: &Arc<Mutex<BrokerState>>) {
    let st = state.clone();
    broker.register(
        Match::request("event.subscribe"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                match m.unpack_value() {
                    Ok(v) => {
                        let topic = v["topic"].as_str().unwrap_or_default().to_string();
                        st.lock().subscriptions.push(topic);
                        let _ = h.respond(&m, None).await;
                    }
                    Err(e) => {
                        let _ = h.respond_error(&m, e.errnum(), Some(&e.to_string())).await;
                    }
                }
            }
        }),
    );

    let st = state.clone();
    broker.register(
        Match::request("event.unsubscribe"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                if let Ok(v) = m.unpack_value() {
                    let topic = v["topic"].as_str().unwrap_or_default();
                    let mut guard = st.lock();
                    if let Some(pos) = guard.subscriptions.iter().position(|s| s == topic) {
                        guard.subscriptions.remove(pos);
                    }
                }
                let _ = h.respond(&m, None).await;
            }
        }),
    );

    let st = state.clone();
    broker.register(
        Match::request("event.publish"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                let v = match m.unpack_value() {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = h.respond_error(&m, e.errnum(), Some(&e.to_string())).await;
                        return;
                    }
                };
                let Some(topic) = v["topic"].as_str() else {
                    let _ = h
                        .respond_error(&m, errnum::EPROTO, Some("publish has no topic"))
                        .await;
                    return;
                };
                let (seq, subscribed) = {
                    let mut guard = st.lock();
                    guard.event_seq += 1;
                    let subscribed = guard
                        .subscriptions
                        .iter()
                        .any(|prefix| topic.starts_with(prefix.as_str()));
                    (guard.event_seq, subscribed)
                };
                let _ = h.respond_pack(&m, &json!({ "seq": seq })).await;

                if subscribed {
                    let mut event = match Message::event(topic) {
                        Ok(event) => event,
                        Err(_) => return,
                    };
                    let _ = event.set_seq(seq);
                    if let Some(payload) = v.get("payload")
                        && !payload.is_null()
                        && event.pack(payload).is_err()
                    {
                        return;
                    }
                    let _ = h.send(&event).await;
                }
            }
        }),
    );
}

fn register_overlay_service(broker: &Handle, state: &Arc<Mutex<BrokerState>>) {
    let st = state.clone();
    broker.register(
        Match::request("overlay.health"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                let rank = match m.nodeid() {
                    Ok(rank) => rank,
                    Err(e) => {
                        let _ = h.respond_error(&m, e.errnum(), Some(&e.to_string())).await;
                        return;
                    }
                };
                let wait = m
                    .unpack_value()
                    .ok()
                    .and_then(|v| v["wait"].as_str().map(str::to_owned));
                if let Some(wait) = &wait
                    && !WAIT_STATES.contains(&wait.as_str())
                {
                    let _ = h
                        .respond_error(
                            &m,
                            errnum::EPROTO,
                            Some(&format!("unknown wait state {:?}", wait)),
                        )
                        .await;
                    return;
                }
                let (health, unreachable) = {
                    let guard = st.lock();
                    let unreachable = guard
                        .net
                        .node(rank)
                        .map(|n| n.unreachable)
                        .unwrap_or(false);
                    (guard.net.health_value(rank), unreachable)
                };
                let Some(health) = health else {
                    let _ = h
                        .respond_error(&m, errnum::EHOSTUNREACH, Some("no such rank"))
                        .await;
                    return;
                };
                if unreachable {
                    trace!(rank, "health probe swallowed for unreachable rank");
                    return;
                }
                if let Some(wait) = wait
                    && health["status"] != json!(wait)
                {
                    // the scripted state never changes, so a non-matching
                    // wait simply never answers
                    return;
                }
                let _ = h.respond_pack(&m, &health).await;
            }
        }),
    );

    let st = state.clone();
    broker.register(
        Match::request("overlay.topology"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                let rank = m
                    .unpack_value()
                    .ok()
                    .and_then(|v| v["rank"].as_u64())
                    .unwrap_or(0) as u32;
                let (size, topo): (u32, Value) = {
                    let guard = st.lock();
                    (guard.net.size(), guard.net.topology_value(rank))
                };
                if rank >= size {
                    let _ = h
                        .respond_error(&m, errnum::EINVAL, Some("rank out of range"))
                        .await;
                    return;
                }
                let _ = h.respond_pack(&m, &topo).await;
            }
        }),
    );

    let st = state.clone();
    broker.register(
        Match::request("overlay.disconnect-subtree"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                if let Err(e) = m.authorize(OWNER_USERID) {
                    let _ = h.respond_error(&m, e.errnum(), Some(&e.to_string())).await;
                    return;
                }
                match m
                    .unpack_value()
                    .ok()
                    .and_then(|v| v["rank"].as_u64())
                {
                    Some(rank) => {
                        st.lock().disconnects.push(rank as u32);
                        let _ = h.respond(&m, None).await;
                    }
                    None => {
                        let _ = h
                            .respond_error(&m, errnum::EPROTO, Some("disconnect has no rank"))
                            .await;
                    }
                }
            }
        }),
    );
}

fn register_attr_service(broker: &Handle, state: &Arc<Mutex<BrokerState>>) {
    let st = state.clone();
    broker.register(
        Match::request("attr.get"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                let name = m
                    .unpack_value()
                    .ok()
                    .and_then(|v| v["name"].as_str().map(str::to_owned));
                let value = name.as_deref().and_then(|name| {
                    let guard = st.lock();
                    match name {
                        "rank" => Some("0".to_string()),
                        "size" => Some(guard.net.size().to_string()),
                        "hostlist" => Some(guard.net.hostlist()),
                        _ => None,
                    }
                });
                match value {
                    Some(value) => {
                        let _ = h.respond_pack(&m, &json!({ "value": value })).await;
                    }
                    None => {
                        let _ = h
                            .respond_error(&m, errnum::ENODATA, Some("unknown attribute"))
                            .await;
                    }
                }
            }
        }),
    );
}

fn register_groups_service(broker: &Handle, state: &Arc<Mutex<BrokerState>>) {
    let st = state.clone();
    broker.register(
        Match::request("groups.join"),
        handler_fn(move |h, m| {
            let st = st.clone();
            async move {
                match m.unpack_value().ok().and_then(|v| {
                    v["name"].as_str().map(str::to_owned)
                }) {
                    Some(name) => {
                        st.lock().joins.push(name);
                        let _ = h.respond(&m, None).await;
                    }
                    None => {
                        let _ = h
                            .respond_error(&m, errnum::EPROTO, Some("join has no name"))
                            .await;
                    }
                }
            }
        }),
    );
}

/// A disconnect control cancels the stream on its matchtag with ENODATA,
/// the terminator streaming clients expect.
fn register_cancel_service(broker: &Handle) {
    broker.register(
        Match {
            typemask: MsgType::Control.as_u8(),
            matchtag: flux_core::MATCHTAG_NONE,
            topic_glob: None,
        },
        handler_fn(|h, m| async move {
            let Ok((ControlType::Disconnect, matchtag)) = control_decode(&m) else {
                return;
            };
            let mut resp = Message::new(MsgType::Response);
            if resp.set_matchtag(matchtag as u32).is_err() {
                return;
            }
            if resp.set_errnum(errnum::ENODATA).is_err() {
                return;
            }
            let _ = h.send(&resp).await;
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{NODEID_ANY, RpcFlags, event_decode};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn health_rpc_reports_scripted_state() {
        let net = TestNet::kary(3, 2)
            .set_status(0, "partial")
            .set_status(2, "lost")
            .set_error(2, "socket closed");
        let broker = TestBroker::start(net);
        let h = broker.client();

        let rpc = h
            .rpc("overlay.health", 0, RpcFlags::empty())
            .await
            .unwrap();
        let v: Value = rpc.get_unpack().await.unwrap();
        assert_eq!(v["rank"], 0);
        assert_eq!(v["status"], "partial");
        assert_eq!(v["children"][1]["status"], "lost");
        assert_eq!(v["children"][1]["error"], "socket closed");
    }

    #[tokio::test]
    async fn topology_rpc_returns_subtree() {
        let broker = TestBroker::start(TestNet::kary(7, 2));
        let h = broker.client();
        let rpc = h
            .rpc_pack("overlay.topology", &json!({ "rank": 1 }), 0, RpcFlags::empty())
            .await
            .unwrap();
        let v: Value = rpc.get_unpack().await.unwrap();
        assert_eq!(v["rank"], 1);
        assert_eq!(v["children"][0]["rank"], 3);
        assert_eq!(v["children"][1]["rank"], 4);
    }

    #[tokio::test]
    async fn event_publish_delivers_to_subscriber() {
        let broker = TestBroker::start(TestNet::kary(1, 2));
        let h = broker.client();

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.register(
            Match::event("job.*"),
            handler_fn(move |_h, m| {
                let tx = tx.clone();
                async move {
                    let (topic, payload) = event_decode(&m).unwrap();
                    let _ = tx.send((topic, m.seq().unwrap(), payload));
                }
            }),
        );

        h.event_subscribe("job.").await.unwrap();
        let seq1 = h
            .event_publish("job.started", Some(json!({ "id": 1 })))
            .await
            .unwrap();
        let seq2 = h.event_publish("job.finished", None).await.unwrap();
        assert!(seq2 > seq1);

        let (topic, seq, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "job.started");
        assert_eq!(seq, seq1);
        assert_eq!(payload.unwrap()["id"], 1);

        let (topic, _, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "job.finished");
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn unsubscribed_topic_not_delivered() {
        let broker = TestBroker::start(TestNet::kary(1, 2));
        let h = broker.client();
        h.event_subscribe("alpha.").await.unwrap();
        h.event_unsubscribe("alpha.").await.unwrap();
        // delivery would race the response; a publish after unsubscribe
        // must produce only the seq response
        let seq = h.event_publish("alpha.one", None).await.unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn streaming_health_wait_answers_on_match() {
        let net = TestNet::kary(1, 2).set_status(0, "degraded");
        let broker = TestBroker::start(net);
        let h = broker.client();

        let mut msg = Message::request("overlay.health").unwrap();
        msg.pack(&json!({ "wait": "degraded" })).unwrap();
        let rpc = h.rpc_message(msg, 0, RpcFlags::STREAMING).await.unwrap();
        let v: Value = rpc.get_unpack().await.unwrap();
        assert_eq!(v["status"], "degraded");
    }

    #[tokio::test]
    async fn streaming_health_wait_mismatch_times_out_and_detaches() {
        let net = TestNet::kary(1, 2);
        let broker = TestBroker::start(net);
        let h = broker.client();

        // the scripted state is "full", so a wait for "lost" never answers
        let mut msg = Message::request("overlay.health").unwrap();
        msg.pack(&json!({ "wait": "lost" })).unwrap();
        let rpc = h.rpc_message(msg, 0, RpcFlags::STREAMING).await.unwrap();
        let err = rpc
            .wait_within(std::time::Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.errnum, errnum::ETIMEDOUT);

        // expiry failed the stream outright; later waiters see the timeout
        let err = rpc.get().await.unwrap_err();
        assert_eq!(err.errnum, errnum::ETIMEDOUT);
    }

    #[tokio::test]
    async fn streaming_health_cancel_terminates_with_enodata() {
        let net = TestNet::kary(1, 2);
        let broker = TestBroker::start(net);
        let h = broker.client();

        let mut msg = Message::request("overlay.health").unwrap();
        msg.pack(&json!({ "wait": "lost" })).unwrap();
        let rpc = h.rpc_message(msg, 0, RpcFlags::STREAMING).await.unwrap();

        rpc.cancel().await.unwrap();
        let err = rpc.get().await.unwrap_err();
        assert_eq!(err.errnum, errnum::ENODATA);
    }

    #[tokio::test]
    async fn bad_wait_state_is_fatal() {
        let broker = TestBroker::start(TestNet::kary(1, 2));
        let h = broker.client();
        let mut msg = Message::request("overlay.health").unwrap();
        msg.pack(&json!({ "wait": "sideways" })).unwrap();
        let rpc = h.rpc_message(msg, 0, RpcFlags::STREAMING).await.unwrap();
        let err = rpc.get().await.unwrap_err();
        assert_eq!(err.errnum, errnum::EPROTO);
    }

    #[tokio::test]
    async fn groups_join_recorded() {
        let broker = TestBroker::start(TestNet::kary(1, 2));
        let h = broker.client();
        let rpc = h
            .rpc_pack("groups.join", &json!({ "name": "sdmon" }), NODEID_ANY, RpcFlags::empty())
            .await
            .unwrap();
        rpc.get().await.unwrap();
        assert_eq!(broker.joins(), vec!["sdmon".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_recorded() {
        let broker = TestBroker::start(TestNet::kary(3, 2));
        let h = broker.client();
        let rpc = h
            .rpc_pack(
                "overlay.disconnect-subtree",
                &json!({ "rank": 2 }),
                0,
                RpcFlags::empty(),
            )
            .await
            .unwrap();
        rpc.get().await.unwrap();
        assert_eq!(broker.disconnects(), vec![2]);
    }

    #[tokio::test]
    async fn disconnect_requires_authorization() {
        let broker = TestBroker::start(TestNet::kary(3, 2));
        let h = broker.client();
        // a guest with the USER role and a foreign userid is refused
        let mut msg = Message::request("overlay.disconnect-subtree").unwrap();
        msg.pack(&json!({ "rank": 2 })).unwrap();
        msg.set_cred(Cred::new(OWNER_USERID + 1, RoleMask::USER));
        let rpc = h.rpc_message(msg, 0, RpcFlags::empty()).await.unwrap();
        let err = rpc.get().await.unwrap_err();
        assert_eq!(err.errnum, errnum::EPERM);
        assert!(broker.disconnects().is_empty());
    }
}
