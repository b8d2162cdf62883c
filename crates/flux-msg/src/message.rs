//! Message envelope and binary codec.
//!
//! A message is logically an ordered list of opaque frames:
//!
//! ```text
//! [route id] ... [route id] [route delimiter - empty frame]
//! [topic frame]
//! [payload frame]
//! PROTO frame
//! ```
//!
//! The trailing PROTO frame is a fixed 20-byte record: a 4-byte prelude
//! (magic, version, type, flags) followed by four network-order u32s
//! (userid, rolemask, and two per-type auxiliary slots).  In this crate the
//! envelope is a value type owning the decoded fields; the frame list is
//! materialized only by [`Message::encode`] and consumed by
//! [`Message::decode`].

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cred::{Cred, RoleMask, USERID_UNKNOWN};
use crate::error::ProtoError;
use crate::filter::Match;

pub const PROTO_MAGIC: u8 = 0x8E;
pub const PROTO_VERSION: u8 = 0x01;
const PROTO_SIZE: usize = 20;

/// Request nodeid: routable to any matching service.
pub const NODEID_ANY: u32 = 0xFFFF_FFFF;
/// Request nodeid sentinel: forward toward the root before servicing.
/// Valid in the RPC interface only; the handle resolves it to the local
/// rank plus [`MsgFlags::UPSTREAM`] before the message hits the wire.
pub const NODEID_UPSTREAM: u32 = 0xFFFF_FFFE;

/// Reserved matchtag: no response is expected, do not pair.
pub const MATCHTAG_NONE: u32 = 0;
/// The upper 12 bits of a matchtag name a streaming group.
pub const MATCHTAG_GROUP_SHIFT: u32 = 20;
pub const MATCHTAG_GROUP_MASK: u32 = 0xFFF0_0000;

/// Message type, a 4-bit enumeration stored in the proto prelude.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Request = 0x01,
    Response = 0x02,
    Event = 0x04,
    Control = 0x08,
}

/// Type mask matching any message type.
pub const MSGTYPE_ANY: u8 = 0x0F;

impl MsgType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x01 => MsgType::Request,
            0x02 => MsgType::Response,
            0x04 => MsgType::Event,
            0x08 => MsgType::Control,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Request => "request",
            MsgType::Response => "response",
            MsgType::Event => "event",
            MsgType::Control => "control",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// Message flags stored in the proto prelude.
    ///
    /// TOPIC, PAYLOAD and ROUTE reflect the frame structure and are managed
    /// by the corresponding setters; the raw flag setter rejects attempts
    /// to change them directly.  STREAMING and NORESPONSE are mutually
    /// exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Message has a topic string.
        const TOPIC = 0x01;
        /// Message has a payload.
        const PAYLOAD = 0x02;
        /// Request needs no response.
        const NORESPONSE = 0x04;
        /// Message is routable.
        const ROUTE = 0x08;
        /// Request nodeid is the sender; route away from it.
        const UPSTREAM = 0x10;
        /// Private to the instance owner and the sender.
        const PRIVATE = 0x20;
        /// Request/response belongs to a streaming RPC.
        const STREAMING = 0x40;
        /// User-defined flag.
        const USER1 = 0x80;
    }
}

const STRUCTURAL_FLAGS: MsgFlags = MsgFlags::TOPIC
    .union(MsgFlags::PAYLOAD)
    .union(MsgFlags::ROUTE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Proto {
    typ: MsgType,
    flags: MsgFlags,
    userid: u32,
    rolemask: RoleMask,
    aux1: u32,
    aux2: u32,
}

/// A message envelope.
///
/// Plain value semantics; share through `Arc<Message>` when a collaborator
/// needs a borrowed view.  The JSON parse cache, last-error slot and aux
/// map are per-instance annotations and are not carried by [`Clone`] or
/// compared by [`PartialEq`].
pub struct Message {
    /// Present iff the ROUTE flag is set.  Front of the deque is the most
    /// recently pushed hop (the next hop on the return path).
    routes: Option<VecDeque<Bytes>>,
    topic: Option<String>,
    payload: Option<Bytes>,
    proto: Proto,
    json_cache: Mutex<Option<serde_json::Value>>,
    last_error: Mutex<Option<String>>,
    aux: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Message {
    /// Construct a message of the given type with all other fields empty.
    pub fn new(typ: MsgType) -> Self {
        let mut proto = Proto {
            typ,
            flags: MsgFlags::empty(),
            userid: USERID_UNKNOWN,
            rolemask: RoleMask::NONE,
            aux1: 0,
            aux2: 0,
        };
        init_aux_slots(&mut proto, typ);
        Message {
            routes: None,
            topic: None,
            payload: None,
            proto,
            json_cache: Mutex::new(None),
            last_error: Mutex::new(None),
            aux: Mutex::new(HashMap::new()),
        }
    }

    /// Convenience: a request with a topic.
    pub fn request(topic: &str) -> Result<Self, ProtoError> {
        let mut msg = Message::new(MsgType::Request);
        msg.set_topic(topic)?;
        Ok(msg)
    }

    /// Convenience: an event with a topic.
    pub fn event(topic: &str) -> Result<Self, ProtoError> {
        let mut msg = Message::new(MsgType::Event);
        msg.set_topic(topic)?;
        Ok(msg)
    }

    /// Derive a response envelope from a request: same topic, same
    /// matchtag, same route stack (so dealer hops can unwind it).
    pub fn response_for(request: &Message) -> Result<Self, ProtoError> {
        if request.msg_type() != MsgType::Request {
            return Err(ProtoError::invalid("response_for requires a request"));
        }
        let mut msg = Message::new(MsgType::Response);
        msg.proto.aux2 = request.proto.aux2;
        if request.proto.flags.contains(MsgFlags::STREAMING) {
            msg.proto.flags |= MsgFlags::STREAMING;
        }
        if let Some(topic) = &request.topic {
            msg.topic = Some(topic.clone());
            msg.proto.flags |= MsgFlags::TOPIC;
        }
        if let Some(routes) = &request.routes {
            msg.routes = Some(routes.clone());
            msg.proto.flags |= MsgFlags::ROUTE;
        }
        Ok(msg)
    }

    /// Copy the wire-visible fields, optionally dropping the payload.
    pub fn copy(&self, keep_payload: bool) -> Self {
        let mut msg = self.clone();
        if !keep_payload {
            msg.payload = None;
            msg.proto.flags &= !MsgFlags::PAYLOAD;
        }
        msg
    }

    pub fn msg_type(&self) -> MsgType {
        self.proto.typ
    }

    /// Change the message type, re-initializing the per-type aux slots.
    /// A response keeps its matchtag so a request can be converted in
    /// place.
    pub fn set_type(&mut self, typ: MsgType) {
        init_aux_slots(&mut self.proto, typ);
        self.proto.typ = typ;
    }

    pub fn flags(&self) -> MsgFlags {
        self.proto.flags
    }

    /// Set the non-structural flags.
    ///
    /// Rejects the STREAMING+NORESPONSE combination, and any attempt to
    /// change TOPIC/PAYLOAD/ROUTE away from what the message structure
    /// implies.
    pub fn set_flags(&mut self, flags: MsgFlags) -> Result<(), ProtoError> {
        if flags.contains(MsgFlags::STREAMING) && flags.contains(MsgFlags::NORESPONSE) {
            return Err(ProtoError::invalid(
                "streaming and noresponse flags are mutually exclusive",
            ));
        }
        if (flags & STRUCTURAL_FLAGS) != (self.proto.flags & STRUCTURAL_FLAGS) {
            return Err(ProtoError::invalid(
                "topic/payload/route flags are set by the corresponding setters",
            ));
        }
        self.proto.flags = flags;
        Ok(())
    }

    /// Mark a request as streaming.  Clears NORESPONSE.
    pub fn set_streaming(&mut self) {
        self.proto.flags &= !MsgFlags::NORESPONSE;
        self.proto.flags |= MsgFlags::STREAMING;
    }

    pub fn is_streaming(&self) -> bool {
        self.proto.flags.contains(MsgFlags::STREAMING)
    }

    /// Mark a request as expecting no response.  Clears STREAMING.
    pub fn set_noresponse(&mut self) {
        self.proto.flags &= !MsgFlags::STREAMING;
        self.proto.flags |= MsgFlags::NORESPONSE;
    }

    pub fn is_noresponse(&self) -> bool {
        self.proto.flags.contains(MsgFlags::NORESPONSE)
    }

    pub fn set_private(&mut self) {
        self.proto.flags |= MsgFlags::PRIVATE;
    }

    pub fn is_private(&self) -> bool {
        self.proto.flags.contains(MsgFlags::PRIVATE)
    }

    pub fn userid(&self) -> u32 {
        self.proto.userid
    }

    pub fn set_userid(&mut self, userid: u32) {
        self.proto.userid = userid;
    }

    pub fn rolemask(&self) -> RoleMask {
        self.proto.rolemask
    }

    pub fn set_rolemask(&mut self, rolemask: RoleMask) {
        self.proto.rolemask = rolemask;
    }

    pub fn cred(&self) -> Cred {
        Cred::new(self.proto.userid, self.proto.rolemask)
    }

    pub fn set_cred(&mut self, cred: Cred) {
        self.proto.userid = cred.userid;
        self.proto.rolemask = cred.rolemask;
    }

    /// Apply the shared authorization predicate to this message's
    /// credentials.
    pub fn authorize(&self, userid: u32) -> Result<(), ProtoError> {
        self.cred().authorize(userid)
    }

    pub fn nodeid(&self) -> Result<u32, ProtoError> {
        self.typed_aux1(MsgType::Request, "nodeid")
    }

    pub fn set_nodeid(&mut self, nodeid: u32) -> Result<(), ProtoError> {
        if nodeid == NODEID_UPSTREAM {
            return Err(ProtoError::invalid(
                "NODEID_UPSTREAM must be resolved before it is stored",
            ));
        }
        self.set_typed_aux1(MsgType::Request, "nodeid", nodeid)
    }

    pub fn errnum(&self) -> Result<i32, ProtoError> {
        Ok(self.typed_aux1(MsgType::Response, "errnum")? as i32)
    }

    pub fn set_errnum(&mut self, errnum: i32) -> Result<(), ProtoError> {
        self.set_typed_aux1(MsgType::Response, "errnum", errnum as u32)
    }

    pub fn seq(&self) -> Result<u32, ProtoError> {
        self.typed_aux1(MsgType::Event, "sequence")
    }

    pub fn set_seq(&mut self, seq: u32) -> Result<(), ProtoError> {
        self.set_typed_aux1(MsgType::Event, "sequence", seq)
    }

    pub fn matchtag(&self) -> Result<u32, ProtoError> {
        match self.proto.typ {
            MsgType::Request | MsgType::Response => Ok(self.proto.aux2),
            _ => Err(ProtoError::protocol("matchtag requires request or response")),
        }
    }

    pub fn set_matchtag(&mut self, matchtag: u32) -> Result<(), ProtoError> {
        match self.proto.typ {
            MsgType::Request | MsgType::Response => {
                self.proto.aux2 = matchtag;
                Ok(())
            }
            _ => Err(ProtoError::invalid("matchtag requires request or response")),
        }
    }

    pub fn control(&self) -> Result<(i32, i32), ProtoError> {
        if self.proto.typ != MsgType::Control {
            return Err(ProtoError::protocol("control fields require a control message"));
        }
        Ok((self.proto.aux1 as i32, self.proto.aux2 as i32))
    }

    pub fn set_control(&mut self, typ: i32, status: i32) -> Result<(), ProtoError> {
        if self.proto.typ != MsgType::Control {
            return Err(ProtoError::invalid("control fields require a control message"));
        }
        self.proto.aux1 = typ as u32;
        self.proto.aux2 = status as u32;
        Ok(())
    }

    fn typed_aux1(&self, expect: MsgType, what: &str) -> Result<u32, ProtoError> {
        if self.proto.typ != expect {
            return Err(ProtoError::protocol(format!(
                "{} requires a {} message",
                what,
                expect.name()
            )));
        }
        Ok(self.proto.aux1)
    }

    fn set_typed_aux1(&mut self, expect: MsgType, what: &str, val: u32) -> Result<(), ProtoError> {
        if self.proto.typ != expect {
            return Err(ProtoError::invalid(format!(
                "{} requires a {} message",
                what,
                expect.name()
            )));
        }
        self.proto.aux1 = val;
        Ok(())
    }

    pub fn topic(&self) -> Result<&str, ProtoError> {
        self.topic
            .as_deref()
            .ok_or_else(|| ProtoError::protocol("message has no topic"))
    }

    pub fn has_topic(&self) -> bool {
        self.topic.is_some()
    }

    pub fn set_topic(&mut self, topic: &str) -> Result<(), ProtoError> {
        if topic.as_bytes().contains(&0) {
            return Err(ProtoError::invalid("topic must not contain NUL"));
        }
        self.topic = Some(topic.to_string());
        self.proto.flags |= MsgFlags::TOPIC;
        Ok(())
    }

    pub fn clear_topic(&mut self) {
        self.topic = None;
        self.proto.flags &= !MsgFlags::TOPIC;
    }

    pub fn payload(&self) -> Result<&[u8], ProtoError> {
        self.payload
            .as_deref()
            .ok_or_else(|| ProtoError::protocol("message has no payload"))
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Cheaply cloned owned payload, if present.
    pub fn payload_bytes(&self) -> Option<Bytes> {
        self.payload.clone()
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        *self.json_cache.lock() = None;
        let payload = payload.into();
        if payload.is_empty() {
            self.payload = None;
            self.proto.flags &= !MsgFlags::PAYLOAD;
        } else {
            self.payload = Some(payload);
            self.proto.flags |= MsgFlags::PAYLOAD;
        }
    }

    pub fn clear_payload(&mut self) {
        *self.json_cache.lock() = None;
        self.payload = None;
        self.proto.flags &= !MsgFlags::PAYLOAD;
    }

    /// Set a NUL-terminated string payload.
    pub fn set_string(&mut self, s: &str) {
        let mut buf = BytesMut::with_capacity(s.len() + 1);
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
        self.set_payload(buf.freeze());
    }

    /// Get the payload as a string.  Returns `Ok(None)` when there is no
    /// payload; a payload that is not NUL-terminated UTF-8 is a protocol
    /// error.
    pub fn string(&self) -> Result<Option<&str>, ProtoError> {
        let Some(payload) = self.payload.as_deref() else {
            return Ok(None);
        };
        let Some((&0, body)) = payload.split_last() else {
            return Err(ProtoError::protocol("string payload is not NUL terminated"));
        };
        std::str::from_utf8(body)
            .map(Some)
            .map_err(|_| ProtoError::protocol("string payload is not valid UTF-8"))
    }

    /// Serialize `value` as a compact JSON object payload.
    pub fn pack<T: Serialize>(&mut self, value: &T) -> Result<(), ProtoError> {
        *self.last_error.lock() = None;
        let json = serde_json::to_value(value)
            .map_err(|e| self.store_error(ProtoError::invalid(e.to_string())))?;
        if !json.is_object() {
            return Err(self.store_error(ProtoError::invalid("payload is not a JSON object")));
        }
        let s = serde_json::to_string(&json)
            .map_err(|e| self.store_error(ProtoError::invalid(e.to_string())))?;
        self.set_string(&s);
        *self.json_cache.lock() = Some(json);
        Ok(())
    }

    /// Project the JSON payload into `T`.  The payload is parsed once and
    /// cached on the message.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        let value = self.unpack_value()?;
        serde_json::from_value(value)
            .map_err(|e| self.store_error(ProtoError::protocol(e.to_string())))
    }

    /// Get the JSON payload as a generic value tree.
    pub fn unpack_value(&self) -> Result<serde_json::Value, ProtoError> {
        *self.last_error.lock() = None;
        let mut cache = self.json_cache.lock();
        if cache.is_none() {
            let s = self
                .string()
                .map_err(|e| self.store_error(e))?
                .ok_or_else(|| {
                    self.store_error(ProtoError::protocol(
                        "message does not have a string payload",
                    ))
                })?;
            let json: serde_json::Value = serde_json::from_str(s)
                .map_err(|e| self.store_error(ProtoError::protocol(e.to_string())))?;
            if !json.is_object() {
                return Err(self.store_error(ProtoError::protocol("payload is not a JSON object")));
            }
            *cache = Some(json);
        }
        Ok(cache.as_ref().unwrap().clone())
    }

    fn store_error(&self, err: ProtoError) -> ProtoError {
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    /// Text of the most recent pack/unpack failure on this message.
    pub fn last_error(&self) -> String {
        self.last_error.lock().clone().unwrap_or_default()
    }

    pub fn is_routable(&self) -> bool {
        self.proto.flags.contains(MsgFlags::ROUTE)
    }

    /// Enable the routing stack.  Idempotent.
    pub fn enable_route(&mut self) {
        if self.routes.is_none() {
            self.routes = Some(VecDeque::new());
            self.proto.flags |= MsgFlags::ROUTE;
        }
    }

    /// Remove the routing stack and clear the flag.
    pub fn clear_route(&mut self) {
        self.routes = None;
        self.proto.flags &= !MsgFlags::ROUTE;
    }

    /// Push a peer id onto the routing stack (most recent hop first).
    pub fn push_route(&mut self, id: &str) -> Result<(), ProtoError> {
        let routes = self
            .routes
            .as_mut()
            .ok_or_else(|| ProtoError::protocol("message is not routable"))?;
        routes.push_front(Bytes::copy_from_slice(id.as_bytes()));
        Ok(())
    }

    /// Pop the most recently pushed id.  `Ok(None)` when the stack is
    /// empty.
    pub fn pop_route(&mut self) -> Result<Option<String>, ProtoError> {
        let routes = self
            .routes
            .as_mut()
            .ok_or_else(|| ProtoError::protocol("message is not routable"))?;
        Ok(routes
            .pop_front()
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    pub fn route_count(&self) -> Result<usize, ProtoError> {
        self.routes
            .as_ref()
            .map(|r| r.len())
            .ok_or_else(|| ProtoError::protocol("message is not routable"))
    }

    /// The first pushed id (the message originator).
    pub fn route_first(&self) -> Result<Option<String>, ProtoError> {
        let routes = self
            .routes
            .as_ref()
            .ok_or_else(|| ProtoError::protocol("message is not routable"))?;
        Ok(routes
            .back()
            .map(|id| String::from_utf8_lossy(id).into_owned()))
    }

    /// The most recently pushed id (the next hop).
    pub fn route_last(&self) -> Result<Option<String>, ProtoError> {
        let routes = self
            .routes
            .as_ref()
            .ok_or_else(|| ProtoError::protocol("message is not routable"))?;
        Ok(routes
            .front()
            .map(|id| String::from_utf8_lossy(id).into_owned()))
    }

    /// Diagnostic form of the routing stack: ids joined oldest-first with
    /// `!`, each truncated to its first 8 characters.
    pub fn route_string(&self) -> String {
        let Some(routes) = &self.routes else {
            return String::new();
        };
        let mut out = String::new();
        for id in routes.iter().rev() {
            if !out.is_empty() {
                out.push('!');
            }
            let s = String::from_utf8_lossy(id);
            out.extend(s.chars().take(8));
        }
        out
    }

    /// True if this message's matchtag pairs with `matchtag`.
    ///
    /// Messages still carrying route frames are in a foreign matchtag
    /// domain and never match.  Group tags compare group bits only,
    /// leaving the low bits free for caller data.
    pub fn cmp_matchtag(&self, matchtag: u32) -> bool {
        if let Some(routes) = &self.routes
            && !routes.is_empty()
        {
            return false;
        }
        let Ok(tag) = self.matchtag() else {
            return false;
        };
        if matchtag & MATCHTAG_GROUP_MASK != 0 {
            (tag & MATCHTAG_GROUP_MASK) == (matchtag & MATCHTAG_GROUP_MASK)
        } else {
            tag == matchtag
        }
    }

    /// Match against a filter (type mask, matchtag, topic glob).
    pub fn matches(&self, filter: &Match) -> bool {
        filter.matches(self)
    }

    /// Attach a named annotation.  Annotations are not wire-visible and do
    /// not survive [`Clone`].
    pub fn aux_set(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.aux.lock().insert(name.to_string(), value);
    }

    pub fn aux_get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.aux.lock().get(name).cloned()
    }

    fn proto_frame(&self) -> [u8; PROTO_SIZE] {
        let mut buf = [0u8; PROTO_SIZE];
        buf[0] = PROTO_MAGIC;
        buf[1] = PROTO_VERSION;
        buf[2] = self.proto.typ.as_u8();
        buf[3] = self.proto.flags.bits();
        buf[4..8].copy_from_slice(&self.proto.userid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.proto.rolemask.bits().to_be_bytes());
        buf[12..16].copy_from_slice(&self.proto.aux1.to_be_bytes());
        buf[16..20].copy_from_slice(&self.proto.aux2.to_be_bytes());
        buf
    }

    fn wire_frames(&self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if let Some(routes) = &self.routes {
            frames.extend(routes.iter().cloned());
            frames.push(Bytes::new());
        }
        if let Some(topic) = &self.topic {
            let mut buf = BytesMut::with_capacity(topic.len() + 1);
            buf.put_slice(topic.as_bytes());
            buf.put_u8(0);
            frames.push(buf.freeze());
        }
        if let Some(payload) = &self.payload {
            frames.push(payload.clone());
        }
        frames.push(Bytes::copy_from_slice(&self.proto_frame()));
        frames
    }

    /// Exact length of [`Message::encode`]'s output: for each frame, one
    /// length byte (five when the frame is 0xFF bytes or longer) plus the
    /// frame body.
    pub fn encoded_size(&self) -> usize {
        self.wire_frames()
            .iter()
            .map(|f| f.len() + if f.len() < 0xFF { 1 } else { 1 + 4 })
            .sum()
    }

    /// Encode to the contiguous wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        for frame in self.wire_frames() {
            if frame.len() < 0xFF {
                buf.put_u8(frame.len() as u8);
            } else {
                buf.put_u8(0xFF);
                buf.put_u32(frame.len() as u32);
            }
            buf.put_slice(&frame);
        }
        buf.freeze()
    }

    /// Decode the wire form.  Truncated frames, a bad proto prelude, or a
    /// frame list that does not satisfy the flags are all fatal.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut frames: VecDeque<Bytes> = VecDeque::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            let mut len = buf[pos] as usize;
            pos += 1;
            if len == 0xFF {
                if buf.len() - pos < 4 {
                    return Err(ProtoError::decode("truncated frame length"));
                }
                len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
            }
            if buf.len() - pos < len {
                return Err(ProtoError::decode("truncated frame body"));
            }
            frames.push_back(Bytes::copy_from_slice(&buf[pos..pos + len]));
            pos += len;
        }

        let proto_frame = frames
            .pop_back()
            .ok_or_else(|| ProtoError::decode("message has no frames"))?;
        let proto = decode_proto(&proto_frame)?;

        let mut routes = None;
        if proto.flags.contains(MsgFlags::ROUTE) {
            let mut stack = VecDeque::new();
            loop {
                let frame = frames
                    .pop_front()
                    .ok_or_else(|| ProtoError::decode("missing route delimiter frame"))?;
                if frame.is_empty() {
                    break;
                }
                stack.push_back(frame);
            }
            routes = Some(stack);
        }

        let mut topic = None;
        if proto.flags.contains(MsgFlags::TOPIC) {
            let frame = frames
                .pop_front()
                .ok_or_else(|| ProtoError::decode("missing topic frame"))?;
            let Some((&0, body)) = frame.split_last() else {
                return Err(ProtoError::decode("topic frame is not NUL terminated"));
            };
            let s = std::str::from_utf8(body)
                .map_err(|_| ProtoError::decode("topic frame is not valid UTF-8"))?;
            topic = Some(s.to_string());
        }

        let mut payload = None;
        if proto.flags.contains(MsgFlags::PAYLOAD) {
            payload = Some(
                frames
                    .pop_front()
                    .ok_or_else(|| ProtoError::decode("missing payload frame"))?,
            );
        }

        if !frames.is_empty() {
            return Err(ProtoError::decode("unexpected extra frames"));
        }

        Ok(Message {
            routes,
            topic,
            payload,
            proto,
            json_cache: Mutex::new(None),
            last_error: Mutex::new(None),
            aux: Mutex::new(HashMap::new()),
        })
    }
}

fn init_aux_slots(proto: &mut Proto, typ: MsgType) {
    match typ {
        MsgType::Request => {
            proto.aux1 = NODEID_ANY;
            proto.aux2 = MATCHTAG_NONE;
        }
        MsgType::Response => {
            // keep the matchtag so a request can become its response
            proto.aux1 = 0;
        }
        MsgType::Event | MsgType::Control => {
            proto.aux1 = 0;
            proto.aux2 = 0;
        }
    }
}

fn decode_proto(frame: &[u8]) -> Result<Proto, ProtoError> {
    if frame.len() != PROTO_SIZE {
        return Err(ProtoError::decode(format!(
            "proto frame is {} bytes, expected {}",
            frame.len(),
            PROTO_SIZE
        )));
    }
    if frame[0] != PROTO_MAGIC {
        return Err(ProtoError::decode("bad proto magic"));
    }
    if frame[1] != PROTO_VERSION {
        return Err(ProtoError::decode("bad proto version"));
    }
    let typ = MsgType::from_u8(frame[2])
        .ok_or_else(|| ProtoError::decode(format!("unknown message type {:#x}", frame[2])))?;
    let flags = MsgFlags::from_bits(frame[3])
        .ok_or_else(|| ProtoError::decode(format!("unknown flag bits {:#x}", frame[3])))?;
    if flags.contains(MsgFlags::STREAMING) && flags.contains(MsgFlags::NORESPONSE) {
        return Err(ProtoError::decode(
            "streaming and noresponse flags are mutually exclusive",
        ));
    }
    Ok(Proto {
        typ,
        flags,
        userid: u32::from_be_bytes(frame[4..8].try_into().unwrap()),
        rolemask: RoleMask::from_bits_retain(u32::from_be_bytes(frame[8..12].try_into().unwrap())),
        aux1: u32::from_be_bytes(frame[12..16].try_into().unwrap()),
        aux2: u32::from_be_bytes(frame[16..20].try_into().unwrap()),
    })
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Message {
            routes: self.routes.clone(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            proto: self.proto,
            json_cache: Mutex::new(None),
            last_error: Mutex::new(None),
            aux: Mutex::new(HashMap::new()),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.routes == other.routes
            && self.topic == other.topic
            && self.payload == other.payload
            && self.proto == other.proto
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.proto.typ)
            .field("flags", &self.proto.flags)
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.as_ref().map(|p| p.len()))
            .field("route_count", &self.routes.as_ref().map(|r| r.len()))
            .finish_non_exhaustive()
    }
}

/// Diagnostic dump: one line per logical field, payload as bounded hex.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "type: {}", self.proto.typ)?;
        writeln!(f, "flags: {:?}", self.proto.flags)?;
        writeln!(
            f,
            "cred: userid={} rolemask={:#x}",
            self.proto.userid,
            self.proto.rolemask.bits()
        )?;
        match self.proto.typ {
            MsgType::Request => writeln!(
                f,
                "nodeid={:#x} matchtag={}",
                self.proto.aux1, self.proto.aux2
            )?,
            MsgType::Response => {
                writeln!(f, "errnum={} matchtag={}", self.proto.aux1, self.proto.aux2)?
            }
            MsgType::Event => writeln!(f, "sequence={}", self.proto.aux1)?,
            MsgType::Control => writeln!(
                f,
                "control type={} status={}",
                self.proto.aux1, self.proto.aux2
            )?,
        }
        if self.routes.is_some() {
            writeln!(f, "route: [{}]", self.route_string())?;
        }
        if let Some(topic) = &self.topic {
            writeln!(f, "topic: {}", topic)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, "payload[{}]:", payload.len())?;
            for b in payload.iter().take(40) {
                write!(f, " {:02x}", b)?;
            }
            if payload.len() > 40 {
                write!(f, " ...")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn new_request_defaults() {
        let msg = Message::new(MsgType::Request);
        assert_eq!(msg.msg_type(), MsgType::Request);
        assert_eq!(msg.nodeid().unwrap(), NODEID_ANY);
        assert_eq!(msg.matchtag().unwrap(), MATCHTAG_NONE);
        assert_eq!(msg.userid(), USERID_UNKNOWN);
        assert_eq!(msg.rolemask(), RoleMask::NONE);
        assert!(msg.flags().is_empty());
    }

    #[test]
    fn typed_accessors_reject_wrong_type() {
        let mut event = Message::new(MsgType::Event);
        assert!(event.nodeid().is_err());
        assert!(event.errnum().is_err());
        assert!(event.matchtag().is_err());
        assert!(event.set_matchtag(1).is_err());
        assert!(event.set_seq(42).is_ok());
        assert_eq!(event.seq().unwrap(), 42);

        let mut ctrl = Message::new(MsgType::Control);
        ctrl.set_control(2, 7).unwrap();
        assert_eq!(ctrl.control().unwrap(), (2, 7));
        assert!(ctrl.seq().is_err());
    }

    #[test]
    fn streaming_noresponse_exclusive() {
        let mut msg = Message::new(MsgType::Request);
        assert!(
            msg.set_flags(MsgFlags::STREAMING | MsgFlags::NORESPONSE)
                .is_err()
        );
        msg.set_streaming();
        assert!(msg.is_streaming());
        msg.set_noresponse();
        assert!(msg.is_noresponse());
        assert!(!msg.is_streaming());
        msg.set_streaming();
        assert!(!msg.is_noresponse());
    }

    #[test]
    fn set_nodeid_rejects_upstream_sentinel() {
        let mut msg = Message::new(MsgType::Request);
        assert!(msg.set_nodeid(NODEID_UPSTREAM).is_err());
        assert!(msg.set_nodeid(5).is_ok());
        assert_eq!(msg.nodeid().unwrap(), 5);
    }

    #[test]
    fn route_stack_lifo() {
        let mut msg = Message::new(MsgType::Request);
        assert!(msg.push_route("a").is_err());

        msg.enable_route();
        msg.enable_route(); // idempotent
        assert_eq!(msg.route_count().unwrap(), 0);
        assert_eq!(msg.pop_route().unwrap(), None);

        msg.push_route("first").unwrap();
        msg.push_route("second").unwrap();
        msg.push_route("third").unwrap();
        assert_eq!(msg.route_count().unwrap(), 3);
        assert_eq!(msg.route_first().unwrap().as_deref(), Some("first"));
        assert_eq!(msg.route_last().unwrap().as_deref(), Some("third"));

        assert_eq!(msg.pop_route().unwrap().as_deref(), Some("third"));
        assert_eq!(msg.pop_route().unwrap().as_deref(), Some("second"));
        assert_eq!(msg.route_count().unwrap(), 1);
        assert_eq!(msg.pop_route().unwrap().as_deref(), Some("first"));
        assert_eq!(msg.pop_route().unwrap(), None);
    }

    #[test]
    fn route_string_truncates_and_joins() {
        let mut msg = Message::new(MsgType::Request);
        msg.enable_route();
        msg.push_route("0123456789abcdef").unwrap();
        msg.push_route("xyz").unwrap();
        assert_eq!(msg.route_string(), "01234567!xyz");
    }

    #[test]
    fn string_payload_nul_terminated() {
        let mut msg = Message::new(MsgType::Request);
        assert_eq!(msg.string().unwrap(), None);
        msg.set_string("hello");
        assert_eq!(msg.payload().unwrap(), b"hello\0");
        assert_eq!(msg.string().unwrap(), Some("hello"));

        msg.set_payload(Bytes::from_static(b"no-nul"));
        assert!(msg.string().is_err());
    }

    #[test]
    fn pack_unpack_roundtrip() {
        #[derive(Deserialize)]
        struct Lookup {
            key: String,
        }
        let mut msg = Message::request("kvs.lookup").unwrap();
        msg.pack(&json!({ "key": "a.b" })).unwrap();
        let lookup: Lookup = msg.unpack().unwrap();
        assert_eq!(lookup.key, "a.b");
    }

    #[test]
    fn pack_rejects_non_object() {
        let mut msg = Message::new(MsgType::Request);
        assert!(msg.pack(&json!([1, 2, 3])).is_err());
        assert!(!msg.last_error().is_empty());
    }

    #[test]
    fn unpack_without_payload_sets_last_error() {
        let msg = Message::new(MsgType::Request);
        assert!(msg.unpack_value().is_err());
        assert!(msg.last_error().contains("string payload"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut msg = Message::request("kvs.lookup").unwrap();
        msg.pack(&json!({ "key": "a.b" })).unwrap();
        msg.set_matchtag(7).unwrap();
        msg.set_nodeid(NODEID_ANY).unwrap();
        msg.set_cred(Cred::new(1000, RoleMask::OWNER));

        let wire = msg.encode();
        assert_eq!(wire.len(), msg.encoded_size());

        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.topic().unwrap(), "kvs.lookup");
        assert_eq!(decoded.matchtag().unwrap(), 7);
        assert_eq!(decoded.nodeid().unwrap(), NODEID_ANY);
        assert_eq!(decoded.userid(), 1000);
        assert_eq!(decoded.rolemask(), RoleMask::OWNER);
        let v = decoded.unpack_value().unwrap();
        assert_eq!(v["key"], "a.b");
    }

    #[test]
    fn encode_decode_with_routes() {
        let mut msg = Message::request("svc.echo").unwrap();
        msg.enable_route();
        msg.push_route("origin-uuid").unwrap();
        msg.push_route("hop1-uuid").unwrap();

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.route_count().unwrap(), 2);
        assert_eq!(decoded.route_first().unwrap().as_deref(), Some("origin-uuid"));
        assert_eq!(decoded.route_last().unwrap().as_deref(), Some("hop1-uuid"));
    }

    #[test]
    fn long_frame_uses_extended_length() {
        let mut msg = Message::new(MsgType::Request);
        let big = vec![0x41u8; 600];
        msg.set_payload(big.clone());

        // payload frame: 0xFF marker + 4 length bytes; proto frame: 1 + 20
        assert_eq!(msg.encoded_size(), (1 + 4 + 600) + (1 + 20));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.payload().unwrap(), &big[..]);
    }

    #[test]
    fn decode_rejects_bad_magic_and_version() {
        let msg = Message::new(MsgType::Request);
        let wire = msg.encode();

        let mut bad = wire.to_vec();
        bad[1] = 0x00; // first byte of the proto frame (magic)
        assert!(Message::decode(&bad).is_err());

        let mut bad = wire.to_vec();
        bad[2] = 0x7F; // version
        assert!(Message::decode(&bad).is_err());
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut msg = Message::request("a.b").unwrap();
        msg.set_string("payload");
        let wire = msg.encode();
        assert!(Message::decode(&wire[..wire.len() - 3]).is_err());
        assert!(Message::decode(&[0xFF, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_missing_route_delimiter() {
        // ROUTE flag set but no delimiter frame before the topic/proto.
        let mut msg = Message::new(MsgType::Request);
        msg.enable_route();
        let wire = msg.encode().to_vec();
        // strip the empty delimiter frame (its single 0x00 length byte
        // leads the encoding)
        assert!(Message::decode(&wire[1..]).is_err());
    }

    #[test]
    fn copy_drops_payload_on_request() {
        let mut msg = Message::request("a.b").unwrap();
        msg.set_string("data");
        let full = msg.copy(true);
        assert!(full.has_payload());
        let bare = msg.copy(false);
        assert!(!bare.has_payload());
        assert!(!bare.flags().contains(MsgFlags::PAYLOAD));
        assert_eq!(bare.topic().unwrap(), "a.b");
    }

    #[test]
    fn response_for_copies_matchtag_topic_routes() {
        let mut req = Message::request("svc.method").unwrap();
        req.set_matchtag(99).unwrap();
        req.enable_route();
        req.push_route("sender").unwrap();

        let resp = Message::response_for(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::Response);
        assert_eq!(resp.matchtag().unwrap(), 99);
        assert_eq!(resp.topic().unwrap(), "svc.method");
        assert_eq!(resp.route_count().unwrap(), 1);
        assert_eq!(resp.errnum().unwrap(), 0);
    }

    #[test]
    fn cmp_matchtag_rules() {
        let mut resp = Message::new(MsgType::Response);
        resp.set_matchtag(7).unwrap();
        assert!(resp.cmp_matchtag(7));
        assert!(!resp.cmp_matchtag(8));

        // group tags compare group bits only
        let group = 3u32 << MATCHTAG_GROUP_SHIFT;
        resp.set_matchtag(group | 0x1234).unwrap();
        assert!(resp.cmp_matchtag(group));
        assert!(resp.cmp_matchtag(group | 0xFFFF));
        assert!(!resp.cmp_matchtag(4u32 << MATCHTAG_GROUP_SHIFT));

        // foreign matchtag domain
        resp.set_matchtag(7).unwrap();
        resp.enable_route();
        resp.push_route("peer").unwrap();
        assert!(!resp.cmp_matchtag(7));
    }

    #[test]
    fn event_seq_slot() {
        let mut msg = Message::event("heartbeat.pulse").unwrap();
        msg.set_seq(41).unwrap();
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.seq().unwrap(), 41);
    }
}
