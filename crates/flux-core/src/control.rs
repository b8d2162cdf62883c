//! Control message helpers.
//!
//! Control messages carry `(type, status)` in the aux slots and never have
//! a topic or payload.  The handle uses [`ControlType::Disconnect`] with
//! `status = matchtag` to cancel a streaming RPC.

use std::fmt;

use flux_msg::{Message, MsgType, ProtoError};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Heartbeat = 0,
    Status = 1,
    Disconnect = 2,
}

impl ControlType {
    pub fn from_i32(val: i32) -> Option<Self> {
        Some(match val {
            0 => ControlType::Heartbeat,
            1 => ControlType::Status,
            2 => ControlType::Disconnect,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlType::Heartbeat => "heartbeat",
            ControlType::Status => "status",
            ControlType::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

pub fn control_encode(typ: ControlType, status: i32) -> Message {
    let mut msg = Message::new(MsgType::Control);
    msg.set_control(typ.as_i32(), status)
        .expect("control message accepts control fields");
    msg
}

pub fn control_decode(msg: &Message) -> Result<(ControlType, i32), ProtoError> {
    let (typ, status) = msg.control()?;
    let typ = ControlType::from_i32(typ)
        .ok_or_else(|| ProtoError::protocol(format!("unknown control type {}", typ)))?;
    Ok((typ, status))
}
