//! # Protocol messages with a fixed id
//!
//! The handshake pair, the heartbeat and the generic return code.

use meshpack::Cursor;
use meshpack::Encoder;

use crate::error::Result;
use crate::ids::code;
use crate::ids::msg_id;
use crate::message::Message;
use crate::message::MessageType;

/// First frame on a new connection: who is calling, and which child
/// server ids it also answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub server_type: i32,
    pub server_id: i32,
    pub child_ids: Vec<i32>,
}

impl Message for AuthRequest {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.i32(self.server_type);
        enc.i32(self.server_id);
        enc.i32_list(&self.child_ids)?;
        Ok(())
    }
}

impl MessageType for AuthRequest {
    const ID: i32 = msg_id::AUTH_REQUEST;

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            server_type: cur.i32()?,
            server_id: cur.i32()?,
            child_ids: cur.i32_list()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub server_type: i32,
    pub server_id: i32,
}

impl Message for AuthResponse {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.i32(self.server_type);
        enc.i32(self.server_id);
        Ok(())
    }
}

impl MessageType for AuthResponse {
    const ID: i32 = msg_id::AUTH_RESPONSE;

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            server_type: cur.i32()?,
            server_id: cur.i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat;

impl Message for Heartbeat {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, _enc: &mut Encoder) -> Result<()> {
        Ok(())
    }
}

impl MessageType for Heartbeat {
    const ID: i32 = msg_id::HEARTBEAT;

    fn decode(_cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self)
    }
}

/// Reply body used when no richer response applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode {
    pub code: i32,
}

impl ReturnCode {
    pub const fn new(code: i32) -> Self {
        Self { code }
    }

    pub const fn ok() -> Self {
        Self { code: code::OK }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}

impl Message for ReturnCode {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.i32(self.code);
        Ok(())
    }
}

impl MessageType for ReturnCode {
    const ID: i32 = msg_id::RETURN_CODE;

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self { code: cur.i32()? })
    }
}
