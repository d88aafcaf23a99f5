//! # Forwarding envelopes
//!
//! Envelopes wrap an already-encoded message so that it can cross relay hops
//! without the relay ever decoding the payload.
//!
//! ## Wire Format
//!
//! ```text
//! Forward / RPC-Forward:
//!   [src_type][src_id][dst_type][dst_id][fwd_seq][fwd_msg_id][fwd_data: i32 len]
//! Entity check / forward (request and response):
//!   <forward layout>[entity_type: i32][entity_id: i64]
//!   check response only: [exists: bool]
//! Multi-Forward:
//!   [src_type][src_id][dst_type][dst_ids: i16 count][fwd_msg_id][fwd_data]
//! ```
//!
//! ## Invariants
//! - A reply swaps source and destination and negates `fwd_seq`.
//! - `fwd_seq == 0` means the sender does not expect a reply.

use meshpack::Cursor;
use meshpack::Encoder;
use meshpack::Frame;

use crate::error::Error;
use crate::error::Result;
use crate::ids::msg_id;
use crate::message::Message;
use crate::message::MessageType;

/// Source and destination servers of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub src_type: i32,
    pub src_id: i32,
    pub dst_type: i32,
    pub dst_id: i32,
}

impl Route {
    pub const fn new(src_type: i32, src_id: i32, dst_type: i32, dst_id: i32) -> Self {
        Self { src_type, src_id, dst_type, dst_id }
    }

    /// The route a reply takes back to the sender.
    pub const fn reversed(&self) -> Self {
        Self {
            src_type: self.dst_type,
            src_id: self.dst_id,
            dst_type: self.src_type,
            dst_id: self.src_id,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.i32(self.src_type);
        enc.i32(self.src_id);
        enc.i32(self.dst_type);
        enc.i32(self.dst_id);
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            src_type: cur.i32()?,
            src_id: cur.i32()?,
            dst_type: cur.i32()?,
            dst_id: cur.i32()?,
        })
    }
}

/// Which of the two server-to-server envelopes a `ForwardEnvelope` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    /// One-way: the last hop unwraps and delivers the inner message.
    Oneway,
    /// Request or reply threaded back through a callback cache.
    Rpc,
}

impl ForwardKind {
    pub const fn msg_id(self) -> i32 {
        match self {
            Self::Oneway => msg_id::FORWARD,
            Self::Rpc => msg_id::RPC_FORWARD,
        }
    }

    pub const fn from_msg_id(id: i32) -> Option<Self> {
        match id {
            msg_id::FORWARD => Some(Self::Oneway),
            msg_id::RPC_FORWARD => Some(Self::Rpc),
            _ => None,
        }
    }
}

/// Forward and RPC-Forward share one layout; the frame id tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEnvelope {
    pub kind: ForwardKind,
    pub route: Route,
    pub fwd_seq: i32,
    pub fwd_msg_id: i32,
    pub fwd_data: Vec<u8>,
}

impl ForwardEnvelope {
    /// Wraps `inner`, encoding it once.
    pub fn wrap(kind: ForwardKind, route: Route, fwd_seq: i32, inner: &dyn Message) -> Result<Self> {
        Ok(Self {
            kind,
            route,
            fwd_seq,
            fwd_msg_id: inner.msg_id(),
            fwd_data: inner.to_bytes()?,
        })
    }

    /// Decodes a Forward or RPC-Forward frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let kind = ForwardKind::from_msg_id(frame.msg_id).ok_or(Error::UnexpectedMessage {
            expected: msg_id::RPC_FORWARD,
            found: frame.msg_id,
        })?;
        let mut cur = Cursor::new(&frame.body);
        let route = Route::decode(&mut cur)?;
        let fwd_seq = cur.i32()?;
        let fwd_msg_id = cur.i32()?;
        let fwd_data = cur.blob()?.to_vec();
        cur.expect_end()?;
        Ok(Self { kind, route, fwd_seq, fwd_msg_id, fwd_data })
    }

    pub fn is_reply(&self) -> bool {
        self.fwd_seq < 0
    }

    /// Builds the reply envelope carrying `(fwd_msg_id, fwd_data)`.
    pub fn reply(&self, fwd_msg_id: i32, fwd_data: Vec<u8>) -> Self {
        Self {
            kind: self.kind,
            route: self.route.reversed(),
            fwd_seq: -self.fwd_seq,
            fwd_msg_id,
            fwd_data,
        }
    }

    pub fn reply_with(&self, msg: &dyn Message) -> Result<Self> {
        Ok(self.reply(msg.msg_id(), msg.to_bytes()?))
    }

    /// The wrapped message as a standalone frame.
    pub fn inner_frame(&self) -> Frame {
        Frame::new(self.fwd_msg_id, self.fwd_seq, self.fwd_data.clone())
    }
}

impl Message for ForwardEnvelope {
    fn msg_id(&self) -> i32 {
        self.kind.msg_id()
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        self.route.encode(enc);
        enc.i32(self.fwd_seq);
        enc.i32(self.fwd_msg_id);
        enc.blob(&self.fwd_data)?;
        Ok(())
    }
}

/// One payload, many destination servers of the same type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiForward {
    pub src_type: i32,
    pub src_id: i32,
    pub dst_type: i32,
    pub dst_ids: Vec<i32>,
    pub fwd_msg_id: i32,
    pub fwd_data: Vec<u8>,
}

impl MultiForward {
    pub fn wrap(src_type: i32, src_id: i32, dst_type: i32, dst_ids: Vec<i32>, inner: &dyn Message) -> Result<Self> {
        Ok(Self {
            src_type,
            src_id,
            dst_type,
            dst_ids,
            fwd_msg_id: inner.msg_id(),
            fwd_data: inner.to_bytes()?,
        })
    }

    /// Destination ids in first-seen order, without duplicates and without
    /// the sender itself.
    pub fn targets(&self) -> Vec<i32> {
        let mut out: Vec<i32> = Vec::with_capacity(self.dst_ids.len());
        for id in &self.dst_ids {
            let is_self = self.dst_type == self.src_type && *id == self.src_id;
            if !is_self && !out.contains(id) {
                out.push(*id);
            }
        }
        out
    }

    /// The wrapped message as a one-way frame.
    pub fn inner_frame(&self) -> Frame {
        Frame::new(self.fwd_msg_id, 0, self.fwd_data.clone())
    }
}

impl Message for MultiForward {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.i32(self.src_type);
        enc.i32(self.src_id);
        enc.i32(self.dst_type);
        enc.i32_list(&self.dst_ids)?;
        enc.i32(self.fwd_msg_id);
        enc.blob(&self.fwd_data)?;
        Ok(())
    }
}

impl MessageType for MultiForward {
    const ID: i32 = msg_id::MULTI_FORWARD;

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            src_type: cur.i32()?,
            src_id: cur.i32()?,
            dst_type: cur.i32()?,
            dst_ids: cur.i32_list()?,
            fwd_msg_id: cur.i32()?,
            fwd_data: cur.blob()?.to_vec(),
        })
    }
}

/// The four entity-addressed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    CheckRequest,
    CheckResponse,
    ForwardRequest,
    ForwardResponse,
}

impl EntityKind {
    pub const fn msg_id(self) -> i32 {
        match self {
            Self::CheckRequest => msg_id::ENTITY_CHECK_REQUEST,
            Self::CheckResponse => msg_id::ENTITY_CHECK_RESPONSE,
            Self::ForwardRequest => msg_id::ENTITY_FORWARD_REQUEST,
            Self::ForwardResponse => msg_id::ENTITY_FORWARD_RESPONSE,
        }
    }

    pub const fn from_msg_id(id: i32) -> Option<Self> {
        match id {
            msg_id::ENTITY_CHECK_REQUEST => Some(Self::CheckRequest),
            msg_id::ENTITY_CHECK_RESPONSE => Some(Self::CheckResponse),
            msg_id::ENTITY_FORWARD_REQUEST => Some(Self::ForwardRequest),
            msg_id::ENTITY_FORWARD_RESPONSE => Some(Self::ForwardResponse),
            _ => None,
        }
    }
}

/// Forward layout extended with the addressed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEnvelope {
    pub kind: EntityKind,
    pub route: Route,
    pub fwd_seq: i32,
    pub fwd_msg_id: i32,
    pub fwd_data: Vec<u8>,
    pub entity_type: i32,
    pub entity_id: i64,
    /// Only written for `CheckResponse`.
    pub exists: bool,
}

impl EntityEnvelope {
    pub fn check_request(route: Route, entity_type: i32, entity_id: i64) -> Self {
        Self {
            kind: EntityKind::CheckRequest,
            route,
            fwd_seq: 0,
            fwd_msg_id: 0,
            fwd_data: Vec::new(),
            entity_type,
            entity_id,
            exists: false,
        }
    }

    pub fn forward_request(
        route: Route,
        fwd_seq: i32,
        entity_type: i32,
        entity_id: i64,
        fwd_msg_id: i32,
        fwd_data: Vec<u8>,
    ) -> Self {
        Self {
            kind: EntityKind::ForwardRequest,
            route,
            fwd_seq,
            fwd_msg_id,
            fwd_data,
            entity_type,
            entity_id,
            exists: false,
        }
    }

    /// Answers a check request.
    pub fn check_response(&self, exists: bool) -> Self {
        Self {
            kind: EntityKind::CheckResponse,
            route: self.route.reversed(),
            fwd_seq: 0,
            fwd_msg_id: 0,
            fwd_data: Vec::new(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            exists,
        }
    }

    /// Answers a forward request with `(fwd_msg_id, fwd_data)`.
    pub fn forward_response(&self, fwd_msg_id: i32, fwd_data: Vec<u8>) -> Self {
        Self {
            kind: EntityKind::ForwardResponse,
            route: self.route.reversed(),
            fwd_seq: -self.fwd_seq,
            fwd_msg_id,
            fwd_data,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            exists: false,
        }
    }

    pub fn forward_response_with(&self, msg: &dyn Message) -> Result<Self> {
        Ok(self.forward_response(msg.msg_id(), msg.to_bytes()?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let kind = EntityKind::from_msg_id(frame.msg_id).ok_or(Error::UnexpectedMessage {
            expected: msg_id::ENTITY_FORWARD_REQUEST,
            found: frame.msg_id,
        })?;
        let mut cur = Cursor::new(&frame.body);
        let route = Route::decode(&mut cur)?;
        let fwd_seq = cur.i32()?;
        let fwd_msg_id = cur.i32()?;
        let fwd_data = cur.blob()?.to_vec();
        let entity_type = cur.i32()?;
        let entity_id = cur.i64()?;
        let exists = match kind {
            EntityKind::CheckResponse => cur.bool()?,
            _ => false,
        };
        cur.expect_end()?;
        Ok(Self {
            kind,
            route,
            fwd_seq,
            fwd_msg_id,
            fwd_data,
            entity_type,
            entity_id,
            exists,
        })
    }
}

impl Message for EntityEnvelope {
    fn msg_id(&self) -> i32 {
        self.kind.msg_id()
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        self.route.encode(enc);
        enc.i32(self.fwd_seq);
        enc.i32(self.fwd_msg_id);
        enc.blob(&self.fwd_data)?;
        enc.i32(self.entity_type);
        enc.i64(self.entity_id);
        if self.kind == EntityKind::CheckResponse {
            enc.bool(self.exists);
        }
        Ok(())
    }
}
