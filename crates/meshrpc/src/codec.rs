//! # Codec
//!
//! The registry that turns `(msg_id, body)` back into typed messages.
//!
//! ## Invariants
//! - **Strict Bodies**: A body must be consumed exactly; trailing bytes fail decoding.
//! - **Open Set**: Applications register their own message types next to the
//!   protocol's reply types (`ReturnCode`, `Heartbeat`).

use std::collections::HashMap;

use meshpack::Cursor;

use crate::error::Error;
use crate::error::Result;
use crate::message::BoxMessage;
use crate::message::Message;
use crate::message::MessageType;
use crate::system::Heartbeat;
use crate::system::ReturnCode;

type DecodeFn = fn(&mut Cursor<'_>) -> Result<BoxMessage>;

fn decode_boxed<M: MessageType>(cur: &mut Cursor<'_>) -> Result<BoxMessage> {
    Ok(Box::new(M::decode(cur)?))
}

/// Maps message ids to decoders.
#[derive(Clone)]
pub struct Codec {
    decoders: HashMap<i32, DecodeFn>,
}

impl Codec {
    /// Creates a codec that already knows the protocol's reply types.
    pub fn new() -> Self {
        let mut codec = Self {
            decoders: HashMap::new(),
        };
        codec.register::<ReturnCode>();
        codec.register::<Heartbeat>();
        codec
    }

    /// Registers a message type under its id, replacing any previous decoder.
    pub fn register<M: MessageType>(&mut self) -> &mut Self {
        self.decoders.insert(M::ID, decode_boxed::<M>);
        self
    }

    pub fn contains(&self, msg_id: i32) -> bool {
        self.decoders.contains_key(&msg_id)
    }

    /// Decodes a message body by id.
    pub fn decode(&self, msg_id: i32, body: &[u8]) -> Result<BoxMessage> {
        let decode = self
            .decoders
            .get(&msg_id)
            .ok_or(Error::UnknownMessage(msg_id))?;
        let mut cur = Cursor::new(body);
        let msg = decode(&mut cur)?;
        cur.expect_end()?;
        Ok(msg)
    }

    /// Encodes a message body. Provided for symmetry with `decode`.
    pub fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>> {
        msg.to_bytes()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}
