//! # Messages
//!
//! A message is a typed value that knows its numeric id and how to write its
//! body. Decoding goes through the `Codec`, which maps ids back to types.

use std::any::Any;
use std::fmt;

use meshpack::Cursor;
use meshpack::Encoder;
use meshpack::Frame;

use crate::error::Result;

/// Lets `dyn Message` be inspected as its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A value that can travel in the body of a frame.
pub trait Message: AsAny + Send + Sync + fmt::Debug {
    /// The numeric id written into the frame header.
    fn msg_id(&self) -> i32;

    /// Writes the body, without any header.
    fn encode(&self, enc: &mut Encoder) -> Result<()>;
}

/// A message whose id is fixed by its type, and which can therefore be
/// registered with a `Codec`.
pub trait MessageType: Message + Sized {
    const ID: i32;

    fn decode(cur: &mut Cursor<'_>) -> Result<Self>;
}

pub type BoxMessage = Box<dyn Message>;

impl dyn Message {
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Encodes the body into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Encodes the message as a frame with the given sequence number.
    pub fn to_frame(&self, seq: i32) -> Result<Frame> {
        Ok(Frame::new(self.msg_id(), seq, self.to_bytes()?))
    }
}

/// Encodes any concrete message into a frame.
pub fn frame_of<M: Message>(msg: &M, seq: i32) -> Result<Frame> {
    (msg as &dyn Message).to_frame(seq)
}

/// Decodes a frame body as a known message type, rejecting trailing bytes.
pub fn decode_frame<M: MessageType>(frame: &Frame) -> Result<M> {
    if frame.msg_id != M::ID {
        return Err(crate::Error::UnexpectedMessage {
            expected: M::ID,
            found: frame.msg_id,
        });
    }
    decode_body(&frame.body)
}

/// Decodes a body as a known message type, rejecting trailing bytes.
pub fn decode_body<M: MessageType>(body: &[u8]) -> Result<M> {
    let mut cur = Cursor::new(body);
    let msg = M::decode(&mut cur)?;
    cur.expect_end()?;
    Ok(msg)
}
