//! # Meshrpc
//!
//! The message vocabulary spoken between cluster servers.
//!
//! ## Architecture
//!
//! Every unit on the wire is a `meshpack::Frame`: `[len][msg_id][seq][body]`.
//! This crate gives meaning to the body:
//!
//! - **Messages**: typed values implementing `Message`, decoded back through a `Codec`.
//! - **Envelopes**: `ForwardEnvelope`, `MultiForward` and `EntityEnvelope` carry an
//!   already-encoded payload across relay servers without decoding it.
//! - **Ids and codes**: the reserved message ids and the `ReturnCode` values.
//!
//! ## Sequence numbers
//!
//! - `seq > 0`: a request expecting a reply.
//! - `seq < 0`: the reply to request `-seq`.
//! - `seq == 0`: one-way.

pub mod error;
pub mod ids;
pub mod message;
pub mod codec;
pub mod system;
pub mod envelope;

pub use error::Error;
pub use error::Result;

pub use ids::code;
pub use ids::msg_id;

pub use message::BoxMessage;
pub use message::Message;
pub use message::MessageType;
pub use message::decode_body;
pub use message::decode_frame;
pub use message::frame_of;

pub use codec::Codec;

pub use system::AuthRequest;
pub use system::AuthResponse;
pub use system::Heartbeat;
pub use system::ReturnCode;

pub use envelope::EntityEnvelope;
pub use envelope::EntityKind;
pub use envelope::ForwardEnvelope;
pub use envelope::ForwardKind;
pub use envelope::MultiForward;
pub use envelope::Route;
