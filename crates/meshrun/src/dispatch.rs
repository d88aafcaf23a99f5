//! # Inbound dispatch
//!
//! Every frame read from a connection lands in `Dispatcher::on_frame`, on
//! that connection's reader task. Protocol ids are intercepted here; the rest
//! are plain service messages.
//!
//! ## Invariants
//! - **Always Answer**: A request (`seq > 0`) gets exactly one reply with
//!   `seq = -request_seq`, even when decoding or handling fails.
//! - **Replies Resolve Locally**: A frame with `seq < 0` is a reply for the
//!   arriving connection's RPC addon and is never handed to a handler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshpack::Frame;
use meshrpc::BoxMessage;
use meshrpc::Codec;
use meshrpc::EntityEnvelope;
use meshrpc::EntityKind;
use meshrpc::ForwardEnvelope;
use meshrpc::Heartbeat;
use meshrpc::Message;
use meshrpc::MultiForward;
use meshrpc::decode_frame;
use meshrpc::msg_id;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::callback::CallError;
use crate::connection::Error as ConnError;
use crate::connection::Link;
use crate::mailbox::MessageHandler;
use crate::mailbox::respond;
use crate::registry::Registry;
use crate::router::Router;

/// Message id to handler, plus an optional catch-all.
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<i32, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, msg_id: i32, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(msg_id, handler).is_some() {
            debug!(msg_id, "handler replaced");
        }
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn MessageHandler>) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, msg_id: i32) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&msg_id)
            .map(|h| h.value().clone())
            .or_else(|| self.fallback.clone())
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.handlers.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

pub struct Dispatcher {
    pub(crate) router: Arc<Router>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) codec: Arc<Codec>,
    pub(crate) handlers: Arc<HandlerTable>,
    pub(crate) rpc_timeout: Duration,
    pub(crate) not_exists_code: i32,
}

impl Dispatcher {
    pub fn on_frame(&self, from: &Arc<Link>, frame: Frame) {
        trace!(peer = %from.peer(), msg_id = frame.msg_id, seq = frame.seq, "frame");
        match frame.msg_id {
            msg_id::HEARTBEAT if frame.seq > 0 => {
                self.send(from, &Heartbeat, -frame.seq);
            }
            msg_id::FORWARD | msg_id::RPC_FORWARD => match ForwardEnvelope::from_frame(&frame) {
                Ok(env) => self.on_forward(from, env),
                Err(e) => warn!(peer = %from.peer(), error = %e, "bad forward envelope"),
            },
            msg_id::MULTI_FORWARD => match decode_frame::<MultiForward>(&frame) {
                Ok(multi) => self.on_multi_forward(multi),
                Err(e) => warn!(peer = %from.peer(), error = %e, "bad multi-forward envelope"),
            },
            msg_id::ENTITY_CHECK_REQUEST
            | msg_id::ENTITY_CHECK_RESPONSE
            | msg_id::ENTITY_FORWARD_REQUEST
            | msg_id::ENTITY_FORWARD_RESPONSE => match EntityEnvelope::from_frame(&frame) {
                Ok(env) => self.on_entity(from, env),
                Err(e) => warn!(peer = %from.peer(), error = %e, "bad entity envelope"),
            },
            msg_id::AUTH_REQUEST | msg_id::AUTH_RESPONSE => {
                debug!(peer = %from.peer(), "auth frame after handshake ignored");
            }
            _ => self.on_plain(from, frame),
        }
    }

    fn on_entity(&self, from: &Arc<Link>, env: EntityEnvelope) {
        match env.kind {
            EntityKind::CheckRequest => self.registry.handle_check_request(from, env),
            EntityKind::CheckResponse => self.registry.handle_check_response(env),
            EntityKind::ForwardRequest => self.on_entity_forward(from, env),
            EntityKind::ForwardResponse => self.registry.handle_forward_response(env),
        }
    }

    /// A message sent straight over the connection, not wrapped.
    fn on_plain(&self, from: &Arc<Link>, frame: Frame) {
        if frame.seq < 0 {
            let seq = -frame.seq;
            match self.codec.decode(frame.msg_id, &frame.body) {
                Ok(msg) => {
                    if !from.rpc.receive_response(seq, msg) {
                        debug!(peer = %from.peer(), seq, "late reply dropped");
                    }
                }
                Err(e) => {
                    warn!(peer = %from.peer(), seq, msg_id = frame.msg_id, error = %e, "reply not decodable");
                    from.rpc.handle_exception(seq, CallError::Decode);
                }
            }
            return;
        }

        let result = self.deliver(frame.msg_id, &frame.body);
        if frame.seq > 0 {
            let body = reply_body(result);
            self.send(from, body.as_ref(), -frame.seq);
        } else if let Err(err) = result {
            debug!(peer = %from.peer(), msg_id = frame.msg_id, error = %err, "one-way message not handled");
        }
    }

    /// Decodes and handles a message addressed to this server.
    pub(crate) fn deliver(&self, msg_id: i32, body: &[u8]) -> Result<BoxMessage, CallError> {
        let msg = self.codec.decode(msg_id, body).map_err(|e| {
            warn!(msg_id, error = %e, "message not decodable");
            CallError::Decode
        })?;
        self.deliver_decoded(msg)
    }

    /// Protocol ids are never handed to user handlers, fallback included.
    pub(crate) fn deliver_decoded(&self, msg: BoxMessage) -> Result<BoxMessage, CallError> {
        let id = msg.msg_id();
        if msg_id::is_system(id) {
            debug!(msg_id = id, "protocol message outside its handler");
            return Err(CallError::NoHandler);
        }
        let handler = self.handlers.get(id).ok_or_else(|| {
            debug!(msg_id = id, "no handler");
            CallError::NoHandler
        })?;
        Ok(respond(handler.as_ref(), msg))
    }

    /// Sends `msg`. A reply too large for the link is swapped for an
    /// encode-failure code so the requester is still answered.
    pub(crate) fn send(&self, to: &Link, msg: &dyn Message, seq: i32) {
        match to.conn.send_message(msg, seq) {
            Ok(()) => {}
            Err(e @ ConnError::TooLarge(_)) if seq < 0 => {
                warn!(peer = %to.peer(), seq, error = %e, "reply too large");
                if let Err(e) = to.conn.send_message(&CallError::Encode.to_return_code(), seq) {
                    debug!(peer = %to.peer(), seq, error = %e, "send failed");
                }
            }
            Err(e) => debug!(peer = %to.peer(), seq, error = %e, "send failed"),
        }
    }
}

/// The message that answers a request: the response itself, or the error as
/// a return code.
pub(crate) fn reply_body(result: Result<BoxMessage, CallError>) -> BoxMessage {
    match result {
        Ok(msg) => msg,
        Err(err) => Box::new(err.to_return_code()),
    }
}
