//! # Connection-level RPC
//!
//! Request/response correlation bound to one connection, independent of
//! entity addressing. Heartbeats, direct service calls and server-to-server
//! forwarded calls all ride on it.
//!
//! ## Invariants
//! - A callback is installed before its request is sent. If sending fails the
//!   same callback is failed through the cache, exactly as a timeout would be.
//! - An inactive connection fails a call immediately; nothing is cached.

use std::sync::Arc;
use std::time::Duration;

use meshpack::Frame;
use meshrpc::BoxMessage;
use meshrpc::ForwardEnvelope;
use meshrpc::ForwardKind;
use meshrpc::Message;
use meshrpc::Route;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::callback::CallError;
use crate::callback::CallResult;
use crate::callback::Callback;
use crate::callback::CallbackCache;
use crate::callback::Reply;
use crate::connection::Connection;
use crate::identity::ServerIdentity;
use crate::seq::SeqGenerator;

pub struct RpcAddon {
    conn: Arc<dyn Connection>,
    local_type: i32,
    local_id: i32,
    seq: SeqGenerator,
    cache: CallbackCache,
}

impl RpcAddon {
    /// `local` is written as the source of forwarded requests.
    pub fn new(conn: Arc<dyn Connection>, local: &ServerIdentity) -> Self {
        Self {
            conn,
            local_type: local.server_type,
            local_id: local.server_id,
            seq: SeqGenerator::new(),
            cache: CallbackCache::new(),
        }
    }

    /// Sends `msg` to the peer and resolves with its reply.
    pub fn ask(&self, msg: &dyn Message, timeout: Duration) -> Reply {
        if !self.conn.is_active() {
            return Reply::ready(Err(CallError::InvalidConnection));
        }
        let seq = self.seq.next();
        let (cb, reply) = Callback::new(seq, timeout);
        self.cache.add(cb);
        self.send_or_fail(seq, msg.to_frame(seq));
        reply
    }

    /// Like `ask`, but resolves through `handler`.
    pub fn ask_with(
        &self,
        msg: &dyn Message,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        if !self.conn.is_active() {
            handler(Err(CallError::InvalidConnection));
            return;
        }
        let seq = self.seq.next();
        self.cache.add(Callback::with_handler(seq, timeout, handler));
        self.send_or_fail(seq, msg.to_frame(seq));
    }

    /// Asks server `(dst_type, dst_id)` through the peer, which relays.
    pub fn forward_ask(&self, dst_type: i32, dst_id: i32, msg: &dyn Message, timeout: Duration) -> Reply {
        if !self.conn.is_active() {
            return Reply::ready(Err(CallError::InvalidConnection));
        }
        let seq = self.seq.next();
        let (cb, reply) = Callback::new(seq, timeout);
        self.cache.add(cb);
        self.send_or_fail(seq, self.forward_frame(dst_type, dst_id, seq, msg));
        reply
    }

    pub fn forward_ask_with(
        &self,
        dst_type: i32,
        dst_id: i32,
        msg: &dyn Message,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        if !self.conn.is_active() {
            handler(Err(CallError::InvalidConnection));
            return;
        }
        let seq = self.seq.next();
        self.cache.add(Callback::with_handler(seq, timeout, handler));
        self.send_or_fail(seq, self.forward_frame(dst_type, dst_id, seq, msg));
    }

    /// One-way send.
    pub fn tell(&self, msg: &dyn Message) -> crate::connection::Result<()> {
        self.conn.send_message(msg, 0)
    }

    pub fn receive_response(&self, seq: i32, msg: BoxMessage) -> bool {
        self.cache.receive_response(seq, msg)
    }

    pub fn handle_exception(&self, seq: i32, err: CallError) -> bool {
        self.cache.handle_exception(seq, err)
    }

    pub fn check_expired(&self, now: Instant) -> usize {
        self.cache.check_expired(now)
    }

    pub fn fail_all(&self, err: CallError) -> usize {
        self.cache.fail_all(err)
    }

    pub fn pending_count(&self) -> usize {
        self.cache.len()
    }

    fn forward_frame(&self, dst_type: i32, dst_id: i32, seq: i32, msg: &dyn Message) -> meshrpc::Result<Frame> {
        let route = Route::new(self.local_type, self.local_id, dst_type, dst_id);
        let env = ForwardEnvelope::wrap(ForwardKind::Rpc, route, seq, msg)?;
        (&env as &dyn Message).to_frame(0)
    }

    fn send_or_fail(&self, seq: i32, frame: meshrpc::Result<Frame>) {
        let sent = match frame {
            Ok(frame) => self.conn.send(frame).map_err(|e| {
                debug!(seq, peer = %self.conn.peer(), error = %e, "request not sent");
                CallError::from(e)
            }),
            Err(e) => {
                warn!(seq, error = %e, "request could not be encoded");
                Err(CallError::Encode)
            }
        };
        if let Err(err) = sent {
            self.cache.handle_exception(seq, err);
        }
    }
}
