//! # Forwarding handlers
//!
//! Moves wrapped payloads across at most one relay server.
//!
//! ## Philosophy
//!
//! - **Relays Stay Dumb**: A relay never decodes the payload. It passes the
//!   envelope on to its direct link for the destination, or unwraps a one-way
//!   forward and sends the inner frame.
//! - **Synthetic Replies**: When a relay cannot pass a request on, it answers
//!   the sender itself, so the caller sees an error instead of a timeout.
//! - **No Waiting**: A hop never blocks on the next hop's round trip; replies
//!   travel back as independent envelopes.

use std::sync::Arc;

use meshrpc::ForwardEnvelope;
use meshrpc::ForwardKind;
use meshrpc::Message;
use meshrpc::MultiForward;
use meshrpc::ReturnCode;
use meshrpc::EntityEnvelope;
use meshrpc::code;
use tracing::debug;
use tracing::warn;

use crate::callback::CallError;
use crate::connection::Link;
use crate::dispatch::Dispatcher;
use crate::dispatch::reply_body;
use crate::entity::EntityRef;

impl Dispatcher {
    pub(crate) fn on_forward(&self, from: &Arc<Link>, env: ForwardEnvelope) {
        let route = env.route;
        if !self.router.is_local(route.dst_type, route.dst_id) {
            self.relay_forward(from, env);
            return;
        }

        match env.kind {
            ForwardKind::Oneway => {
                if let Err(err) = self.deliver(env.fwd_msg_id, &env.fwd_data) {
                    debug!(src_type = route.src_type, src_id = route.src_id, error = %err, "forwarded message not handled");
                }
            }
            ForwardKind::Rpc if env.fwd_seq < 0 => {
                let seq = -env.fwd_seq;
                match self.codec.decode(env.fwd_msg_id, &env.fwd_data) {
                    Ok(msg) => {
                        if !from.rpc.receive_response(seq, msg) {
                            debug!(seq, "late forwarded reply dropped");
                        }
                    }
                    Err(e) => {
                        warn!(seq, error = %e, "forwarded reply not decodable");
                        from.rpc.handle_exception(seq, CallError::Decode);
                    }
                }
            }
            ForwardKind::Rpc => {
                let result = self.deliver(env.fwd_msg_id, &env.fwd_data);
                if env.fwd_seq > 0 {
                    let body = reply_body(result);
                    self.answer_forward(from, &env, body.as_ref());
                }
            }
        }
    }

    fn relay_forward(&self, from: &Arc<Link>, env: ForwardEnvelope) {
        let route = env.route;
        let Some(link) = self.router.direct(route.dst_type, route.dst_id) else {
            warn!(dst_type = route.dst_type, dst_id = route.dst_id, "no link to forward destination");
            self.refuse_forward(from, &env, code::DESTINATION_UNREACHABLE);
            return;
        };

        let sent = match env.kind {
            ForwardKind::Oneway => link.conn.send(env.inner_frame()),
            ForwardKind::Rpc => link.conn.send_message(&env, 0),
        };
        if let Err(e) = sent {
            warn!(peer = %link.peer(), error = %e, "forward relay failed");
            self.refuse_forward(from, &env, code::FORWARD_FAILED);
        }
    }

    fn refuse_forward(&self, from: &Link, env: &ForwardEnvelope, code: i32) {
        if env.kind == ForwardKind::Rpc && env.fwd_seq > 0 {
            self.answer_forward(from, env, &ReturnCode::new(code));
        }
    }

    fn answer_forward(&self, to: &Link, env: &ForwardEnvelope, body: &dyn Message) {
        match env.reply_with(body) {
            Ok(reply) => self.send(to, &reply, 0),
            Err(e) => warn!(seq = env.fwd_seq, error = %e, "forward reply not encoded"),
        }
    }

    pub(crate) fn on_multi_forward(&self, multi: MultiForward) {
        for id in multi.targets() {
            if self.router.is_local(multi.dst_type, id) {
                if let Err(err) = self.deliver(multi.fwd_msg_id, &multi.fwd_data) {
                    debug!(error = %err, "multi-forwarded message not handled");
                }
                continue;
            }
            match self.router.direct(multi.dst_type, id) {
                Some(link) => {
                    if let Err(e) = link.conn.send(multi.inner_frame()) {
                        debug!(peer = %link.peer(), error = %e, "multi-forward leg failed");
                    }
                }
                None => debug!(dst_type = multi.dst_type, dst_id = id, "no link for multi-forward leg"),
            }
        }
    }

    pub(crate) fn on_entity_forward(&self, from: &Arc<Link>, env: EntityEnvelope) {
        let route = env.route;
        if !self.router.is_local(route.dst_type, route.dst_id) {
            let relayed = self
                .router
                .direct(route.dst_type, route.dst_id)
                .map(|link| link.conn.send_message(&env, 0).is_ok())
                .unwrap_or(false);
            if !relayed {
                warn!(
                    dst_type = route.dst_type,
                    dst_id = route.dst_id,
                    entity_type = env.entity_type,
                    entity_id = env.entity_id,
                    "entity forward not relayed"
                );
                if env.fwd_seq > 0 {
                    self.answer_entity(from, &env, &ReturnCode::new(code::FORWARD_FAILED));
                }
            }
            return;
        }

        let entity = self
            .registry
            .local_finder()
            .get_local_entity(env.entity_type, env.entity_id);
        let EntityRef::Local(local) = entity else {
            debug!(entity_type = env.entity_type, entity_id = env.entity_id, "entity forward for missing entity");
            if env.fwd_seq > 0 {
                self.answer_entity(from, &env, &ReturnCode::new(self.not_exists_code));
            }
            return;
        };

        let msg = match self.codec.decode(env.fwd_msg_id, &env.fwd_data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(entity_type = env.entity_type, entity_id = env.entity_id, error = %e, "entity message not decodable");
                if env.fwd_seq > 0 {
                    self.answer_entity(from, &env, &CallError::Decode.to_return_code());
                }
                return;
            }
        };

        if env.fwd_seq <= 0 {
            local.tell(msg);
            return;
        }

        let to = from.clone();
        local.ask_with(msg, self.rpc_timeout, move |result| {
            let body = reply_body(result);
            match env.forward_response_with(body.as_ref()) {
                Ok(reply) => {
                    if let Err(e) = to.conn.send_message(&reply, 0) {
                        debug!(peer = %to.peer(), error = %e, "entity reply not sent");
                    }
                }
                Err(e) => warn!(error = %e, "entity reply not encoded"),
            }
        });
    }

    fn answer_entity(&self, to: &Link, env: &EntityEnvelope, body: &dyn Message) {
        match env.forward_response_with(body) {
            Ok(reply) => self.send(to, &reply, 0),
            Err(e) => warn!(seq = env.fwd_seq, error = %e, "entity reply not encoded"),
        }
    }
}
