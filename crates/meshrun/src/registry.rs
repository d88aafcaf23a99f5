//! # Reference Registry
//!
//! Hands out `EntityRef`s and owns the cached `RemoteRef`s, keyed by entity
//! type and then entity id.
//!
//! ## Philosophy
//!
//! - **Locality First**: An entity this server is responsible for always gets
//!   a fresh local (or empty) ref from the `LocalEntityFinder`; those are
//!   never cached.
//! - **Lazy Remote Refs**: A remote ref is created on the first lookup miss
//!   and reclaimed by the sweep once invalid past the grace period or idle.
//! - **Relay Unchanged**: Existence checks and forward responses addressed to
//!   another server are passed on byte for byte.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use meshrpc::Codec;
use meshrpc::EntityEnvelope;
use meshrpc::Message;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::callback::CallError;
use crate::config::ClusterConfig;
use crate::connection::Link;
use crate::entity::EmptyRef;
use crate::entity::EntityRef;
use crate::entity::RefState;
use crate::entity::RemoteRef;
use crate::entity::SweepOutcome;
use crate::entity::SweepPolicy;
use crate::finder::AddressFinder;
use crate::finder::LocalEntityFinder;
use crate::router::Router;

type RefsById = DashMap<i64, Arc<RemoteRef>>;

pub struct Registry {
    refs: DashMap<i32, Arc<RefsById>>,
    router: Arc<Router>,
    local_finder: Arc<dyn LocalEntityFinder>,
    address_finder: Arc<dyn AddressFinder>,
    codec: Arc<Codec>,
    not_exists_code: i32,
    policy: SweepPolicy,
}

impl Registry {
    pub fn new(
        router: Arc<Router>,
        local_finder: Arc<dyn LocalEntityFinder>,
        address_finder: Arc<dyn AddressFinder>,
        codec: Arc<Codec>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            refs: DashMap::new(),
            router,
            local_finder,
            address_finder,
            codec,
            not_exists_code: config.not_exists_code,
            policy: SweepPolicy::from(config),
        }
    }

    pub fn local_finder(&self) -> &Arc<dyn LocalEntityFinder> {
        &self.local_finder
    }

    /// The ref for an entity, wherever it lives.
    pub fn get_ref(&self, entity_type: i32, entity_id: i64) -> EntityRef {
        if self.local_finder.is_local_entity(entity_type, entity_id) {
            return self.local_finder.get_local_entity(entity_type, entity_id);
        }
        match self.get_remote_ref(entity_type, entity_id, true) {
            Some(r) => EntityRef::Remote(r),
            None => EntityRef::Empty(EmptyRef::new(entity_type, entity_id, self.not_exists_code)),
        }
    }

    /// The cached remote ref, created on a miss when `create_if_absent`.
    ///
    /// A new ref whose owner cannot be resolved starts out INVALID.
    pub fn get_remote_ref(&self, entity_type: i32, entity_id: i64, create_if_absent: bool) -> Option<Arc<RemoteRef>> {
        let by_id = if create_if_absent {
            self.refs.entry(entity_type).or_default().value().clone()
        } else {
            self.refs.get(&entity_type)?.value().clone()
        };

        if let Some(r) = by_id.get(&entity_id) {
            return Some(r.value().clone());
        }
        if !create_if_absent {
            return None;
        }

        let r = by_id
            .entry(entity_id)
            .or_insert_with(|| {
                let address = self.address_finder.find_address(entity_type, entity_id);
                if address.is_none() {
                    debug!(entity_type, entity_id, "no owner for entity");
                }
                Arc::new(RemoteRef::new(
                    entity_type,
                    entity_id,
                    address,
                    self.router.clone(),
                    self.not_exists_code,
                ))
            })
            .value()
            .clone();
        Some(r)
    }

    pub fn len(&self) -> usize {
        self.refs.iter().map(|by_id| by_id.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answers a check addressed here, or relays it. A check that cannot be
    /// relayed is answered with `exists = false`.
    pub fn handle_check_request(&self, from: &Link, env: EntityEnvelope) {
        let route = env.route;
        if self.router.is_local(route.dst_type, route.dst_id) {
            let exists = self.local_finder.exists(env.entity_type, env.entity_id);
            trace!(entity_type = env.entity_type, entity_id = env.entity_id, exists, "answering check");
            self.reply(from, &env.check_response(exists));
            return;
        }

        match self.router.direct(route.dst_type, route.dst_id) {
            Some(link) if link.conn.send_message(&env, 0).is_ok() => {}
            _ => {
                warn!(
                    dst_type = route.dst_type,
                    dst_id = route.dst_id,
                    entity_type = env.entity_type,
                    entity_id = env.entity_id,
                    "check not relayed"
                );
                self.reply(from, &env.check_response(false));
            }
        }
    }

    pub fn handle_check_response(&self, env: EntityEnvelope) {
        let route = env.route;
        if !self.router.is_local(route.dst_type, route.dst_id) {
            self.relay(env);
            return;
        }
        match self.get_remote_ref(env.entity_type, env.entity_id, false) {
            Some(r) => r.on_check_result(env.exists),
            None => debug!(entity_type = env.entity_type, entity_id = env.entity_id, "check response for unknown ref"),
        }
    }

    pub fn handle_forward_response(&self, env: EntityEnvelope) {
        let route = env.route;
        if !self.router.is_local(route.dst_type, route.dst_id) {
            self.relay(env);
            return;
        }
        let seq = -env.fwd_seq;
        let Some(r) = self.get_remote_ref(env.entity_type, env.entity_id, false) else {
            debug!(entity_type = env.entity_type, entity_id = env.entity_id, seq, "forward response for unknown ref");
            return;
        };
        match self.codec.decode(env.fwd_msg_id, &env.fwd_data) {
            Ok(msg) => {
                if !r.on_forward_response(seq, msg) {
                    debug!(seq, "late forward response dropped");
                }
            }
            Err(e) => {
                warn!(seq, msg_id = env.fwd_msg_id, error = %e, "forward response not decodable");
                r.handle_exception(seq, CallError::Decode);
            }
        }
    }

    /// Sweeps every ref once and drops the ones that are done. Returns the
    /// number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let tables: Vec<Arc<RefsById>> = self.refs.iter().map(|e| e.value().clone()).collect();
        let mut removed = 0;
        for by_id in tables {
            let refs: Vec<(i64, Arc<RemoteRef>)> = by_id
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect();
            for (id, r) in refs {
                if r.sweep(now, &self.policy) == SweepOutcome::Remove
                    && by_id.remove_if(&id, |_, current| Arc::ptr_eq(current, &r) && reclaimable(current)).is_some()
                {
                    trace!(entity_type = r.entity_type(), entity_id = id, state = ?r.state(), "ref reclaimed");
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Runs `sweep` every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                registry.sweep(Instant::now());
            }
        })
    }

    /// Fails every pending call on every ref and forgets them all.
    pub fn shutdown(&self) -> usize {
        let tables: Vec<Arc<RefsById>> = self.refs.iter().map(|e| e.value().clone()).collect();
        self.refs.clear();
        tables
            .iter()
            .flat_map(|by_id| by_id.iter().map(|e| e.value().clone()).collect::<Vec<_>>())
            .map(|r| r.shutdown())
            .sum()
    }

    fn reply(&self, to: &Link, env: &EntityEnvelope) {
        if let Err(e) = to.conn.send_message(env, 0) {
            debug!(peer = %to.peer(), error = %e, "reply not sent");
        }
    }

    fn relay(&self, env: EntityEnvelope) {
        let route = env.route;
        match self.router.direct(route.dst_type, route.dst_id) {
            Some(link) => {
                if let Err(e) = link.conn.send_message(&env as &dyn Message, 0) {
                    debug!(peer = %link.peer(), error = %e, "relay failed");
                }
            }
            None => debug!(dst_type = route.dst_type, dst_id = route.dst_id, "no link to relay response"),
        }
    }
}

/// An idle ref still held by a caller can send again, and its replies are
/// matched by (type, id) and seq only. Reclaiming it would let a newer ref
/// for the same entity, whose seqs restart at 1, take those replies. INVALID
/// refs never send, so they go regardless.
///
/// Runs under the map's shard lock, so `get_ref` cannot clone in between.
/// The two expected owners are the map itself and the sweep's own handle.
fn reclaimable(current: &Arc<RemoteRef>) -> bool {
    current.state() == RefState::Invalid || Arc::strong_count(current) <= 2
}
