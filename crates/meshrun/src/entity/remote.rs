//! # Remote entity references
//!
//! A `RemoteRef` stands for an entity owned by another server. Before the
//! first message goes out, the owner is asked whether the entity exists;
//! traffic issued meanwhile is queued and released in order once it does.
//!
//! ## States
//!
//! ```text
//! INIT --first use--> CHECK --exists--> RUN
//!   ^                   |
//!   +---no route--------+--missing / unanswered--> INVALID
//! ```
//!
//! ## Invariants
//! - **One Check**: Only the caller that wins the `INIT -> CHECK` swap sends
//!   the existence check, however many calls race on a fresh ref.
//! - **Queue Under Lock**: Enqueueing re-reads the state while holding the
//!   queue lock, and flush/invalidate change the state under that same lock,
//!   so nothing is stranded in the queue after it drains.
//! - **FIFO**: Queued traffic leaves in enqueue order. Requests whose callback
//!   already expired are skipped.
//! - **Callback First**: Every request installs its callback before anything
//!   is sent; send failures resolve that callback through the cache.
//! - Callbacks are never resolved while the queue lock is held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use meshrpc::BoxMessage;
use meshrpc::EntityEnvelope;
use meshrpc::Message;
use meshrpc::ReturnCode;
use meshrpc::Route;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::callback::CallError;
use crate::callback::CallResult;
use crate::callback::Callback;
use crate::callback::CallbackCache;
use crate::callback::Reply;
use crate::config::ClusterConfig;
use crate::identity::EntityAddress;
use crate::router::Router;
use crate::seq::SeqGenerator;

const INIT: u8 = 0;
const CHECK: u8 = 1;
const RUN: u8 = 2;
const INVALID: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    Init,
    Check,
    Run,
    Invalid,
}

impl RefState {
    fn from_u8(v: u8) -> Self {
        match v {
            INIT => Self::Init,
            CHECK => Self::Check,
            RUN => Self::Run,
            _ => Self::Invalid,
        }
    }
}

/// What the registry should do with a ref after sweeping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Keep,
    Remove,
}

/// Ages that drive the sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub check_timeout: Duration,
    pub invalid_grace: Duration,
    pub idle_threshold: Duration,
}

impl From<&ClusterConfig> for SweepPolicy {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            check_timeout: config.check_timeout(),
            invalid_grace: config.invalid_grace,
            idle_threshold: config.idle_threshold,
        }
    }
}

/// An encoded message waiting for the check to finish. `seq == 0` is a tell.
struct Queued {
    seq: i32,
    msg_id: i32,
    data: Vec<u8>,
}

pub struct RemoteRef {
    entity_type: i32,
    entity_id: i64,
    address: Option<EntityAddress>,
    router: Arc<Router>,
    not_exists_code: i32,
    state: AtomicU8,
    // Timestamps are milliseconds since `base`.
    base: Instant,
    last_ms: AtomicU64,
    state_ms: AtomicU64,
    queue: Mutex<VecDeque<Queued>>,
    seq: SeqGenerator,
    cache: CallbackCache,
}

impl RemoteRef {
    /// A ref without an address starts INVALID and never sends anything.
    pub fn new(
        entity_type: i32,
        entity_id: i64,
        address: Option<EntityAddress>,
        router: Arc<Router>,
        not_exists_code: i32,
    ) -> Self {
        let state = if address.is_some() { INIT } else { INVALID };
        Self {
            entity_type,
            entity_id,
            address,
            router,
            not_exists_code,
            state: AtomicU8::new(state),
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
            state_ms: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            seq: SeqGenerator::new(),
            cache: CallbackCache::new(),
        }
    }

    pub fn entity_type(&self) -> i32 {
        self.entity_type
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    pub fn address(&self) -> Option<EntityAddress> {
        self.address
    }

    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> Instant {
        self.base
    }

    pub fn pending_count(&self) -> usize {
        self.cache.len()
    }

    pub fn queued_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Starts the existence check if nobody has yet.
    pub fn check(&self) {
        if self
            .state
            .compare_exchange(INIT, CHECK, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.mark_state_change();
        debug!(entity_type = self.entity_type, entity_id = self.entity_id, "checking entity");

        match self.send_check() {
            Ok(()) => {}
            Err(err @ (CallError::Unreachable | CallError::ConnectionLost)) => {
                debug!(
                    entity_type = self.entity_type,
                    entity_id = self.entity_id,
                    error = %err,
                    "existence check not sent, will retry"
                );
                self.reset(err);
            }
            Err(err) => {
                warn!(
                    entity_type = self.entity_type,
                    entity_id = self.entity_id,
                    error = %err,
                    "existence check not sent"
                );
                self.invalidate();
            }
        }
    }

    pub fn tell(&self, msg: &dyn Message) {
        self.touch();
        match msg.to_bytes() {
            Ok(data) => self.submit(Queued {
                seq: 0,
                msg_id: msg.msg_id(),
                data,
            }),
            Err(e) => warn!(
                entity_type = self.entity_type,
                entity_id = self.entity_id,
                error = %e,
                "tell could not be encoded"
            ),
        }
    }

    pub fn ask(&self, msg: &dyn Message, timeout: Duration) -> Reply {
        let seq = self.seq.next();
        let (cb, reply) = Callback::new(seq, timeout);
        self.cache.add(cb);
        self.submit_request(seq, msg);
        reply
    }

    pub fn ask_with(
        &self,
        msg: &dyn Message,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        let seq = self.seq.next();
        self.cache.add(Callback::with_handler(seq, timeout, handler));
        self.submit_request(seq, msg);
    }

    /// Applies the owner's answer to the existence check.
    pub fn on_check_result(&self, exists: bool) {
        if exists {
            self.flush();
        } else if self.state() == RefState::Check {
            debug!(entity_type = self.entity_type, entity_id = self.entity_id, "entity does not exist");
            self.invalidate();
        }
    }

    /// Resolves request `seq` with a forwarded reply. A not-exists code also
    /// invalidates the ref, so later calls fail without traffic.
    pub fn on_forward_response(&self, seq: i32, msg: BoxMessage) -> bool {
        self.touch();
        let gone = msg
            .downcast_ref::<ReturnCode>()
            .is_some_and(|rc| rc.code == self.not_exists_code);
        let matched = self.cache.receive_response(seq, msg);
        if gone {
            debug!(entity_type = self.entity_type, entity_id = self.entity_id, "entity disappeared");
            self.invalidate();
        }
        matched
    }

    pub fn handle_exception(&self, seq: i32, err: CallError) -> bool {
        self.cache.handle_exception(seq, err)
    }

    /// Moves to INVALID, discarding queued traffic and failing every pending
    /// call with the not-exists error. Returns false if already INVALID.
    pub fn invalidate(&self) -> bool {
        let (prev, drained) = {
            let mut queue = self.lock_queue();
            let prev = self.state.swap(INVALID, Ordering::AcqRel);
            if prev != INVALID {
                self.mark_state_change();
            }
            (prev, queue.drain(..).collect::<Vec<_>>())
        };

        let err = self.not_exists();
        for q in drained.iter().filter(|q| q.seq != 0) {
            self.cache.handle_exception(q.seq, err);
        }
        let failed = self.cache.fail_all(err);
        if prev != INVALID {
            debug!(
                entity_type = self.entity_type,
                entity_id = self.entity_id,
                discarded = drained.len(),
                failed,
                "entity ref invalidated"
            );
        }
        prev != INVALID
    }

    /// Returns a CHECK that never left this server to INIT, failing the
    /// queued requests with `err`. Says nothing about the entity, so the next
    /// call checks again.
    fn reset(&self, err: CallError) {
        let drained = {
            let mut queue = self.lock_queue();
            if self
                .state
                .compare_exchange(CHECK, INIT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.mark_state_change();
            queue.drain(..).collect::<Vec<_>>()
        };
        for q in drained.iter().filter(|q| q.seq != 0) {
            self.cache.handle_exception(q.seq, err);
        }
    }

    /// Expires callbacks and applies the state timeouts.
    pub fn sweep(&self, now: Instant, policy: &SweepPolicy) -> SweepOutcome {
        self.cache.check_expired(now);

        let now_ms = self.millis(now);
        let in_state = Duration::from_millis(now_ms.saturating_sub(self.state_ms.load(Ordering::Acquire)));
        match self.state() {
            RefState::Check => {
                if in_state >= policy.check_timeout {
                    warn!(
                        entity_type = self.entity_type,
                        entity_id = self.entity_id,
                        "existence check unanswered"
                    );
                    self.invalidate();
                }
                SweepOutcome::Keep
            }
            RefState::Invalid if in_state >= policy.invalid_grace => SweepOutcome::Remove,
            RefState::Invalid => SweepOutcome::Keep,
            RefState::Init | RefState::Run => {
                let idle = Duration::from_millis(now_ms.saturating_sub(self.last_ms.load(Ordering::Acquire)));
                if idle >= policy.idle_threshold && self.cache.is_empty() && self.queued_len() == 0 {
                    SweepOutcome::Remove
                } else {
                    SweepOutcome::Keep
                }
            }
        }
    }

    /// Fails everything pending with a shutdown error.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Queued> = self.lock_queue().drain(..).collect();
        for q in drained.iter().filter(|q| q.seq != 0) {
            self.cache.handle_exception(q.seq, CallError::Shutdown);
        }
        self.cache.shutdown()
    }

    fn submit_request(&self, seq: i32, msg: &dyn Message) {
        self.touch();
        match msg.to_bytes() {
            Ok(data) => self.submit(Queued {
                seq,
                msg_id: msg.msg_id(),
                data,
            }),
            Err(e) => {
                warn!(seq, error = %e, "request could not be encoded");
                self.cache.handle_exception(seq, CallError::Encode);
            }
        }
    }

    fn submit(&self, q: Queued) {
        let seq = q.seq;
        let failed = {
            let mut queue = self.lock_queue();
            match self.state() {
                RefState::Run => self.send_queued(q).err(),
                RefState::Invalid => Some(self.not_exists()),
                RefState::Init | RefState::Check => {
                    queue.push_back(q);
                    None
                }
            }
        };

        match failed {
            Some(err) if seq != 0 => {
                self.cache.handle_exception(seq, err);
            }
            Some(err) => {
                trace!(entity_type = self.entity_type, entity_id = self.entity_id, error = %err, "tell dropped");
            }
            None => self.check(),
        }
    }

    fn flush(&self) {
        let mut failed = Vec::new();
        {
            let mut queue = self.lock_queue();
            if self
                .state
                .compare_exchange(CHECK, RUN, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.mark_state_change();
            debug!(
                entity_type = self.entity_type,
                entity_id = self.entity_id,
                queued = queue.len(),
                "entity confirmed"
            );

            while let Some(q) = queue.pop_front() {
                let seq = q.seq;
                if seq != 0 && !self.cache.contains(seq) {
                    trace!(seq, "skipping expired request");
                    continue;
                }
                if let Err(err) = self.send_queued(q) {
                    if seq != 0 {
                        failed.push((seq, err));
                    }
                }
            }
        }
        for (seq, err) in failed {
            self.cache.handle_exception(seq, err);
        }
    }

    fn send_check(&self) -> Result<(), CallError> {
        let addr = self.address.ok_or(CallError::Unreachable)?;
        let env = EntityEnvelope::check_request(self.route(addr), self.entity_type, self.entity_id);
        self.send_to(addr, &env)
    }

    fn send_queued(&self, q: Queued) -> Result<(), CallError> {
        let addr = self.address.ok_or(CallError::Unreachable)?;
        let env = EntityEnvelope::forward_request(
            self.route(addr),
            q.seq,
            self.entity_type,
            self.entity_id,
            q.msg_id,
            q.data,
        );
        self.send_to(addr, &env)
    }

    fn send_to(&self, addr: EntityAddress, env: &EntityEnvelope) -> Result<(), CallError> {
        let hop = self
            .router
            .route(addr.server_type, addr.server_id)
            .ok_or(CallError::Unreachable)?;
        let frame = (env as &dyn Message).to_frame(0).map_err(|_| CallError::Encode)?;
        hop.link().conn.send(frame).map_err(CallError::from)
    }

    fn route(&self, addr: EntityAddress) -> Route {
        let local = self.router.local();
        Route::new(local.server_type, local.server_id, addr.server_type, addr.server_id)
    }

    fn not_exists(&self) -> CallError {
        CallError::from_code(self.not_exists_code)
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.base).as_millis() as u64
    }

    fn touch(&self) {
        self.last_ms.store(self.millis(Instant::now()), Ordering::Release);
    }

    fn mark_state_change(&self) {
        self.state_ms.store(self.millis(Instant::now()), Ordering::Release);
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("pending", &self.cache.len())
            .finish()
    }
}
