//! # Entity references
//!
//! An `EntityRef` addresses an entity by `(entity_type, entity_id)` without
//! the caller knowing where it lives.
//!
//! References are organized as an exhaustive enum,
//! with each variant implemented in its own module under `src/entity/`.
//!
//! - **Local**: the entity runs in this process; calls are enqueued on its mailbox.
//! - **Remote**: the entity is owned by another server; calls are checked,
//!   queued and forwarded.
//! - **Empty**: the entity does not exist; calls fail immediately.

pub mod empty;
pub mod local;
pub mod remote;

pub use empty::EmptyRef;
pub use local::LocalRef;
pub use remote::RefState;
pub use remote::RemoteRef;
pub use remote::SweepOutcome;
pub use remote::SweepPolicy;

use std::sync::Arc;
use std::time::Duration;

use meshrpc::BoxMessage;

use crate::callback::CallResult;
use crate::callback::Reply;

#[derive(Debug, Clone)]
pub enum EntityRef {
    Local(LocalRef),
    Remote(Arc<RemoteRef>),
    Empty(EmptyRef),
}

impl EntityRef {
    pub fn entity_type(&self) -> i32 {
        match self {
            Self::Local(r) => r.entity_type(),
            Self::Remote(r) => r.entity_type(),
            Self::Empty(r) => r.entity_type(),
        }
    }

    pub fn entity_id(&self) -> i64 {
        match self {
            Self::Local(r) => r.entity_id(),
            Self::Remote(r) => r.entity_id(),
            Self::Empty(r) => r.entity_id(),
        }
    }

    /// One-way send. Delivery is not confirmed.
    pub fn tell(&self, msg: BoxMessage) {
        match self {
            Self::Local(r) => r.tell(msg),
            Self::Remote(r) => r.tell(&*msg),
            Self::Empty(r) => r.tell(msg),
        }
    }

    /// Sends a request and resolves with the response, or an error once
    /// `timeout` has passed.
    pub fn ask(&self, msg: BoxMessage, timeout: Duration) -> Reply {
        match self {
            Self::Local(r) => r.ask(msg, timeout),
            Self::Remote(r) => r.ask(&*msg, timeout),
            Self::Empty(r) => r.ask(msg),
        }
    }

    /// Like `ask`, resolving through `handler` instead of a future.
    pub fn ask_with(
        &self,
        msg: BoxMessage,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        match self {
            Self::Local(r) => r.ask_with(msg, timeout, handler),
            Self::Remote(r) => r.ask_with(&*msg, timeout, handler),
            Self::Empty(r) => r.ask_with(msg, handler),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty(_))
    }
}
