//! # Callback Cache
//!
//! In-flight requests keyed by sequence number.
//!
//! ## Invariants
//! - **Single Owner**: Each sequence number maps to at most one live entry.
//! - **Remover Resolves**: Every path that resolves an entry (reply, error,
//!   expiry, shutdown) first removes it from the map. Whoever wins the removal
//!   resolves the entry; everyone else sees nothing and backs off.
//! - **Sweep-Only Timeouts**: Expiry is detected by `check_expired`, never by a
//!   per-request timer. A reply arriving after its entry expired is dropped.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use meshrpc::BoxMessage;
use meshrpc::ReturnCode;
use meshrpc::code;

/// Why a call produced no response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    Timeout,
    Shutdown,
    ConnectionLost,
    InvalidConnection,
    Unreachable,
    EntityNotExists,
    ForwardFailed,
    NoHandler,
    Encode,
    Decode,
    /// A non-zero return code without a dedicated variant.
    Remote(i32),
}

impl CallError {
    /// The wire return code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Timeout => code::TIMEOUT,
            Self::Shutdown => code::SHUTDOWN,
            Self::ConnectionLost => code::CONNECTION_LOST,
            Self::InvalidConnection => code::INVALID_CONNECTION,
            Self::Unreachable => code::DESTINATION_UNREACHABLE,
            Self::EntityNotExists => code::ENTITY_NOT_EXISTS,
            Self::ForwardFailed => code::FORWARD_FAILED,
            Self::NoHandler => code::NO_HANDLER,
            Self::Encode => code::ENCODE_FAILED,
            Self::Decode => code::DECODE_FAILED,
            Self::Remote(c) => *c,
        }
    }

    pub fn from_code(c: i32) -> Self {
        match c {
            code::TIMEOUT => Self::Timeout,
            code::SHUTDOWN => Self::Shutdown,
            code::CONNECTION_LOST => Self::ConnectionLost,
            code::INVALID_CONNECTION => Self::InvalidConnection,
            code::DESTINATION_UNREACHABLE => Self::Unreachable,
            code::ENTITY_NOT_EXISTS => Self::EntityNotExists,
            code::FORWARD_FAILED => Self::ForwardFailed,
            code::NO_HANDLER => Self::NoHandler,
            code::ENCODE_FAILED => Self::Encode,
            code::DECODE_FAILED => Self::Decode,
            other => Self::Remote(other),
        }
    }

    /// The error as a reply body.
    pub fn to_return_code(&self) -> ReturnCode {
        ReturnCode::new(self.code())
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Shutdown => write!(f, "request owner shut down"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::InvalidConnection => write!(f, "connection is not active"),
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::EntityNotExists => write!(f, "entity does not exist"),
            Self::ForwardFailed => write!(f, "relay could not forward request"),
            Self::NoHandler => write!(f, "no handler for message"),
            Self::Encode => write!(f, "request could not be encoded"),
            Self::Decode => write!(f, "message could not be decoded"),
            Self::Remote(c) => write!(f, "remote returned code {}", c),
        }
    }
}

impl std::error::Error for CallError {}

pub type CallResult = std::result::Result<BoxMessage, CallError>;

/// Turns a decoded reply into a call outcome: a `ReturnCode` other than OK is
/// an error, anything else is the response.
pub fn into_result(msg: BoxMessage) -> CallResult {
    let rc = msg.downcast_ref::<ReturnCode>().map(|rc| rc.code);
    match rc {
        Some(c) if c != code::OK => Err(CallError::from_code(c)),
        _ => Ok(msg),
    }
}

/// Future side of a future-style callback.
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<CallResult>,
}

impl Reply {
    /// A reply that is already resolved.
    pub fn ready(result: CallResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for Reply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the owning cache went away unresolved.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CallError::Shutdown)))
    }
}

pub type Handler = Box<dyn FnOnce(CallResult) + Send + 'static>;

enum Completion {
    Reply(oneshot::Sender<CallResult>),
    // Never locked; the mutex only lets the cache be shared across tasks.
    Handler(Mutex<Handler>),
}

/// A pending request: sequence number, absolute expiry and how to resolve it.
pub struct Callback {
    seq: i32,
    expires_at: Instant,
    completion: Completion,
}

impl Callback {
    /// A future-style callback and the `Reply` it resolves.
    pub fn new(seq: i32, timeout: Duration) -> (Self, Reply) {
        let (tx, rx) = oneshot::channel();
        let cb = Self {
            seq,
            expires_at: Instant::now() + timeout,
            completion: Completion::Reply(tx),
        };
        (cb, Reply { rx })
    }

    /// A callback-style entry; `handler` runs on whichever task resolves it.
    pub fn with_handler(
        seq: i32,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) -> Self {
        Self {
            seq,
            expires_at: Instant::now() + timeout,
            completion: Completion::Handler(Mutex::new(Box::new(handler))),
        }
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn resolve(self, result: CallResult) {
        match self.completion {
            Completion::Reply(tx) => {
                let _ = tx.send(result);
            }
            Completion::Handler(handler) => {
                let handler = handler.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
                handler(result)
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("seq", &self.seq)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CallbackCache {
    entries: DashMap<i32, Callback>,
}

impl CallbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cb: Callback) {
        if let Some(old) = self.entries.insert(cb.seq, cb) {
            warn!(seq = old.seq, "sequence number reused while still pending");
            old.resolve(Err(CallError::Timeout));
        }
    }

    /// Resolves the entry for `seq` with a reply.
    ///
    /// Returns false only when nothing was waiting and the message is not a
    /// bare `ReturnCode`; unmatched return codes are acknowledged anyway.
    pub fn receive_response(&self, seq: i32, msg: BoxMessage) -> bool {
        let is_return_code = msg.is::<ReturnCode>();
        match self.entries.remove(&seq) {
            Some((_, cb)) => {
                cb.resolve(into_result(msg));
                true
            }
            None => {
                debug!(seq, "reply without a pending request");
                is_return_code
            }
        }
    }

    /// Fails one entry. Returns false if it was already gone.
    pub fn handle_exception(&self, seq: i32, err: CallError) -> bool {
        match self.entries.remove(&seq) {
            Some((_, cb)) => {
                cb.resolve(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fails every entry whose expiry is at or before `now` with `Timeout`.
    pub fn check_expired(&self, now: Instant) -> usize {
        let expired: Vec<i32> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| *e.key())
            .collect();

        let mut count = 0;
        for seq in expired {
            if let Some((_, cb)) = self.entries.remove_if(&seq, |_, cb| cb.is_expired(now)) {
                debug!(seq, "request timed out");
                cb.resolve(Err(CallError::Timeout));
                count += 1;
            }
        }
        count
    }

    /// Fails every remaining entry with `err`.
    pub fn fail_all(&self, err: CallError) -> usize {
        let keys: Vec<i32> = self.entries.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter(|seq| self.handle_exception(*seq, err))
            .count()
    }

    pub fn shutdown(&self) -> usize {
        self.fail_all(CallError::Shutdown)
    }

    pub fn contains(&self, seq: i32) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
