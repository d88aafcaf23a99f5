//! # Mailboxes
//!
//! Each local entity runs on its own task and is reached only by enqueueing.
//! Entity logic never runs on the caller's task, so a handler sees its
//! messages one at a time and in arrival order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use meshrpc::BoxMessage;
use meshrpc::ReturnCode;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::callback::CallError;
use crate::callback::CallResult;
use crate::callback::Callback;
use crate::callback::CallbackCache;
use crate::callback::Reply;
use crate::seq::SeqGenerator;

/// Entity and service logic: takes a message, maybe returns a response.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, msg: BoxMessage) -> Option<BoxMessage>;
}

impl<F> MessageHandler for F
where
    F: Fn(BoxMessage) -> Option<BoxMessage> + Send + Sync + 'static,
{
    fn handle_message(&self, msg: BoxMessage) -> Option<BoxMessage> {
        self(msg)
    }
}

/// Runs `handler`, answering with a bare OK code when it has nothing to say.
pub(crate) fn respond(handler: &dyn MessageHandler, msg: BoxMessage) -> BoxMessage {
    handler
        .handle_message(msg)
        .unwrap_or_else(|| Box::new(ReturnCode::ok()))
}

enum Job {
    Tell(BoxMessage),
    Ask(i32, BoxMessage),
}

struct Shared {
    seq: SeqGenerator,
    cache: CallbackCache,
}

/// Handle to an entity's task. Cloning shares the same task.
#[derive(Clone)]
pub struct Mailbox {
    entity_type: i32,
    entity_id: i64,
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
}

impl Mailbox {
    /// Spawns the entity task. Pending asks are swept for expiry every
    /// `sweep_interval`.
    pub fn spawn(
        entity_type: i32,
        entity_id: i64,
        handler: Arc<dyn MessageHandler>,
        sweep_interval: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let shared = Arc::new(Shared {
            seq: SeqGenerator::new(),
            cache: CallbackCache::new(),
        });

        let task_shared = shared.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(Job::Tell(msg)) => {
                            let _ = handler.handle_message(msg);
                        }
                        Some(Job::Ask(seq, msg)) => {
                            if !task_shared.cache.contains(seq) {
                                trace!(entity_type, entity_id, seq, "skipping expired ask");
                                continue;
                            }
                            let resp = respond(handler.as_ref(), msg);
                            task_shared.cache.receive_response(seq, resp);
                        }
                        None => break,
                    },
                    _ = sweep.tick() => {
                        task_shared.cache.check_expired(Instant::now());
                    }
                }
            }
            task_shared.cache.shutdown();
            debug!(entity_type, entity_id, "mailbox stopped");
        });

        Self {
            entity_type,
            entity_id,
            tx,
            shared,
        }
    }

    pub fn entity_type(&self) -> i32 {
        self.entity_type
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    /// Enqueues a one-way message. Returns false once the task has stopped.
    pub fn tell(&self, msg: BoxMessage) -> bool {
        self.tx.send(Job::Tell(msg)).is_ok()
    }

    pub fn ask(&self, msg: BoxMessage, timeout: Duration) -> Reply {
        let seq = self.shared.seq.next();
        let (cb, reply) = Callback::new(seq, timeout);
        self.shared.cache.add(cb);
        self.enqueue_ask(seq, msg);
        reply
    }

    pub fn ask_with(
        &self,
        msg: BoxMessage,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        let seq = self.shared.seq.next();
        self.shared.cache.add(Callback::with_handler(seq, timeout, handler));
        self.enqueue_ask(seq, msg);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.cache.len()
    }

    fn enqueue_ask(&self, seq: i32, msg: BoxMessage) {
        if self.tx.send(Job::Ask(seq, msg)).is_err() {
            self.shared.cache.handle_exception(seq, CallError::EntityNotExists);
        }
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
