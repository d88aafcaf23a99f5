//! Entities hosted by this process.

use std::time::Duration;

use meshrpc::BoxMessage;
use tracing::debug;

use crate::callback::CallResult;
use crate::callback::Reply;
use crate::mailbox::Mailbox;

#[derive(Debug, Clone)]
pub struct LocalRef {
    mailbox: Mailbox,
}

impl LocalRef {
    pub fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }

    pub fn entity_type(&self) -> i32 {
        self.mailbox.entity_type()
    }

    pub fn entity_id(&self) -> i64 {
        self.mailbox.entity_id()
    }

    pub fn tell(&self, msg: BoxMessage) {
        if !self.mailbox.tell(msg) {
            debug!(
                entity_type = self.entity_type(),
                entity_id = self.entity_id(),
                "tell to stopped entity dropped"
            );
        }
    }

    /// Resolves with the handler's response, or a bare OK code when the
    /// handler returned nothing.
    pub fn ask(&self, msg: BoxMessage, timeout: Duration) -> Reply {
        self.mailbox.ask(msg, timeout)
    }

    pub fn ask_with(
        &self,
        msg: BoxMessage,
        timeout: Duration,
        handler: impl FnOnce(CallResult) + Send + 'static,
    ) {
        self.mailbox.ask_with(msg, timeout, handler)
    }
}
