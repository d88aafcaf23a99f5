//! Entities known not to exist.

use meshrpc::BoxMessage;
use tracing::trace;

use crate::callback::CallError;
use crate::callback::CallResult;
use crate::callback::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyRef {
    entity_type: i32,
    entity_id: i64,
    not_exists_code: i32,
}

impl EmptyRef {
    pub fn new(entity_type: i32, entity_id: i64, not_exists_code: i32) -> Self {
        Self {
            entity_type,
            entity_id,
            not_exists_code,
        }
    }

    pub fn entity_type(&self) -> i32 {
        self.entity_type
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    pub fn error(&self) -> CallError {
        CallError::from_code(self.not_exists_code)
    }

    pub fn tell(&self, msg: BoxMessage) {
        trace!(
            entity_type = self.entity_type,
            entity_id = self.entity_id,
            msg_id = msg.msg_id(),
            "tell to missing entity dropped"
        );
    }

    pub fn ask(&self, _msg: BoxMessage) -> Reply {
        Reply::ready(Err(self.error()))
    }

    pub fn ask_with(&self, _msg: BoxMessage, handler: impl FnOnce(CallResult) + Send + 'static) {
        handler(Err(self.error()))
    }
}
