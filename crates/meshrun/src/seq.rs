//! # Sequence numbers
//!
//! Request sequence numbers are positive `i32`s. Zero means "no reply
//! expected" and negative values mark replies, so the generator wraps from
//! `i32::MAX` back to 1 and never yields anything else.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

#[derive(Debug)]
pub struct SeqGenerator {
    last: AtomicI32,
}

impl SeqGenerator {
    pub const fn new() -> Self {
        Self { last: AtomicI32::new(0) }
    }

    /// Starts so that the next value handed out is `last + 1`.
    pub const fn starting_after(last: i32) -> Self {
        Self { last: AtomicI32::new(last) }
    }

    pub fn next(&self) -> i32 {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = if current <= 0 || current == i32::MAX { 1 } else { current + 1 };
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SeqGenerator {
    fn default() -> Self {
        Self::new()
    }
}
