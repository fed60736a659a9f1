//! Warnings accumulator
//!
//! Every skip, retry and fail-soft branch records a human-readable line here
//! and logs it at `warn`. Concurrent branches each write through their own
//! `Mutex<Warnings>` slot, owned by the caller, so lines survive a branch that
//! is abandoned mid-flight and the merged order still follows the input.

use std::sync::{Mutex, PoisonError};

/// Ordered, caller-owned list of warning lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings {
    items: Vec<String>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log one warning
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.items.push(message);
    }

    /// Record a message that was already logged where it arose
    pub fn push_quiet(&mut self, message: impl Into<String>) {
        self.items.push(message.into());
    }

    /// Append another accumulator's lines without logging them again
    pub fn extend(&mut self, other: Warnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }
}

/// Record and log one warning through a shared slot
pub fn record(slot: &Mutex<Warnings>, message: impl Into<String>) {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(message);
}

/// Take a slot's lines, leaving it empty
pub fn drain(slot: &Mutex<Warnings>) -> Warnings {
    std::mem::take(&mut *slot.lock().unwrap_or_else(PoisonError::into_inner))
}

impl IntoIterator for Warnings {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
