//! Last known errors of a reconciliation
//!
//! Readiness checks record why an object is still pending and forget the
//! reason once the object converges, so the list always describes what is
//! currently outstanding. The handler uses it to enrich a timeout failure.
//!
//! One accumulator is created per invocation and passed down the call chain;
//! nothing is shared between invocations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics {
    entries: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reason unless it is already present
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.entries.contains(&message) {
            self.entries.push(message);
        }
    }

    /// Forget every reason mentioning `name`
    pub fn pop(&mut self, name: &str) {
        self.entries.retain(|entry| !entry.contains(name));
    }

    /// Merge reasons reported elsewhere, keeping them deduplicated
    pub fn extend<I: IntoIterator<Item = String>>(&mut self, messages: I) {
        for message in messages {
            self.push(message);
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
