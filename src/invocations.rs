//! Pending-invocation bookkeeping.
//!
//! The registry allocates correlation ids and holds a one-shot completion
//! slot per in-flight `invoke` call. Fire-and-forget sends never touch
//! it. Each slot is removed exactly once, when its matching completion is
//! observed; completions with no matching entry are dropped without
//! effect (late replies for abandoned calls, or unsolicited ids).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::HubError;

type CompletionSlot = oneshot::Sender<Result<Value, HubError>>;

/// Allocates invocation ids and correlates completions to pending calls.
///
/// Owned by exactly one connection object. The id counter never resets
/// for the life of the object; a fresh connection starts again at zero.
#[derive(Debug, Default)]
pub struct InvocationRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, CompletionSlot>>,
}

impl InvocationRegistry {
    /// Create an empty registry with the id counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current counter value as a string and advance it.
    ///
    /// Ids are unique for the lifetime of the connection object and are
    /// never reused.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Store a one-shot completion slot for `id` and return its receiver.
    ///
    /// Ids come from [`Self::next_id`], so an overwrite cannot happen in
    /// correct usage; the debug assertion guards against regressions.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Result<Value, HubError>> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.to_string(), tx);
        debug_assert!(previous.is_none(), "invocation id {id} registered twice");
        rx
    }

    /// Remove the slot for `id` without firing it.
    ///
    /// Used when frame transmission fails after registration; the caller
    /// already has the send error in hand.
    pub fn abandon(&self, id: &str) {
        self.pending.lock().expect("pending lock poisoned").remove(id);
    }

    /// Resolve or reject the pending call matching `id`.
    ///
    /// The slot fires at most once: it is removed before firing. An
    /// unknown id is dropped silently.
    pub fn complete(&self, id: &str, result: Option<Value>, error: Option<String>) {
        let slot = self.pending.lock().expect("pending lock poisoned").remove(id);
        let Some(slot) = slot else {
            log::debug!("Dropping completion for unknown invocation id '{id}'");
            return;
        };

        let outcome = match error {
            Some(message) => Err(HubError::Server(message)),
            None => Ok(result.unwrap_or(Value::Null)),
        };

        // The caller may have stopped waiting; a dead receiver is fine.
        let _ = slot.send(outcome);
    }

    /// Reject every outstanding pending call with `ConnectionClosed`.
    ///
    /// Runs when the connection transitions to closed, so callers never
    /// wait on a result that can no longer arrive.
    pub fn reject_all(&self) {
        let drained: Vec<CompletionSlot> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            log::debug!("Rejecting {} pending invocation(s) on close", drained.len());
        }
        for slot in drained {
            let _ = slot.send(Err(HubError::ConnectionClosed));
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}
