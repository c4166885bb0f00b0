//! Per-conversation admission control for response generation.
//!
//! Each conversation id maps to a capacity-1 semaphore. Holding the
//! [`GenerationPermit`] means holding the conversation; dropping it releases
//! the conversation on every path, including panics and task cancellation.
//! Gates are created on first use and removed once nobody holds or waits on
//! them, so the map only tracks conversations with live generations.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type GateMap = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// The gate was closed while waiting. Gates are never closed by this module,
/// so seeing this means the manager is being torn down.
#[derive(Debug, Error)]
#[error("generation gate for conversation {0} was closed")]
pub struct GateClosed(pub String);

/// Per-conversation capacity-1 gates.
#[derive(Debug, Default, Clone)]
pub struct GenerationManager {
    gates: GateMap,
}

impl GenerationManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the conversation without waiting. `None` means another generation holds it.
    #[must_use]
    pub fn try_acquire(&self, conversation_id: &str) -> Option<GenerationPermit> {
        let gate = self.gate(conversation_id);
        let permit = Arc::clone(&gate.semaphore).try_acquire_owned().ok()?;
        Some(GenerationPermit {
            _permit: permit,
            gate,
        })
    }

    /// Waits until the conversation is free and takes it.
    ///
    /// Dropping the returned future while it waits gives up the place in line.
    ///
    /// # Errors
    /// Returns [`GateClosed`] if the gate was closed while waiting.
    pub async fn acquire(&self, conversation_id: &str) -> Result<GenerationPermit, GateClosed> {
        let gate = self.gate(conversation_id);
        let permit = Arc::clone(&gate.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed(conversation_id.to_string()))?;
        Ok(GenerationPermit {
            _permit: permit,
            gate,
        })
    }

    /// Returns whether a generation currently holds `conversation_id`.
    #[must_use]
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|semaphore| semaphore.available_permits() == 0)
    }

    /// Number of conversations with a holder or a waiter.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn gate(&self, conversation_id: &str) -> GateRef {
        let semaphore = Arc::clone(
            self.lock()
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        );
        GateRef {
            conversation_id: conversation_id.to_string(),
            semaphore,
            gates: Arc::clone(&self.gates),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counted reference to a gate; the last one out removes the map entry.
struct GateRef {
    conversation_id: String,
    semaphore: Arc<Semaphore>,
    gates: GateMap,
}

impl Drop for GateRef {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // Every holder and waiter clones the semaphore under this lock, so a
        // count of two (map + self) means nobody else can reach it.
        let idle = gates
            .get(&self.conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.semaphore))
            && Arc::strong_count(&self.semaphore) == 2;
        if idle {
            gates.remove(&self.conversation_id);
        }
    }
}

/// Exclusive hold on one conversation's generation slot.
///
/// Field order matters: the semaphore permit is released before the gate
/// reference checks whether the entry can be pruned.
pub struct GenerationPermit {
    _permit: OwnedSemaphorePermit,
    gate: GateRef,
}

impl GenerationPermit {
    /// Conversation this permit holds.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.gate.conversation_id
    }
}

impl fmt::Debug for GenerationPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationPermit")
            .field("conversation_id", &self.gate.conversation_id)
            .finish_non_exhaustive()
    }
}
