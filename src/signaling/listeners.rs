//! Listener-Registry
//!
//! Dispatch-Tabelle von `EventKind` auf eine geordnete Liste von Callbacks.
//! Die Reihenfolge der Registrierung bestimmt die Aufrufreihenfolge.

use super::messages::{EventKind, SignalingEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback für ein Signaling-Event
pub type Listener = Arc<dyn Fn(&SignalingEvent) + Send + Sync>;

/// Identität einer Registrierung, wird für `unsubscribe` gebraucht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    table: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl ListenerRegistry {
    pub fn add(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table.write().entry(kind).or_default().push((id, listener));
        id
    }

    /// Entfernt einen bestimmten Listener oder, ohne `id`, alle für `kind`.
    /// Gibt die Anzahl entfernter Registrierungen zurück.
    pub fn remove(&self, kind: EventKind, id: Option<ListenerId>) -> usize {
        let mut table = self.table.write();
        match id {
            None => table.remove(&kind).map(|v| v.len()).unwrap_or(0),
            Some(id) => {
                let Some(list) = table.get_mut(&kind) else {
                    return 0;
                };
                let before = list.len();
                list.retain(|(entry, _)| *entry != id);
                let removed = before - list.len();
                if list.is_empty() {
                    table.remove(&kind);
                }
                removed
            }
        }
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.table.read().get(&kind).map(|v| v.len()).unwrap_or(0)
    }

    /// Ruft alle Listener für das Event synchron auf.
    ///
    /// Es wird über einen Snapshot iteriert, damit Listener sich selbst
    /// (oder andere) abmelden können, ohne dass die Registry blockiert.
    /// Ein panischer Listener wird geloggt, die übrigen laufen weiter.
    pub fn dispatch(&self, event: &SignalingEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, Listener)> = match self.table.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        for (id, listener) in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!("Listener {:?} for '{}' panicked", id, kind);
            }
        }

        snapshot.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
