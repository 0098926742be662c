//! Warteschlange für Control-Requests pro Call-ID
//!
//! Pro Call-ID ist höchstens ein Request unterwegs (der vorderste Eintrag).
//! Weitere Aktionen warten, bis der laufende Request abgeschlossen ist.

use super::CallError;
use crate::control::ControlAction;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

pub(crate) type Reply = oneshot::Sender<Result<(), CallError>>;

pub(crate) struct PendingControl {
    pub action: ControlAction,
    /// `None` bei Fire-and-forget (Hangup, Timeout, Auto-Reject)
    pub reply: Option<Reply>,
}

impl PendingControl {
    pub fn new(action: ControlAction, reply: Option<Reply>) -> Self {
        Self { action, reply }
    }

    pub fn respond(self, result: Result<(), CallError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

#[derive(Default)]
pub(crate) struct ControlGate {
    queues: HashMap<String, VecDeque<PendingControl>>,
}

impl ControlGate {
    /// Reiht ein. `true`, wenn die Queue vorher leer war und sofort gestartet werden darf.
    pub fn enqueue(&mut self, call_id: &str, pending: PendingControl) -> bool {
        let queue = self.queues.entry(call_id.to_string()).or_default();
        queue.push_back(pending);
        queue.len() == 1
    }

    /// Aktion, die gerade läuft bzw. als nächste startet
    pub fn front(&self, call_id: &str) -> Option<ControlAction> {
        self.queues
            .get(call_id)
            .and_then(|q| q.front())
            .map(|p| p.action)
    }

    /// Entfernt den vordersten Eintrag (abgeschlossen oder übersprungen)
    pub fn pop(&mut self, call_id: &str) -> Option<PendingControl> {
        let queue = self.queues.get_mut(call_id)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(call_id);
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_in_flight_per_call_id() {
        let mut gate = ControlGate::default();

        assert!(gate.enqueue("CA1", PendingControl::new(ControlAction::Accept, None)));
        assert!(!gate.enqueue("CA1", PendingControl::new(ControlAction::Hangup, None)));
        assert!(gate.enqueue("CA2", PendingControl::new(ControlAction::Reject, None)));

        assert_eq!(gate.front("CA1"), Some(ControlAction::Accept));
        assert_eq!(gate.pop("CA1").map(|p| p.action), Some(ControlAction::Accept));
        assert_eq!(gate.front("CA1"), Some(ControlAction::Hangup));
        assert!(gate.pop("CA1").is_some());

        assert!(gate.front("CA1").is_none());
        assert_eq!(gate.front("CA2"), Some(ControlAction::Reject));
        assert!(gate.pop("CA1").is_none());
    }

    #[tokio::test]
    async fn test_respond_delivers_result() {
        let (tx, rx) = oneshot::channel();
        PendingControl::new(ControlAction::Accept, Some(tx)).respond(Err(CallError::NoActiveCall));
        assert!(matches!(rx.await, Ok(Err(CallError::NoActiveCall))));
    }
}
