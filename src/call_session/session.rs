//! CallSession - der eine maßgebliche Datensatz pro Anruf
//!
//! Alle Phasenwechsel laufen über `CallSession::apply`, eine reine Funktion
//! ohne I/O. Sie erzwingt die Vorwärts-Ordnung
//! `dialing < ringing < connected < ended` und setzt `connected_at`
//! höchstens einmal.

use crate::call_session::CallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// PHASES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Dialing,
    Ringing,
    Connected,
    Ended,
}

impl CallPhase {
    fn rank(self) -> u8 {
        match self {
            CallPhase::Dialing => 0,
            CallPhase::Ringing => 1,
            CallPhase::Connected => 2,
            CallPhase::Ended => 3,
        }
    }

    /// Dialing, Ringing oder Connected
    pub fn is_active(self) -> bool {
        self != CallPhase::Ended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Rejected,
    LocalTimeout,
    LocalHangup,
}

impl EndReason {
    /// Übersetzt den `reason` aus `callEnded`
    pub fn from_wire(reason: &str) -> Option<Self> {
        match reason.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(EndReason::Completed),
            "failed" => Some(EndReason::Failed),
            "busy" => Some(EndReason::Busy),
            "no-answer" | "no_answer" => Some(EndReason::NoAnswer),
            "rejected" => Some(EndReason::Rejected),
            _ => None,
        }
    }
}

/// Ziel eines Phasenwechsels, z.B. aus der Status-Tabelle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseUpdate {
    Dialing,
    Ringing,
    Connected,
    Ended(EndReason),
}

impl PhaseUpdate {
    pub fn phase(self) -> CallPhase {
        match self {
            PhaseUpdate::Dialing => CallPhase::Dialing,
            PhaseUpdate::Ringing => CallPhase::Ringing,
            PhaseUpdate::Connected => CallPhase::Connected,
            PhaseUpdate::Ended(_) => CallPhase::Ended,
        }
    }
}

/// Feste Tabelle Server-Status → Phase
pub fn map_status(status: &str) -> Option<PhaseUpdate> {
    match status {
        "initiated" => Some(PhaseUpdate::Dialing),
        "ringing" => Some(PhaseUpdate::Ringing),
        "answered" | "in-progress" => Some(PhaseUpdate::Connected),
        "completed" => Some(PhaseUpdate::Ended(EndReason::Completed)),
        "failed" => Some(PhaseUpdate::Ended(EndReason::Failed)),
        "busy" => Some(PhaseUpdate::Ended(EndReason::Busy)),
        "no-answer" => Some(PhaseUpdate::Ended(EndReason::NoAnswer)),
        _ => None,
    }
}

/// Ergebnis von `CallSession::apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Gleiche Phase, nichts passiert
    Unchanged,
    /// Vorwärts in die neue Phase
    Advanced { from: CallPhase, to: CallPhase },
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anruf vom Anlegen bis zum Ende
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Lokale ID für Logs, existiert auch ohne Server-ID
    pub local_id: Uuid,
    pub id: Option<String>,
    pub direction: CallDirection,
    pub counterpart_number: String,
    pub counterpart_name: Option<String>,
    phase: CallPhase,
    end_reason: Option<EndReason>,
    connected_at: Option<DateTime<Utc>>,
    duration_seconds: u64,
}

impl CallSession {
    /// Ausgehender Anruf, vom Server bestätigt
    pub fn outgoing(id: Option<String>, number: String, name: Option<String>) -> Self {
        Self::new(id, CallDirection::Outgoing, CallPhase::Dialing, number, name)
    }

    /// Eingehender Anruf aus `incomingCall`
    pub fn incoming(id: Option<String>, number: String, name: Option<String>) -> Self {
        Self::new(id, CallDirection::Incoming, CallPhase::Ringing, number, name)
    }

    fn new(
        id: Option<String>,
        direction: CallDirection,
        phase: CallPhase,
        counterpart_number: String,
        counterpart_name: Option<String>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            id,
            direction,
            counterpart_number,
            counterpart_name,
            phase,
            end_reason: None,
            connected_at: None,
            duration_seconds: 0,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Eingefrorene Dauer, nur nach `ended` aussagekräftig
    pub fn frozen_duration(&self) -> u64 {
        self.duration_seconds
    }

    /// Gehört ein Event mit dieser Call-ID zu dieser Session?
    ///
    /// Events ohne ID und Sessions ohne ID passen immer.
    pub fn matches(&self, call_id: Option<&str>) -> bool {
        match (call_id, self.id.as_deref()) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => true,
        }
    }

    /// Wendet einen Phasenwechsel an.
    ///
    /// Rückschritte und alles nach `ended` sind Protokollverletzungen.
    pub fn apply(&mut self, update: PhaseUpdate, now: DateTime<Utc>) -> Result<Applied, CallError> {
        let target = update.phase();

        if self.phase == CallPhase::Ended {
            return Err(CallError::ProtocolViolation(format!(
                "session already ended, ignoring {:?}",
                update
            )));
        }
        if target.rank() < self.phase.rank() {
            return Err(CallError::ProtocolViolation(format!(
                "phase regression {:?} -> {:?}",
                self.phase, target
            )));
        }
        if target == self.phase {
            return Ok(Applied::Unchanged);
        }

        let from = self.phase;
        self.phase = target;
        match update {
            PhaseUpdate::Connected => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(now);
                }
            }
            PhaseUpdate::Ended(reason) => self.end_reason = Some(reason),
            PhaseUpdate::Dialing | PhaseUpdate::Ringing => {}
        }

        Ok(Applied::Advanced { from, to: target })
    }

    /// Friert die Dauer beim Ende ein
    pub fn freeze_duration(&mut self, elapsed_seconds: u64) {
        if self.phase == CallPhase::Ended {
            self.duration_seconds = elapsed_seconds;
        }
    }
}

/// Lookup für Anzeigenamen, gehört der Präsentationsschicht (Kontakte)
pub trait ContactDirectory: Send + Sync {
    fn display_name(&self, number: &str) -> Option<String>;
}

// ============================================================================
// TESTS
// ============================================================================
