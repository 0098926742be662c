//! Projektion für die Präsentationsschicht
//!
//! Die UI liest nur `CallView` und hört auf `CallEvent`, rohe
//! Signaling-Events sieht sie nie.

use super::session::{CallDirection, CallPhase, CallSession, EndReason};
use super::timer::format_duration;
use crate::control::ControlAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Zustand der State-Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Connected,
    Ended,
}

impl From<CallPhase> for CallState {
    fn from(phase: CallPhase) -> Self {
        match phase {
            CallPhase::Dialing => CallState::Dialing,
            CallPhase::Ringing => CallState::Ringing,
            CallPhase::Connected => CallState::Connected,
            CallPhase::Ended => CallState::Ended,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        })
    }
}

/// Aktueller Anruf, so wie die UI ihn rendert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub state: CallState,
    pub call_id: Option<String>,
    pub direction: Option<CallDirection>,
    pub counterpart_number: String,
    pub counterpart_name: Option<String>,
    pub end_reason: Option<EndReason>,
    pub connected_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub formatted_duration: String,
    /// Laufender Control-Request, z.B. für einen Spinner
    pub pending_action: Option<ControlAction>,
}

impl CallView {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            direction: None,
            counterpart_number: String::new(),
            counterpart_name: None,
            end_reason: None,
            connected_at: None,
            duration_seconds: 0,
            formatted_duration: format_duration(0),
            pending_action: None,
        }
    }

    pub(crate) fn of_session(
        session: &CallSession,
        live_seconds: u64,
        pending_action: Option<ControlAction>,
    ) -> Self {
        let duration_seconds = match session.phase() {
            CallPhase::Ended => session.frozen_duration(),
            CallPhase::Connected => live_seconds,
            CallPhase::Dialing | CallPhase::Ringing => 0,
        };

        Self {
            state: session.phase().into(),
            call_id: session.id.clone(),
            direction: Some(session.direction),
            counterpart_number: session.counterpart_number.clone(),
            counterpart_name: session.counterpart_name.clone(),
            end_reason: session.end_reason(),
            connected_at: session.connected_at(),
            duration_seconds,
            formatted_duration: format_duration(duration_seconds),
            pending_action,
        }
    }
}

impl Default for CallView {
    fn default() -> Self {
        Self::idle()
    }
}

/// Was mit einem zweiten eingehenden Anruf passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecondCallDisposition {
    /// Automatisch beim Server abgelehnt
    AutoRejected,
    /// Nur gemeldet, die UI entscheidet
    Surfaced,
}

/// Events an die Präsentationsschicht
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        from: CallState,
        to: CallState,
    },
    SecondCall {
        call_id: Option<String>,
        counterpart_number: String,
        counterpart_name: Option<String>,
        disposition: SecondCallDisposition,
    },
    /// Beendete Session wurde verworfen, UI kehrt zu Idle zurück
    SessionCleared {
        call_id: Option<String>,
        end_reason: Option<EndReason>,
    },
}
