//! Call Session Module - State-Machine für den aktuellen Anruf
//!
//! Dieses Modul verwaltet:
//! - Die eine maßgebliche `CallSession` und ihre Phasen
//! - Den Gesprächs-Timer und den No-Answer-Timeout
//! - Die Projektion `CallView` für die UI
//! - Die Abstimmung zwischen Signaling-Events und Control-Requests

mod gate;
mod machine;
mod session;
mod timer;
mod view;

pub use machine::{CallSessionHandle, CallSessionMachine};
pub use session::{
    map_status, Applied, CallDirection, CallPhase, CallSession, ContactDirectory, EndReason,
    PhaseUpdate,
};
pub use timer::{format_duration, CallTimer};
pub use view::{CallEvent, CallState, CallView, SecondCallDisposition};

use crate::control::{ControlAction, ControlError};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: ControlAction,
        state: CallState,
    },

    #[error("Dial was cancelled before the server answered")]
    DialCancelled,

    /// Wird nur geloggt, nie an die UI gereicht
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Call session service stopped")]
    Stopped,
}
