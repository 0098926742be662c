//! Call Control Module - REST Control-Plane
//!
//! One-shot Requests an den Server: wählen, annehmen, ablehnen, auflegen.
//! Die State-Machine kennt nur den `CallControl`-Trait, die HTTP-Umsetzung
//! steckt in `HttpCallControl`.

mod http;

pub use http::HttpCallControl;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Call not found: {0}")]
    NotFound(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Antwort auf `POST /calls/make`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialResponse {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(default)]
    pub status: String,
}

/// Steueraktionen auf einem Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Dial,
    Accept,
    Reject,
    Hangup,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ControlAction::Dial => "dial",
            ControlAction::Accept => "accept",
            ControlAction::Reject => "reject",
            ControlAction::Hangup => "hangup",
        })
    }
}

/// Prüft die Zielnummer vor dem Request
pub fn validate_number(number: &str) -> Result<&str, ControlError> {
    let trimmed = number.trim();
    if trimmed.is_empty() {
        return Err(ControlError::Validation(
            "phone number must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

// ============================================================================
// TRAIT
// ============================================================================

/// Control-Plane, wie sie die State-Machine sieht
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn dial(&self, number: &str) -> Result<DialResponse, ControlError>;

    async fn accept(&self, call_id: &str) -> Result<(), ControlError>;

    async fn reject(&self, call_id: &str) -> Result<(), ControlError>;

    async fn hangup(&self, call_id: &str) -> Result<(), ControlError>;

    /// Führt eine Aktion auf einem bestehenden Anruf aus
    async fn perform(&self, action: ControlAction, call_id: &str) -> Result<(), ControlError> {
        match action {
            ControlAction::Accept => self.accept(call_id).await,
            ControlAction::Reject => self.reject(call_id).await,
            ControlAction::Hangup => self.hangup(call_id).await,
            ControlAction::Dial => Err(ControlError::Validation(
                "dial is not an action on an existing call".to_string(),
            )),
        }
    }
}
