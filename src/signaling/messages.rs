//! Message Types für das Signaling-Protokoll
//!
//! Der Server schickt JSON-Frames der Form `{"event": "<name>", "data": {...}}`.
//! Diese Strukturen bilden das Vokabular typsicher ab.

use serde::{Deserialize, Serialize};

// ============================================================================
// SERVER → CLIENT PAYLOADS
// ============================================================================

/// Eingehender Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallPayload {
    #[serde(rename = "callId", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Server hat den ausgehenden Anruf angelegt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInitiatedPayload {
    #[serde(rename = "callId", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Statuswechsel eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatusPayload {
    #[serde(rename = "callId", default)]
    pub call_id: Option<String>,
    pub status: String,
}

/// Anruf wurde serverseitig beendet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallEndedPayload {
    #[serde(rename = "callId", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Alle Nachrichten, die der Server über die Verbindung schickt
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    IncomingCall(IncomingCallPayload),
    CallInitiated(CallInitiatedPayload),
    CallStatusUpdate(CallStatusPayload),
    CallEnded(CallEndedPayload),
}

impl ServerMessage {
    /// Parst einen Text-Frame. `None` bei unbekannten Events oder kaputtem JSON.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                // Unbekannte Event-Namen sind kein Fehler, der Server darf mehr schicken
                match serde_json::from_str::<RawFrame>(text) {
                    Ok(raw) if !EventKind::is_known(&raw.event) => {
                        tracing::debug!("Ignoring unknown signaling event '{}'", raw.event);
                    }
                    _ => tracing::warn!("Malformed signaling frame: {}", e),
                }
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
}

// ============================================================================
// CLIENT → SERVER
// ============================================================================

/// Ausgehender Frame, gleiches Format wie eingehend
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame<'a, T: Serialize> {
    pub event: &'a str,
    pub data: T,
}

// ============================================================================
// TYPED EVENTS
// ============================================================================

/// Events, die der EventBus an Listener verteilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    IncomingCall(IncomingCallPayload),
    CallInitiated(CallInitiatedPayload),
    CallStatusUpdate(CallStatusPayload),
    CallEnded(CallEndedPayload),

    /// Verbindung steht (auch nach Reconnect)
    Connect,
    /// Verbindung verloren
    Disconnect,
    /// Transportfehler
    Error { message: String },
}

impl SignalingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SignalingEvent::IncomingCall(_) => EventKind::IncomingCall,
            SignalingEvent::CallInitiated(_) => EventKind::CallInitiated,
            SignalingEvent::CallStatusUpdate(_) => EventKind::CallStatusUpdate,
            SignalingEvent::CallEnded(_) => EventKind::CallEnded,
            SignalingEvent::Connect => EventKind::Connect,
            SignalingEvent::Disconnect => EventKind::Disconnect,
            SignalingEvent::Error { .. } => EventKind::Error,
        }
    }
}

impl From<ServerMessage> for SignalingEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::IncomingCall(p) => SignalingEvent::IncomingCall(p),
            ServerMessage::CallInitiated(p) => SignalingEvent::CallInitiated(p),
            ServerMessage::CallStatusUpdate(p) => SignalingEvent::CallStatusUpdate(p),
            ServerMessage::CallEnded(p) => SignalingEvent::CallEnded(p),
        }
    }
}

/// Schlüssel der Dispatch-Tabelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingCall,
    CallInitiated,
    CallStatusUpdate,
    CallEnded,
    Connect,
    Disconnect,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::IncomingCall,
        EventKind::CallInitiated,
        EventKind::CallStatusUpdate,
        EventKind::CallEnded,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Error,
    ];

    /// Name auf dem Draht bzw. des Lifecycle-Events
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IncomingCall => "incomingCall",
            EventKind::CallInitiated => "callInitiated",
            EventKind::CallStatusUpdate => "callStatusUpdate",
            EventKind::CallEnded => "callEnded",
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Error => "error",
        }
    }

    fn is_known(name: &str) -> bool {
        Self::ALL.iter().any(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================
