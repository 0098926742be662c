//! Signaling Module - EventBus für den Call-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen, halten und wiederherstellen
//! - Eingehende Frames parsen und als typisierte Events verteilen
//! - Listener pro Event-Typ in Registrierungsreihenfolge aufrufen
//!

mod client;
mod listeners;
mod messages;

pub use client::{EventBus, SignalingError};
pub use listeners::{Listener, ListenerId};
pub use messages::*;
