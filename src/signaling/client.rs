//! EventBus - WebSocket Client für den Signaling-Server
//!
//! Hält genau eine persistente Verbindung zum Server:
//! - Idempotentes `connect()`, explizites `disconnect()`
//! - Automatische Reconnection mit Backoff
//! - Heartbeat per WebSocket-Ping
//! - Typisierte Listener statt String-Events

use super::listeners::{Listener, ListenerId, ListenerRegistry};
use super::messages::{EventKind, OutboundFrame, ServerMessage, SignalingEvent};
use crate::config::SignalingConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// LINK STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum Outbound {
    Text(String),
}

struct Link {
    status: LinkStatus,
    /// Wird bei jedem connect()/disconnect() erhöht, alte Tasks erkennen sich daran
    generation: u64,
    outbound: Option<mpsc::Sender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    url: Url,
    config: SignalingConfig,
    listeners: ListenerRegistry,
    link: Mutex<Link>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.link.lock().generation == generation
    }

    /// Übernimmt eine frische Verbindung, falls die Generation noch gilt
    fn mark_connected(&self, generation: u64) -> Option<mpsc::Receiver<Outbound>> {
        let mut link = self.link.lock();
        if link.generation != generation {
            return None;
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        link.outbound = Some(tx);
        link.status = LinkStatus::Connected;
        Some(rx)
    }

    /// Verbindung ist weggebrochen (nicht durch uns)
    fn mark_lost(&self, generation: u64) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        link.outbound = None;
        link.status = if self.config.reconnect {
            LinkStatus::Reconnecting
        } else {
            LinkStatus::Disconnected
        };
        true
    }

    fn display_url(&self) -> String {
        let mut shown = self.url.clone();
        shown.set_query(None);
        shown.to_string()
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// Signaling-Transport mit typisiertem Publish/Subscribe
///
/// Wird einmal von der Application-Root erzeugt und per Handle (Clone)
/// weitergereicht.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Erstellt einen neuen EventBus (noch ohne Verbindung)
    pub fn new(config: SignalingConfig, auth_token: Option<&str>) -> Result<Self, SignalingError> {
        let url = signaling_url(&config.url, auth_token)?;

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                config,
                listeners: ListenerRegistry::default(),
                link: Mutex::new(Link {
                    status: LinkStatus::Disconnected,
                    generation: 0,
                    outbound: None,
                    task: None,
                }),
            }),
        })
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().status == LinkStatus::Connected
    }

    /// Registriert einen Listener für `kind`
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&SignalingEvent) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(callback);
        self.shared.listeners.add(kind, listener)
    }

    /// Entfernt einen Listener, ohne `id` alle Listener für `kind`
    pub fn unsubscribe(&self, kind: EventKind, id: Option<ListenerId>) -> usize {
        self.shared.listeners.remove(kind, id)
    }

    /// Anzahl registrierter Listener für `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared.listeners.count(kind)
    }

    /// Verteilt ein Event an alle Listener (auch für lokal erzeugte Lifecycle-Events)
    pub(crate) fn dispatch(&self, event: &SignalingEvent) {
        self.shared.listeners.dispatch(event);
    }

    /// Baut die Verbindung auf. Mehrfache Aufrufe sind ein No-Op.
    ///
    /// Fehler werden zusätzlich als `error`-Event an die Listener gemeldet.
    /// Ist Reconnect aktiv, wird im Hintergrund weiter versucht.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let generation = {
            let mut link = self.shared.link.lock();
            if link.status != LinkStatus::Disconnected {
                tracing::debug!("connect() ignored, link is {:?}", link.status);
                return Ok(());
            }
            link.status = LinkStatus::Connecting;
            link.generation += 1;
            link.generation
        };

        tracing::info!(
            "Connecting to signaling server: {}",
            self.shared.display_url()
        );

        match open_socket(&self.shared.url).await {
            Ok(stream) => {
                let Some(outbound) = self.shared.mark_connected(generation) else {
                    tracing::info!("Disconnected while connecting, dropping socket");
                    return Err(SignalingError::NotConnected);
                };

                // Connect geht an die Listener, bevor der erste Server-Frame gelesen wird
                tracing::info!("Connected to signaling server");
                self.dispatch(&SignalingEvent::Connect);

                let shared = Arc::clone(&self.shared);
                let task = tokio::spawn(supervise(shared, generation, stream, outbound));
                self.store_task(generation, task);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Signaling connection failed: {}", e);
                let retry = {
                    let mut link = self.shared.link.lock();
                    if link.generation != generation {
                        false
                    } else if self.shared.config.reconnect {
                        link.status = LinkStatus::Reconnecting;
                        true
                    } else {
                        link.status = LinkStatus::Disconnected;
                        false
                    }
                };

                self.dispatch(&SignalingEvent::Error {
                    message: e.to_string(),
                });

                if retry {
                    let shared = Arc::clone(&self.shared);
                    let task = tokio::spawn(async move {
                        if let Some((stream, outbound)) = reconnect(&shared, generation).await {
                            supervise(shared, generation, stream, outbound).await;
                        }
                    });
                    self.store_task(generation, task);
                }

                Err(e)
            }
        }
    }

    /// Trennt die Verbindung und entfernt alle Listener
    pub fn disconnect(&self) {
        let (outbound, task, previous) = {
            let mut link = self.shared.link.lock();
            let previous = link.status;
            link.generation += 1;
            link.status = LinkStatus::Disconnected;
            (link.outbound.take(), link.task.take(), previous)
        };

        // Ohne Sender schließt der Pump-Task den Socket selbst mit einem Close-Frame
        drop(outbound);
        if let Some(task) = task {
            if previous != LinkStatus::Connected {
                task.abort();
            }
        }

        self.shared.listeners.clear();
        tracing::info!("Disconnected from signaling server ({:?})", previous);
    }

    /// Sendet ein Event an den Server
    pub async fn send<T: Serialize>(&self, event: &str, data: T) -> Result<(), SignalingError> {
        let tx = self
            .shared
            .link
            .lock()
            .outbound
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let text = serde_json::to_string(&OutboundFrame { event, data })
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Outbound::Text(text))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn store_task(&self, generation: u64, task: JoinHandle<()>) {
        let mut link = self.shared.link.lock();
        if link.generation == generation {
            link.task = Some(task);
        } else {
            task.abort();
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.shared.link.lock();
        f.debug_struct("EventBus")
            .field("url", &self.shared.display_url())
            .field("status", &link.status)
            .field("generation", &link.generation)
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

async fn open_socket(url: &Url) -> Result<WsStream, SignalingError> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
    Ok(stream)
}

/// Hält eine Verbindung am Leben und baut sie nach Abbruch neu auf
async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    mut stream: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    loop {
        let closed_locally = pump(&shared, stream, outbound).await;
        if closed_locally || !shared.mark_lost(generation) {
            return;
        }

        tracing::warn!("Signaling connection lost");
        shared.listeners.dispatch(&SignalingEvent::Disconnect);

        if !shared.config.reconnect {
            return;
        }

        match reconnect(&shared, generation).await {
            Some((next_stream, next_outbound)) => {
                stream = next_stream;
                outbound = next_outbound;
            }
            None => return,
        }
    }
}

/// Reconnect mit exponentiellem Backoff, bis es klappt oder disconnect() kommt
async fn reconnect(
    shared: &Arc<Shared>,
    generation: u64,
) -> Option<(WsStream, mpsc::Receiver<Outbound>)> {
    let mut delay = shared.config.reconnect_initial();
    loop {
        tokio::time::sleep(delay).await;
        if !shared.is_current(generation) {
            return None;
        }

        tracing::info!("Reconnecting to signaling server (backoff {:?})", delay);
        match open_socket(&shared.url).await {
            Ok(stream) => {
                let outbound = shared.mark_connected(generation)?;
                tracing::info!("Signaling connection restored");
                shared.listeners.dispatch(&SignalingEvent::Connect);
                return Some((stream, outbound));
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                shared.listeners.dispatch(&SignalingEvent::Error {
                    message: e.to_string(),
                });
                delay = (delay * 2).min(shared.config.reconnect_max());
            }
        }
    }
}

/// Liest Frames, schreibt ausgehende Nachrichten und Pings.
///
/// Gibt `true` zurück, wenn die Verbindung lokal geschlossen wurde.
async fn pump(
    shared: &Shared,
    stream: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
) -> bool {
    let (mut write, mut read) = stream.split();
    let period = shared.config.ping_interval().max(Duration::from_secs(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(msg) = ServerMessage::parse(&text) {
                        shared.listeners.dispatch(&SignalingEvent::from(msg));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by server");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    shared.listeners.dispatch(&SignalingEvent::Error {
                        message: e.to_string(),
                    });
                    return false;
                }
            },
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        shared.listeners.dispatch(&SignalingEvent::Error {
                            message: e.to_string(),
                        });
                        return false;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("Heartbeat failed: {}", e);
                    return false;
                }
            }
        }
    }
}

/// http(s) wird zu ws(s), das Token wandert in den Query-String
fn signaling_url(raw: &str, auth_token: Option<&str>) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(raw.to_string()))?;
    }

    if let Some(token) = auth_token {
        url.query_pairs_mut().append_pair("token", token);
    }

    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================
