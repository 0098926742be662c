//! CallSync - Anruf-Synchronisation für einen mobilen Voice-Client
//!
//! Hält den lokalen Anrufzustand konsistent mit einem entfernten Call-Server:
//! - WebSocket-Signaling als EventBus (Server → Client Events)
//! - REST Control-Plane für wählen, annehmen, ablehnen, auflegen
//! - Eine State-Machine als einzige Wahrheit über den aktuellen Anruf
//! - Gesprächs-Timer und No-Answer-Timeout

pub mod call_session;
pub mod config;
pub mod control;
pub mod signaling;

use anyhow::Context;
use call_session::{CallSessionHandle, CallSessionMachine};
use config::AppConfig;
use control::{CallControl, HttpCallControl};
use signaling::EventBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::filter::{Directive, EnvFilter};

/// Standard-Filter, `RUST_LOG` kann sie erweitern
const DEFAULT_DIRECTIVES: [&str; 3] = [
    "callsync_lib=debug",
    "tokio_tungstenite=warn",
    "reqwest=warn",
];

/// Initialisiert das Logging. Mehrfache Aufrufe sind harmlos.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}

// ============================================================================
// APPLICATION ROOT
// ============================================================================

/// Verdrahtet EventBus, Control-Plane und State-Machine
///
/// Wird einmal von der mobilen Shell erzeugt. Die Teile werden per
/// Referenz bzw. Handle weitergereicht.
pub struct CallApp {
    config: AppConfig,
    bus: EventBus,
    calls: CallSessionHandle,
    attached: AtomicBool,
}

impl CallApp {
    /// Baut die App mit der HTTP Control-Plane. Braucht eine laufende Tokio-Runtime.
    pub fn init(config: AppConfig) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        let control = HttpCallControl::new(&config.server, config.auth_token.clone())
            .context("Failed to create call control client")?;

        Self::with_control(config, Arc::new(control))
    }

    /// Wie `init`, aber mit eigener Control-Plane
    pub fn with_control(config: AppConfig, control: Arc<dyn CallControl>) -> anyhow::Result<Self> {
        tracing::info!("Initializing CallSync...");

        let bus = EventBus::new(config.signaling.clone(), config.auth_token.as_deref())
            .context("Failed to create signaling client")?;
        let calls = CallSessionMachine::new(control, config.call.clone()).spawn();

        Ok(Self {
            config,
            bus,
            calls,
            attached: AtomicBool::new(false),
        })
    }

    /// Hängt die State-Machine an den Bus und verbindet
    ///
    /// Scheitert die erste Verbindung, versucht der Bus es bei aktivem
    /// Reconnect im Hintergrund weiter.
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.attached.swap(true, Ordering::SeqCst) {
            self.calls.attach(&self.bus);
        }

        self.bus
            .connect()
            .await
            .context("Failed to connect to signaling server")?;

        tracing::info!("CallSync started");
        Ok(())
    }

    /// Trennt die Verbindung und entfernt alle Listener
    pub fn shutdown(&self) {
        self.bus.disconnect();
        self.attached.store(false, Ordering::SeqCst);
        tracing::info!("CallSync shut down");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn calls(&self) -> &CallSessionHandle {
        &self.calls
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("bus", &self.bus)
            .field("calls", &self.calls)
            .finish()
    }
}
