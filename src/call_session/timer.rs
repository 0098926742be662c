//! CallTimer - Gesprächsdauer
//!
//! Zählt ganze Sekunden, solange er läuft. Jeder Tick prüft unter dem Lock
//! die Epoche, die `start`/`stop` hochzählen. Nach `stop()` kann deshalb
//! kein verspäteter Tick mehr zählen.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct TimerState {
    elapsed: u64,
    running: bool,
    epoch: u64,
}

pub struct CallTimer {
    state: Arc<Mutex<TimerState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    ticks: Arc<watch::Sender<u64>>,
}

impl CallTimer {
    pub fn new() -> Self {
        let (ticks, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            task: Mutex::new(None),
            ticks: Arc::new(ticks),
        }
    }

    /// Startet (oder re-armiert) den Timer, ohne `elapsed` zurückzusetzen.
    /// Braucht eine laufende Tokio-Runtime.
    pub fn start(&self) {
        let epoch = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.running = true;
            state.epoch
        };

        let state = Arc::clone(&self.state);
        let ticks = Arc::clone(&self.ticks);
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut s = state.lock();
                if s.epoch != epoch || !s.running {
                    break;
                }
                s.elapsed += 1;
                ticks.send_replace(s.elapsed);
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Hält an, `elapsed` bleibt stehen
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.running = false;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Stoppt und setzt auf 0
    pub fn reset(&self) {
        self.stop();
        self.state.lock().elapsed = 0;
        self.ticks.send_replace(0);
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.state.lock().elapsed
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// `MM:SS`
    pub fn formatted(&self) -> String {
        format_duration(self.elapsed_seconds())
    }

    /// Empfänger, der bei jedem Tick den neuen Stand bekommt
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.ticks.subscribe()
    }
}

impl Default for CallTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CallTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallTimer")
            .field("elapsed", &state.elapsed)
            .field("running", &state.running)
            .finish()
    }
}

/// Sekunden als `MM:SS`, Minuten unbegrenzt
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// TESTS
// ============================================================================
