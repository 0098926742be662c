//! CallSessionMachine - Orchestrator für den aktuellen Anruf
//!
//! Ein einzelner Actor-Task besitzt die `CallSession`, den Timer und alle
//! Deadlines. Signaling-Events, UI-Kommandos, Control-Antworten und
//! Timer laufen durch dieselbe Queue und werden strikt nacheinander
//! verarbeitet. Die UI spricht nur mit dem `CallSessionHandle`.

use super::gate::{ControlGate, PendingControl, Reply};
use super::session::{
    map_status, Applied, CallDirection, CallPhase, CallSession, ContactDirectory, EndReason,
    PhaseUpdate,
};
use super::timer::CallTimer;
use super::view::{CallEvent, CallState, CallView, SecondCallDisposition};
use super::CallError;
use crate::config::CallConfig;
use crate::control::{validate_number, CallControl, ControlAction, ControlError, DialResponse};
use crate::signaling::{
    CallEndedPayload, CallInitiatedPayload, CallStatusPayload, EventBus, EventKind,
    IncomingCallPayload, ListenerId, SignalingEvent,
};
use chrono::Utc;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};

const EVENT_CAPACITY: usize = 100;

/// Events, auf die die Machine am Bus hört
const SUBSCRIBED: [EventKind; 7] = [
    EventKind::IncomingCall,
    EventKind::CallInitiated,
    EventKind::CallStatusUpdate,
    EventKind::CallEnded,
    EventKind::Connect,
    EventKind::Disconnect,
    EventKind::Error,
];

// ============================================================================
// ACTOR INPUTS
// ============================================================================

enum Command {
    Dial { number: String, reply: Reply },
    Accept { reply: Reply },
    Reject { reply: Reply },
    Hangup { reply: Reply },
}

enum Input {
    Signal(SignalingEvent),
    Command(Command),
    DialSettled(Result<DialResponse, ControlError>),
    ControlSettled {
        call_id: String,
        action: ControlAction,
        result: Result<(), ControlError>,
    },
}

/// Dial-Request ist unterwegs, es gibt noch keine Session
struct PendingDial {
    number: String,
    reply: Reply,
    /// Events, die vor der Dial-Antwort ankommen
    buffered: Vec<SignalingEvent>,
    /// Hangup kam, bevor der Server geantwortet hat
    cancelled: bool,
}

/// Darf der vorderste Control-Request noch raus?
enum Readiness {
    Issue,
    Skip(Result<(), CallError>),
}

// ============================================================================
// BUILDER
// ============================================================================

/// Baut die State-Machine und startet ihren Actor
pub struct CallSessionMachine {
    control: Arc<dyn CallControl>,
    config: CallConfig,
    contacts: Option<Arc<dyn ContactDirectory>>,
}

impl CallSessionMachine {
    pub fn new(control: Arc<dyn CallControl>, config: CallConfig) -> Self {
        Self {
            control,
            config,
            contacts: None,
        }
    }

    /// Anzeigenamen für Nummern ohne `contactName`
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Startet den Actor. Braucht eine laufende Tokio-Runtime.
    ///
    /// Der Actor läuft, bis alle Handles und Bus-Listener weg sind.
    pub fn spawn(self) -> CallSessionHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(CallView::idle());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = SessionActor {
            control: self.control,
            config: self.config,
            contacts: self.contacts,
            inputs: input_tx.downgrade(),
            view_tx,
            events: event_tx.clone(),
            session: None,
            pending_dial: None,
            gate: ControlGate::default(),
            timer: CallTimer::new(),
            no_answer: None,
            clear_at: None,
            last_cleared: None,
        };
        tokio::spawn(actor.run(input_rx));

        CallSessionHandle {
            inputs: input_tx,
            view: view_rx,
            events: event_tx,
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Zugriff der Präsentationsschicht auf die State-Machine
#[derive(Clone)]
pub struct CallSessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<CallView>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSessionHandle {
    /// Registriert die Machine als Listener am EventBus
    pub fn attach(&self, bus: &EventBus) -> Vec<ListenerId> {
        SUBSCRIBED
            .iter()
            .map(|&kind| {
                let inputs = self.inputs.clone();
                bus.subscribe(kind, move |event| {
                    let _ = inputs.send(Input::Signal(event.clone()));
                })
            })
            .collect()
    }

    /// Ausgehender Anruf. Kehrt zurück, sobald der Server geantwortet hat.
    pub async fn dial(&self, number: &str) -> Result<(), CallError> {
        self.request(|reply| Command::Dial {
            number: number.to_string(),
            reply,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Endet lokal immer in `ended{rejected}`, auch wenn der Request scheitert
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Optimistisch: der lokale Zustand ist sofort `ended`
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    /// Aktueller Snapshot
    pub fn view(&self) -> CallView {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.view.borrow().state
    }

    /// Empfänger für jede Änderung an der View
    pub fn watch(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(command(tx)))
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }
}

impl std::fmt::Debug for CallSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionHandle")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct SessionActor {
    control: Arc<dyn CallControl>,
    config: CallConfig,
    contacts: Option<Arc<dyn ContactDirectory>>,
    /// Schwach, sonst hält sich der Actor selbst am Leben
    inputs: mpsc::WeakUnboundedSender<Input>,
    view_tx: watch::Sender<CallView>,
    events: broadcast::Sender<CallEvent>,

    session: Option<CallSession>,
    pending_dial: Option<PendingDial>,
    gate: ControlGate,
    timer: CallTimer,
    no_answer: Option<Pin<Box<Sleep>>>,
    clear_at: Option<Pin<Box<Sleep>>>,
    /// Call-ID der zuletzt verworfenen Session
    last_cleared: Option<String>,
}

/// Wartet auf eine optionale Deadline, ohne Deadline nie
async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        let mut ticks = self.timer.watch();
        tracing::debug!("Call session actor started");

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
                _ = expire(&mut self.no_answer) => {
                    self.no_answer = None;
                    self.on_no_answer_timeout();
                }
                _ = expire(&mut self.clear_at) => {
                    self.clear_at = None;
                    self.clear_session();
                }
                changed = ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.publish();
        }

        self.timer.stop();
        tracing::debug!("Call session actor stopped");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Signal(event) => self.on_signal(event),
            Input::Command(Command::Dial { number, reply }) => self.on_dial(number, reply),
            Input::Command(Command::Accept { reply }) => {
                self.on_answer_command(ControlAction::Accept, reply)
            }
            Input::Command(Command::Reject { reply }) => {
                self.on_answer_command(ControlAction::Reject, reply)
            }
            Input::Command(Command::Hangup { reply }) => self.on_hangup(reply),
            Input::DialSettled(result) => self.on_dial_settled(result),
            Input::ControlSettled {
                call_id,
                action,
                result,
            } => self.on_control_settled(call_id, action, result),
        }
    }

    // ------------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------------

    fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.phase().into())
            .unwrap_or(CallState::Idle)
    }

    fn current_view(&self) -> CallView {
        if let Some(session) = &self.session {
            let pending = session.id.as_deref().and_then(|id| self.gate.front(id));
            return CallView::of_session(session, self.timer.elapsed_seconds(), pending);
        }

        let mut view = CallView::idle();
        if let Some(pending) = &self.pending_dial {
            view.counterpart_number = pending.number.clone();
            view.pending_action = Some(ControlAction::Dial);
        }
        view
    }

    fn publish(&self) {
        let view = self.current_view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn emit_state_change(&self, from: CallState) {
        let to = self.state();
        if from != to {
            tracing::info!("Call state: {} -> {}", from, to);
            let _ = self.events.send(CallEvent::StateChanged { from, to });
        }
    }

    fn violation(&self, error: &CallError) {
        tracing::warn!("{}", error);
    }

    fn lookup_name(&self, number: &str) -> Option<String> {
        self.contacts.as_ref()?.display_name(number)
    }

    fn is_showing_ended(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.phase() == CallPhase::Ended)
    }

    fn is_ours(&self, call_id: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.id.as_deref() == Some(call_id))
    }

    // ------------------------------------------------------------------------
    // Signaling events
    // ------------------------------------------------------------------------

    fn on_signal(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connect => {
                tracing::info!("Signaling connected (call state {})", self.state());
            }
            SignalingEvent::Disconnect => {
                tracing::warn!(
                    "Signaling disconnected, keeping {} session until updates resume",
                    self.state()
                );
            }
            SignalingEvent::Error { message } => {
                tracing::warn!("Signaling error: {}", message);
            }
            SignalingEvent::IncomingCall(payload) => self.on_incoming_call(payload),
            other => {
                if self.session.is_none() {
                    if let Some(pending) = self.pending_dial.as_mut() {
                        tracing::debug!("Buffering {} until dial response", other.kind());
                        pending.buffered.push(other);
                        return;
                    }
                }
                self.on_call_event(other);
            }
        }
    }

    fn on_call_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::CallInitiated(payload) => self.on_call_initiated(payload),
            SignalingEvent::CallStatusUpdate(payload) => self.on_status_update(payload),
            SignalingEvent::CallEnded(payload) => self.on_call_ended(payload),
            _ => {}
        }
    }

    /// Gilt ein Event für die aktuelle Session?
    fn applies_to_session(&self, kind: EventKind, call_id: Option<&str>) -> bool {
        match &self.session {
            None => {
                self.violation(&CallError::ProtocolViolation(format!(
                    "{} without an active call",
                    kind
                )));
                false
            }
            Some(session) if !session.matches(call_id) => {
                tracing::debug!(
                    "Ignoring {} for call {:?}, current call is {:?}",
                    kind,
                    call_id,
                    session.id
                );
                false
            }
            Some(_) => true,
        }
    }

    fn on_incoming_call(&mut self, payload: IncomingCallPayload) {
        let IncomingCallPayload {
            call_id,
            phone_number,
            contact_name,
            ..
        } = payload;

        let Some(call_id) = call_id else {
            self.violation(&CallError::ProtocolViolation(format!(
                "incomingCall from {} without callId",
                phone_number
            )));
            return;
        };

        // Eine beendete Call-ID kommt nie wieder zurück auf Ringing
        if self.is_ours(&call_id) || self.last_cleared.as_deref() == Some(call_id.as_str()) {
            tracing::debug!("Duplicate incomingCall for {} ({})", call_id, self.state());
            return;
        }
        if self.is_showing_ended() {
            self.clear_session();
        }

        let name = contact_name.or_else(|| self.lookup_name(&phone_number));
        if self.session.is_some() || self.pending_dial.is_some() {
            self.on_second_call(call_id, phone_number, name);
            return;
        }

        let from = self.state();
        tracing::info!("Incoming call {} from {}", call_id, phone_number);
        self.session = Some(CallSession::incoming(Some(call_id), phone_number, name));
        self.arm_no_answer();
        self.emit_state_change(from);
    }

    fn on_second_call(&mut self, call_id: String, number: String, name: Option<String>) {
        let disposition = if self.config.auto_reject_second_call {
            SecondCallDisposition::AutoRejected
        } else {
            SecondCallDisposition::Surfaced
        };
        tracing::info!(
            "Second incoming call {} from {} while {} ({:?})",
            call_id,
            number,
            self.state(),
            disposition
        );

        if disposition == SecondCallDisposition::AutoRejected {
            self.enqueue_control(&call_id, PendingControl::new(ControlAction::Reject, None));
        }

        let _ = self.events.send(CallEvent::SecondCall {
            call_id: Some(call_id),
            counterpart_number: number,
            counterpart_name: name,
            disposition,
        });
    }

    fn on_call_initiated(&mut self, payload: CallInitiatedPayload) {
        if !self.applies_to_session(EventKind::CallInitiated, payload.call_id.as_deref()) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.direction != CallDirection::Outgoing || session.phase() != CallPhase::Dialing {
            let error = CallError::ProtocolViolation(format!(
                "callInitiated for {:?} call in phase {:?}",
                session.direction,
                session.phase()
            ));
            self.violation(&error);
            return;
        }
        if session.id.is_none() {
            session.id = payload.call_id;
        }
        tracing::debug!("Server confirmed outgoing call {:?}", session.id);
    }

    fn on_status_update(&mut self, payload: CallStatusPayload) {
        if !self.applies_to_session(EventKind::CallStatusUpdate, payload.call_id.as_deref()) {
            return;
        }
        let Some(update) = map_status(&payload.status) else {
            tracing::warn!("Unknown call status '{}', ignoring", payload.status);
            return;
        };
        if let Some(session) = self.session.as_mut() {
            if session.id.is_none() {
                session.id = payload.call_id;
            }
        }
        self.apply_update(update);
    }

    fn on_call_ended(&mut self, payload: CallEndedPayload) {
        if !self.applies_to_session(EventKind::CallEnded, payload.call_id.as_deref()) {
            return;
        }
        if self.is_showing_ended() {
            tracing::debug!("callEnded for a call that already ended");
            return;
        }

        let reason = match payload.reason.as_deref() {
            None => EndReason::Completed,
            Some(wire) => EndReason::from_wire(wire).unwrap_or_else(|| {
                tracing::debug!("Unrecognized end reason '{}', using completed", wire);
                EndReason::Completed
            }),
        };
        self.apply_update(PhaseUpdate::Ended(reason));
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Einziger Weg für Phasenwechsel. `true`, wenn die Phase vorwärts ging.
    fn apply_update(&mut self, update: PhaseUpdate) -> bool {
        let from = self.state();
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match session.apply(update, Utc::now()) {
            Err(error) => {
                self.violation(&error);
                false
            }
            Ok(Applied::Unchanged) => {
                tracing::debug!("Phase already {:?}", update.phase());
                false
            }
            Ok(Applied::Advanced { to, .. }) => {
                match to {
                    CallPhase::Connected => self.on_connected(),
                    CallPhase::Ended => self.on_ended(),
                    CallPhase::Dialing | CallPhase::Ringing => {}
                }
                self.emit_state_change(from);
                true
            }
        }
    }

    fn on_connected(&mut self) {
        self.no_answer = None;
        if !self.timer.is_running() {
            self.timer.start();
        }
    }

    fn on_ended(&mut self) {
        self.no_answer = None;
        self.timer.stop();
        let elapsed = self.timer.elapsed_seconds();
        if let Some(session) = self.session.as_mut() {
            session.freeze_duration(elapsed);
            tracing::info!(
                "Call {:?} ended ({:?}) after {}s",
                session.id,
                session.end_reason(),
                elapsed
            );
        }
        self.clear_at = Some(Box::pin(sleep(self.config.clear_delay())));
    }

    fn arm_no_answer(&mut self) {
        self.no_answer = Some(Box::pin(sleep(self.config.no_answer_timeout())));
    }

    fn on_no_answer_timeout(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if !matches!(session.phase(), CallPhase::Dialing | CallPhase::Ringing) {
            return;
        }
        let call_id = session.id.clone();

        tracing::info!(
            "No answer after {:?}, ending call {:?}",
            self.config.no_answer_timeout(),
            call_id
        );
        self.apply_update(PhaseUpdate::Ended(EndReason::LocalTimeout));
        if let Some(call_id) = call_id {
            self.enqueue_control(&call_id, PendingControl::new(ControlAction::Hangup, None));
        }
    }

    /// Verwirft die beendete Session, UI geht zurück auf Idle
    fn clear_session(&mut self) {
        self.clear_at = None;
        if !self.is_showing_ended() {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };
        self.timer.reset();

        tracing::debug!("Clearing session {} ({:?})", session.local_id, session.id);
        let end_reason = session.end_reason();
        self.last_cleared = session.id.clone();
        let _ = self.events.send(CallEvent::SessionCleared {
            call_id: session.id,
            end_reason,
        });
        let _ = self.events.send(CallEvent::StateChanged {
            from: CallState::Ended,
            to: CallState::Idle,
        });
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn on_dial(&mut self, number: String, reply: Reply) {
        if self.is_showing_ended() {
            self.clear_session();
        }
        if self.session.is_some() || self.pending_dial.is_some() {
            let _ = reply.send(Err(CallError::AlreadyInCall));
            return;
        }
        let number = match validate_number(&number) {
            Ok(number) => number.to_string(),
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let Some(inputs) = self.inputs.upgrade() else {
            let _ = reply.send(Err(CallError::Stopped));
            return;
        };

        tracing::info!("Dialing {}", number);
        let control = Arc::clone(&self.control);
        let target = number.clone();
        tokio::spawn(async move {
            let result = control.dial(&target).await;
            let _ = inputs.send(Input::DialSettled(result));
        });

        self.pending_dial = Some(PendingDial {
            number,
            reply,
            buffered: Vec::new(),
            cancelled: false,
        });
    }

    fn on_dial_settled(&mut self, result: Result<DialResponse, ControlError>) {
        let Some(pending) = self.pending_dial.take() else {
            tracing::warn!("Dial response without a pending dial");
            return;
        };

        let response = match result {
            Err(e) => {
                tracing::warn!("Dial to {} failed: {}", pending.number, e);
                if !pending.buffered.is_empty() {
                    tracing::debug!("Dropping {} buffered events", pending.buffered.len());
                }
                self.publish();
                let _ = pending.reply.send(Err(e.into()));
                return;
            }
            Ok(response) => response,
        };

        if pending.cancelled {
            tracing::info!(
                "Dial to {} was cancelled, hanging up {}",
                pending.number,
                response.call_id
            );
            self.enqueue_control(
                &response.call_id,
                PendingControl::new(ControlAction::Hangup, None),
            );
            let _ = pending.reply.send(Err(CallError::DialCancelled));
            return;
        }

        let from = self.state();
        let name = self.lookup_name(&pending.number);
        let call_id = Some(response.call_id).filter(|id| !id.is_empty());
        tracing::info!("Outgoing call {:?} to {}", call_id, pending.number);

        self.session = Some(CallSession::outgoing(call_id, pending.number, name));
        self.arm_no_answer();
        self.emit_state_change(from);

        if let Some(update) = map_status(&response.status) {
            self.apply_update(update);
        }
        for event in pending.buffered {
            self.on_call_event(event);
        }

        self.publish();
        let _ = pending.reply.send(Ok(()));
    }

    /// Accept oder Reject auf dem klingelnden eingehenden Anruf
    fn on_answer_command(&mut self, action: ControlAction, reply: Reply) {
        let call_id = match &self.session {
            None => Err(CallError::NoActiveCall),
            Some(session)
                if session.direction == CallDirection::Incoming
                    && session.phase() == CallPhase::Ringing =>
            {
                session.id.clone().ok_or(CallError::NoActiveCall)
            }
            Some(_) => Err(CallError::InvalidState {
                action,
                state: self.state(),
            }),
        };

        match call_id {
            Ok(call_id) => self.enqueue_control(&call_id, PendingControl::new(action, Some(reply))),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_hangup(&mut self, reply: Reply) {
        let active = self
            .session
            .as_ref()
            .filter(|s| s.phase().is_active())
            .map(|s| s.id.clone());

        match active {
            Some(call_id) => {
                self.apply_update(PhaseUpdate::Ended(EndReason::LocalHangup));
                match call_id {
                    Some(call_id) => self.enqueue_control(
                        &call_id,
                        PendingControl::new(ControlAction::Hangup, None),
                    ),
                    None => tracing::warn!("Call has no server id, hangup stays local"),
                }
                self.publish();
                let _ = reply.send(Ok(()));
            }
            None => match self.pending_dial.as_mut() {
                Some(pending) => {
                    tracing::info!("Hangup while dialing {}, cancelling", pending.number);
                    pending.cancelled = true;
                    let _ = reply.send(Ok(()));
                }
                None => {
                    let _ = reply.send(Err(CallError::NoActiveCall));
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Control requests
    // ------------------------------------------------------------------------

    fn enqueue_control(&mut self, call_id: &str, pending: PendingControl) {
        let action = pending.action;
        if self.gate.enqueue(call_id, pending) {
            self.start_front(call_id);
        } else {
            tracing::debug!("{} on {} waits for the running request", action, call_id);
        }
    }

    /// Prüft eine Aktion unmittelbar bevor sie rausgeht
    fn readiness(&self, action: ControlAction, call_id: &str) -> Readiness {
        let phase = self
            .session
            .as_ref()
            .filter(|_| self.is_ours(call_id))
            .map(|s| s.phase());

        match (action, phase) {
            (ControlAction::Hangup, _) => Readiness::Issue,
            (ControlAction::Accept | ControlAction::Reject, Some(CallPhase::Ringing)) => {
                Readiness::Issue
            }
            (ControlAction::Accept, Some(CallPhase::Connected)) => Readiness::Skip(Ok(())),
            (ControlAction::Reject, Some(CallPhase::Ended)) => Readiness::Skip(Ok(())),
            // Auto-Reject eines zweiten Anrufs
            (ControlAction::Reject, None) => Readiness::Issue,
            (ControlAction::Accept, None) => Readiness::Skip(Err(CallError::NoActiveCall)),
            (action, Some(_)) => Readiness::Skip(Err(CallError::InvalidState {
                action,
                state: self.state(),
            })),
            (ControlAction::Dial, None) => Readiness::Skip(Err(CallError::NoActiveCall)),
        }
    }

    fn start_front(&mut self, call_id: &str) {
        while let Some(action) = self.gate.front(call_id) {
            if let Readiness::Skip(result) = self.readiness(action, call_id) {
                tracing::debug!("Skipping {} on {}", action, call_id);
                if let Some(pending) = self.gate.pop(call_id) {
                    pending.respond(result);
                }
                continue;
            }

            let Some(inputs) = self.inputs.upgrade() else {
                return;
            };
            tracing::debug!("Sending {} for {}", action, call_id);
            let control = Arc::clone(&self.control);
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                let result = control.perform(action, &call_id).await;
                let _ = inputs.send(Input::ControlSettled {
                    call_id,
                    action,
                    result,
                });
            });
            return;
        }
    }

    fn on_control_settled(
        &mut self,
        call_id: String,
        action: ControlAction,
        result: Result<(), ControlError>,
    ) {
        let Some(pending) = self.gate.pop(&call_id) else {
            tracing::warn!("{} response for {} without a pending request", action, call_id);
            return;
        };
        let ours = self.is_ours(&call_id);

        let outcome = match action {
            ControlAction::Accept => match result {
                Ok(()) => {
                    if ours && self.state() == CallState::Ringing {
                        self.apply_update(PhaseUpdate::Connected);
                    } else {
                        tracing::debug!("Accept for {} settled after the call moved on", call_id);
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!("Accept for {} failed: {}", call_id, e);
                    Err(e.into())
                }
            },
            ControlAction::Reject => {
                if let Err(e) = &result {
                    tracing::warn!("Reject for {} failed, ending locally: {}", call_id, e);
                }
                if ours && self.state() != CallState::Ended {
                    self.apply_update(PhaseUpdate::Ended(EndReason::Rejected));
                }
                Ok(())
            }
            ControlAction::Hangup => {
                match result {
                    Ok(()) => tracing::debug!("Hangup for {} confirmed", call_id),
                    Err(e) => tracing::warn!("Hangup for {} failed: {}", call_id, e),
                }
                Ok(())
            }
            ControlAction::Dial => Ok(()),
        };

        self.publish();
        pending.respond(outcome);
        self.start_front(&call_id);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    const CALL_ID: &str = "CA100";

    /// Control-Plane ohne Netzwerk, mit einstellbaren Fehlern und Latenzen
    #[derive(Default)]
    struct MockControl {
        calls: Mutex<Vec<(ControlAction, String)>>,
        failures: Mutex<HashMap<ControlAction, ControlError>>,
        delays: Mutex<HashMap<ControlAction, Duration>>,
    }

    impl MockControl {
        fn fail(&self, action: ControlAction, error: ControlError) {
            self.failures.lock().insert(action, error);
        }

        fn delay(&self, action: ControlAction, delay: Duration) {
            self.delays.lock().insert(action, delay);
        }

        fn calls(&self) -> Vec<(ControlAction, String)> {
            self.calls.lock().clone()
        }

        async fn respond(&self, action: ControlAction, subject: &str) -> Result<(), ControlError> {
            self.calls.lock().push((action, subject.to_string()));
            let delay = self.delays.lock().get(&action).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self.failures.lock().get(&action).cloned();
            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CallControl for MockControl {
        async fn dial(&self, number: &str) -> Result<DialResponse, ControlError> {
            self.respond(ControlAction::Dial, number).await?;
            Ok(DialResponse {
                call_id: CALL_ID.to_string(),
                status: "initiated".to_string(),
            })
        }

        async fn accept(&self, call_id: &str) -> Result<(), ControlError> {
            self.respond(ControlAction::Accept, call_id).await
        }

        async fn reject(&self, call_id: &str) -> Result<(), ControlError> {
            self.respond(ControlAction::Reject, call_id).await
        }

        async fn hangup(&self, call_id: &str) -> Result<(), ControlError> {
            self.respond(ControlAction::Hangup, call_id).await
        }
    }

    struct Contacts;

    impl ContactDirectory for Contacts {
        fn display_name(&self, number: &str) -> Option<String> {
            (number == "+15551230000").then(|| "Alice".to_string())
        }
    }

    fn setup(control: &Arc<MockControl>) -> (EventBus, CallSessionHandle) {
        let bus = EventBus::new(SignalingConfig::default(), None).unwrap();
        let handle = CallSessionMachine::new(control.clone(), CallConfig::default()).spawn();
        handle.attach(&bus);
        (bus, handle)
    }

    async fn wait_for(handle: &CallSessionHandle, check: impl Fn(&CallView) -> bool) -> CallView {
        let mut rx = handle.watch();
        let view = timeout(Duration::from_secs(5), rx.wait_for(|v| check(v)))
            .await
            .expect("timed out waiting for view")
            .expect("actor stopped");
        view.clone()
    }

    async fn wait_state(handle: &CallSessionHandle, state: CallState) -> CallView {
        wait_for(handle, |v| v.state == state).await
    }

    /// Lässt gespawnte Tasks laufen, ohne die Uhr weit vorzustellen
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn incoming(call_id: &str, number: &str) -> SignalingEvent {
        SignalingEvent::IncomingCall(IncomingCallPayload {
            call_id: Some(call_id.to_string()),
            phone_number: number.to_string(),
            contact_name: None,
            direction: Some("inbound".to_string()),
            status: Some("ringing".to_string()),
        })
    }

    fn status(call_id: Option<&str>, status: &str) -> SignalingEvent {
        SignalingEvent::CallStatusUpdate(CallStatusPayload {
            call_id: call_id.map(str::to_string),
            status: status.to_string(),
        })
    }

    fn ended(call_id: Option<&str>, reason: Option<&str>) -> SignalingEvent {
        SignalingEvent::CallEnded(CallEndedPayload {
            call_id: call_id.map(str::to_string),
            reason: reason.map(str::to_string),
        })
    }

    async fn ring_and_accept(bus: &EventBus, handle: &CallSessionHandle) {
        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(handle, CallState::Ringing).await;
        handle.accept().await.unwrap();
        wait_state(handle, CallState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_to_connected() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        handle.dial("+15551230000").await.unwrap();
        let view = wait_state(&handle, CallState::Dialing).await;
        assert_eq!(view.call_id.as_deref(), Some(CALL_ID));
        assert_eq!(view.direction, Some(CallDirection::Outgoing));

        bus.dispatch(&SignalingEvent::CallInitiated(CallInitiatedPayload {
            call_id: None,
            to: Some("+15551230000".to_string()),
            status: Some("initiated".to_string()),
        }));
        bus.dispatch(&status(None, "answered"));

        let view = wait_state(&handle, CallState::Connected).await;
        assert!(view.connected_at.is_some());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let view = handle.view();
        assert_eq!(view.duration_seconds, 3);
        assert_eq!(view.formatted_duration, "00:03");
        assert_eq!(
            control.calls(),
            vec![(ControlAction::Dial, "+15551230000".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_ends_locally_even_on_network_failure() {
        let control = Arc::new(MockControl::default());
        control.fail(ControlAction::Reject, ControlError::Network("timeout".into()));
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(&handle, CallState::Ringing).await;

        handle.reject().await.unwrap();
        let view = wait_state(&handle, CallState::Ended).await;
        assert_eq!(view.end_reason, Some(EndReason::Rejected));
        assert_eq!(
            control.calls(),
            vec![(ControlAction::Reject, "CA1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_freezes_duration_then_clears() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);
        let mut events = handle.subscribe();

        ring_and_accept(&bus, &handle).await;
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(handle.view().duration_seconds, 5);

        bus.dispatch(&ended(None, None));
        let view = wait_state(&handle, CallState::Ended).await;
        assert_eq!(view.end_reason, Some(EndReason::Completed));
        assert_eq!(view.duration_seconds, 5);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let view = handle.view();
        assert_eq!(view.state, CallState::Ended);
        assert_eq!(view.duration_seconds, 5);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.view(), CallView::idle());

        let mut cleared = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SessionCleared { call_id, end_reason } = event {
                assert_eq!(call_id.as_deref(), Some("CA1"));
                assert_eq!(end_reason, Some(EndReason::Completed));
                cleared = true;
            }
        }
        assert!(cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_incoming_call_is_auto_rejected() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);
        let mut events = handle.subscribe();

        ring_and_accept(&bus, &handle).await;
        bus.dispatch(&incoming("CA2", "+15550000002"));
        settle().await;

        let view = handle.view();
        assert_eq!(view.state, CallState::Connected);
        assert_eq!(view.call_id.as_deref(), Some("CA1"));
        assert!(control
            .calls()
            .contains(&(ControlAction::Reject, "CA2".to_string())));

        let mut second = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SecondCall { call_id, disposition, .. } = event {
                second = Some((call_id, disposition));
            }
        }
        assert_eq!(
            second,
            Some((Some("CA2".to_string()), SecondCallDisposition::AutoRejected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_answer_timeout_hangs_up() {
        let control = Arc::new(MockControl::default());
        let (_bus, handle) = setup(&control);

        handle.dial("+15551230000").await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        let view = handle.view();
        assert_eq!(view.state, CallState::Ended);
        assert_eq!(view.end_reason, Some(EndReason::LocalTimeout));
        assert!(control
            .calls()
            .contains(&(ControlAction::Hangup, CALL_ID.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_status_does_not_reset_timeout() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        handle.dial("+15551230000").await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        bus.dispatch(&status(Some(CALL_ID), "ringing"));
        wait_state(&handle, CallState::Ringing).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(handle.view().end_reason, Some(EndReason::LocalTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_before_timeout_cancels_it() {
        let control = Arc::new(MockControl::default());
        control.delay(ControlAction::Accept, Duration::from_secs(1));
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(&handle, CallState::Ringing).await;
        handle.accept().await.unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(handle.view().state, CallState::Connected);
        assert_eq!(
            control.calls(),
            vec![(ControlAction::Accept, "CA1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_response_after_timeout_is_ignored() {
        let control = Arc::new(MockControl::default());
        control.delay(ControlAction::Accept, Duration::from_secs(40));
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(&handle, CallState::Ringing).await;

        let accepting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.accept().await })
        };
        settle().await;
        assert_eq!(handle.view().pending_action, Some(ControlAction::Accept));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let view = handle.view();
        assert_eq!(view.end_reason, Some(EndReason::LocalTimeout));
        // Hangup wartet, bis der Accept-Request durch ist
        assert_eq!(
            control.calls(),
            vec![(ControlAction::Accept, "CA1".to_string())]
        );

        assert!(accepting.await.unwrap().is_ok());
        settle().await;
        assert_ne!(handle.view().state, CallState::Connected);
        assert_eq!(
            control.calls(),
            vec![
                (ControlAction::Accept, "CA1".to_string()),
                (ControlAction::Hangup, "CA1".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_stays_ringing() {
        let control = Arc::new(MockControl::default());
        control.fail(ControlAction::Accept, ControlError::NotFound("CA1".into()));
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(&handle, CallState::Ringing).await;

        let result = handle.accept().await;
        assert!(matches!(
            result,
            Err(CallError::Control(ControlError::NotFound(_)))
        ));
        let view = handle.view();
        assert_eq!(view.state, CallState::Ringing);
        assert_eq!(view.pending_action, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_is_optimistic() {
        let control = Arc::new(MockControl::default());
        control.delay(ControlAction::Hangup, Duration::from_secs(10));
        control.fail(ControlAction::Hangup, ControlError::Network("offline".into()));
        let (bus, handle) = setup(&control);

        ring_and_accept(&bus, &handle).await;
        handle.hangup().await.unwrap();

        let view = handle.view();
        assert_eq!(view.state, CallState::Ended);
        assert_eq!(view.end_reason, Some(EndReason::LocalHangup));
        assert_eq!(view.pending_action, Some(ControlAction::Hangup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_regression_is_ignored() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        bus.dispatch(&status(Some("CA1"), "in-progress"));
        let connected = wait_state(&handle, CallState::Connected).await;

        bus.dispatch(&status(Some("CA1"), "ringing"));
        settle().await;
        let view = handle.view();
        assert_eq!(view.state, CallState::Connected);
        assert_eq!(view.connected_at, connected.connected_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_answered_keeps_timer() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        ring_and_accept(&bus, &handle).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        bus.dispatch(&status(Some("CA1"), "answered"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.view().duration_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_before_dial_response_are_replayed() {
        let control = Arc::new(MockControl::default());
        control.delay(ControlAction::Dial, Duration::from_secs(1));
        let (bus, handle) = setup(&control);

        let dialing = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.dial("+15551230000").await })
        };
        settle().await;
        assert_eq!(handle.view().pending_action, Some(ControlAction::Dial));

        bus.dispatch(&status(Some(CALL_ID), "ringing"));
        assert!(dialing.await.unwrap().is_ok());

        let view = wait_state(&handle, CallState::Ringing).await;
        assert_eq!(view.call_id.as_deref(), Some(CALL_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_errors() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        assert!(matches!(
            handle.dial("  ").await,
            Err(CallError::Control(ControlError::Validation(_)))
        ));
        assert!(control.calls().is_empty());

        bus.dispatch(&incoming("CA1", "+15557654321"));
        wait_state(&handle, CallState::Ringing).await;
        assert_eq!(
            handle.dial("+15551230000").await,
            Err(CallError::AlreadyInCall)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_network_failure_stays_idle() {
        let control = Arc::new(MockControl::default());
        control.fail(ControlAction::Dial, ControlError::Network("refused".into()));
        let (_bus, handle) = setup(&control);

        assert!(matches!(
            handle.dial("+15551230000").await,
            Err(CallError::Control(ControlError::Network(_)))
        ));
        assert_eq!(handle.view(), CallView::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_dial_cancels_call() {
        let control = Arc::new(MockControl::default());
        control.delay(ControlAction::Dial, Duration::from_secs(1));
        let (_bus, handle) = setup(&control);

        let dialing = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.dial("+15551230000").await })
        };
        settle().await;

        handle.hangup().await.unwrap();
        assert_eq!(dialing.await.unwrap(), Err(CallError::DialCancelled));
        settle().await;

        assert_eq!(handle.state(), CallState::Idle);
        assert_eq!(
            control.calls(),
            vec![
                (ControlAction::Dial, "+15551230000".to_string()),
                (ControlAction::Hangup, CALL_ID.to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_call_ended_is_ignored() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        ring_and_accept(&bus, &handle).await;
        bus.dispatch(&ended(Some("CA9"), Some("completed")));
        settle().await;
        assert_eq!(handle.state(), CallState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call_flushes_ended_session() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);
        let mut events = handle.subscribe();

        bus.dispatch(&incoming("CA1", "+15557654321"));
        bus.dispatch(&ended(Some("CA1"), Some("no-answer")));
        wait_state(&handle, CallState::Ended).await;

        bus.dispatch(&incoming("CA2", "+15550000002"));
        let view = wait_for(&handle, |v| v.call_id.as_deref() == Some("CA2")).await;
        assert_eq!(view.state, CallState::Ringing);

        let mut cleared = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SessionCleared { call_id, .. } = event {
                cleared.push(call_id);
            }
        }
        assert_eq!(cleared, vec![Some("CA1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_call_never_rings_again() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        bus.dispatch(&incoming("CA1", "+15557654321"));
        bus.dispatch(&ended(Some("CA1"), None));
        wait_state(&handle, CallState::Ended).await;

        // Während der Ended-Anzeige
        bus.dispatch(&incoming("CA1", "+15557654321"));
        settle().await;
        let view = handle.view();
        assert_eq!(view.state, CallState::Ended);
        assert_eq!(view.end_reason, Some(EndReason::Completed));

        // Nach dem Verwerfen
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.state(), CallState::Idle);
        bus.dispatch(&incoming("CA1", "+15557654321"));
        settle().await;
        assert_eq!(handle.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_resume_after_disconnect() {
        let control = Arc::new(MockControl::default());
        let (bus, handle) = setup(&control);

        ring_and_accept(&bus, &handle).await;
        bus.dispatch(&SignalingEvent::Disconnect);
        bus.dispatch(&SignalingEvent::Connect);
        bus.dispatch(&status(Some("CA1"), "completed"));

        let view = wait_state(&handle, CallState::Ended).await;
        assert_eq!(view.end_reason, Some(EndReason::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_in_wrong_state() {
        let control = Arc::new(MockControl::default());
        let (_bus, handle) = setup(&control);

        assert_eq!(handle.accept().await, Err(CallError::NoActiveCall));
        assert_eq!(handle.hangup().await, Err(CallError::NoActiveCall));

        handle.dial("+15551230000").await.unwrap();
        assert_eq!(
            handle.accept().await,
            Err(CallError::InvalidState {
                action: ControlAction::Accept,
                state: CallState::Dialing,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_name_lookup() {
        let control = Arc::new(MockControl::default());
        let handle = CallSessionMachine::new(control, CallConfig::default())
            .with_contacts(Arc::new(Contacts))
            .spawn();

        handle.dial("+15551230000").await.unwrap();
        assert_eq!(handle.view().counterpart_name.as_deref(), Some("Alice"));
    }
}
