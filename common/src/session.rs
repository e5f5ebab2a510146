use crate::{
    codec::{decode, DecodeError, ProtocolMessage},
    config::{PersistedSettings, SessionConfig},
    dispatch::{route, Intent, Route},
    error::{SessionError, TransportError},
    reconcile::{Reconciler, SyncOutcome},
    telemetry::{telemetry_message, TelemetryTrigger},
    types::{BatterySample, ClientStatus, ConnectionStatus, OutletState, TimeOfDay},
};

/// Work the host must carry out after an engine call. The engine itself
/// never touches the network.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Connect { delay_ms: u64 },
    Disconnect,
    Subscribe,
    Publish(ProtocolMessage),
    /// Message produced while no session is up; at-most-once means it is gone.
    Discard(ProtocolMessage),
    /// Remote state replaced local state; tell the UI observer.
    ApplyOutlets(OutletState),
    /// Local settings changed and should be persisted.
    Snapshot(PersistedSettings),
    TriggerTelemetry(TelemetryTrigger),
    Ignore(Ignored),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    StaleSync { token: u32, expected: Option<u32> },
    Unhandled(&'static str),
}

#[derive(Debug, Clone)]
pub struct SessionEngine {
    pub config: SessionConfig,
    settings: PersistedSettings,

    status: ConnectionStatus,
    last_error: Option<SessionError>,
    started: bool,
    network_available: bool,
    consecutive_failures: u32,

    reconciler: Reconciler,
}

impl SessionEngine {
    pub fn new(config: SessionConfig, mut settings: PersistedSettings) -> Self {
        settings.sanitize();
        let reconciler = Reconciler::new(config.sync_tokens);
        Self {
            config,
            settings,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            started: false,
            network_available: true,
            consecutive_failures: 0,
            reconciler,
        }
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn outlets(&self) -> OutletState {
        self.settings.outlets
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    /// Whether the transport should be driving the connection right now.
    /// False while offline so a dead network is never busy-polled.
    pub fn should_poll(&self) -> bool {
        self.started && (self.status == ConnectionStatus::Connected || self.network_available)
    }

    pub fn start(&mut self) -> Vec<SessionAction> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        if !self.network_available {
            self.last_error = Some(SessionError::ConnectivityUnavailable);
            return Vec::new();
        }

        self.status = ConnectionStatus::Connecting;
        vec![SessionAction::Connect { delay_ms: 0 }]
    }

    pub fn stop(&mut self) -> Vec<SessionAction> {
        if !self.started {
            return Vec::new();
        }
        self.started = false;
        self.reconciler.abandon();

        let was_live = self.status != ConnectionStatus::Disconnected;
        self.status = ConnectionStatus::Disconnected;
        if was_live {
            vec![SessionAction::Disconnect]
        } else {
            Vec::new()
        }
    }

    pub fn connect_attempt(&mut self) {
        if self.started && self.status == ConnectionStatus::Disconnected {
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// Broker accepted the connection. Sync is requested here and only here,
    /// once per established connection. The backoff counter survives until
    /// the subscription is confirmed.
    pub fn connected(&mut self) -> Vec<SessionAction> {
        if !self.started {
            return vec![SessionAction::Disconnect];
        }
        if self.status == ConnectionStatus::Connected {
            return Vec::new();
        }

        self.status = ConnectionStatus::Connected;
        self.last_error = None;

        vec![
            SessionAction::Subscribe,
            SessionAction::Publish(ProtocolMessage::Greeting(self.config.greeting.clone())),
            SessionAction::Publish(self.reconciler.request()),
            SessionAction::TriggerTelemetry(TelemetryTrigger::Connected),
        ]
    }

    /// Broker granted the inbound subscription; the session is fully up.
    pub fn subscribed(&mut self) {
        if self.status == ConnectionStatus::Connected {
            self.consecutive_failures = 0;
        }
    }

    pub fn connection_lost(&mut self, cause: TransportError) -> Vec<SessionAction> {
        self.status = ConnectionStatus::Disconnected;
        self.reconciler.abandon();

        if !self.started {
            return Vec::new();
        }
        if !self.network_available {
            self.last_error = Some(SessionError::ConnectivityUnavailable);
            return Vec::new();
        }

        self.last_error = Some(cause.into());
        let delay_ms = self.next_reconnect_delay_ms();
        vec![SessionAction::Connect { delay_ms }]
    }

    pub fn connectivity_changed(&mut self, available: bool) -> Vec<SessionAction> {
        let was_available = self.network_available;
        self.network_available = available;

        if !available || was_available || !self.started {
            return Vec::new();
        }
        if self.last_error == Some(SessionError::ConnectivityUnavailable) {
            self.last_error = None;
        }
        if self.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }

        self.consecutive_failures = 0;
        self.status = ConnectionStatus::Connecting;
        vec![SessionAction::Connect { delay_ms: 0 }]
    }

    pub fn subscribe_failed(&mut self, reason: String) -> Vec<SessionAction> {
        self.last_error = Some(TransportError::Subscribe(reason).into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.status = ConnectionStatus::Disconnected;
        self.reconciler.abandon();
        vec![SessionAction::Disconnect]
    }

    /// Dropped, not retried. Only recorded.
    pub fn publish_failed(&mut self, cause: TransportError) {
        self.last_error = Some(cause.into());
    }

    pub fn send(&mut self, message: ProtocolMessage) -> Vec<SessionAction> {
        if self.status == ConnectionStatus::Connected {
            vec![SessionAction::Publish(message)]
        } else {
            vec![SessionAction::Discard(message)]
        }
    }

    /// Raw inbound bytes; anything that is not UTF-8 is a decode failure
    /// like any other.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Result<Vec<SessionAction>, DecodeError> {
        match std::str::from_utf8(payload) {
            Ok(text) => self.handle_wire(text),
            Err(_) => Err(self.decode_failed(DecodeError::NotUtf8)),
        }
    }

    pub fn handle_wire(&mut self, payload: &str) -> Result<Vec<SessionAction>, DecodeError> {
        match decode(payload) {
            Ok(message) => Ok(self.handle_message(message)),
            Err(err) => Err(self.decode_failed(err)),
        }
    }

    fn decode_failed(&mut self, err: DecodeError) -> DecodeError {
        self.last_error = Some(err.clone().into());
        err
    }

    pub fn handle_message(&mut self, message: ProtocolMessage) -> Vec<SessionAction> {
        match route(message) {
            Route::Reconcile { outlets, token } => match self.reconciler.accept(outlets, token) {
                SyncOutcome::Applied(outlets) => {
                    self.settings.outlets = outlets;
                    vec![
                        SessionAction::ApplyOutlets(outlets),
                        SessionAction::Snapshot(self.settings.clone()),
                    ]
                }
                SyncOutcome::Stale { token, expected } => {
                    vec![SessionAction::Ignore(Ignored::StaleSync { token, expected })]
                }
            },
            Route::Unhandled(kind) => vec![SessionAction::Ignore(Ignored::Unhandled(kind))],
        }
    }

    /// Local state changes first, then one message goes out per intent.
    /// Repeated identical intents are not collapsed.
    pub fn apply_intent(&mut self, intent: Intent) -> Vec<SessionAction> {
        intent.apply(&mut self.settings);

        let mut actions = vec![SessionAction::Snapshot(self.settings.clone())];
        actions.extend(self.send(intent.message()));
        if intent.changes_settings() {
            actions.push(SessionAction::TriggerTelemetry(
                TelemetryTrigger::SettingsChanged,
            ));
        }
        actions
    }

    pub fn telemetry(&mut self, sample: BatterySample, clock: TimeOfDay) -> Vec<SessionAction> {
        match telemetry_message(sample, clock) {
            Some(message) => self.send(message),
            None => Vec::new(),
        }
    }

    /// On-demand sync from the UI. The connect path does not go through here.
    pub fn resync(&mut self) -> Vec<SessionAction> {
        if self.status != ConnectionStatus::Connected {
            return Vec::new();
        }
        vec![SessionAction::Publish(self.reconciler.request())]
    }

    pub fn status_view(&self) -> ClientStatus {
        ClientStatus {
            connection: self.status.as_str(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            network_available: self.network_available,
            outlets: self.settings.outlets.as_array(),
            battery_threshold: self.settings.battery_threshold.percent(),
            timer_on: self.settings.timer_on.map(|t| t.clock_string()),
            timer_off: self.settings.timer_off.map(|t| t.clock_string()),
            sync_outstanding: self.reconciler.outstanding().is_some(),
        }
    }

    /// Immediate on the first failure, then doubling up to the configured cap.
    fn next_reconnect_delay_ms(&mut self) -> u64 {
        let delay = match self.consecutive_failures {
            0 => 0,
            n => {
                let factor = 1u64 << (n - 1).min(16);
                self.config
                    .reconnect_base_ms
                    .saturating_mul(factor)
                    .min(self.config.reconnect_max_ms)
            }
        };
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }
}
