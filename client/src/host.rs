use std::{
    collections::{HashMap, VecDeque},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, SubscribeReasonCode};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex, Notify},
    time::Instant,
};
use tracing::{debug, info, warn};

use powerstrip_common::{
    encode, BatteryThreshold, ConnectionStatus, Ignored, Intent, Outlet, OutletState,
    PersistedSettings, RuntimeConfig, SessionAction, SessionEngine, TelemetryTrigger, TimeOfDay,
    TransportError,
};

use crate::{
    device::{BatterySource, ConnectivityProbe, SysfsBattery, SysfsConnectivity, WallClock},
    outbox::{AtMostOnceOutbox, Outbox},
};

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<SessionEngine>>,
    mqtt: AsyncClient,
    outbox: Arc<dyn Outbox>,
    inbound_topic: Arc<String>,
    /// Wakes the transport loop when a connect becomes possible again.
    wake: Arc<Notify>,
    telemetry: mpsc::Sender<TelemetryTrigger>,
    outlets: Arc<watch::Sender<OutletState>>,
    settings: Arc<watch::Sender<PersistedSettings>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct OutletsView {
    outlets: [bool; 4],
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_OUTLET_WAIT_SECS: u64 = 60;
const TELEMETRY_QUEUE_DEPTH: usize = 8;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let mut mqtt_options = MqttOptions::new(
        runtime.session.client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(runtime.session.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let probe: Arc<dyn ConnectivityProbe> =
        Arc::new(SysfsConnectivity::new(runtime.connectivity.assume_online));
    let battery: Arc<dyn BatterySource> =
        Arc::new(SysfsBattery::new(runtime.telemetry.battery_path.as_deref()));
    let clock = WallClock::new(runtime.timezone.as_deref());

    let online = probe_connectivity(&probe).await.unwrap_or(true);
    let mut engine = SessionEngine::new(runtime.session.clone(), runtime.settings.clone());
    let _ = engine.connectivity_changed(online);

    let (outlets_tx, _) = watch::channel(engine.outlets());
    let (settings_tx, settings_rx) = watch::channel(engine.settings().clone());
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE_DEPTH);

    let outbox = AtMostOnceOutbox::new(mqtt.clone(), runtime.network.outbound_topic.clone());
    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        mqtt,
        outbox: Arc::new(outbox),
        inbound_topic: Arc::new(runtime.network.inbound_topic.clone()),
        wake: Arc::new(Notify::new()),
        telemetry: telemetry_tx,
        outlets: Arc::new(outlets_tx),
        settings: Arc::new(settings_tx),
        store,
    };

    spawn_settings_persist_loop(
        app_state.store.clone(),
        settings_rx,
        Duration::from_millis(runtime.settings_save_debounce_ms),
    );
    spawn_mqtt_loop(
        app_state.clone(),
        eventloop,
        Duration::from_secs(runtime.session.connect_timeout_secs),
    );
    spawn_connectivity_watch(
        app_state.clone(),
        probe,
        Duration::from_secs(runtime.connectivity.poll_interval_secs),
    );
    spawn_telemetry_loop(
        app_state.clone(),
        telemetry_rx,
        battery,
        clock,
        Duration::from_secs(runtime.telemetry.interval_secs),
    );

    let start = app_state.engine.lock().await.start();
    if start.is_empty() {
        info!("network unavailable, connect deferred until it returns");
    }
    execute_session_actions(&app_state, start).await;

    let port = std::env::var("POWERSTRIP_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind client server at {addr}"))?;

    info!(
        "powerstrip client listening on http://{addr}, broker {}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );
    axum::serve(listener, router(app_state.clone()))
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("http server failed")?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/outlets", get(handle_get_outlets))
        .route("/api/outlet", post(handle_set_outlet))
        .route("/api/battery", post(handle_set_battery))
        .route("/api/timer/on", post(handle_set_timer_on))
        .route("/api/timer/off", post(handle_set_timer_off))
        .route("/api/sync", post(handle_sync))
        .route("/api/telemetry", post(handle_telemetry))
        .with_state(app_state)
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(online) = std::env::var("POWERSTRIP_ASSUME_ONLINE")
        .ok()
        .and_then(|value| parse_switch(&value))
    {
        runtime.connectivity.assume_online = online;
    }
}

async fn shutdown_signal(app_state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");

    let (actions, settings) = {
        let mut engine = app_state.engine.lock().await;
        (engine.stop(), engine.settings().clone())
    };
    execute_session_actions(&app_state, actions).await;

    if let Err(err) = app_state.store.save_settings(&settings).await {
        warn!("failed to persist settings on shutdown: {err:#}");
    }
}

/// Runs engine actions in order. Returns the reconnect delay if one was
/// requested so the transport loop can wait it out.
async fn execute_session_actions(
    app_state: &AppState,
    actions: Vec<SessionAction>,
) -> Option<Duration> {
    let mut queue = VecDeque::from(actions);
    let mut reconnect_delay = None;

    while let Some(action) = queue.pop_front() {
        match action {
            SessionAction::Connect { delay_ms } => {
                reconnect_delay = Some(Duration::from_millis(delay_ms));
                app_state.wake.notify_one();
            }
            SessionAction::Disconnect => {
                if let Err(err) = app_state.mqtt.try_disconnect() {
                    debug!("mqtt disconnect request dropped: {err}");
                }
            }
            SessionAction::Subscribe => {
                let topic = app_state.inbound_topic.as_str();
                if let Err(err) = app_state.mqtt.try_subscribe(topic, QoS::AtMostOnce) {
                    warn!("subscribe to {topic} failed: {err}");
                    let follow_up = app_state
                        .engine
                        .lock()
                        .await
                        .subscribe_failed(err.to_string());
                    queue.extend(follow_up);
                }
            }
            SessionAction::Publish(message) => match app_state.outbox.deliver(encode(&message)) {
                Ok(()) => debug!("sent {} message", message.kind()),
                Err(err) => {
                    warn!("dropping {} message: {err}", message.kind());
                    app_state.engine.lock().await.publish_failed(err);
                }
            },
            SessionAction::Discard(message) => {
                debug!("not connected, discarding {} message", message.kind());
            }
            SessionAction::ApplyOutlets(outlets) => {
                info!("outlet state from remote: {:?}", outlets.as_array());
                app_state.outlets.send_replace(outlets);
            }
            SessionAction::Snapshot(settings) => {
                app_state.settings.send_replace(settings);
            }
            SessionAction::TriggerTelemetry(trigger) => {
                if let Err(err) = app_state.telemetry.try_send(trigger) {
                    debug!("telemetry trigger {} dropped: {err}", trigger.as_str());
                }
            }
            SessionAction::Ignore(Ignored::StaleSync { token, expected }) => {
                info!("dropping stale sync reply #{token} (waiting for {expected:?})");
            }
            SessionAction::Ignore(Ignored::Unhandled(kind)) => {
                debug!("ignoring inbound {kind} message");
            }
        }
    }

    reconnect_delay
}

async fn wait_until_pollable(app_state: &AppState) {
    while !app_state.engine.lock().await.should_poll() {
        app_state.wake.notified().await;
    }
}

async fn pause_for_reconnect(app_state: &AppState, actions: Vec<SessionAction>) {
    if let Some(delay) = execute_session_actions(app_state, actions).await {
        if !delay.is_zero() {
            info!("reconnecting in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: EventLoop, connect_timeout: Duration) {
    tokio::spawn(async move {
        loop {
            wait_until_pollable(&app_state).await;

            let connected = {
                let mut engine = app_state.engine.lock().await;
                engine.connect_attempt();
                engine.status() == ConnectionStatus::Connected
            };

            let event = if connected {
                eventloop.poll().await
            } else {
                match tokio::time::timeout(connect_timeout, eventloop.poll()).await {
                    Ok(event) => event,
                    Err(_) => {
                        warn!("mqtt connect timed out after {}s", connect_timeout.as_secs());
                        let actions = app_state.engine.lock().await.connection_lost(
                            TransportError::ConnectTimeout(connect_timeout.as_secs()),
                        );
                        pause_for_reconnect(&app_state, actions).await;
                        continue;
                    }
                }
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    let actions = app_state.engine.lock().await.connected();
                    execute_session_actions(&app_state, actions).await;
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    if rejected {
                        warn!("broker rejected subscription to {}", app_state.inbound_topic);
                        let actions = app_state
                            .engine
                            .lock()
                            .await
                            .subscribe_failed("rejected by broker".to_string());
                        execute_session_actions(&app_state, actions).await;
                    } else {
                        debug!("subscribed to {}", app_state.inbound_topic);
                        app_state.engine.lock().await.subscribed();
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    let (actions, online) = {
                        let mut engine = app_state.engine.lock().await;
                        let cause = if engine.status() == ConnectionStatus::Connected {
                            TransportError::ConnectionLost(err.to_string())
                        } else {
                            TransportError::Connect(err.to_string())
                        };
                        let online = engine.network_available();
                        (engine.connection_lost(cause), online)
                    };
                    if online {
                        warn!("mqtt connection error: {err}");
                    } else {
                        debug!("mqtt connection error while offline: {err}");
                    }
                    pause_for_reconnect(&app_state, actions).await;
                }
            }
        }
    });
}

fn spawn_connectivity_watch(
    app_state: AppState,
    probe: Arc<dyn ConnectivityProbe>,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let Some(available) = probe_connectivity(&probe).await else {
                continue;
            };

            let (changed, actions) = {
                let mut engine = app_state.engine.lock().await;
                let changed = engine.network_available() != available;
                (changed, engine.connectivity_changed(available))
            };
            if changed {
                if available {
                    info!("network available");
                } else {
                    warn!("network unavailable, pausing reconnects");
                }
            }
            execute_session_actions(&app_state, actions).await;
        }
    });
}

/// Sysfs reads block, so they run off the async workers.
async fn probe_connectivity(probe: &Arc<dyn ConnectivityProbe>) -> Option<bool> {
    let probe = probe.clone();
    match tokio::task::spawn_blocking(move || probe.is_available()).await {
        Ok(available) => Some(available),
        Err(err) => {
            warn!("connectivity probe failed: {err}");
            None
        }
    }
}

fn spawn_telemetry_loop(
    app_state: AppState,
    mut triggers: mpsc::Receiver<TelemetryTrigger>,
    battery: Arc<dyn BatterySource>,
    clock: WallClock,
    every: Duration,
) {
    tokio::spawn(async move {
        // The first report goes out on connect; periodic beats follow.
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            let trigger = tokio::select! {
                _ = interval.tick() => TelemetryTrigger::Periodic,
                Some(trigger) = triggers.recv() => trigger,
            };
            emit_telemetry(&app_state, &battery, &clock, trigger).await;
        }
    });
}

async fn emit_telemetry(
    app_state: &AppState,
    battery: &Arc<dyn BatterySource>,
    clock: &WallClock,
    trigger: TelemetryTrigger,
) {
    let battery = battery.clone();
    let sample = tokio::task::spawn_blocking(move || battery.sample())
        .await
        .unwrap_or_else(|err| {
            warn!("battery read failed: {err}");
            None
        });
    let Some(sample) = sample else {
        warn!(
            "battery level unavailable, skipping {} telemetry",
            trigger.as_str()
        );
        return;
    };

    let actions = app_state
        .engine
        .lock()
        .await
        .telemetry(sample, clock.now());
    debug!("{} telemetry beat", trigger.as_str());
    execute_session_actions(app_state, actions).await;
}

fn spawn_settings_persist_loop(
    store: AppStore,
    mut settings: watch::Receiver<PersistedSettings>,
    debounce: Duration,
) {
    tokio::spawn(async move {
        while settings.changed().await.is_ok() {
            tokio::time::sleep(debounce).await;
            let snapshot = settings.borrow_and_update().clone();
            if let Err(err) = store.save_settings(&snapshot).await {
                warn!("failed to persist settings: {err:#}");
            }
        }
    });
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }
    if topic != app_state.inbound_topic.as_str() {
        debug!("ignoring message on unexpected topic {topic}");
        return;
    }

    let decoded = app_state.engine.lock().await.handle_payload(payload);
    match decoded {
        Ok(actions) => {
            execute_session_actions(app_state, actions).await;
        }
        Err(err) => warn!(
            "discarding malformed message {:?}: {err}",
            String::from_utf8_lossy(payload)
        ),
    }
}

async fn dispatch_intent(state: &AppState, intent: Intent) {
    let actions = state.engine.lock().await.apply_intent(intent);
    execute_session_actions(state, actions).await;
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.status_view();
    Json(status)
}

/// `?wait=N` holds the request until the outlet state changes or N seconds pass.
async fn handle_get_outlets(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mut outlets = state.outlets.subscribe();
    if let Some(wait) = params.get("wait") {
        let Ok(secs) = wait.parse::<u64>() else {
            return error_response(StatusCode::BAD_REQUEST, "Invalid 'wait' value");
        };
        let secs = secs.min(MAX_OUTLET_WAIT_SECS);
        let _ = tokio::time::timeout(Duration::from_secs(secs), outlets.changed()).await;
    }

    let current = *outlets.borrow();
    Json(OutletsView {
        outlets: current.as_array(),
    })
    .into_response()
}

async fn handle_set_outlet(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(outlet) = params
        .get("index")
        .and_then(|value| value.parse::<u8>().ok())
        .and_then(Outlet::new)
    else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'index' (1-4)");
    };
    let Some(on) = params.get("value").and_then(|value| parse_switch(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'value'. Use 'on' or 'off'");
    };

    dispatch_intent(&state, Intent::ToggleOutlet { outlet, on }).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_battery(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(threshold) = value
        .parse::<u8>()
        .ok()
        .and_then(BatteryThreshold::from_percent)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid battery threshold (100, 95, 90, 85, 80, 75, 70, 60, 50)",
        );
    };

    dispatch_intent(&state, Intent::SetBatteryThreshold(threshold)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_timer_on(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(time) = params.get("value").and_then(|value| TimeOfDay::parse(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid time value (H-M)");
    };

    dispatch_intent(&state, Intent::SetTimerOn(time)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_timer_off(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(time) = params.get("value").and_then(|value| TimeOfDay::parse(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid time value (H-M)");
    };

    dispatch_intent(&state, Intent::SetTimerOff(time)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_sync(State(state): State<AppState>) -> impl IntoResponse {
    let actions = {
        let mut engine = state.engine.lock().await;
        if engine.status() != ConnectionStatus::Connected {
            return error_response(StatusCode::CONFLICT, "Not connected");
        }
        engine.resync()
    };
    execute_session_actions(&state, actions).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_telemetry(State(state): State<AppState>) -> impl IntoResponse {
    if state.telemetry.try_send(TelemetryTrigger::Manual).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Telemetry queue is full");
    }
    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("POWERSTRIP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.powerstrip"));
        Self::at(&data_dir)
    }

    fn at(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw).with_context(|| {
                format!("invalid runtime config at {}", self.runtime_path.display())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    /// Rewrites only the settings section; environment overrides never land
    /// on disk.
    async fn save_settings(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        let mut runtime = self.load_runtime_config().await?;
        runtime.settings = settings.clone();
        self.save_runtime_config(&runtime).await
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::testing::RecordingOutbox;
    use powerstrip_common::{SessionConfig, SessionError};

    struct Harness {
        state: AppState,
        outbox: Arc<RecordingOutbox>,
        triggers: mpsc::Receiver<TelemetryTrigger>,
        _eventloop: EventLoop,
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("powerstrip-host-{name}-{}", std::process::id()))
    }

    fn harness(name: &str, outbox: RecordingOutbox) -> Harness {
        let (mqtt, eventloop) =
            AsyncClient::new(MqttOptions::new("host-test", "localhost", 1883), 16);
        let engine = SessionEngine::new(SessionConfig::default(), PersistedSettings::default());
        let (outlets_tx, _) = watch::channel(engine.outlets());
        let (settings_tx, _) = watch::channel(engine.settings().clone());
        let (telemetry_tx, triggers) = mpsc::channel(TELEMETRY_QUEUE_DEPTH);
        let outbox = Arc::new(outbox);

        let state = AppState {
            engine: Arc::new(Mutex::new(engine)),
            mqtt,
            outbox: outbox.clone(),
            inbound_topic: Arc::new("ToAndroid".to_string()),
            wake: Arc::new(Notify::new()),
            telemetry: telemetry_tx,
            outlets: Arc::new(outlets_tx),
            settings: Arc::new(settings_tx),
            store: AppStore::at(&scratch_dir(name)),
        };

        Harness {
            state,
            outbox,
            triggers,
            _eventloop: eventloop,
        }
    }

    async fn bring_up(state: &AppState) {
        let actions = {
            let mut engine = state.engine.lock().await;
            let _ = engine.start();
            engine.connect_attempt();
            engine.connected()
        };
        execute_session_actions(state, actions).await;
    }

    fn query(pairs: &[(&str, &str)]) -> Query<HashMap<String, String>> {
        Query(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn connect_greets_and_requests_sync() {
        let h = harness("connect", RecordingOutbox::default());
        bring_up(&h.state).await;

        assert_eq!(
            h.outbox.sent(),
            vec!["Hello from powerstrip client".to_string(), "Sync".to_string()]
        );
    }

    #[tokio::test]
    async fn outlet_toggle_publishes_and_snapshots() {
        let h = harness("toggle", RecordingOutbox::default());
        bring_up(&h.state).await;

        let response = handle_set_outlet(
            State(h.state.clone()),
            query(&[("index", "2"), ("value", "on")]),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.outbox.sent().last(), Some(&"State:2:1".to_string()));
        assert!(h.state.settings.borrow().outlets.as_array()[1]);
    }

    #[tokio::test]
    async fn timer_update_also_triggers_telemetry() {
        let mut h = harness("timer", RecordingOutbox::default());
        bring_up(&h.state).await;

        let response = handle_set_timer_on(State(h.state.clone()), query(&[("value", "7-30")]))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.outbox.sent().contains(&"Update:Timer On:7-30".to_string()));

        let mut triggers = Vec::new();
        while let Ok(trigger) = h.triggers.try_recv() {
            triggers.push(trigger);
        }
        assert_eq!(
            triggers,
            vec![TelemetryTrigger::Connected, TelemetryTrigger::SettingsChanged]
        );
    }

    struct FixedBattery;

    impl BatterySource for FixedBattery {
        fn sample(&self) -> Option<powerstrip_common::BatterySample> {
            Some(powerstrip_common::BatterySample {
                level: 45,
                scale: 100,
            })
        }
    }

    struct FixedProbe(bool);

    impl ConnectivityProbe for FixedProbe {
        fn is_available(&self) -> bool {
            self.0
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn first_report_goes_out_on_connect() {
        let Harness {
            state,
            outbox,
            triggers,
            _eventloop,
        } = harness("telemetry-connect", RecordingOutbox::default());

        spawn_telemetry_loop(
            state.clone(),
            triggers,
            Arc::new(FixedBattery),
            WallClock::new(Some("UTC")),
            Duration::from_secs(600),
        );
        let start = state.engine.lock().await.start();
        execute_session_actions(&state, start).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbox.sent().is_empty());

        bring_up(&state).await;
        assert!(
            wait_for(|| outbox
                .sent()
                .iter()
                .any(|sent| sent.starts_with("Current:45.0:")))
            .await
        );
        assert_eq!(outbox.sent()[..2], ["Hello from powerstrip client", "Sync"]);
    }

    #[tokio::test]
    async fn connectivity_watch_feeds_the_engine() {
        let h = harness("connectivity", RecordingOutbox::default());
        spawn_connectivity_watch(
            h.state.clone(),
            Arc::new(FixedProbe(false)),
            Duration::from_millis(20),
        );

        let engine = h.state.engine.clone();
        assert!(
            wait_for(|| engine
                .try_lock()
                .map(|engine| !engine.network_available())
                .unwrap_or(false))
            .await
        );
        assert!(!h.state.engine.lock().await.should_poll());
    }

    #[tokio::test]
    async fn bad_parameters_are_rejected() {
        let h = harness("bad-params", RecordingOutbox::default());

        let outlet = handle_set_outlet(
            State(h.state.clone()),
            query(&[("index", "5"), ("value", "on")]),
        )
        .await
        .into_response();
        assert_eq!(outlet.status(), StatusCode::BAD_REQUEST);

        let battery = handle_set_battery(State(h.state.clone()), query(&[("value", "42")]))
            .await
            .into_response();
        assert_eq!(battery.status(), StatusCode::BAD_REQUEST);

        let timer = handle_set_timer_off(State(h.state.clone()), query(&[("value", "25-00")]))
            .await
            .into_response();
        assert_eq!(timer.status(), StatusCode::BAD_REQUEST);
        assert!(h.outbox.sent().is_empty());
    }

    #[tokio::test]
    async fn intents_while_disconnected_change_local_state_only() {
        let h = harness("offline-intent", RecordingOutbox::default());

        let _ = handle_set_outlet(
            State(h.state.clone()),
            query(&[("index", "1"), ("value", "on")]),
        )
        .await;

        assert!(h.outbox.sent().is_empty());
        assert!(h.state.engine.lock().await.outlets().as_array()[0]);
    }

    #[tokio::test]
    async fn sync_reply_reaches_outlet_observer() {
        let h = harness("sync-reply", RecordingOutbox::default());
        bring_up(&h.state).await;
        let mut observer = h.state.outlets.subscribe();

        handle_mqtt_message(&h.state, "ToAndroid", b"1:0/2:1/3:0/4:1").await;

        assert!(observer.has_changed().unwrap());
        assert_eq!(
            observer.borrow_and_update().as_array(),
            [false, true, false, true]
        );
    }

    #[tokio::test]
    async fn foreign_and_oversized_messages_are_dropped() {
        let h = harness("foreign", RecordingOutbox::default());
        bring_up(&h.state).await;

        handle_mqtt_message(&h.state, "elsewhere", b"1:1/2:1/3:1/4:1").await;
        handle_mqtt_message(&h.state, "ToAndroid", &[b'1'; MAX_MQTT_PAYLOAD_BYTES + 1]).await;

        assert_eq!(*h.state.outlets.borrow(), OutletState::default());
    }

    #[tokio::test]
    async fn malformed_inbound_is_recorded_not_applied() {
        let h = harness("malformed", RecordingOutbox::default());
        bring_up(&h.state).await;

        handle_mqtt_message(&h.state, "ToAndroid", b"1:1/2").await;

        let engine = h.state.engine.lock().await;
        assert!(matches!(engine.last_error(), Some(SessionError::Decode(_))));
        assert_eq!(engine.outlets(), OutletState::default());
    }

    #[tokio::test]
    async fn non_utf8_inbound_shows_in_status() {
        let h = harness("non-utf8", RecordingOutbox::default());
        bring_up(&h.state).await;

        handle_mqtt_message(&h.state, "ToAndroid", &[0xc3, 0x28, b'/', 0xff]).await;

        let status = h.state.engine.lock().await.status_view();
        assert_eq!(
            status.last_error.as_deref(),
            Some("payload is not valid utf-8")
        );
        assert_eq!(status.outlets, [false; 4]);
    }

    #[tokio::test]
    async fn failed_publish_is_recorded() {
        let outbox = RecordingOutbox {
            fail: true,
            ..RecordingOutbox::default()
        };
        let h = harness("publish-fail", outbox);
        bring_up(&h.state).await;

        let engine = h.state.engine.lock().await;
        assert_eq!(engine.status(), ConnectionStatus::Connected);
        assert!(matches!(
            engine.last_error(),
            Some(SessionError::Transport(TransportError::Publish(_)))
        ));
    }

    #[tokio::test]
    async fn sync_requires_connection() {
        let h = harness("sync", RecordingOutbox::default());
        let refused = handle_sync(State(h.state.clone())).await.into_response();
        assert_eq!(refused.status(), StatusCode::CONFLICT);

        bring_up(&h.state).await;
        let accepted = handle_sync(State(h.state.clone())).await.into_response();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(h.outbox.sent().last(), Some(&"Sync".to_string()));
    }

    #[tokio::test]
    async fn reconnect_delay_is_returned() {
        let h = harness("delay", RecordingOutbox::default());
        let delay = execute_session_actions(
            &h.state,
            vec![SessionAction::Connect { delay_ms: 1_500 }],
        )
        .await;
        assert_eq!(delay, Some(Duration::from_millis(1_500)));
    }

    #[tokio::test]
    async fn settings_round_trip_through_store() {
        let dir = scratch_dir("store");
        let _ = std::fs::remove_dir_all(&dir);
        let store = AppStore::at(&dir);

        let mut settings = PersistedSettings::default();
        settings.timer_off = TimeOfDay::new(22, 15);
        settings.battery_threshold = BatteryThreshold::from_percent(80).unwrap();
        store.save_settings(&settings).await.unwrap();

        let runtime = store.load_runtime_config().await.unwrap();
        assert_eq!(runtime.settings, settings);
    }

    #[test]
    fn switch_values() {
        assert_eq!(parse_switch("ON"), Some(true));
        assert_eq!(parse_switch("0"), Some(false));
        assert_eq!(parse_switch("maybe"), None);
    }
}
