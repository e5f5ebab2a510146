use serde::{Deserialize, Serialize};

use crate::{
    topics::{DEFAULT_CLIENT_ID, DEFAULT_GREETING, TOPIC_INBOUND, TOPIC_OUTBOUND},
    types::{BatteryThreshold, OutletState, TimeOfDay},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub greeting: String,
    /// Append a correlation token to sync requests (`Sync:<n>`).
    #[serde(default)]
    pub sync_tokens: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive_secs: 720,
            connect_timeout_secs: 10,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            greeting: DEFAULT_GREETING.to_string(),
            sync_tokens: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
    #[serde(default)]
    pub battery_path: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            battery_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub assume_online: bool,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            assume_online: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub inbound_topic: String,
    pub outbound_topic: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "raspberrypi".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            inbound_topic: TOPIC_INBOUND.to_string(),
            outbound_topic: TOPIC_OUTBOUND.to_string(),
        }
    }
}

/// Last-known local state, written after every local change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub outlets: OutletState,
    pub battery_threshold: BatteryThreshold,
    #[serde(default)]
    pub timer_on: Option<TimeOfDay>,
    #[serde(default)]
    pub timer_off: Option<TimeOfDay>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub settings: PersistedSettings,
    /// IANA zone for the telemetry clock; system local time when unset.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_settings_save_debounce_ms")]
    pub settings_save_debounce_ms: u64,
}

fn default_settings_save_debounce_ms() -> u64 {
    2_000
}

impl PersistedSettings {
    pub fn sanitize(&mut self) {
        self.battery_threshold.sanitize();
        self.timer_on = self.timer_on.and_then(|t| TimeOfDay::new(t.hour, t.minute));
        self.timer_off = self.timer_off.and_then(|t| TimeOfDay::new(t.hour, t.minute));
    }
}

impl SessionConfig {
    pub fn sanitize(&mut self) {
        if self.client_id.trim().is_empty() {
            self.client_id = DEFAULT_CLIENT_ID.to_string();
        }
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 3_600);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
        self.reconnect_base_ms = self.reconnect_base_ms.max(100);
        if self.reconnect_max_ms < self.reconnect_base_ms {
            self.reconnect_max_ms = self.reconnect_base_ms;
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.session.sanitize();
        self.settings.sanitize();
        self.telemetry.interval_secs = self.telemetry.interval_secs.clamp(10, 86_400);
        self.connectivity.poll_interval_secs = self.connectivity.poll_interval_secs.clamp(1, 300);
        if self
            .timezone
            .as_deref()
            .is_some_and(|zone| zone.trim().is_empty())
        {
            self.timezone = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let raw = r#"{ "network": { "mqtt_host": "broker.lan", "mqtt_port": 1884,
            "mqtt_user": "", "mqtt_pass": "", "inbound_topic": "ToAndroid",
            "outbound_topic": "FromAndroid" } }"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.network.mqtt_host, "broker.lan");
        assert_eq!(config.session.keep_alive_secs, 720);
        assert_eq!(config.telemetry.interval_secs, 600);
        assert_eq!(config.settings_save_debounce_ms, 2_000);
    }

    #[test]
    fn sanitize_clamps_session_timing() {
        let mut config = RuntimeConfig::default();
        config.session.connect_timeout_secs = 0;
        config.session.reconnect_base_ms = 5_000;
        config.session.reconnect_max_ms = 10;
        config.timezone = Some("  ".to_string());
        config.sanitize();

        assert_eq!(config.session.connect_timeout_secs, 1);
        assert_eq!(config.session.reconnect_max_ms, 5_000);
        assert_eq!(config.timezone, None);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = PersistedSettings {
            outlets: OutletState::from_array([true, false, true, false]),
            battery_threshold: BatteryThreshold::from_percent(80).unwrap(),
            timer_on: TimeOfDay::new(7, 30),
            timer_off: None,
        };
        let raw = serde_json::to_string(&settings).unwrap();
        let parsed: PersistedSettings = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, settings);
    }
}
