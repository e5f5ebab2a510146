use chrono::Timelike;

use crate::{
    codec::ProtocolMessage,
    types::{BatterySample, TimeOfDay},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryTrigger {
    Periodic,
    /// First report on every established connection.
    Connected,
    SettingsChanged,
    Manual,
}

impl TelemetryTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::Connected => "connected",
            Self::SettingsChanged => "settings-changed",
            Self::Manual => "manual",
        }
    }
}

pub fn clock_of<T: Timelike>(now: &T) -> TimeOfDay {
    TimeOfDay {
        hour: now.hour() as u8,
        minute: now.minute() as u8,
    }
}

/// `None` when the device reports an unusable battery reading.
pub fn telemetry_message(sample: BatterySample, clock: TimeOfDay) -> Option<ProtocolMessage> {
    sample.percent().map(|battery_percent| ProtocolMessage::Telemetry {
        battery_percent,
        clock,
    })
}
