use serde::{Deserialize, Serialize};

pub const OUTLET_COUNT: usize = 4;

/// Selectable stop-charging percentages, in the order the settings list shows them.
pub const BATTERY_THRESHOLD_CHOICES: [u8; 9] = [100, 95, 90, 85, 80, 75, 70, 60, 50];

/// One of the four switchable outlets, numbered 1 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Outlet(u8);

impl Outlet {
    pub const ALL: [Outlet; OUTLET_COUNT] = [Outlet(1), Outlet(2), Outlet(3), Outlet(4)];

    pub fn new(number: u8) -> Option<Self> {
        if (1..=OUTLET_COUNT as u8).contains(&number) {
            Some(Self(number))
        } else {
            None
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutletState([bool; OUTLET_COUNT]);

impl OutletState {
    pub fn from_array(states: [bool; OUTLET_COUNT]) -> Self {
        Self(states)
    }

    pub fn as_array(&self) -> [bool; OUTLET_COUNT] {
        self.0
    }

    pub fn get(&self, outlet: Outlet) -> bool {
        self.0[outlet.index()]
    }

    pub fn set(&mut self, outlet: Outlet, on: bool) {
        self.0[outlet.index()] = on;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    /// Zero-padded 24-hour rendering used by telemetry, e.g. `14-05`.
    pub fn clock_string(self) -> String {
        format!("{:02}-{:02}", self.hour, self.minute)
    }

    /// Unpadded rendering used by timer setting updates, e.g. `7-5`.
    pub fn setting_string(self) -> String {
        format!("{}-{}", self.hour, self.minute)
    }

    /// Accepts both renderings, and `:` as the separator.
    pub fn parse(value: &str) -> Option<Self> {
        let (hour, minute) = value.split_once(['-', ':'])?;
        let hour = hour.trim().parse::<u8>().ok()?;
        let minute = minute.trim().parse::<u8>().ok()?;
        Self::new(hour, minute)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatteryThreshold {
    index: usize,
}

impl BatteryThreshold {
    pub fn from_index(index: usize) -> Option<Self> {
        (index < BATTERY_THRESHOLD_CHOICES.len()).then_some(Self { index })
    }

    pub fn from_percent(percent: u8) -> Option<Self> {
        BATTERY_THRESHOLD_CHOICES
            .iter()
            .position(|choice| *choice == percent)
            .map(|index| Self { index })
    }

    pub fn index(self) -> usize {
        self.index
    }

    pub fn percent(self) -> u8 {
        BATTERY_THRESHOLD_CHOICES[self.index.min(BATTERY_THRESHOLD_CHOICES.len() - 1)]
    }

    pub fn sanitize(&mut self) {
        if self.index >= BATTERY_THRESHOLD_CHOICES.len() {
            self.index = 0;
        }
    }
}

/// Raw battery reading as the device reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatterySample {
    pub level: i32,
    pub scale: i32,
}

impl BatterySample {
    pub fn percent(self) -> Option<f32> {
        if self.level < 0 || self.scale <= 0 {
            return None;
        }
        Some((self.level as f32 / self.scale as f32) * 100.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub connection: &'static str,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "networkAvailable")]
    pub network_available: bool,
    pub outlets: [bool; OUTLET_COUNT],
    #[serde(rename = "batteryThreshold")]
    pub battery_threshold: u8,
    #[serde(rename = "timerOn")]
    pub timer_on: Option<String>,
    #[serde(rename = "timerOff")]
    pub timer_off: Option<String>,
    #[serde(rename = "syncOutstanding")]
    pub sync_outstanding: bool,
}
