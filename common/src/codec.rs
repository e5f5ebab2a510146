use std::fmt;

use thiserror::Error;

use crate::types::{Outlet, OutletState, TimeOfDay};

/// Width of the `1:b/2:b/3:b/4:b` status frame.
pub const SYNC_REPLY_WIDTH: usize = 15;

const TOKEN_SEPARATOR: u8 = b'#';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Battery,
    TimerOn,
    TimerOff,
}

impl SettingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Battery => "Battery",
            Self::TimerOn => "Timer On",
            Self::TimerOff => "Timer Off",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "Battery" => Some(Self::Battery),
            "Timer On" => Some(Self::TimerOn),
            "Timer Off" => Some(Self::TimerOff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    StateChange { outlet: Outlet, on: bool },
    SyncRequest { token: Option<u32> },
    SyncReply { outlets: OutletState, token: Option<u32> },
    Telemetry { battery_percent: f32, clock: TimeOfDay },
    SettingUpdate { kind: SettingKind, value: String },
    /// Outbound only; sent once per connection before the first sync.
    Greeting(String),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "state-change",
            Self::SyncRequest { .. } => "sync-request",
            Self::SyncReply { .. } => "sync-reply",
            Self::Telemetry { .. } => "telemetry",
            Self::SettingUpdate { .. } => "setting-update",
            Self::Greeting(_) => "greeting",
        }
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("malformed sync reply `{0}`")]
    MalformedSync(String),
    #[error("truncated {0} message")]
    Truncated(&'static str),
    #[error("invalid outlet `{0}`")]
    InvalidOutlet(String),
    #[error("invalid on/off flag `{0}`")]
    InvalidFlag(String),
    #[error("invalid battery percentage `{0}`")]
    InvalidBattery(String),
    #[error("invalid clock `{0}`")]
    InvalidClock(String),
    #[error("unknown setting `{0}`")]
    UnknownSetting(String),
    #[error("invalid sync token `{0}`")]
    InvalidToken(String),
}

pub fn encode(message: &ProtocolMessage) -> String {
    match message {
        ProtocolMessage::StateChange { outlet, on } => {
            format!("State:{}:{}", outlet.number(), flag(*on))
        }
        ProtocolMessage::SyncRequest { token: None } => "Sync".to_string(),
        ProtocolMessage::SyncRequest { token: Some(token) } => format!("Sync:{token}"),
        ProtocolMessage::SyncReply { outlets, token } => {
            let mut frame = Outlet::ALL
                .iter()
                .map(|outlet| format!("{}:{}", outlet.number(), flag(outlets.get(*outlet))))
                .collect::<Vec<_>>()
                .join("/");
            if let Some(token) = token {
                frame.push(TOKEN_SEPARATOR as char);
                frame.push_str(&token.to_string());
            }
            frame
        }
        ProtocolMessage::Telemetry {
            battery_percent,
            clock,
        } => format!(
            "Current:{}:{}",
            format_percent(*battery_percent),
            clock.clock_string()
        ),
        ProtocolMessage::SettingUpdate { kind, value } => {
            format!("Update:{}:{}", kind.as_str(), value)
        }
        ProtocolMessage::Greeting(text) => text.clone(),
    }
}

pub fn decode(payload: &str) -> Result<ProtocolMessage, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (head, rest) = match payload.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (payload, None),
    };

    match head {
        "State" => decode_state_change(rest),
        "Sync" => decode_sync_request(rest),
        "Current" => decode_telemetry(rest),
        "Update" => decode_setting_update(rest),
        // The status frame is the only shape the remote pushes to us.
        _ => decode_sync_reply(payload),
    }
}

fn flag(on: bool) -> char {
    if on {
        '1'
    } else {
        '0'
    }
}

/// Renders like a float, always with a fractional part: `45.0`, `45.5`.
fn format_percent(percent: f32) -> String {
    if percent.is_finite() && percent.fract() == 0.0 {
        format!("{percent:.1}")
    } else {
        format!("{percent}")
    }
}

fn decode_state_change(rest: Option<&str>) -> Result<ProtocolMessage, DecodeError> {
    let (outlet, on) = rest
        .and_then(|rest| rest.split_once(':'))
        .ok_or(DecodeError::Truncated("state"))?;

    let outlet = outlet
        .parse::<u8>()
        .ok()
        .and_then(Outlet::new)
        .ok_or_else(|| DecodeError::InvalidOutlet(outlet.to_string()))?;

    let on = match on {
        "0" => false,
        "1" => true,
        other => return Err(DecodeError::InvalidFlag(other.to_string())),
    };

    Ok(ProtocolMessage::StateChange { outlet, on })
}

fn decode_sync_request(rest: Option<&str>) -> Result<ProtocolMessage, DecodeError> {
    let token = rest.map(parse_token).transpose()?;
    Ok(ProtocolMessage::SyncRequest { token })
}

fn decode_telemetry(rest: Option<&str>) -> Result<ProtocolMessage, DecodeError> {
    let (percent, clock) = rest
        .and_then(|rest| rest.split_once(':'))
        .ok_or(DecodeError::Truncated("telemetry"))?;

    let battery_percent = percent
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| DecodeError::InvalidBattery(percent.to_string()))?;

    let clock = parse_clock(clock).ok_or_else(|| DecodeError::InvalidClock(clock.to_string()))?;

    Ok(ProtocolMessage::Telemetry {
        battery_percent,
        clock,
    })
}

fn decode_setting_update(rest: Option<&str>) -> Result<ProtocolMessage, DecodeError> {
    let (kind, value) = rest
        .and_then(|rest| rest.split_once(':'))
        .ok_or(DecodeError::Truncated("update"))?;

    let kind = SettingKind::parse(kind).ok_or_else(|| DecodeError::UnknownSetting(kind.into()))?;
    if value.is_empty() {
        return Err(DecodeError::Truncated("update"));
    }

    Ok(ProtocolMessage::SettingUpdate {
        kind,
        value: value.to_string(),
    })
}

fn decode_sync_reply(payload: &str) -> Result<ProtocolMessage, DecodeError> {
    let malformed = || DecodeError::MalformedSync(payload.to_string());

    let bytes = payload.as_bytes();
    if bytes.len() < SYNC_REPLY_WIDTH {
        return Err(malformed());
    }
    let (frame, suffix) = bytes.split_at(SYNC_REPLY_WIDTH);

    let mut outlets = OutletState::default();
    for outlet in Outlet::ALL {
        // Each outlet occupies `n:b` followed by `/` except the last one.
        let base = outlet.index() * 4;
        if frame[base] != b'0' + outlet.number() || frame[base + 1] != b':' {
            return Err(malformed());
        }
        if base + 3 < SYNC_REPLY_WIDTH && frame[base + 3] != b'/' {
            return Err(malformed());
        }
        let on = match frame[base + 2] {
            b'0' => false,
            b'1' => true,
            _ => return Err(malformed()),
        };
        outlets.set(outlet, on);
    }

    let token = match suffix {
        [] => None,
        [TOKEN_SEPARATOR, digits @ ..] => {
            let digits = std::str::from_utf8(digits).map_err(|_| malformed())?;
            Some(parse_token(digits)?)
        }
        _ => return Err(malformed()),
    };

    Ok(ProtocolMessage::SyncReply { outlets, token })
}

fn parse_token(value: &str) -> Result<u32, DecodeError> {
    value
        .parse::<u32>()
        .map_err(|_| DecodeError::InvalidToken(value.to_string()))
}

/// Telemetry clocks are strictly `HH-MM`.
fn parse_clock(value: &str) -> Option<TimeOfDay> {
    let (hour, minute) = value.split_once('-')?;
    if hour.len() != 2 || minute.len() != 2 {
        return None;
    }
    TimeOfDay::new(hour.parse().ok()?, minute.parse().ok()?)
}
