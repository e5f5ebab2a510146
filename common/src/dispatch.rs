use crate::{
    codec::{ProtocolMessage, SettingKind},
    config::PersistedSettings,
    types::{BatteryThreshold, Outlet, OutletState, TimeOfDay},
};

/// A local user request. Each one maps to exactly one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ToggleOutlet { outlet: Outlet, on: bool },
    SetBatteryThreshold(BatteryThreshold),
    SetTimerOn(TimeOfDay),
    SetTimerOff(TimeOfDay),
}

impl Intent {
    pub fn apply(self, settings: &mut PersistedSettings) {
        match self {
            Self::ToggleOutlet { outlet, on } => settings.outlets.set(outlet, on),
            Self::SetBatteryThreshold(threshold) => settings.battery_threshold = threshold,
            Self::SetTimerOn(time) => settings.timer_on = Some(time),
            Self::SetTimerOff(time) => settings.timer_off = Some(time),
        }
    }

    pub fn message(self) -> ProtocolMessage {
        match self {
            Self::ToggleOutlet { outlet, on } => ProtocolMessage::StateChange { outlet, on },
            Self::SetBatteryThreshold(threshold) => ProtocolMessage::SettingUpdate {
                kind: SettingKind::Battery,
                value: threshold.percent().to_string(),
            },
            Self::SetTimerOn(time) => ProtocolMessage::SettingUpdate {
                kind: SettingKind::TimerOn,
                value: time.setting_string(),
            },
            Self::SetTimerOff(time) => ProtocolMessage::SettingUpdate {
                kind: SettingKind::TimerOff,
                value: time.setting_string(),
            },
        }
    }

    /// Setting changes make the remote re-check thresholds and timers,
    /// which it does on the next telemetry beat.
    pub fn changes_settings(self) -> bool {
        !matches!(self, Self::ToggleOutlet { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Reconcile {
        outlets: OutletState,
        token: Option<u32>,
    },
    /// Decoded fine but nothing on this side acts on it.
    Unhandled(&'static str),
}

pub fn route(message: ProtocolMessage) -> Route {
    match message {
        ProtocolMessage::SyncReply { outlets, token } => Route::Reconcile { outlets, token },
        other => Route::Unhandled(other.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    #[test]
    fn timer_update_uses_unpadded_clock() {
        let intent = Intent::SetTimerOn(TimeOfDay::new(7, 30).unwrap());
        assert_eq!(encode(&intent.message()), "Update:Timer On:7-30");
        assert!(intent.changes_settings());
    }

    #[test]
    fn battery_update_sends_percent() {
        let intent = Intent::SetBatteryThreshold(BatteryThreshold::from_percent(85).unwrap());
        assert_eq!(encode(&intent.message()), "Update:Battery:85");

        let mut settings = PersistedSettings::default();
        intent.apply(&mut settings);
        assert_eq!(settings.battery_threshold.percent(), 85);
    }

    #[test]
    fn toggle_updates_local_state() {
        let outlet = Outlet::new(3).unwrap();
        let intent = Intent::ToggleOutlet { outlet, on: true };
        let mut settings = PersistedSettings::default();
        intent.apply(&mut settings);

        assert!(settings.outlets.get(outlet));
        assert!(!intent.changes_settings());
        assert_eq!(encode(&intent.message()), "State:3:1");
    }

    #[test]
    fn non_sync_inbound_is_unhandled() {
        let routed = route(ProtocolMessage::StateChange {
            outlet: Outlet::new(1).unwrap(),
            on: true,
        });
        assert_eq!(routed, Route::Unhandled("state-change"));
        assert_eq!(
            route(ProtocolMessage::Greeting("hi".into())),
            Route::Unhandled("greeting")
        );
    }
}
