pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use codec::{decode, encode, DecodeError, ProtocolMessage, SettingKind};
pub use config::{PersistedSettings, RuntimeConfig, SessionConfig};
pub use dispatch::Intent;
pub use error::{SessionError, TransportError};
pub use session::{Ignored, SessionAction, SessionEngine};
pub use telemetry::TelemetryTrigger;
pub use topics::*;
pub use types::{
    BatterySample, BatteryThreshold, ClientStatus, ConnectionStatus, Outlet, OutletState,
    TimeOfDay,
};
