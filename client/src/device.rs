//! Host adapters for the device-side collaborators: battery level, network
//! reachability and the wall clock used for telemetry.

use std::path::{Path, PathBuf};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::warn;

use powerstrip_common::{telemetry::clock_of, BatterySample, TimeOfDay};

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";
const NET_CLASS_ROOT: &str = "/sys/class/net";

pub trait BatterySource: Send + Sync {
    fn sample(&self) -> Option<BatterySample>;
}

pub trait ConnectivityProbe: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Reads `capacity` (0-100) of the first battery the kernel exposes.
pub struct SysfsBattery {
    capacity_path: Option<PathBuf>,
}

impl SysfsBattery {
    pub fn new(configured: Option<&str>) -> Self {
        let capacity_path = configured
            .map(PathBuf::from)
            .or_else(|| find_battery_capacity(Path::new(POWER_SUPPLY_ROOT)));
        if capacity_path.is_none() {
            warn!("no battery found under {POWER_SUPPLY_ROOT}; telemetry will be skipped");
        }
        Self { capacity_path }
    }
}

impl BatterySource for SysfsBattery {
    fn sample(&self) -> Option<BatterySample> {
        let path = self.capacity_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        parse_capacity(&raw)
    }
}

pub struct SysfsConnectivity {
    root: PathBuf,
    assume_online: bool,
}

impl SysfsConnectivity {
    pub fn new(assume_online: bool) -> Self {
        Self {
            root: PathBuf::from(NET_CLASS_ROOT),
            assume_online,
        }
    }
}

impl ConnectivityProbe for SysfsConnectivity {
    fn is_available(&self) -> bool {
        self.assume_online || any_interface_up(&self.root)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    zone: Option<Tz>,
}

impl WallClock {
    pub fn new(zone: Option<&str>) -> Self {
        let zone = zone.and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!("unknown timezone `{name}`, using system local time");
                None
            }
        });
        Self { zone }
    }

    pub fn now(&self) -> TimeOfDay {
        match self.zone {
            Some(tz) => clock_of(&Utc::now().with_timezone(&tz)),
            None => clock_of(&chrono::Local::now()),
        }
    }
}

fn parse_capacity(raw: &str) -> Option<BatterySample> {
    raw.trim()
        .parse::<i32>()
        .ok()
        .filter(|level| (0..=100).contains(level))
        .map(|level| BatterySample { level, scale: 100 })
}

fn find_battery_capacity(root: &Path) -> Option<PathBuf> {
    let mut supplies: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    supplies.sort();

    supplies.into_iter().find_map(|supply| {
        let kind = std::fs::read_to_string(supply.join("type")).ok()?;
        let capacity = supply.join("capacity");
        (kind.trim() == "Battery" && capacity.exists()).then_some(capacity)
    })
}

/// A missing sysfs tree means we cannot tell, which counts as online.
fn any_interface_up(root: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(root) else {
        return true;
    };

    entries.filter_map(Result::ok).any(|entry| {
        if entry.file_name() == "lo" {
            return false;
        }
        std::fs::read_to_string(entry.path().join("operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false)
    })
}
