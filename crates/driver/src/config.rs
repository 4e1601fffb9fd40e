use std::{path::Path, path::PathBuf, time::Duration};

use anyhow::Context as _;
use brazo_geom::{IkConfig, KinematicChain};
use brazo_planner::Dispatch;
use serde::{Deserialize, Serialize};

use crate::connection::BusConfig;

/// Everything that can go in the configuration file. Anything left out
/// gets its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// The servo controller's character device.
    pub device: PathBuf,
    /// A byte to put in front of every write. HID devices without numbered
    /// reports want a zero here.
    pub report_id: Option<u8>,
    pub chain: KinematicChain,
    pub speed: f64,
    pub dispatch: Dispatch,
    /// Whether to check every solution with forward kinematics.
    pub verify: bool,
    pub tolerance_mm: f64,
    /// How long to let the controller think before reading its answer.
    pub settle_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let ik = IkConfig::default();
        Settings {
            device: PathBuf::from("/dev/hidraw0"),
            report_id: Some(0),
            chain: KinematicChain::default(),
            speed: 1.0,
            dispatch: Dispatch::default(),
            verify: ik.verify,
            tolerance_mm: ik.tolerance_mm,
            settle_ms: 200,
            read_timeout_ms: 1000,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn ik_config(&self) -> IkConfig {
        IkConfig {
            verify: self.verify,
            tolerance_mm: self.tolerance_mm,
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            settle: Duration::from_millis(self.settle_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}
