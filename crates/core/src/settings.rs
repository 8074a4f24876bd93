use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sleep::Jitter;
use crate::types::Point;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub endpoints: Endpoints,
    pub http_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub profiles_dir: PathBuf,
    pub presets_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub default_profile: Option<String>,
    pub pacing: Pacing,
    pub targets: TargetFilter,
    pub focus_hotkey: String,
    /// Held while AITargetNext clicks boxes so the character stands still.
    pub stay_binding: String,
    pub party_slots: BTreeMap<String, Point>,
    pub clear_target_points: Vec<Point>,
    pub unstuck_point: Point,
    pub unstuck_jitter_px: i32,
    pub focus_click_point: Point,
    pub bounds_merge_px: i32,
    pub target_click_offset_y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub port: String,
    pub baud_rate: u32,
    pub resolution: [u32; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub stats: String,
    pub bounds: String,
    pub target: String,
    pub foreground: String,
    pub clients: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub key_hold: Jitter,
    pub after_action: Jitter,
    pub after_tick: Jitter,
    pub click_settle: Jitter,
    pub stop_grace_ms: u64,
    pub unstuck_settle_ms: u64,
    pub focus_settle_ms: u64,
}

/// Names accepted as a target. Deny wins; an empty allow list accepts
/// everything not denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl TargetFilter {
    pub fn accepts(&self, name: &str) -> bool {
        if self.deny.iter().any(|d| d == name) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| a == name)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            resolution: [1920, 1080],
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        let base = "http://127.0.0.1:2223";
        Self {
            stats: format!("{}/api/stats", base),
            bounds: format!("{}/api/findBounds", base),
            target: format!("{}/api/currentTarget", base),
            foreground: format!("{}/api/foregroundWindow", base),
            clients: format!("{}/api/init", base),
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            key_hold: Jitter::fixed(50),
            after_action: Jitter::new(50, 100),
            after_tick: Jitter::new(200, 300),
            click_settle: Jitter::fixed(50),
            stop_grace_ms: 10_000,
            unstuck_settle_ms: 3_000,
            focus_settle_ms: 200,
        }
    }
}

impl Pacing {
    /// All delays zero, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            key_hold: Jitter::default(),
            after_action: Jitter::default(),
            after_tick: Jitter::default(),
            click_settle: Jitter::default(),
            stop_grace_ms: 0,
            unstuck_settle_ms: 0,
            focus_settle_ms: 0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let party_slots = [147, 201, 255, 309, 364, 417, 472, 525]
            .iter()
            .enumerate()
            .map(|(i, y)| ((i + 1).to_string(), Point::new(40, *y)))
            .collect();
        Self {
            device: DeviceSettings::default(),
            endpoints: Endpoints::default(),
            http_timeout_ms: 2_000,
            poll_interval_ms: 100,
            profiles_dir: PathBuf::from("var/profiles"),
            presets_dir: PathBuf::from("var/preset"),
            logs_dir: PathBuf::from("logs"),
            default_profile: None,
            pacing: Pacing::default(),
            targets: TargetFilter::default(),
            focus_hotkey: "\\".into(),
            stay_binding: "shift+z".into(),
            party_slots,
            clear_target_points: vec![Point::new(480, 320), Point::new(580, 320)],
            unstuck_point: Point::new(960, 840),
            unstuck_jitter_px: 40,
            focus_click_point: Point::new(960, 560),
            bounds_merge_px: 3,
            target_click_offset_y: 30,
        }
    }
}

impl Settings {
    /// Missing file yields defaults; an unreadable or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}
