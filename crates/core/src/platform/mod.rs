pub mod ch9329;
pub mod http;
pub mod stub;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::logger;
use crate::settings::Settings;
use crate::types::{ClientId, Point};

pub const MOD_LEFT_CTRL: u8 = 0x01;
pub const MOD_LEFT_SHIFT: u8 = 0x02;
pub const MOD_LEFT_ALT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    None,
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn bits(self) -> u8 {
        match self {
            MouseButton::None => 0x00,
            MouseButton::Left => 0x01,
            MouseButton::Right => 0x02,
            MouseButton::Middle => 0x04,
        }
    }
}

/// The shared keyboard/mouse emulation channel. Each call is one report;
/// implementations serialize calls internally, gesture ordering across
/// controllers is the arbiter's job.
pub trait InputDevice: Send + Sync {
    fn send_key(&self, modifier: u8, key: &str) -> Result<()>;
    fn end_key(&self) -> Result<()>;
    fn mouse_absolute(&self, button: MouseButton, point: Point, wheel: i8) -> Result<()>;
    fn mouse_end(&self) -> Result<()>;
}

/// Which client window owns the OS foreground.
pub trait FocusService: Send + Sync {
    /// Foreground client, 0 when unknown.
    fn foreground(&self) -> Result<ClientId>;
    fn request_foreground(&self, id: ClientId) -> Result<()>;
}

/// On-screen target detection.
pub trait VisionService: Send + Sync {
    /// Candidate target boxes `[x0, y0, x1, y1]`, already merged.
    fn bounds(&self) -> Result<Vec<[i32; 4]>>;
    /// Name of the currently selected target, if any.
    fn current_target(&self) -> Result<Option<String>>;
}

/// Running game clients: pid -> window title.
pub trait ClientDirectory: Send + Sync {
    fn clients(&self) -> Result<BTreeMap<ClientId, String>>;
}

/// Split `"shift+z"` style bindings into a modifier mask and the key.
pub fn parse_binding(binding: &str) -> (u8, &str) {
    let mut modifier = 0;
    let mut rest = binding.trim();
    while let Some((head, tail)) = rest.split_once('+') {
        if tail.is_empty() {
            break; // the key itself is '+'
        }
        let m = match head.to_ascii_lowercase().as_str() {
            "shift" => MOD_LEFT_SHIFT,
            "ctrl" | "control" => MOD_LEFT_CTRL,
            "alt" => MOD_LEFT_ALT,
            _ => break,
        };
        modifier |= m;
        rest = tail;
    }
    (modifier, rest)
}

/// Glue horizontally adjacent boxes whose facing edges are within
/// `tolerance` pixels and whose tops line up. Boxes are ordered top to
/// bottom, left to right; each box is merged at most once, with the
/// closest unmerged neighbour to its right.
pub fn merge_bounds(mut boxes: Vec<[i32; 4]>, tolerance: i32) -> Vec<[i32; 4]> {
    boxes.sort_by_key(|b| (b[1], b[0]));
    let mut used = vec![false; boxes.len()];
    let mut merged = Vec::with_capacity(boxes.len());
    for i in 0..boxes.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let cur = boxes[i];
        let neighbour = (0..boxes.len())
            .filter(|&j| !used[j])
            .filter(|&j| {
                let gap = boxes[j][0] - cur[2];
                (0..=tolerance).contains(&gap) && (boxes[j][1] - cur[1]).abs() < tolerance
            })
            .min_by_key(|&j| boxes[j][0] - cur[2]);
        match neighbour {
            Some(j) => {
                used[j] = true;
                let next = boxes[j];
                merged.push([cur[0], cur[1].min(next[1]), next[2], cur[3].max(next[3])]);
            }
            None => merged.push(cur),
        }
    }
    merged
}

/// Open the input device for the current settings. Failing to open the
/// hardware port is fatal to the caller.
pub fn create_device(settings: &Settings, force_stub: bool) -> Result<Arc<dyn InputDevice>> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Ok(Arc::new(stub::StubDevice));
    }
    logger::register_prefix("device", logger::COLOR_GRAY);
    let dev = ch9329::Ch9329Device::open(&settings.device).map_err(|e| {
        Error::Device(format!("open {}: {}", settings.device.port, e))
    })?;
    Ok(Arc::new(dev))
}
