use std::collections::BTreeMap;

use super::{ClientDirectory, FocusService, InputDevice, MouseButton, VisionService};
use crate::error::Result;
use crate::logger;
use crate::types::{ClientId, Point};

/// Input device that only logs, selected with `--stub`.
pub struct StubDevice;

impl InputDevice for StubDevice {
    fn send_key(&self, modifier: u8, key: &str) -> Result<()> {
        logger::info_p("stub", &format!("send_key(0x{:02x}, \"{}\")", modifier, key));
        Ok(())
    }

    fn end_key(&self) -> Result<()> {
        logger::info_p("stub", "end_key()");
        Ok(())
    }

    fn mouse_absolute(&self, button: MouseButton, point: Point, wheel: i8) -> Result<()> {
        logger::info_p("stub", &format!("mouse_absolute({:?}, {}x{}, {})", button, point.x, point.y, wheel));
        Ok(())
    }

    fn mouse_end(&self) -> Result<()> {
        logger::info_p("stub", "mouse_end()");
        Ok(())
    }
}

/// Offline stand-ins for the companion services: two fake clients, no
/// foreground information and no vision.
pub struct StubServices;

impl FocusService for StubServices {
    fn foreground(&self) -> Result<ClientId> {
        Ok(0)
    }

    fn request_foreground(&self, id: ClientId) -> Result<()> {
        logger::info_p("stub", &format!("request_foreground({})", id));
        Ok(())
    }
}

impl VisionService for StubServices {
    fn bounds(&self) -> Result<Vec<[i32; 4]>> {
        Ok(Vec::new())
    }

    fn current_target(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

impl ClientDirectory for StubServices {
    fn clients(&self) -> Result<BTreeMap<ClientId, String>> {
        Ok(BTreeMap::from([
            (10001, "Lineage II".to_string()),
            (10002, "Lineage II".to_string()),
        ]))
    }
}
