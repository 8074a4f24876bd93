//! CH9329 UART-to-HID adapter.
//!
//! Frame: `57 AB 00 <cmd> <len> <data..> <sum>`, where `sum` is the low
//! byte of the sum of every preceding byte.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use super::{InputDevice, MouseButton};
use crate::error::{Error, Result};
use crate::logger;
use crate::settings::DeviceSettings;
use crate::types::Point;

const HEAD: [u8; 3] = [0x57, 0xAB, 0x00];
const CMD_KEYBOARD: u8 = 0x02;
const CMD_MOUSE_ABSOLUTE: u8 = 0x04;
const ABS_RANGE: u32 = 4096;

pub fn frame(cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEAD.len() + 3 + data.len());
    out.extend_from_slice(&HEAD);
    out.push(cmd);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    let sum = out.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    out.push(sum);
    out
}

/// HID usage id for a key name.
pub fn key_code(key: &str) -> Option<u8> {
    let lower = key.to_ascii_lowercase();
    let mut chars = lower.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return match c {
            'a'..='z' => Some(0x04 + (c as u8 - b'a')),
            '1'..='9' => Some(0x1E + (c as u8 - b'1')),
            '0' => Some(0x27),
            ' ' => Some(0x2C),
            '-' => Some(0x2D),
            '=' => Some(0x2E),
            '[' => Some(0x2F),
            ']' => Some(0x30),
            '\\' => Some(0x31),
            ';' => Some(0x33),
            '\'' => Some(0x34),
            '`' => Some(0x35),
            ',' => Some(0x36),
            '.' => Some(0x37),
            '/' => Some(0x38),
            _ => None,
        };
    }
    match lower.as_str() {
        "enter" | "return" => Some(0x28),
        "esc" | "escape" => Some(0x29),
        "backspace" => Some(0x2A),
        "tab" => Some(0x2B),
        "space" => Some(0x2C),
        "home" => Some(0x4A),
        "pageup" => Some(0x4B),
        "delete" => Some(0x4C),
        "end" => Some(0x4D),
        "pagedown" => Some(0x4E),
        "right" => Some(0x4F),
        "left" => Some(0x50),
        "down" => Some(0x51),
        "up" => Some(0x52),
        f if f.starts_with('f') => match f[1..].parse::<u8>() {
            Ok(n @ 1..=12) => Some(0x3A + n - 1),
            _ => None,
        },
        _ => None,
    }
}

struct Port {
    file: File,
    last_point: Point,
}

pub struct Ch9329Device {
    port: Mutex<Port>,
    resolution: [u32; 2],
}

impl Ch9329Device {
    pub fn open(settings: &DeviceSettings) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&settings.port)?;
        #[cfg(unix)]
        configure_raw(&file, settings.baud_rate)?;
        logger::info_p("device", &format!("opened {} @ {}", settings.port, settings.baud_rate));
        Ok(Self {
            port: Mutex::new(Port { file, last_point: Point::default() }),
            resolution: settings.resolution,
        })
    }

    fn scale(&self, point: Point) -> (u16, u16) {
        let axis = |v: i32, extent: u32| -> u16 {
            let extent = extent.max(1);
            let v = v.clamp(0, extent as i32 - 1) as u32;
            (v * ABS_RANGE / extent) as u16
        };
        (axis(point.x, self.resolution[0]), axis(point.y, self.resolution[1]))
    }

    fn write(&self, cmd: u8, data: &[u8]) -> Result<()> {
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        port.file
            .write_all(&frame(cmd, data))
            .map_err(|e| Error::Device(e.to_string()))
    }

    fn mouse_report(&self, buttons: u8, point: Point, wheel: i8) -> Result<()> {
        let (x, y) = self.scale(point);
        let [xl, xh] = x.to_le_bytes();
        let [yl, yh] = y.to_le_bytes();
        self.write(CMD_MOUSE_ABSOLUTE, &[0x02, buttons, xl, xh, yl, yh, wheel as u8])?;
        self.port.lock().unwrap_or_else(PoisonError::into_inner).last_point = point;
        Ok(())
    }
}

impl InputDevice for Ch9329Device {
    fn send_key(&self, modifier: u8, key: &str) -> Result<()> {
        let code = key_code(key).ok_or_else(|| Error::Device(format!("unknown key {:?}", key)))?;
        self.write(CMD_KEYBOARD, &[modifier, 0, code, 0, 0, 0, 0, 0])
    }

    fn end_key(&self) -> Result<()> {
        self.write(CMD_KEYBOARD, &[0; 8])
    }

    fn mouse_absolute(&self, button: MouseButton, point: Point, wheel: i8) -> Result<()> {
        self.mouse_report(button.bits(), point, wheel)
    }

    fn mouse_end(&self) -> Result<()> {
        let last = self.port.lock().unwrap_or_else(PoisonError::into_inner).last_point;
        self.mouse_report(0, last, 0)
    }
}

#[cfg(unix)]
fn configure_raw(file: &File, baud: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let speed = match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported baud rate {}", baud))),
    };
    let fd = file.as_raw_fd();
    // SAFETY: fd is a live descriptor owned by `file`; termios is fully
    // initialised by tcgetattr before use.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        libc::cfsetispeed(&mut tio, speed);
        libc::cfsetospeed(&mut tio, speed);
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
