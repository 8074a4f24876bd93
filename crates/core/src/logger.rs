//! Process-wide log and status-message sink.
//!
//! Every line goes to `app.log`; when a TUI sender is wired the same line is
//! forwarded as `level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage` so the log
//! pane can colour it. Calls made before [`init`] are dropped, which keeps
//! library code and tests free of logger setup.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock, PoisonError};

use chrono::Local;

use crate::types::ClientId;

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

struct Logger {
    file: File,
    tui_tx: Option<mpsc::Sender<String>>,
    prefixes: HashMap<String, u8>, // prefix -> color index
}

// Color indices for TUI rendering (mapped in ui.rs)
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;
pub const COLOR_GREEN: u8 = 3;
pub const COLOR_MAGENTA: u8 = 4;

/// Initialize the global logger. Truncates `<log_dir>/app.log`.
pub fn init(log_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("app.log"))?;

    LOGGER
        .set(Mutex::new(Logger { file, tui_tx: None, prefixes: HashMap::new() }))
        .ok();
    Ok(())
}

/// Wire the TUI log channel.
pub fn set_tui_sender(tx: mpsc::Sender<String>) {
    if let Some(logger) = LOGGER.get() {
        lock(logger).tui_tx = Some(tx);
    }
}

/// Register a prefix with a color used by the `*_p` variants.
pub fn register_prefix(prefix: &str, color: u8) {
    if let Some(logger) = LOGGER.get() {
        lock(logger).prefixes.insert(prefix.to_string(), color);
    }
}

/// Log prefix used by a client's run controller.
pub fn client_prefix(id: ClientId) -> String {
    format!("client-{}", id)
}

fn lock(logger: &Mutex<Logger>) -> std::sync::MutexGuard<'_, Logger> {
    logger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_log(level: &str, prefix: &str, msg: &str) {
    let Some(logger) = LOGGER.get() else { return };
    let ts = Local::now().format("%H:%M:%S").to_string();

    let file_line = if prefix.is_empty() {
        format!("[{}] [{}] {}", ts, level, msg)
    } else {
        format!("[{}] [{}] [{}] {}", ts, level, prefix, msg)
    };

    let mut l = lock(logger);
    let color = l.prefixes.get(prefix).copied().unwrap_or(0);
    writeln!(l.file, "{}", file_line).ok();
    if let Some(tx) = &l.tui_tx {
        // receiver gone means the TUI exited; keep writing the file
        if tx.send(format!("{}\x1f{}\x1f{}\x1f{}\x1f{}", level, prefix, color, ts, msg)).is_err() {
            l.tui_tx = None;
        }
    }
}

pub fn info(msg: &str) {
    write_log("INFO", "", msg);
}

pub fn warn(msg: &str) {
    write_log("WARN", "", msg);
}

pub fn error(msg: &str) {
    write_log("ERROR", "", msg);
}

pub fn info_p(prefix: &str, msg: &str) {
    write_log("INFO", prefix, msg);
}

pub fn warn_p(prefix: &str, msg: &str) {
    write_log("WARN", prefix, msg);
}

pub fn error_p(prefix: &str, msg: &str) {
    write_log("ERROR", prefix, msg);
}
