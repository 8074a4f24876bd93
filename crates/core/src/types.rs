use std::fmt;

use serde::{Deserialize, Serialize};

/// Tracked game client identifier (the client's process id)
pub type ClientId = u32;

/// Absolute screen point in device coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[i32; 2]> for Point {
    fn from(p: [i32; 2]) -> Self {
        Self { x: p[0], y: p[1] }
    }
}

/// Which controller initiates focus switches first. Main is the lowest
/// client id seen at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Main,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Main => f.write_str("main"),
            Role::Secondary => f.write_str("secondary"),
        }
    }
}

/// Lifecycle of one run controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
}

impl RunState {
    pub fn is_active(self) -> bool {
        self != RunState::Idle
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Row of the registry as shown to the operator surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub id: ClientId,
    pub role: Role,
    pub state: RunState,
    pub profile: Option<String>,
}

/// Command from TUI to the command processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Discover,
    Start { client: ClientId, profile: String },
    Stop(ClientId),
    Pause(ClientId),
    Reload,
    Quit,
}
