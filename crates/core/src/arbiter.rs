//! Input arbitration between run controllers.
//!
//! One thread owns the turn state: a single holder plus a FIFO of waiting
//! clients. Controllers ask for a turn over a request channel and block on
//! a private reply channel until granted. A [`Turn`] releases on drop. No
//! controller ever sends to another controller, so two clients asking at
//! once simply queue.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::logger;
use crate::platform::{parse_binding, FocusService, InputDevice};
use crate::sleep;
use crate::types::ClientId;

enum Request {
    Acquire { client: ClientId, reply: Sender<()> },
    Release(ClientId),
}

/// Handle to the arbiter thread. Cheap to clone; the thread exits once
/// every handle and turn is dropped.
#[derive(Clone)]
pub struct Arbiter {
    tx: Sender<Request>,
}

/// Exclusive right to drive the input device and the foreground window.
pub struct Turn {
    client: ClientId,
    tx: Sender<Request>,
    /// Foreground client before this turn switched away from it.
    pub return_to: Option<ClientId>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.tx.send(Request::Release(self.client)).ok();
    }
}

impl Arbiter {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        logger::register_prefix("arbiter", logger::COLOR_MAGENTA);
        let (tx, rx) = unbounded();
        let handle = thread::spawn(move || serve(rx));
        (Self { tx }, handle)
    }

    /// Block until `client` holds the turn. Returns `None` when `cancel`
    /// fires or disconnects first, or the arbiter is gone.
    pub fn acquire(&self, client: ClientId, cancel: &Receiver<()>) -> Option<Turn> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx.send(Request::Acquire { client, reply: reply_tx }).ok()?;
        select! {
            recv(reply_rx) -> granted => granted.ok().map(|_| Turn {
                client,
                tx: self.tx.clone(),
                return_to: None,
            }),
            recv(cancel) -> _ => {
                // withdraw, or hand back a grant that raced the cancel
                self.tx.send(Request::Release(client)).ok();
                None
            }
        }
    }
}

fn serve(rx: Receiver<Request>) {
    let mut holder: Option<ClientId> = None;
    let mut waiting: VecDeque<(ClientId, Sender<()>)> = VecDeque::new();

    while let Ok(req) = rx.recv() {
        match req {
            Request::Acquire { client, reply } => match holder {
                None => {
                    if reply.send(()).is_ok() {
                        holder = Some(client);
                    }
                }
                Some(h) if h == client => {
                    reply.send(()).ok();
                }
                Some(h) => {
                    logger::info_p("arbiter", &format!("client {} waits for {}", client, h));
                    waiting.push_back((client, reply));
                }
            },
            Request::Release(client) => {
                if holder == Some(client) {
                    holder = grant_next(&mut waiting);
                } else {
                    waiting.retain(|(c, _)| *c != client);
                }
            }
        }
    }
}

fn grant_next(waiting: &mut VecDeque<(ClientId, Sender<()>)>) -> Option<ClientId> {
    while let Some((client, reply)) = waiting.pop_front() {
        if reply.send(()).is_ok() {
            return Some(client);
        }
    }
    None
}

/// Collaborators needed to move the OS foreground between clients.
pub struct FocusSwitch<'a> {
    pub focus: &'a dyn FocusService,
    pub device: &'a dyn InputDevice,
    pub hotkey: &'a str,
    pub settle_ms: u64,
}

impl FocusSwitch<'_> {
    /// Make `target` the foreground client. Returns the client that was in
    /// front before, or `None` when no switch was needed.
    pub fn switch_to(&self, target: ClientId) -> Result<Option<ClientId>> {
        let current = self.focus.foreground()?;
        if current == 0 || current == target {
            return Ok(None);
        }
        if let Err(e) = self.focus.request_foreground(target) {
            logger::warn_p("arbiter", &format!("focus request failed ({}), cycling windows", e));
            let (modifier, key) = parse_binding(self.hotkey);
            self.device.send_key(modifier, key)?;
            self.device.end_key()?;
        }
        sleep::sleep_ms(self.settle_ms);
        let now = self.focus.foreground()?;
        if now != target {
            return Err(Error::WindowSwitchFailed { expected: target, actual: now });
        }
        Ok(Some(current))
    }
}
