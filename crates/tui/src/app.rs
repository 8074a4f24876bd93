use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};

use crossbeam_channel::Sender;
use duet_core::registry::Registry;
use duet_core::types::{ClientId, ClientView, Command};

use crate::confirm::ConfirmDialog;

pub struct App {
    pub registry: Arc<Registry>,
    pub rows: Vec<ClientView>,
    pub selected: usize,
    pub profiles: Vec<String>,
    /// Index into `profiles` picked per client
    pub profile_choice: BTreeMap<ClientId, usize>,
    pub default_profile: Option<String>,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<String>,
    pub cmd_tx: Sender<Command>,
    pub confirm: Option<ConfirmDialog>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        registry: Arc<Registry>,
        log_rx: mpsc::Receiver<String>,
        cmd_tx: Sender<Command>,
        default_profile: Option<String>,
    ) -> Self {
        let mut app = Self {
            registry,
            rows: Vec::new(),
            selected: 0,
            profiles: Vec::new(),
            profile_choice: BTreeMap::new(),
            default_profile,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            cmd_tx,
            confirm: None,
            should_quit: false,
        };
        app.refresh();
        app
    }

    /// Re-read controller state and the stored profile list.
    pub fn refresh(&mut self) {
        self.rows = self.registry.views();
        self.profiles = self.registry.profiles();
        if self.selected >= self.rows.len() {
            self.selected = self.rows.len().saturating_sub(1);
        }
        let default = self
            .default_profile
            .as_ref()
            .and_then(|d| self.profiles.iter().position(|p| p == d))
            .unwrap_or(0);
        for row in &self.rows {
            self.profile_choice.entry(row.id).or_insert(default);
        }
    }

    pub fn drain_logs(&mut self) {
        while let Ok(msg) = self.log_rx.try_recv() {
            self.log_messages.push(msg);
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    pub fn move_up(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        }
    }

    pub fn move_down(&mut self) {
        if self.selected + 1 < self.rows.len() {
            self.selected += 1;
        }
    }

    fn selected_id(&self) -> Option<ClientId> {
        self.rows.get(self.selected).map(|r| r.id)
    }

    /// Profile that `s` would start for `id`.
    pub fn chosen_profile(&self, id: ClientId) -> Option<&str> {
        let idx = self.profile_choice.get(&id).copied().unwrap_or(0);
        self.profiles.get(idx).map(String::as_str)
    }

    pub fn cycle_profile(&mut self) {
        let (Some(id), false) = (self.selected_id(), self.profiles.is_empty()) else { return };
        let n = self.profiles.len();
        let idx = self.profile_choice.entry(id).or_insert(0);
        *idx = (*idx + 1) % n;
    }

    pub fn start_selected(&mut self) {
        let Some(id) = self.selected_id() else { return };
        match self.chosen_profile(id) {
            Some(profile) => {
                let profile = profile.to_string();
                self.cmd_tx.send(Command::Start { client: id, profile }).ok();
            }
            None => duet_core::logger::warn("no stored profiles to start"),
        }
    }

    pub fn stop_selected(&mut self) {
        if let Some(id) = self.selected_id() {
            self.cmd_tx.send(Command::Stop(id)).ok();
        }
    }

    pub fn pause_selected(&mut self) {
        if let Some(id) = self.selected_id() {
            self.cmd_tx.send(Command::Pause(id)).ok();
        }
    }

    pub fn reload_all(&mut self) {
        self.cmd_tx.send(Command::Reload).ok();
    }

    pub fn rediscover(&mut self) {
        self.cmd_tx.send(Command::Discover).ok();
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    pub fn running_count(&self) -> usize {
        self.rows.iter().filter(|r| r.state.is_active()).count()
    }

    pub fn request_quit(&mut self) {
        let running = self.running_count();
        if running == 0 {
            self.quit();
            return;
        }
        self.confirm = Some(ConfirmDialog::new(format!("Stop {} running client(s) and quit?", running)));
    }

    pub fn quit(&mut self) {
        self.confirm = None;
        self.cmd_tx.send(Command::Quit).ok();
        self.should_quit = true;
    }
}
