use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Receiver;

use crate::catalog::ProfileTemplate;
use crate::controller::{Env, RunController};
use crate::error::{Error, Result};
use crate::logger;
use crate::platform::ClientDirectory;
use crate::profile::ProfileStore;
use crate::types::{ClientId, ClientView, Command, Role};

/// Process-lifetime table of run controllers, one per tracked client.
/// Entries are created on the first discovery and never removed.
pub struct Registry {
    env: Arc<Env>,
    store: Arc<ProfileStore>,
    entries: Mutex<BTreeMap<ClientId, Arc<RunController>>>,
}

impl Registry {
    pub fn new(env: Arc<Env>, store: Arc<ProfileStore>) -> Self {
        logger::register_prefix("registry", logger::COLOR_GREEN);
        Self { env, store, entries: Mutex::new(BTreeMap::new()) }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ClientId, Arc<RunController>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: ClientId) -> Result<Arc<RunController>> {
        self.entries().get(&id).cloned().ok_or(Error::UnknownClient(id))
    }

    /// Populate an empty registry from `ids` (lowest id is Main), then
    /// report id -> running. A populated registry is only reported on.
    pub fn discover(&self, ids: &[ClientId]) -> BTreeMap<ClientId, bool> {
        let mut entries = self.entries();
        if entries.is_empty() {
            let main = ids.iter().min().copied();
            for &id in ids {
                let role = if Some(id) == main { Role::Main } else { Role::Secondary };
                logger::info_p("registry", &format!("tracking client {} as {}", id, role));
                entries.insert(id, RunController::new(id, role, Arc::clone(&self.env)));
            }
        }
        ids.iter()
            .map(|id| (*id, entries.get(id).is_some_and(|c| !c.try_acquire())))
            .collect()
    }

    pub fn running_state(&self, id: ClientId) -> Result<bool> {
        Ok(!self.get(id)?.try_acquire())
    }

    pub fn views(&self) -> Vec<ClientView> {
        self.entries()
            .values()
            .map(|c| ClientView { id: c.id(), role: c.role(), state: c.state(), profile: c.profile() })
            .collect()
    }

    pub fn start(&self, id: ClientId, profile: &str) -> Result<()> {
        self.get(id)?.start(profile)
    }

    pub fn stop(&self, id: ClientId) -> Result<()> {
        self.get(id)?.stop();
        Ok(())
    }

    pub fn pause(&self, id: ClientId) -> Result<()> {
        self.get(id)?.pause();
        Ok(())
    }

    pub fn reload_all(&self) {
        for c in self.entries().values() {
            c.reload();
        }
    }

    /// Stored profile names.
    pub fn profiles(&self) -> Vec<String> {
        self.store.list()
    }

    /// Persist `template`, then have every running controller pick it up.
    pub fn save_profile(&self, template: &ProfileTemplate) -> Result<()> {
        self.store.save(template)?;
        self.reload_all();
        Ok(())
    }

    /// Stop every controller and wait for their loops to exit.
    pub fn shutdown(&self) {
        let all: Vec<_> = self.entries().values().cloned().collect();
        for c in &all {
            c.stop();
        }
        for c in &all {
            c.join();
        }
    }
}

/// Command processor. Runs on a background thread until `Quit` or until
/// every sender is gone.
pub fn serve(registry: Arc<Registry>, directory: Arc<dyn ClientDirectory>, cmd_rx: Receiver<Command>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let result = match cmd {
            Command::Quit => break,
            Command::Discover => directory.clients().map(|clients| {
                let ids: Vec<ClientId> = clients.keys().copied().collect();
                for (id, running) in registry.discover(&ids) {
                    logger::info_p("registry", &format!("client {}: {}", id, if running { "running" } else { "idle" }));
                }
            }),
            Command::Start { client, profile } => registry.start(client, &profile),
            Command::Stop(id) => registry.stop(id),
            Command::Pause(id) => registry.pause(id),
            Command::Reload => {
                registry.reload_all();
                Ok(())
            }
        };
        if let Err(e) = result {
            logger::error_p("registry", &e.to_string());
        }
    }
    logger::info_p("registry", "shutting down");
    registry.shutdown();
}
