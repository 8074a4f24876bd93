//! Player/target/party telemetry: the wire format served by the stats
//! companion, the published snapshot, and the background poller.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Deserialize;

use crate::error::Result;
use crate::logger;
use crate::types::ClientId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Gauge {
    pub percent: f64,
    pub last_update: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TargetStat {
    pub hp_percent: f64,
    pub last_update: i64,
    /// Last poll with target HP above zero. Filled in by the poller.
    #[serde(skip)]
    pub hp_was_present_at: Option<DateTime<Utc>>,
    /// Last poll with target HP below ~100%. Filled in by the poller.
    #[serde(skip)]
    pub full_hp_unchanged_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlayerStat {
    #[serde(rename = "CP")]
    pub cp: Gauge,
    #[serde(rename = "HP")]
    pub hp: Gauge,
    #[serde(rename = "MP")]
    pub mp: Gauge,
    #[serde(rename = "Target")]
    pub target: TargetStat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PartyMember {
    pub hp_percent: f64,
}

/// Party slot (1..=8) -> member gauges
pub type Party = BTreeMap<u8, PartyMember>;

/// Everything the stats endpoint reports in one poll.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TelemetrySnapshot {
    pub player: BTreeMap<ClientId, PlayerStat>,
    pub party: Party,
}

impl TelemetrySnapshot {
    pub fn player(&self, id: ClientId) -> Option<&PlayerStat> {
        self.player.get(&id)
    }
}

/// Read side of telemetry, injected into every consumer.
pub trait TelemetrySource: Send + Sync {
    fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>>;
}

/// Latest published snapshot. Writers replace the whole record, so a
/// reader holds either the old or the new one, never a mix.
#[derive(Debug, Default)]
pub struct SharedTelemetry {
    current: RwLock<Option<Arc<TelemetrySnapshot>>>,
}

impl SharedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: TelemetrySnapshot) {
        let next = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(next);
    }
}

impl TelemetrySource for SharedTelemetry {
    fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

const FULL_HP_PERCENT: f64 = 99.0;

/// Carries the derived per-client timestamps from poll to poll.
#[derive(Debug, Default)]
pub struct TargetTracker {
    seen: BTreeMap<ClientId, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl TargetTracker {
    pub fn apply(&mut self, snapshot: &mut TelemetrySnapshot, now: DateTime<Utc>) {
        for (id, stat) in snapshot.player.iter_mut() {
            let (present_at, full_since) = self.seen.entry(*id).or_default();
            let hp = stat.target.hp_percent;
            if hp > 0.0 {
                *present_at = Some(now);
            }
            if hp >= FULL_HP_PERCENT {
                if full_since.is_none() {
                    *full_since = Some(now);
                }
            } else {
                *full_since = Some(now);
            }
            stat.target.hp_was_present_at = *present_at;
            stat.target.full_hp_unchanged_since = *full_since;
        }
    }
}

fn fetch(agent: &ureq::Agent, url: &str) -> Result<TelemetrySnapshot> {
    Ok(agent.get(url).call()?.into_json()?)
}

/// Poll `url` every `interval` and publish into `shared` until `shutdown`
/// fires or disconnects. Failed polls keep the previous snapshot.
pub fn spawn_poller(
    url: String,
    interval: Duration,
    timeout: Duration,
    shared: Arc<SharedTelemetry>,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    logger::register_prefix("telemetry", logger::COLOR_GRAY);
    thread::spawn(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let mut tracker = TargetTracker::default();
        let mut failing = false;
        logger::info_p("telemetry", &format!("polling {}", url));
        loop {
            match fetch(&agent, &url) {
                Ok(mut snapshot) => {
                    if failing {
                        logger::info_p("telemetry", "stats server back");
                        failing = false;
                    }
                    tracker.apply(&mut snapshot, Utc::now());
                    shared.publish(snapshot);
                }
                Err(e) => {
                    // only log the first failure of a streak
                    if !failing {
                        logger::warn_p("telemetry", &format!("poll failed: {}", e));
                        failing = true;
                    }
                }
            }
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        logger::info_p("telemetry", "poller stopped");
    })
}
