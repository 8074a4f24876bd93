//! Per-client run controller: lifecycle, signal handling and the tick loop
//! that walks a profile's action list.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::arbiter::{Arbiter, FocusSwitch, Turn};
use crate::catalog::{ActionItem, ActionKind};
use crate::condition;
use crate::error::{Error, Result};
use crate::logger;
use crate::platform::{parse_binding, FocusService, InputDevice, MouseButton, VisionService};
use crate::profile::ProfileSource;
use crate::settings::Settings;
use crate::sleep;
use crate::telemetry::{Party, PlayerStat, TelemetrySource};
use crate::types::{ClientId, Point, RunState, Role};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything a controller talks to. Shared by all controllers.
pub struct Env {
    pub device: Arc<dyn InputDevice>,
    pub focus: Arc<dyn FocusService>,
    pub vision: Arc<dyn VisionService>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub profiles: Arc<dyn ProfileSource>,
    pub arbiter: Arbiter,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<Settings>,
    /// Fires (disconnects) once on process shutdown.
    pub shutdown: Receiver<()>,
}

struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    fn raise(&self) {
        self.tx.send(()).ok();
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

pub struct RunController {
    id: ClientId,
    role: Role,
    env: Arc<Env>,
    state: Mutex<RunState>,
    profile: Mutex<Option<String>>,
    stop: Signal,
    reload: Signal,
    pause: Signal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Returns the controller to Idle however the loop thread ends, unwinding
/// included.
struct IdleOnExit<'a>(&'a Mutex<RunState>);

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        *lock(self.0) = RunState::Idle;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunController {
    pub fn new(id: ClientId, role: Role, env: Arc<Env>) -> Arc<Self> {
        logger::register_prefix(&logger::client_prefix(id), logger::COLOR_BLUE);
        Arc::new(Self {
            id,
            role,
            env,
            state: Mutex::new(RunState::Idle),
            profile: Mutex::new(None),
            stop: Signal::new(),
            reload: Signal::new(),
            pause: Signal::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    /// Profile of the current or last activation.
    pub fn profile(&self) -> Option<String> {
        lock(&self.profile).clone()
    }

    /// Read-only check: true when no control loop owns this controller.
    pub fn try_acquire(&self) -> bool {
        match self.state.try_lock() {
            Ok(s) => !s.is_active(),
            Err(std::sync::TryLockError::Poisoned(p)) => !p.into_inner().is_active(),
            // someone is mid-transition, so not idle
            Err(std::sync::TryLockError::WouldBlock) => false,
        }
    }

    pub fn start(self: &Arc<Self>, profile: &str) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.is_active() {
                return Err(Error::AlreadyRunning(self.id));
            }
            *state = RunState::Running;
        }
        // signals aimed at a previous activation
        self.stop.drain();
        self.reload.drain();
        self.pause.drain();
        *lock(&self.profile) = Some(profile.to_string());

        logger::info_p(&self.prefix(), &format!("starting with profile {}", profile));
        let this = Arc::clone(self);
        let profile = profile.to_string();
        let handle = thread::Builder::new()
            .name(format!("client-{}", self.id))
            .spawn(move || this.run(profile));
        match handle {
            Ok(h) => {
                if let Some(old) = lock(&self.handle).replace(h) {
                    old.join().ok();
                }
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = RunState::Idle;
                Err(e.into())
            }
        }
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, RunState::Running | RunState::Paused) {
            *state = RunState::Stopping;
            self.stop.raise();
        }
    }

    /// Pause a running loop, or resume a paused one.
    pub fn pause(&self) {
        if matches!(self.state(), RunState::Running | RunState::Paused) {
            self.pause.raise();
        }
    }

    pub fn reload(&self) {
        if self.state().is_active() {
            self.reload.raise();
        }
    }

    /// Wait for the control loop thread, if any, to exit.
    pub fn join(&self) {
        let handle = lock(&self.handle).take();
        if let Some(h) = handle {
            h.join().ok();
        }
    }

    fn prefix(&self) -> String {
        logger::client_prefix(self.id)
    }

    fn set_state(&self, from: RunState, to: RunState) {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
        }
    }

    fn run(self: Arc<Self>, profile: String) {
        let _idle = IdleOnExit(&self.state);
        let prefix = self.prefix();
        let mut worker = Worker::new(self.id, self.role, profile, Arc::clone(&self.env), self.stop.tx.clone());
        let shutdown = self.env.shutdown.clone();

        loop {
            select! {
                recv(shutdown) -> _ => {
                    logger::info_p(&prefix, "shutdown");
                    break;
                }
                recv(self.stop.rx) -> _ => {
                    logger::info_p(&prefix, "macros stopped");
                    break;
                }
                recv(self.reload.rx) -> _ => {
                    worker.clear();
                    logger::info_p(&prefix, "reloaded");
                }
                recv(self.pause.rx) -> _ => {
                    if !self.wait_paused(&shutdown) {
                        break;
                    }
                }
                default => {
                    if let Err(e) = worker.tick() {
                        logger::error_p(&prefix, &format!("{}, stopping", e));
                        break;
                    }
                }
            }
        }

        worker.clear();
    }

    /// Block until the second pause signal. False when asked to stop
    /// meanwhile.
    fn wait_paused(&self, shutdown: &Receiver<()>) -> bool {
        let prefix = self.prefix();
        self.set_state(RunState::Running, RunState::Paused);
        logger::info_p(&prefix, "paused");
        select! {
            recv(self.pause.rx) -> _ => {
                self.set_state(RunState::Paused, RunState::Running);
                logger::info_p(&prefix, "resumed");
                true
            }
            recv(self.stop.rx) -> _ => {
                logger::info_p(&prefix, "macros stopped");
                false
            }
            recv(shutdown) -> _ => false,
        }
    }
}

/// A deadline past the representable range never elapses.
fn period_elapsed(last: DateTime<Utc>, period_ms: u64, now: DateTime<Utc>) -> bool {
    i64::try_from(period_ms)
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|period| last.checked_add_signed(period))
        .is_some_and(|deadline| now >= deadline)
}

struct RunAction {
    item: ActionItem,
    last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Skipped,
    Done,
    /// Stop fired; the rest of the tick is abandoned.
    Stopped,
    /// Cancelled while waiting for the input turn.
    Cancelled,
}

/// Tick state of one activation. Owned by the control loop thread.
pub struct Worker {
    id: ClientId,
    role: Role,
    profile: String,
    env: Arc<Env>,
    stop_tx: Sender<()>,
    prefix: String,
    actions: Vec<RunAction>,
    synced: bool,
    telemetry_missing: bool,
}

impl Worker {
    pub fn new(id: ClientId, role: Role, profile: String, env: Arc<Env>, stop_tx: Sender<()>) -> Self {
        Self {
            id,
            role,
            profile,
            env,
            stop_tx,
            prefix: logger::client_prefix(id),
            actions: Vec::new(),
            synced: false,
            telemetry_missing: false,
        }
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// `last_run` of each working step, in order.
    pub fn last_runs(&self) -> Vec<Option<DateTime<Utc>>> {
        self.actions.iter().map(|a| a.last_run).collect()
    }

    fn load(&mut self) -> Result<()> {
        let template = self.env.profiles.load(&self.profile)?;
        let listed: usize = template.items.iter().filter(|p| p.is_active).map(|p| p.preset.items.len()).sum();
        self.actions = template
            .action_items()
            .into_iter()
            .map(|item| RunAction { item, last_run: None })
            .collect();
        if listed > self.actions.len() {
            logger::warn_p(
                &self.prefix,
                &format!("skipping {} step(s) without a known action", listed - self.actions.len()),
            );
        }
        if self.actions.is_empty() {
            return Err(Error::NoActionsAvailable);
        }
        logger::info_p(&self.prefix, &format!("loaded {} action(s) from {}", self.actions.len(), self.profile));
        Ok(())
    }

    /// One pass over the action list. An error ends the activation.
    pub fn tick(&mut self) -> Result<()> {
        if self.actions.is_empty() {
            self.load()?;
        }

        let mut turn = None;
        if !self.synced {
            self.synced = true;
            if self.role == Role::Main && self.ensure_turn(&mut turn).is_none() {
                return Ok(());
            }
        }

        for i in 0..self.actions.len() {
            match self.step(i, &mut turn) {
                Step::Stopped | Step::Cancelled => break,
                Step::Skipped | Step::Done => {}
            }
        }

        if let Some(t) = turn {
            self.finish_turn(t);
        }
        sleep::sleep_jitter(&self.env.settings.pacing.after_tick);
        Ok(())
    }

    fn step(&mut self, i: usize, turn: &mut Option<Turn>) -> Step {
        let now = self.env.clock.now();
        let item = self.actions[i].item.clone();
        let last_run = self.actions[i].last_run;
        let Some(kind) = item.kind() else { return Step::Skipped };

        if item.period_ms > 0 {
            if let Some(last) = last_run {
                if !period_elapsed(last, item.period_ms, now) {
                    return Step::Skipped;
                }
            }
        }

        let snapshot = self.env.telemetry.snapshot();
        let player = snapshot.as_deref().and_then(|s| s.player(self.id)).cloned();
        let empty = Party::new();
        let party = snapshot.as_deref().map_or(&empty, |s| &s.party);
        match condition::evaluate(item.combinator, &item.conditions, player.as_ref(), party, now) {
            Ok(pass) => {
                self.telemetry_missing = false;
                if !pass {
                    return Step::Skipped;
                }
            }
            Err(e) => {
                if !self.telemetry_missing {
                    logger::warn_p(&self.prefix, &format!("check condition: {}", e));
                    self.telemetry_missing = true;
                }
                return Step::Skipped;
            }
        }

        let result = match kind {
            ActionKind::Stop => self.stop_action(i, &item, player.as_ref(), turn),
            ActionKind::AiTargetNext => self.ai_target_next(turn),
            ActionKind::AssistPartyMember => self.assist_party_member(&item, turn),
            ActionKind::Unstuck => self.unstuck(&item, turn),
            ActionKind::Delay => {
                sleep::sleep_ms(item.delay_ms);
                Ok(Step::Done)
            }
            ActionKind::Attack => self.attack(&item, turn),
            _ => self.send_binding(&item, turn),
        };

        let step = match result {
            Ok(step) => step,
            Err(e) => {
                logger::error_p(&self.prefix, &format!("{:?} {}: {}", kind, item.binding, e));
                Step::Skipped
            }
        };
        if matches!(step, Step::Done | Step::Stopped) {
            self.actions[i].last_run = Some(self.env.clock.now());
            sleep::sleep_jitter(&self.env.settings.pacing.after_action);
        }
        step
    }

    /// Hold the input turn for the rest of the tick, switching the
    /// foreground to this client once granted.
    fn ensure_turn<'t>(&self, turn: &'t mut Option<Turn>) -> Option<&'t mut Turn> {
        if turn.is_none() {
            let mut granted = self.env.arbiter.acquire(self.id, &self.env.shutdown)?;
            match self.focus_switch().switch_to(self.id) {
                Ok(prev) => {
                    // a freshly raised window takes keys only after a click
                    if prev.is_some() {
                        if let Err(e) = self.click(MouseButton::Left, self.env.settings.focus_click_point) {
                            logger::warn_p(&self.prefix, &format!("focus click: {}", e));
                        }
                    }
                    granted.return_to = prev;
                }
                // input is already serialized, carry on without focus
                Err(e) => logger::warn_p(&self.prefix, &format!("switch window: {}", e)),
            }
            *turn = Some(granted);
        }
        turn.as_mut()
    }

    fn finish_turn(&self, turn: Turn) {
        if let Some(prev) = turn.return_to {
            if let Err(e) = self.focus_switch().switch_to(prev) {
                logger::warn_p(&self.prefix, &format!("switch back to {}: {}", prev, e));
            }
        }
        drop(turn);
    }

    fn focus_switch(&self) -> FocusSwitch<'_> {
        let s = &self.env.settings;
        FocusSwitch {
            focus: self.env.focus.as_ref(),
            device: self.env.device.as_ref(),
            hotkey: &s.focus_hotkey,
            settle_ms: s.pacing.focus_settle_ms,
        }
    }

    fn target_hp(&self) -> Option<f64> {
        let snapshot = self.env.telemetry.snapshot()?;
        snapshot.player(self.id).map(|p| p.target.hp_percent)
    }

    fn press(&self, binding: &str) -> Result<()> {
        let (modifier, key) = parse_binding(binding);
        let device = &self.env.device;
        device.send_key(modifier, key)?;
        sleep::sleep_jitter(&self.env.settings.pacing.key_hold);
        device.end_key()
    }

    fn click(&self, button: MouseButton, at: Point) -> Result<()> {
        let device = &self.env.device;
        device.mouse_absolute(button, at, 0)?;
        sleep::sleep_jitter(&self.env.settings.pacing.click_settle);
        device.mouse_end()
    }

    fn send_binding(&self, item: &ActionItem, turn: &mut Option<Turn>) -> Result<Step> {
        if self.ensure_turn(turn).is_none() {
            return Ok(Step::Cancelled);
        }
        self.press(&item.binding)?;
        sleep::sleep_ms(item.delay_ms);
        Ok(Step::Done)
    }

    fn attack(&self, item: &ActionItem, turn: &mut Option<Turn>) -> Result<Step> {
        if let Ok(Some(name)) = self.env.vision.current_target() {
            if !self.env.settings.targets.accepts(&name) {
                logger::info_p(&self.prefix, &format!("dropping target {}", name));
                if self.ensure_turn(turn).is_none() {
                    return Ok(Step::Cancelled);
                }
                self.press("esc")?;
                return Ok(Step::Skipped);
            }
        }
        self.send_binding(item, turn)
    }

    // First visit arms the step; a later visit past the period fires once
    // the target is dead, then stops this controller.
    fn stop_action(
        &self,
        i: usize,
        item: &ActionItem,
        player: Option<&PlayerStat>,
        turn: &mut Option<Turn>,
    ) -> Result<Step> {
        if self.actions[i].last_run.is_none() {
            return Ok(Step::Done);
        }
        match player {
            Some(p) if p.target.hp_percent == 0.0 => {}
            _ => return Ok(Step::Skipped),
        }
        if self.ensure_turn(turn).is_none() {
            return Ok(Step::Cancelled);
        }
        self.press(&item.binding)?;
        sleep::sleep_ms(item.delay_ms);
        sleep::sleep_ms(self.env.settings.pacing.stop_grace_ms);
        logger::info_p(&self.prefix, "stop action fired");
        self.stop_tx.send(()).ok();
        Ok(Step::Stopped)
    }

    fn ai_target_next(&self, turn: &mut Option<Turn>) -> Result<Step> {
        if self.role != Role::Main {
            logger::error_p(&self.prefix, "aitargetnext is only supported on the main client");
            return Ok(Step::Skipped);
        }
        let boxes = self.env.vision.bounds()?;
        if self.ensure_turn(turn).is_none() {
            return Ok(Step::Cancelled);
        }
        let (stay_mod, stay_key) = parse_binding(&self.env.settings.stay_binding);
        self.env.device.send_key(stay_mod, stay_key)?;
        sleep::sleep_jitter(&self.env.settings.pacing.key_hold);
        let result = self.pick_target(&boxes, (stay_mod, stay_key));
        // the stay key stays held until every click is done
        let released = self.env.device.end_key();
        result.and(released)?;
        Ok(Step::Done)
    }

    /// Click candidate boxes until one yields an accepted target, then
    /// clear the selection if none did.
    fn pick_target(&self, boxes: &[[i32; 4]], stay: (u8, &str)) -> Result<()> {
        let s = &self.env.settings;
        let mut acquired = self.target_hp().unwrap_or(0.0) > 0.0;
        for b in boxes {
            if acquired {
                break;
            }
            let at = Point::new(b[0] + (b[2] - b[0]) / 2, b[1] + s.target_click_offset_y);
            self.click(MouseButton::Left, at)?;
            match self.env.vision.current_target() {
                Ok(Some(name)) if s.targets.accepts(&name) => {
                    logger::info_p(&self.prefix, &format!("target is {}", name));
                    acquired = true;
                }
                Ok(Some(name)) => {
                    logger::info_p(&self.prefix, &format!("skipping target {}", name));
                    self.env.device.send_key(0, "esc")?;
                    sleep::sleep_jitter(&s.pacing.key_hold);
                    self.env.device.send_key(stay.0, stay.1)?;
                }
                _ => acquired = self.target_hp().unwrap_or(0.0) > 0.0,
            }
        }
        if !acquired {
            for p in &s.clear_target_points {
                self.env.device.mouse_absolute(MouseButton::Right, *p, 0)?;
            }
            self.env.device.mouse_end()?;
        }
        Ok(())
    }

    fn assist_party_member(&self, item: &ActionItem, turn: &mut Option<Turn>) -> Result<Step> {
        let Some(point) = self.env.settings.party_slots.get(item.additional.trim()).copied() else {
            logger::error_p(&self.prefix, &format!("wrong party slot for assist: {:?}", item.additional));
            return Ok(Step::Skipped);
        };
        if self.ensure_turn(turn).is_none() {
            return Ok(Step::Cancelled);
        }
        self.env.device.mouse_absolute(MouseButton::Right, point, 0)?;
        self.env.device.mouse_end()?;
        sleep::sleep_ms(item.delay_ms);
        Ok(Step::Done)
    }

    fn unstuck(&self, item: &ActionItem, turn: &mut Option<Turn>) -> Result<Step> {
        if self.ensure_turn(turn).is_none() {
            return Ok(Step::Cancelled);
        }
        let s = &self.env.settings;
        let at = Point::new(
            sleep::spread(s.unstuck_point.x, s.unstuck_jitter_px),
            sleep::spread(s.unstuck_point.y, s.unstuck_jitter_px),
        );
        self.click(MouseButton::Left, at)?;
        sleep::sleep_ms(s.pacing.unstuck_settle_ms);
        self.press(&item.binding)?;
        self.press("esc")?;
        sleep::sleep_ms(item.delay_ms);
        Ok(Step::Done)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{Condition, Field, Operator, Preset, ProfilePreset, ProfileTemplate};
    use crate::settings::Pacing;
    use crate::telemetry::{SharedTelemetry, TelemetrySnapshot};
    use crossbeam_channel::bounded;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Key(u8, String),
        EndKey,
        Mouse(MouseButton, Point),
        MouseEnd,
    }

    #[derive(Default)]
    pub struct RecordingDevice {
        pub events: Mutex<Vec<Event>>,
    }

    impl RecordingDevice {
        pub fn events(&self) -> Vec<Event> {
            lock(&self.events).clone()
        }

        pub fn keys(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Key(_, k) => Some(k),
                    _ => None,
                })
                .collect()
        }
    }

    impl InputDevice for RecordingDevice {
        fn send_key(&self, modifier: u8, key: &str) -> Result<()> {
            lock(&self.events).push(Event::Key(modifier, key.to_string()));
            Ok(())
        }
        fn end_key(&self) -> Result<()> {
            lock(&self.events).push(Event::EndKey);
            Ok(())
        }
        fn mouse_absolute(&self, button: MouseButton, point: Point, _wheel: i8) -> Result<()> {
            lock(&self.events).push(Event::Mouse(button, point));
            Ok(())
        }
        fn mouse_end(&self) -> Result<()> {
            lock(&self.events).push(Event::MouseEnd);
            Ok(())
        }
    }

    /// Foreground is whatever was last requested.
    #[derive(Default)]
    pub struct MemoryFocus {
        pub current: Mutex<ClientId>,
    }

    impl FocusService for MemoryFocus {
        fn foreground(&self) -> Result<ClientId> {
            Ok(*lock(&self.current))
        }
        fn request_foreground(&self, id: ClientId) -> Result<()> {
            *lock(&self.current) = id;
            Ok(())
        }
    }

    /// `names` are handed out one per lookup before falling back to `target`.
    #[derive(Default)]
    pub struct FakeVision {
        pub boxes: Mutex<Option<Vec<[i32; 4]>>>,
        pub target: Mutex<Option<String>>,
        pub names: Mutex<std::collections::VecDeque<String>>,
    }

    impl VisionService for FakeVision {
        fn bounds(&self) -> Result<Vec<[i32; 4]>> {
            lock(&self.boxes).clone().ok_or_else(|| Error::Vision("offline".into()))
        }
        fn current_target(&self) -> Result<Option<String>> {
            if let Some(name) = lock(&self.names).pop_front() {
                return Ok(Some(name));
            }
            Ok(lock(&self.target).clone())
        }
    }

    pub struct MemoryProfiles(pub Mutex<Vec<ActionItem>>);

    impl ProfileSource for MemoryProfiles {
        fn load(&self, name: &str) -> Result<ProfileTemplate> {
            Ok(ProfileTemplate {
                name: name.to_string(),
                items: vec![ProfilePreset {
                    preset: Preset { id: 1, name: "test".into(), items: lock(&self.0).clone() },
                    is_active: true,
                }],
            })
        }
    }

    pub struct ManualClock(pub Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn advance(&self, secs: i64) {
            *lock(&self.0) += ChronoDuration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *lock(&self.0)
        }
    }

    pub struct Rig {
        pub env: Arc<Env>,
        pub device: Arc<RecordingDevice>,
        pub focus: Arc<MemoryFocus>,
        pub vision: Arc<FakeVision>,
        pub telemetry: Arc<SharedTelemetry>,
        pub profiles: Arc<MemoryProfiles>,
        pub clock: Arc<ManualClock>,
        pub shutdown_tx: Option<Sender<()>>,
    }

    impl Rig {
        pub fn new(items: Vec<ActionItem>) -> Self {
            let mut settings = Settings::default();
            settings.pacing = Pacing::immediate();
            Self::with_settings(items, settings)
        }

        /// Zero pacing except a 1 ms breather between ticks, for tests
        /// that run real control loop threads.
        pub fn looping(items: Vec<ActionItem>) -> Self {
            let mut settings = Settings::default();
            settings.pacing = Pacing::immediate();
            settings.pacing.after_tick = crate::sleep::Jitter::fixed(1);
            Self::with_settings(items, settings)
        }

        pub fn with_settings(items: Vec<ActionItem>, settings: Settings) -> Self {
            let device = Arc::new(RecordingDevice::default());
            let focus = Arc::new(MemoryFocus::default());
            let vision = Arc::new(FakeVision::default());
            let telemetry = Arc::new(SharedTelemetry::new());
            let profiles = Arc::new(MemoryProfiles(Mutex::new(items)));
            let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
            let (shutdown_tx, shutdown) = bounded(0);
            let (arbiter, _) = Arbiter::spawn();
            let env = Arc::new(Env {
                device: device.clone(),
                focus: focus.clone(),
                vision: vision.clone(),
                telemetry: telemetry.clone(),
                profiles: profiles.clone(),
                arbiter,
                clock: clock.clone(),
                settings: Arc::new(settings),
                shutdown,
            });
            Self { env, device, focus, vision, telemetry, profiles, clock, shutdown_tx: Some(shutdown_tx) }
        }

        pub fn set_target_hp(&self, ids: &[ClientId], hp: f64) {
            let mut s = TelemetrySnapshot::default();
            for id in ids {
                let mut p = PlayerStat::default();
                p.hp.percent = 80.0;
                p.mp.percent = 80.0;
                p.target.hp_percent = hp;
                s.player.insert(*id, p);
            }
            self.telemetry.publish(s);
        }

        pub fn worker(&self, id: ClientId, role: Role) -> (Worker, Receiver<()>) {
            let (tx, rx) = unbounded();
            (Worker::new(id, role, "test".into(), self.env.clone(), tx), rx)
        }
    }

    fn attack_when_target_alive() -> ActionItem {
        ActionItem::new(ActionKind::Attack, "1").with_condition(Condition::new(Field::TargetHp, Operator::Gt, "0"))
    }

    #[test]
    fn attack_waits_for_a_live_target() {
        let rig = Rig::new(vec![attack_when_target_alive()]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);

        for _ in 0..5 {
            w.tick().unwrap();
        }
        assert!(rig.device.events().is_empty());
        assert_eq!(w.last_runs(), vec![None]);

        rig.set_target_hp(&[7], 30.0);
        w.tick().unwrap();
        assert_eq!(rig.device.events(), vec![Event::Key(0, "1".into()), Event::EndKey]);
        assert!(w.last_runs()[0].is_some());
    }

    #[test]
    fn period_guard() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Press, "f1").with_period(5_000)]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);

        w.tick().unwrap();
        assert_eq!(rig.device.keys(), vec!["f1"]);

        rig.clock.advance(2);
        w.tick().unwrap();
        assert_eq!(rig.device.keys().len(), 1);

        rig.clock.advance(4);
        w.tick().unwrap();
        assert_eq!(rig.device.keys().len(), 2);
    }

    #[test]
    fn stop_action_arms_then_fires_once() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Stop, "0").with_period(10_000)]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, stop) = rig.worker(7, Role::Secondary);

        w.tick().unwrap();
        assert!(rig.device.events().is_empty());
        assert!(w.last_runs()[0].is_some());
        assert!(stop.try_recv().is_err());

        rig.clock.advance(11);
        w.tick().unwrap();
        assert_eq!(rig.device.events(), vec![Event::Key(0, "0".into()), Event::EndKey]);
        assert!(stop.try_recv().is_ok());
        assert!(stop.try_recv().is_err());
    }

    #[test]
    fn stop_action_holds_while_target_alive() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Stop, "0").with_period(10_000)]);
        rig.set_target_hp(&[7], 45.0);
        let (mut w, stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        rig.clock.advance(11);
        w.tick().unwrap();
        assert!(rig.device.events().is_empty());
        assert!(stop.try_recv().is_err());
    }

    #[test]
    fn missing_telemetry_skips_without_failing() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Press, "2")]);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        w.tick().unwrap();
        assert!(rig.device.events().is_empty());
    }

    #[test]
    fn empty_profile_is_terminal() {
        let rig = Rig::new(vec![]);
        let (mut w, _stop) = rig.worker(7, Role::Main);
        assert!(matches!(w.tick(), Err(Error::NoActionsAvailable)));
    }

    #[test]
    fn assist_party_member_right_clicks_slot() {
        let rig = Rig::new(vec![
            ActionItem::new(ActionKind::AssistPartyMember, "").with_additional("3"),
            ActionItem::new(ActionKind::AssistPartyMember, "").with_additional("9"),
        ]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        assert_eq!(
            rig.device.events(),
            vec![Event::Mouse(MouseButton::Right, Point::new(40, 255)), Event::MouseEnd]
        );
        let runs = w.last_runs();
        assert!(runs[0].is_some());
        assert!(runs[1].is_none());
    }

    #[test]
    fn attack_drops_rejected_target() {
        let mut settings = Settings::default();
        settings.pacing = Pacing::immediate();
        settings.targets.deny = vec!["Gibik".into()];
        let rig = Rig::with_settings(vec![ActionItem::new(ActionKind::Attack, "1")], settings);
        rig.set_target_hp(&[7], 50.0);
        *lock(&rig.vision.target) = Some("Gibik".into());
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        assert_eq!(rig.device.keys(), vec!["esc"]);
        assert_eq!(w.last_runs(), vec![None]);
    }

    #[test]
    fn ai_target_next_clicks_boxes_then_clears() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::AiTargetNext, "")]);
        rig.set_target_hp(&[7], 0.0);
        *lock(&rig.vision.boxes) = Some(vec![[100, 200, 140, 214], [300, 400, 360, 415]]);
        let (mut w, _stop) = rig.worker(7, Role::Main);
        w.tick().unwrap();

        let clicks: Vec<Event> = rig
            .device
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Mouse(..)))
            .collect();
        assert_eq!(
            clicks,
            vec![
                Event::Mouse(MouseButton::Left, Point::new(120, 230)),
                Event::Mouse(MouseButton::Left, Point::new(330, 430)),
                Event::Mouse(MouseButton::Right, Point::new(480, 320)),
                Event::Mouse(MouseButton::Right, Point::new(580, 320)),
            ]
        );
    }

    /// Every left click selects a live target for `client`.
    struct SelectingDevice {
        inner: RecordingDevice,
        telemetry: Arc<SharedTelemetry>,
        client: ClientId,
    }

    impl InputDevice for SelectingDevice {
        fn send_key(&self, modifier: u8, key: &str) -> Result<()> {
            self.inner.send_key(modifier, key)
        }
        fn end_key(&self) -> Result<()> {
            self.inner.end_key()
        }
        fn mouse_absolute(&self, button: MouseButton, point: Point, wheel: i8) -> Result<()> {
            if button == MouseButton::Left {
                let mut s = TelemetrySnapshot::default();
                let mut p = PlayerStat::default();
                p.hp.percent = 80.0;
                p.target.hp_percent = 100.0;
                s.player.insert(self.client, p);
                self.telemetry.publish(s);
            }
            self.inner.mouse_absolute(button, point, wheel)
        }
        fn mouse_end(&self) -> Result<()> {
            self.inner.mouse_end()
        }
    }

    fn env_with_device(rig: &Rig, device: Arc<dyn InputDevice>) -> Arc<Env> {
        Arc::new(Env {
            device,
            focus: rig.focus.clone(),
            vision: rig.vision.clone(),
            telemetry: rig.telemetry.clone(),
            profiles: rig.profiles.clone(),
            arbiter: rig.env.arbiter.clone(),
            clock: rig.clock.clone(),
            settings: rig.env.settings.clone(),
            shutdown: rig.env.shutdown.clone(),
        })
    }

    fn deny_gibik() -> Settings {
        let mut settings = Settings::default();
        settings.pacing = Pacing::immediate();
        settings.targets.deny = vec!["Gibik".into()];
        settings
    }

    fn selecting_worker(rig: &Rig, id: ClientId) -> (Arc<SelectingDevice>, Worker) {
        let device = Arc::new(SelectingDevice {
            inner: RecordingDevice::default(),
            telemetry: rig.telemetry.clone(),
            client: id,
        });
        let (tx, _) = unbounded();
        let w = Worker::new(id, Role::Main, "test".into(), env_with_device(rig, device.clone()), tx);
        (device, w)
    }

    #[test]
    fn ai_target_next_moves_past_a_rejected_target() {
        let rig = Rig::with_settings(vec![ActionItem::new(ActionKind::AiTargetNext, "")], deny_gibik());
        rig.set_target_hp(&[7], 0.0);
        *lock(&rig.vision.boxes) = Some(vec![[100, 200, 140, 214], [300, 400, 360, 415], [500, 600, 540, 614]]);
        lock(&rig.vision.names).extend(["Gibik".to_string(), "Cave Servant".to_string()]);
        let (device, mut w) = selecting_worker(&rig, 7);
        w.tick().unwrap();

        let events = device.inner.events();
        let clicks: Vec<Event> = events.iter().filter(|e| matches!(e, Event::Mouse(..))).cloned().collect();
        assert_eq!(
            clicks,
            vec![
                Event::Mouse(MouseButton::Left, Point::new(120, 230)),
                Event::Mouse(MouseButton::Left, Point::new(330, 430)),
            ]
        );
        assert_eq!(device.inner.keys(), vec!["z", "esc", "z"]);
        assert_eq!(events.first(), Some(&Event::Key(crate::platform::MOD_LEFT_SHIFT, "z".into())));
        assert_eq!(events.last(), Some(&Event::EndKey));
    }

    #[test]
    fn ai_target_next_clears_when_every_target_is_rejected() {
        let rig = Rig::with_settings(vec![ActionItem::new(ActionKind::AiTargetNext, "")], deny_gibik());
        rig.set_target_hp(&[7], 0.0);
        *lock(&rig.vision.boxes) = Some(vec![[100, 200, 140, 214], [300, 400, 360, 415]]);
        *lock(&rig.vision.target) = Some("Gibik".into());
        let (device, mut w) = selecting_worker(&rig, 7);
        w.tick().unwrap();

        let events = device.inner.events();
        assert_eq!(device.inner.keys().iter().filter(|k| *k == "esc").count(), 2);
        let right: Vec<Event> =
            events.iter().filter(|e| matches!(e, Event::Mouse(MouseButton::Right, _))).cloned().collect();
        assert_eq!(
            right,
            vec![
                Event::Mouse(MouseButton::Right, Point::new(480, 320)),
                Event::Mouse(MouseButton::Right, Point::new(580, 320)),
            ]
        );
        assert_eq!(events.last(), Some(&Event::EndKey));
    }

    #[test]
    fn ai_target_next_vision_error_skips() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::AiTargetNext, "")]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Main);
        w.tick().unwrap();
        assert!(rig.device.events().is_empty());
        assert_eq!(w.last_runs(), vec![None]);
    }

    #[test]
    fn ai_target_next_is_main_only() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::AiTargetNext, "")]);
        rig.set_target_hp(&[8], 0.0);
        *lock(&rig.vision.boxes) = Some(vec![[100, 200, 140, 214]]);
        let (mut w, _stop) = rig.worker(8, Role::Secondary);
        w.tick().unwrap();
        assert!(rig.device.events().is_empty());
    }

    #[test]
    fn unstuck_clicks_near_point_then_keys() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Unstuck, "shift+g")]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        let events = rig.device.events();
        match &events[0] {
            Event::Mouse(MouseButton::Left, p) => {
                assert!((920..=1000).contains(&p.x));
                assert!((800..=880).contains(&p.y));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rig.device.keys(), vec!["g".to_string(), "esc".to_string()]);
        assert!(events.contains(&Event::Key(crate::platform::MOD_LEFT_SHIFT, "g".into())));
    }

    #[test]
    fn turn_switches_focus_and_back() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[8], 0.0);
        *lock(&rig.focus.current) = 7;
        let (mut w, _stop) = rig.worker(8, Role::Secondary);
        w.tick().unwrap();
        assert_eq!(rig.device.keys(), vec!["1"]);
        assert_eq!(rig.device.events()[0], Event::Mouse(MouseButton::Left, Point::new(960, 560)));
        assert_eq!(*lock(&rig.focus.current), 7);
    }

    #[test]
    fn period_beyond_the_calendar_never_elapses() {
        let rig = Rig::new(vec![
            ActionItem::new(ActionKind::Press, "1").with_period(u64::MAX),
            ActionItem::new(ActionKind::Press, "2").with_period(i64::MAX as u64),
        ]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        rig.clock.advance(86_400 * 365);
        w.tick().unwrap();
        assert_eq!(rig.device.keys(), vec!["1", "2"]);
    }

    /// Foreground never moves off client 7 and every request is refused.
    #[derive(Default)]
    struct StuckFocus {
        requests: Mutex<Vec<ClientId>>,
    }

    impl FocusService for StuckFocus {
        fn foreground(&self) -> Result<ClientId> {
            Ok(7)
        }
        fn request_foreground(&self, id: ClientId) -> Result<()> {
            lock(&self.requests).push(id);
            Err(Error::Http("refused".into()))
        }
    }

    #[test]
    fn failed_window_switch_still_sends_the_key() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[8], 0.0);
        let focus = Arc::new(StuckFocus::default());
        let env = Arc::new(Env {
            device: rig.device.clone(),
            focus: focus.clone(),
            vision: rig.vision.clone(),
            telemetry: rig.telemetry.clone(),
            profiles: rig.profiles.clone(),
            arbiter: rig.env.arbiter.clone(),
            clock: rig.clock.clone(),
            settings: rig.env.settings.clone(),
            shutdown: rig.env.shutdown.clone(),
        });
        let (tx, _stop) = unbounded();
        let mut w = Worker::new(8, Role::Secondary, "test".into(), env, tx);
        w.tick().unwrap();

        // hotkey fallback, then the action itself; no switch back
        assert_eq!(rig.device.keys(), vec!["\\", "1"]);
        assert!(!rig.device.events().iter().any(|e| matches!(e, Event::Mouse(..))));
        assert_eq!(*lock(&focus.requests), vec![8]);
        assert_eq!(w.last_runs().len(), 1);
        assert!(w.last_runs()[0].is_some());
    }

    #[test]
    fn reload_clears_and_picks_up_edits() {
        let rig = Rig::new(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7], 0.0);
        let (mut w, _stop) = rig.worker(7, Role::Secondary);
        w.tick().unwrap();
        *lock(&rig.profiles.0) = vec![ActionItem::new(ActionKind::Press, "2")];
        w.tick().unwrap();
        w.clear();
        w.tick().unwrap();
        assert_eq!(rig.device.keys(), vec!["1", "1", "2"]);
    }

    fn wait_for(what: &str, mut f: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        while !f() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn start_twice_is_rejected_and_stop_returns_to_idle() {
        let rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        let c = RunController::new(7, Role::Secondary, rig.env.clone());
        assert!(c.try_acquire());

        c.start("test").unwrap();
        assert!(!c.try_acquire());
        assert!(matches!(c.start("test"), Err(Error::AlreadyRunning(7))));

        c.stop();
        c.join();
        assert_eq!(c.state(), RunState::Idle);
        assert!(c.try_acquire());
        assert_eq!(c.profile().as_deref(), Some("test"));
    }

    #[test]
    fn reload_reaches_a_running_loop() {
        let rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7], 0.0);
        let c = RunController::new(7, Role::Secondary, rig.env.clone());
        c.start("test").unwrap();
        wait_for("the first key", || rig.device.keys().iter().any(|k| k == "1"));

        *lock(&rig.profiles.0) = vec![ActionItem::new(ActionKind::Press, "2")];
        c.reload();
        wait_for("the edited key", || rig.device.keys().iter().any(|k| k == "2"));
        assert_eq!(c.state(), RunState::Running);

        c.stop();
        c.join();
    }

    /// Panics on the first key it is asked to press.
    struct PanickingDevice;

    impl InputDevice for PanickingDevice {
        fn send_key(&self, _modifier: u8, key: &str) -> Result<()> {
            panic!("device fault on {}", key);
        }
        fn end_key(&self) -> Result<()> {
            Ok(())
        }
        fn mouse_absolute(&self, _: MouseButton, _: Point, _: i8) -> Result<()> {
            Ok(())
        }
        fn mouse_end(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn panicking_loop_returns_to_idle() {
        let rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7], 0.0);
        let c = RunController::new(7, Role::Secondary, env_with_device(&rig, Arc::new(PanickingDevice)));
        c.start("test").unwrap();
        c.join();
        assert_eq!(c.state(), RunState::Idle);
        assert!(c.try_acquire());

        // the turn went back to the arbiter with the unwinding worker
        let (_cancel_tx, cancel) = bounded::<()>(0);
        assert!(rig.env.arbiter.acquire(8, &cancel).is_some());
        c.start("test").unwrap();
        c.join();
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn empty_profile_ends_the_activation() {
        let rig = Rig::looping(vec![]);
        let c = RunController::new(7, Role::Main, rig.env.clone());
        c.start("test").unwrap();
        c.join();
        assert_eq!(c.state(), RunState::Idle);
        assert!(rig.device.events().is_empty());
    }

    #[test]
    fn pause_toggles() {
        let rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7], 0.0);
        let c = RunController::new(7, Role::Secondary, rig.env.clone());
        c.start("test").unwrap();

        c.pause();
        wait_for("paused", || c.state() == RunState::Paused);
        let frozen = rig.device.keys().len();
        thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(rig.device.keys().len(), frozen);

        c.pause();
        wait_for("running", || c.state() == RunState::Running);
        wait_for("progress", || rig.device.keys().len() > frozen);

        c.stop();
        c.join();
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn stale_stop_does_not_end_next_activation() {
        let rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7], 0.0);
        let c = RunController::new(7, Role::Secondary, rig.env.clone());
        c.stop.raise();
        c.start("test").unwrap();
        wait_for("a key", || !rig.device.keys().is_empty());
        assert_eq!(c.state(), RunState::Running);
        c.stop();
        c.join();
    }

    #[test]
    fn shutdown_ends_every_loop() {
        let mut rig = Rig::looping(vec![ActionItem::new(ActionKind::Press, "1")]);
        rig.set_target_hp(&[7, 8], 0.0);
        let a = RunController::new(7, Role::Main, rig.env.clone());
        let b = RunController::new(8, Role::Secondary, rig.env.clone());
        a.start("test").unwrap();
        b.start("test").unwrap();
        drop(rig.shutdown_tx.take());
        a.join();
        b.join();
        assert_eq!(a.state(), RunState::Idle);
        assert_eq!(b.state(), RunState::Idle);
    }

    /// Device that flags a key press starting while another is held.
    #[derive(Default)]
    struct OverlapDevice {
        held: Mutex<Option<String>>,
        keys: Mutex<Vec<String>>,
        overlaps: std::sync::atomic::AtomicUsize,
    }

    impl InputDevice for OverlapDevice {
        fn send_key(&self, _modifier: u8, key: &str) -> Result<()> {
            let mut held = lock(&self.held);
            if held.is_some() {
                self.overlaps.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            *held = Some(key.to_string());
            lock(&self.keys).push(key.to_string());
            drop(held);
            // widen the window a concurrent press would hit
            thread::sleep(std::time::Duration::from_micros(200));
            Ok(())
        }
        fn end_key(&self) -> Result<()> {
            *lock(&self.held) = None;
            Ok(())
        }
        fn mouse_absolute(&self, _: MouseButton, _: Point, _: i8) -> Result<()> {
            Ok(())
        }
        fn mouse_end(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn two_controllers_never_interleave_gestures() {
        let rig = Rig::looping(vec![]);
        let device = Arc::new(OverlapDevice::default());
        let items = |key: &str| vec![ActionItem::new(ActionKind::Press, key), ActionItem::new(ActionKind::Press, key)];

        let env_for = |key: &str| {
            Arc::new(Env {
                device: device.clone(),
                focus: rig.focus.clone(),
                vision: rig.vision.clone(),
                telemetry: rig.telemetry.clone(),
                profiles: Arc::new(MemoryProfiles(Mutex::new(items(key)))),
                arbiter: rig.env.arbiter.clone(),
                clock: rig.clock.clone(),
                settings: rig.env.settings.clone(),
                shutdown: rig.env.shutdown.clone(),
            })
        };
        rig.set_target_hp(&[7, 8], 0.0);
        let a = RunController::new(7, Role::Main, env_for("1"));
        let b = RunController::new(8, Role::Secondary, env_for("2"));
        a.start("a").unwrap();
        b.start("b").unwrap();

        wait_for("both clients", || {
            let keys = lock(&device.keys);
            keys.iter().filter(|k| *k == "1").count() > 20 && keys.iter().filter(|k| *k == "2").count() > 20
        });
        a.stop();
        b.stop();
        a.join();
        b.join();

        assert_eq!(device.overlaps.load(std::sync::atomic::Ordering::SeqCst), 0);
        // a tick's presses stay together
        let keys = lock(&device.keys).clone();
        let mut i = 0;
        while i + 1 < keys.len() {
            assert_eq!(keys[i], keys[i + 1], "split tick at {}", i);
            i += 2;
        }
    }
}
