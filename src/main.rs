use std::io;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use duet_core::arbiter::Arbiter;
use duet_core::controller::{Env, SystemClock};
use duet_core::platform::http::HttpServices;
use duet_core::platform::stub::StubServices;
use duet_core::platform::{create_device, ClientDirectory, FocusService, VisionService};
use duet_core::profile::ProfileStore;
use duet_core::registry::{self, Registry};
use duet_core::settings::Settings;
use duet_core::telemetry::{self, SharedTelemetry};
use duet_core::logger;
use duet_core::types::Command;

struct Args {
    stub: bool,
    config: PathBuf,
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = Args { stub: false, config: PathBuf::from("settings.json") };
    let mut it = argv.into_iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--stub" => args.stub = true,
            "--config" => match it.next() {
                Some(p) => args.config = PathBuf::from(p),
                None => anyhow::bail!("--config needs a path"),
            },
            other => anyhow::bail!("unknown flag {}", other),
        }
    }
    Ok(args)
}

type Services = (Arc<dyn FocusService>, Arc<dyn VisionService>, Arc<dyn ClientDirectory>);

fn companion_services(settings: &Settings, stub: bool) -> Services {
    if stub {
        let s = Arc::new(StubServices);
        return (s.clone(), s.clone(), s);
    }
    let h = Arc::new(HttpServices::new(
        settings.endpoints.clone(),
        Duration::from_millis(settings.http_timeout_ms),
        settings.bounds_merge_px,
    ));
    (h.clone(), h.clone(), h)
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let settings = Settings::load(&args.config)
        .with_context(|| format!("reading settings {}", args.config.display()))?;

    logger::init(&settings.logs_dir).with_context(|| format!("opening log dir {}", settings.logs_dir.display()))?;

    // without the hardware channel there is nothing to drive
    let device = create_device(&settings, args.stub).context("opening input device")?;

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<Command>();
    // dropped on exit; every loop watching it sees the disconnect
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    logger::set_tui_sender(log_tx);
    logger::info(&format!("duet started{}", if args.stub { " (stub)" } else { "" }));

    let stats = Arc::new(SharedTelemetry::new());
    let poller = telemetry::spawn_poller(
        settings.endpoints.stats.clone(),
        Duration::from_millis(settings.poll_interval_ms),
        Duration::from_millis(settings.http_timeout_ms),
        Arc::clone(&stats),
        shutdown_rx.clone(),
    );

    let (focus, vision, directory) = companion_services(&settings, args.stub);

    let store = Arc::new(ProfileStore::new(&settings.profiles_dir, &settings.presets_dir));
    let (arbiter, _arbiter_thread) = Arbiter::spawn();
    let default_profile = settings.default_profile.clone();
    let env = Arc::new(Env {
        device,
        focus,
        vision,
        telemetry: stats,
        profiles: store.clone(),
        arbiter,
        clock: Arc::new(SystemClock),
        settings: Arc::new(settings),
        shutdown: shutdown_rx,
    });
    let registry = Arc::new(Registry::new(env, store));

    cmd_tx.send(Command::Discover).ok();
    let serve_registry = Arc::clone(&registry);
    let processor = thread::spawn(move || registry::serve(serve_registry, directory, cmd_rx));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = duet_tui::App::new(Arc::clone(&registry), log_rx, cmd_tx.clone(), default_profile);
    let result = duet_tui::event::run(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    // TUI gone: make sure the processor sees Quit even after an error
    cmd_tx.send(Command::Quit).ok();
    drop(shutdown_tx);
    processor.join().ok();
    poller.join().ok();

    result
}
