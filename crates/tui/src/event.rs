use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, MouseEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::ui;
use crate::App;

pub fn run(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> anyhow::Result<()> {
    loop {
        if app.should_quit {
            return Ok(());
        }

        app.drain_logs();
        app.refresh();

        terminal.draw(|f| ui::draw(f, app))?;

        // 100ms poll keeps the state rows fresh
        if event::poll(Duration::from_millis(100))? {
            match event::read()? {
                Event::Key(key) => {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if app.confirm.is_some() {
                        on_confirm_key(app, key);
                    } else {
                        on_key(app, key);
                    }
                }
                Event::Mouse(mouse) => match mouse.kind {
                    MouseEventKind::ScrollUp => app.scroll_log_up(3),
                    MouseEventKind::ScrollDown => app.scroll_log_down(3),
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

fn on_key(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => app.request_quit(),
        KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('K') => app.move_up(),
        KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('J') => app.move_down(),
        KeyCode::Tab => app.cycle_profile(),
        KeyCode::Char('s') | KeyCode::Char('S') => app.start_selected(),
        KeyCode::Char('x') | KeyCode::Char('X') => app.stop_selected(),
        KeyCode::Char('p') | KeyCode::Char('P') => app.pause_selected(),
        KeyCode::Char('r') | KeyCode::Char('R') => app.reload_all(),
        KeyCode::Char('d') | KeyCode::Char('D') => app.rediscover(),
        KeyCode::Char('l') | KeyCode::Char('L') => app.toggle_log(),
        _ => {}
    }
}

fn on_confirm_key(app: &mut App, key: KeyEvent) {
    let Some(dialog) = app.confirm.as_mut() else { return };
    match key.code {
        KeyCode::Left | KeyCode::Right | KeyCode::Tab | KeyCode::Char('h') | KeyCode::Char('l') => dialog.toggle(),
        KeyCode::Char('y') | KeyCode::Char('Y') => app.quit(),
        KeyCode::Enter => {
            if dialog.selected {
                app.quit();
            } else {
                app.confirm = None;
            }
        }
        KeyCode::Esc | KeyCode::Char('n') | KeyCode::Char('N') => app.confirm = None,
        _ => {}
    }
}
