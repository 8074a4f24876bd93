use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use duet_core::types::{Role, RunState};

use crate::App;

fn state_color(state: RunState) -> Color {
    match state {
        RunState::Running => Color::Green,
        RunState::Paused => Color::Yellow,
        RunState::Stopping => Color::Magenta,
        RunState::Idle => Color::DarkGray,
    }
}

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = if app.log_visible {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(f.area())
    } else {
        Layout::default().constraints([Constraint::Percentage(100)]).split(f.area())
    };

    let running = app.running_count();
    let (banner_label, banner_bg) = if app.rows.is_empty() {
        ("NO CLIENTS (press d to discover)".to_string(), Color::Red)
    } else if running > 0 {
        (format!("{} OF {} RUNNING", running, app.rows.len()), Color::Green)
    } else {
        ("ALL IDLE (press s to start)".to_string(), Color::DarkGray)
    };

    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow));
    let mut lines: Vec<Line> = vec![
        Line::from(vec![
            Span::raw(" "),
            key("j/k"),
            Span::raw(" select, "),
            key("tab"),
            Span::raw(" profile, "),
            key("s"),
            Span::raw("tart, "),
            key("x"),
            Span::raw(" stop, "),
            key("p"),
            Span::raw("ause, "),
            key("r"),
            Span::raw("eload, "),
            key("d"),
            Span::raw("iscover"),
        ]),
        Line::from(""),
    ];

    for (i, row) in app.rows.iter().enumerate() {
        let marker = if i == app.selected { "> " } else { "  " };
        let role = match row.role {
            Role::Main => Span::styled("main ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
            Role::Secondary => Span::styled("sec  ", Style::default().fg(Color::Cyan)),
        };
        // while active show what is running, otherwise what `s` would start
        let profile = if row.state.is_active() {
            row.profile.clone().unwrap_or_default()
        } else {
            app.chosen_profile(row.id).unwrap_or("-").to_string()
        };
        lines.push(Line::from(vec![
            Span::raw(marker),
            Span::styled(format!("{:<8}", row.id), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
            role,
            Span::styled(format!("{:<9}", row.state.to_string()), Style::default().fg(state_color(row.state))),
            Span::styled(profile, Style::default().fg(Color::DarkGray)),
        ]));
    }

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(chunks[0]);

    let width = left[0].width as usize;
    let pad_total = width.saturating_sub(banner_label.len());
    let pad_left = pad_total / 2;
    let centered = format!("{}{}{}", " ".repeat(pad_left), banner_label, " ".repeat(pad_total - pad_left));
    let banner = Paragraph::new(Line::from(Span::styled(
        centered,
        Style::default().fg(Color::Black).bg(banner_bg).add_modifier(Modifier::BOLD),
    )));
    f.render_widget(banner, left[0]);

    let list = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(list, left[1]);

    if app.log_visible && chunks.len() > 1 {
        let visible_height = chunks[1].height.saturating_sub(2) as usize;
        let total = app.log_messages.len();
        let scroll = app.log_scroll.min(total.saturating_sub(visible_height));
        let start = total.saturating_sub(visible_height + scroll);
        let end = total.saturating_sub(scroll);
        let log_lines: Vec<Line> = app.log_messages[start..end].iter().map(|m| parse_log_line(m)).collect();

        let log_panel = Paragraph::new(log_lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Logs ")
                    .border_style(Style::default().fg(Color::Yellow)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(log_panel, chunks[1]);
    }

    if let Some(dialog) = &app.confirm {
        dialog.render(f);
    }
}

/// Structured log line (level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage)
/// to a colored Line.
fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    let [level, prefix, color, timestamp, message] = parts[..] else {
        return Line::from(raw);
    };

    let color = match color.parse::<u8>().unwrap_or(0) {
        1 => Color::DarkGray,  // COLOR_GRAY
        2 => Color::LightBlue, // COLOR_BLUE
        3 => Color::Green,     // COLOR_GREEN
        4 => Color::Magenta,   // COLOR_MAGENTA
        _ => Color::White,
    };

    let mut spans = vec![Span::styled(timestamp, Style::default().fg(Color::DarkGray)), Span::raw(" ")];
    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        _ => {}
    }
    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(message, Style::default().fg(color)));
    Line::from(spans)
}
