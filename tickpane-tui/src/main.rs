//! Multi-pane charting terminal.
//!
//! Thin rendering shell over the tickpane engine: all chart, overlay,
//! alert and template state lives behind [`TerminalHandles`]; this binary
//! only translates keystrokes into commands and draws the latest
//! [`RenderSnapshot`].

use chrono::{DateTime, Utc};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, BorderType, Borders, Chart, Dataset, GraphType, List, ListItem, Paragraph},
};
use rustls::crypto::ring::default_provider;
use std::{collections::VecDeque, error::Error, io, sync::Arc, time::Duration};
use tickpane_core::{AlertCondition, OverlayColor, PaneId};
use tickpane_engine::{
    BuiltinCatalog, JsonFileStore, LiveFeed, LiveFeedConfig, PaneView, RenderSnapshot, Terminal,
    TerminalCommand, TerminalConfig, TerminalEvent, TerminalHandles,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const C_UP: Color = Color::Rgb(100, 220, 100);       // Green
const C_DOWN: Color = Color::Rgb(220, 100, 100);     // Red
const C_DIM: Color = Color::Rgb(120, 120, 120);      // Gray
const C_BRIGHT: Color = Color::Rgb(220, 220, 220);   // White
const C_ACCENT: Color = Color::Rgb(100, 180, 220);   // Cyan
const C_HEADER: Color = Color::Rgb(180, 130, 220);   // Purple

const SYMBOLS: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"];
const OVERLAY_CYCLE: [&str; 4] = ["sma", "ema", "rsi", "bollinger"];
const DEFAULT_TEMPLATE: &str = "default";
const MAX_NOTIFICATIONS: usize = 50;

/// Renderer-local state: pane focus, overlay cycling, notification log
struct App {
    focused: usize,
    overlay_cursor: usize,
    notifications: VecDeque<(DateTime<Utc>, String)>,
}

impl App {
    fn new() -> Self {
        Self {
            focused: 0,
            overlay_cursor: 0,
            notifications: VecDeque::new(),
        }
    }

    fn focused_pane(&self, snapshot: &RenderSnapshot) -> PaneId {
        PaneId(self.focused.min(snapshot.panes.len().saturating_sub(1)))
    }

    fn notify(&mut self, text: String) {
        self.notifications.push_front((Utc::now(), text));
        self.notifications.truncate(MAX_NOTIFICATIONS);
    }

    fn on_event(&mut self, event: TerminalEvent) {
        let text = match event {
            TerminalEvent::AlertFired { alert, price } => format!(
                "ALERT {} {} {:.2} hit @ {:.2}",
                alert.symbol,
                alert.condition.label(),
                alert.target_price,
                price
            ),
            TerminalEvent::OverlayError {
                pane,
                display_name,
                error,
                ..
            } => format!("{display_name} on {pane} failed: {error}"),
            TerminalEvent::ConnectivityChanged(state) => format!("feed {}", state.label()),
            TerminalEvent::Backfilled { pane, candles } => {
                format!("{pane} reconciled with {candles} candles")
            }
            TerminalEvent::TemplateSaved { name } => format!("template '{name}' saved"),
            TerminalEvent::TemplateApplied { name } => format!("template '{name}' applied"),
            TerminalEvent::TemplateError(error) => format!("template error: {error}"),
        };
        self.notify(text);
    }
}

fn init_logging() {
    // The terminal owns stdout; logs go to a file next to the binary
    let Ok(file) = std::fs::File::create("tickpane-tui.log") else {
        return;
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file)
        .with_ansi(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();
    init_logging();

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
        original_hook(info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = ratatui::Terminal::new(backend)?;

    let feed = Arc::new(LiveFeed::start(LiveFeedConfig::default()));
    let (engine, handles) = Terminal::new(
        feed,
        Arc::new(BuiltinCatalog::new()),
        JsonFileStore::new(),
        TerminalConfig::default(),
    );
    tokio::spawn(engine.run());
    info!("charting terminal started");

    let result = run_app(&mut terminal, handles).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

async fn run_app(
    terminal: &mut ratatui::Terminal<CrosstermBackend<io::Stdout>>,
    mut handles: TerminalHandles,
) -> Result<(), Box<dyn Error>> {
    let mut app = App::new();
    let mut last_draw = std::time::Instant::now();
    let draw_interval = Duration::from_millis(50);

    loop {
        if event::poll(Duration::from_millis(5))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if key.code == KeyCode::Char('q') || key.code == KeyCode::Esc {
                        let _ = handles.commands.send(TerminalCommand::Shutdown);
                        return Ok(());
                    }
                    let snapshot = handles.snapshots.borrow().clone();
                    handle_key(key.code, &mut app, &snapshot, &handles);
                }
            }
        }

        while let Ok(event) = handles.events.try_recv() {
            app.on_event(event);
        }

        if last_draw.elapsed() >= draw_interval {
            let snapshot = handles.snapshots.borrow().clone();
            terminal.draw(|f| ui(f, &snapshot, &app))?;
            last_draw = std::time::Instant::now();
        }
    }
}

fn handle_key(code: KeyCode, app: &mut App, snapshot: &RenderSnapshot, handles: &TerminalHandles) {
    let pane = app.focused_pane(snapshot);
    let focused = snapshot.panes.iter().find(|view| view.id == pane);

    let command = match code {
        KeyCode::Char('1') => Some(TerminalCommand::SetLayout(1)),
        KeyCode::Char('2') => Some(TerminalCommand::SetLayout(2)),
        KeyCode::Char('4') => Some(TerminalCommand::SetLayout(4)),
        KeyCode::Tab => {
            if !snapshot.panes.is_empty() {
                app.focused = (app.focused + 1) % snapshot.panes.len();
            }
            None
        }
        KeyCode::Char('s') => focused.map(|view| {
            let index = SYMBOLS
                .iter()
                .position(|symbol| view.symbol == *symbol)
                .map(|index| (index + 1) % SYMBOLS.len())
                .unwrap_or(0);
            TerminalCommand::SetSymbol {
                pane,
                symbol: SYMBOLS[index].into(),
            }
        }),
        KeyCode::Char('t') => focused.map(|view| TerminalCommand::SetTimeframe {
            pane,
            timeframe: view.timeframe.next(),
        }),
        KeyCode::Char('o') => {
            let indicator = OVERLAY_CYCLE[app.overlay_cursor % OVERLAY_CYCLE.len()];
            app.overlay_cursor += 1;
            Some(TerminalCommand::AddOverlay {
                pane,
                indicator: indicator.into(),
                parameters: Default::default(),
            })
        }
        KeyCode::Char('x') => focused
            .and_then(|view| view.overlays.last())
            .map(|overlay| TerminalCommand::RemoveOverlay {
                pane,
                overlay: overlay.id,
            }),
        KeyCode::Char('v') => focused
            .and_then(|view| view.overlays.last())
            .map(|overlay| TerminalCommand::ToggleOverlay {
                pane,
                overlay: overlay.id,
            }),
        KeyCode::Char('a') | KeyCode::Char('b') => focused
            .and_then(|view| view.candles.last())
            .map(|last| {
                // Quick alert half a percent away from the last price
                let (condition, target_price) = if code == KeyCode::Char('a') {
                    (AlertCondition::Above, last.close * 1.005)
                } else {
                    (AlertCondition::Below, last.close * 0.995)
                };
                TerminalCommand::CreateAlert {
                    symbol: focused.map(|view| view.symbol.clone()).unwrap_or_default(),
                    condition,
                    target_price,
                }
            }),
        KeyCode::Char('r') => snapshot
            .alerts
            .iter()
            .find(|alert| alert.fired_at.is_some())
            .map(|alert| TerminalCommand::RearmAlert(alert.id)),
        KeyCode::Char('d') => snapshot
            .alerts
            .last()
            .map(|alert| TerminalCommand::DeleteAlert(alert.id)),
        KeyCode::Char('w') => Some(TerminalCommand::SaveTemplate(DEFAULT_TEMPLATE.to_string())),
        KeyCode::Char('l') => Some(TerminalCommand::ApplyTemplate(DEFAULT_TEMPLATE.to_string())),
        _ => None,
    };

    if let Some(command) = command {
        let _ = handles.commands.send(command);
    }
}

fn ui(f: &mut Frame, snapshot: &RenderSnapshot, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(10),
            Constraint::Length(8),
            Constraint::Length(1),
        ])
        .split(f.area());

    render_status_bar(f, chunks[0], snapshot, app);
    render_pane_grid(f, chunks[1], snapshot, app);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[2]);
    render_alerts(f, bottom[0], snapshot);
    render_notifications(f, bottom[1], app);

    render_footer(f, chunks[3]);
}

fn render_status_bar(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot, app: &App) {
    let connectivity_color = if snapshot.connectivity.is_connected() {
        C_UP
    } else {
        C_DOWN
    };

    let mut spans = vec![
        Span::styled(
            " TICKPANE ",
            Style::default().fg(C_HEADER).add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("[{}] ", snapshot.connectivity.label()),
            Style::default().fg(connectivity_color).add_modifier(Modifier::BOLD),
        ),
    ];
    if let Some(view) = snapshot.panes.get(app.focused) {
        spans.push(Span::styled(
            format!("{} {} ", view.symbol, view.timeframe),
            Style::default().fg(C_BRIGHT),
        ));
    }
    spans.push(Span::styled(
        format!(
            "| {} pane(s) | {} alert(s)",
            snapshot.panes.len(),
            snapshot.alerts.len()
        ),
        Style::default().fg(C_DIM),
    ));

    let bar = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(C_HEADER)),
    );
    f.render_widget(bar, area);
}

fn render_pane_grid(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot, app: &App) {
    let areas: Vec<Rect> = match snapshot.panes.len() {
        2 => Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(area)
            .to_vec(),
        4 => {
            let rows = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(area);
            let mut cells = Vec::with_capacity(4);
            for row in rows.iter() {
                let columns = Layout::default()
                    .direction(Direction::Horizontal)
                    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                    .split(*row);
                cells.extend(columns.iter().copied());
            }
            cells
        }
        _ => vec![area],
    };

    for (index, view) in snapshot.panes.iter().enumerate() {
        if let Some(cell) = areas.get(index) {
            render_pane(f, *cell, view, index == app.focused);
        }
    }
}

fn render_pane(f: &mut Frame, area: Rect, view: &PaneView, focused: bool) {
    let border_color = if focused { C_ACCENT } else { C_DIM };
    let mut title = format!(" {} {} ", view.symbol, view.timeframe);
    if view.recently_backfilled {
        title.push_str("• synced ");
    }
    let block = Block::default()
        .title(Span::styled(
            title,
            Style::default().fg(C_BRIGHT).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border_color));

    if view.candles.is_empty() {
        let waiting = Paragraph::new(Span::styled(
            "waiting for data...",
            Style::default().fg(C_DIM),
        ))
        .alignment(Alignment::Center)
        .block(block);
        f.render_widget(waiting, area);
        return;
    }

    let closes: Vec<(f64, f64)> = view
        .candles
        .iter()
        .map(|candle| (candle.open_time.timestamp() as f64, candle.close))
        .collect();
    let x_min = closes.first().map(|(x, _)| *x).unwrap_or(0.0);
    let mut x_max = closes.last().map(|(x, _)| *x).unwrap_or(1.0);
    if x_max <= x_min {
        x_max = x_min + 1.0;
    }

    let mut y_min = f64::MAX;
    let mut y_max = f64::MIN;
    for candle in &view.candles {
        y_min = y_min.min(candle.low);
        y_max = y_max.max(candle.high);
    }

    let overlay_lines: Vec<(String, Color, Vec<(f64, f64)>)> = view
        .overlays
        .iter()
        .filter(|overlay| overlay.visible)
        .map(|overlay| {
            let points: Vec<(f64, f64)> = overlay
                .points
                .iter()
                .map(|(time, value)| (time.timestamp() as f64, *value))
                .filter(|(x, _)| *x >= x_min && *x <= x_max)
                .collect();
            for (_, y) in &points {
                y_min = y_min.min(*y);
                y_max = y_max.max(*y);
            }
            (overlay.display_name.clone(), line_color(overlay.color), points)
        })
        .collect();

    let pad = ((y_max - y_min) * 0.05).max(y_max.abs() * 0.001).max(f64::EPSILON);
    let y_bounds = [y_min - pad, y_max + pad];

    let price_color = if view.candles.len() >= 2
        && view.candles[view.candles.len() - 1].close < view.candles[0].close
    {
        C_DOWN
    } else {
        C_UP
    };

    let mut datasets = vec![
        Dataset::default()
            .name(view.symbol.as_str())
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(price_color))
            .data(&closes),
    ];
    for (name, color, points) in &overlay_lines {
        datasets.push(
            Dataset::default()
                .name(name.as_str())
                .marker(Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(*color))
                .data(points),
        );
    }

    let time_label = |ts: f64| {
        DateTime::<Utc>::from_timestamp(ts as i64, 0)
            .map(|time| time.format("%H:%M").to_string())
            .unwrap_or_default()
    };
    let chart = Chart::new(datasets)
        .block(block)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(C_DIM))
                .bounds([x_min, x_max])
                .labels(vec![
                    Span::styled(time_label(x_min), Style::default().fg(C_DIM)),
                    Span::styled(time_label(x_max), Style::default().fg(C_DIM)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(C_DIM))
                .bounds(y_bounds)
                .labels(vec![
                    Span::styled(format!("{:.2}", y_bounds[0]), Style::default().fg(C_DIM)),
                    Span::styled(
                        format!("{:.2}", (y_bounds[0] + y_bounds[1]) / 2.0),
                        Style::default().fg(C_DIM),
                    ),
                    Span::styled(format!("{:.2}", y_bounds[1]), Style::default().fg(C_DIM)),
                ]),
        );
    f.render_widget(chart, area);
}

fn render_alerts(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot) {
    let items: Vec<ListItem> = snapshot
        .alerts
        .iter()
        .map(|alert| {
            let (status, color) = match (alert.active, alert.fired_at) {
                (_, Some(at)) => (format!("FIRED {}", at.format("%H:%M:%S")), C_DOWN),
                (true, None) => ("ARMED".to_string(), C_UP),
                (false, None) => ("OFF".to_string(), C_DIM),
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", alert.id), Style::default().fg(C_DIM)),
                Span::styled(
                    format!("{} {} {:.2} ", alert.symbol, alert.condition.label(), alert.target_price),
                    Style::default().fg(C_BRIGHT),
                ),
                Span::styled(status, Style::default().fg(color)),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .title(Span::styled(" Alerts ", Style::default().fg(C_ACCENT)))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(C_DIM)),
    );
    f.render_widget(list, area);
}

fn render_notifications(f: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .notifications
        .iter()
        .map(|(time, text)| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{} ", time.format("%H:%M:%S")),
                    Style::default().fg(C_DIM),
                ),
                Span::styled(text.clone(), Style::default().fg(C_BRIGHT)),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .title(Span::styled(" Notifications ", Style::default().fg(C_ACCENT)))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(C_DIM)),
    );
    f.render_widget(list, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let help = Paragraph::new(Span::styled(
        " q quit | 1/2/4 layout | Tab focus | s symbol | t timeframe | o overlay | v show/hide | x remove | a/b alert | r rearm | d delete | w save | l load",
        Style::default().fg(C_DIM),
    ));
    f.render_widget(help, area);
}

fn line_color(color: OverlayColor) -> Color {
    match color {
        OverlayColor::Yellow => Color::Yellow,
        OverlayColor::Cyan => Color::Cyan,
        OverlayColor::Magenta => Color::Magenta,
        OverlayColor::Green => Color::Green,
        OverlayColor::Blue => Color::Blue,
        OverlayColor::Red => Color::Red,
    }
}
