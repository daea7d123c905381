use std::io::{self, Stdout, Write, stdout};
use std::time::Duration;

use anyhow::Result;
use chrono::{FixedOffset, Utc};
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::{TableStyle, UiConfig};
use crate::error::Warning;
use crate::live::{ActiveWorkflowView, ActivityStatus, Renderer, SESSION_BUDGET, ViewModel};
use crate::metrics::Summary;
use crate::report::{Report, ReportRows};
use crate::util::{
    format_cost_flagged, format_model_name, format_rate, format_timestamp, format_tokens,
    human_duration, human_duration_ms, now_local, progress_bar, truncate,
};

const FOOTER_ROWS: u16 = 2;
const BANNER: &str = "SESSION USAGE MONITOR";
const MAX_FOOTER_WARNINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLayoutMode {
    Full,
    Compact,
    Minimal,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    pub width: u16,
    pub height: u16,
    pub footer_rows: u16,
}

impl FrameBudget {
    fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            footer_rows: FOOTER_ROWS.min(height),
        }
    }

    fn body_bottom(self) -> u16 {
        self.height.saturating_sub(self.footer_rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Plain,
    Heading,
    Dim,
    Good,
    Warn,
    Alert,
}

impl Tone {
    fn color(self) -> Option<Color> {
        match self {
            Self::Plain => None,
            Self::Heading => Some(Color::Cyan),
            Self::Dim => Some(Color::DarkGrey),
            Self::Good => Some(Color::Green),
            Self::Warn => Some(Color::Yellow),
            Self::Alert => Some(Color::Red),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    text: String,
    tone: Tone,
}

impl Line {
    fn plain(text: impl Into<String>) -> Self {
        Self::toned(text, Tone::Plain)
    }

    fn toned(text: impl Into<String>, tone: Tone) -> Self {
        Self {
            text: text.into(),
            tone,
        }
    }

    fn blank() -> Self {
        Self::plain("")
    }

    fn styled(&self, colors: bool, width: Option<usize>) -> String {
        let text = match width {
            Some(width) => truncate(&self.text, width),
            None => self.text.clone(),
        };
        match self.tone.color() {
            Some(color) if colors => {
                if self.tone == Tone::Heading {
                    text.with(color).bold().to_string()
                } else {
                    text.with(color).to_string()
                }
            }
            _ => text,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisplayOptions {
    pub table_style: TableStyle,
    pub colors: bool,
    pub progress_bars: bool,
    /// Local offset for printed timestamps; `None` uses the system zone.
    pub offset: Option<FixedOffset>,
}

impl DisplayOptions {
    pub fn from_config(ui: &UiConfig) -> Self {
        Self {
            table_style: ui.table_style,
            colors: ui.colors,
            progress_bars: ui.progress_bars,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: Option<FixedOffset>) -> Self {
        self.offset = offset;
        self
    }
}

pub fn enter_terminal() -> Result<()> {
    let mut out = stdout();
    terminal::enable_raw_mode()?;
    execute!(out, EnterAlternateScreen, Hide)?;
    Ok(())
}

pub fn leave_terminal() -> Result<()> {
    let mut out = stdout();
    execute!(out, Show, LeaveAlternateScreen)?;
    terminal::disable_raw_mode()?;
    Ok(())
}

/// Full-screen dashboard on the alternate screen. Quits on `q` or Ctrl+C.
pub struct TerminalRenderer {
    options: DisplayOptions,
    last_view: Option<ViewModel>,
}

impl TerminalRenderer {
    pub fn new(options: DisplayOptions) -> Self {
        Self {
            options,
            last_view: None,
        }
    }
}

impl Renderer for TerminalRenderer {
    fn render(&mut self, view: &ViewModel) -> Result<()> {
        draw(view, &self.options)?;
        self.last_view = Some(view.clone());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        if !event::poll(timeout)? {
            return Ok(false);
        }
        match event::read()? {
            Event::Key(key) if is_quit_key(&key) => Ok(true),
            Event::Resize(_, _) => {
                if let Some(view) = &self.last_view {
                    draw(view, &self.options)?;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

fn is_quit_key(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char('q')
        || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
}

/// Line-oriented renderer for pipes and logs. Prints only when the headline
/// numbers change.
pub struct HeadlessRenderer<W: Write = Stdout> {
    out: W,
    last_signature: String,
}

impl HeadlessRenderer<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> HeadlessRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_signature: String::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Renderer for HeadlessRenderer<W> {
    fn render(&mut self, view: &ViewModel) -> Result<()> {
        let signature = headless_signature(view);
        if signature == self.last_signature {
            return Ok(());
        }
        if view.stale {
            tracing::warn!("session directory unreadable; figures are from the last good refresh");
        }
        writeln!(self.out, "{}", headless_line(view))?;
        self.out.flush()?;
        self.last_signature = signature;
        Ok(())
    }
}

fn headless_signature(view: &ViewModel) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        view.session_count,
        view.workflow_count,
        view.totals.tokens.total(),
        view.totals.cost,
        view.active
            .as_ref()
            .map(|active| active.workflow.workflow_id.as_str())
            .unwrap_or(""),
        view.stale
    )
}

fn headless_line(view: &ViewModel) -> String {
    let mut line = format!(
        "[{}] sessions {} | workflows {} | tokens in {} out {} | cost {}",
        now_local(),
        view.session_count,
        view.workflow_count,
        format_tokens(view.totals.tokens_in()),
        format_tokens(view.totals.tokens_out()),
        format_cost_flagged(view.totals.cost, view.totals.is_estimated()),
    );
    if let Some(active) = &view.active {
        line.push_str(&format!(
            " | active {} ({})",
            truncate(&active.workflow.title, 32),
            active.activity.label()
        ));
    }
    if view.stale {
        line.push_str(" | STALE");
    }
    line
}

pub fn draw(view: &ViewModel, options: &DisplayOptions) -> Result<()> {
    let mut out = stdout();
    let (width, height) = terminal::size()?;
    if width == 0 || height == 0 {
        return Ok(());
    }

    let budget = FrameBudget::new(width, height);
    let max_body_row = budget.body_bottom();
    let layout = select_layout_mode(width, height);
    let w = width as usize;

    execute!(out, MoveTo(0, 0), Clear(ClearType::All))?;

    let mut row = 0u16;
    for line in dashboard_lines(view, w, layout, options) {
        if !write_line(&mut out, &mut row, max_body_row, w, &line, options.colors)? {
            break;
        }
    }
    render_footer(&mut out, w, height, options.colors)?;

    out.flush()?;
    Ok(())
}

fn dashboard_lines(
    view: &ViewModel,
    width: usize,
    layout: UiLayoutMode,
    options: &DisplayOptions,
) -> Vec<Line> {
    let mut lines = Vec::new();
    if !matches!(layout, UiLayoutMode::Minimal) {
        lines.push(Line::toned(center_line(BANNER, width), Tone::Heading));
        lines.push(Line::blank());
    }

    runtime_section(&mut lines, view, width, layout);
    lines.push(Line::blank());
    active_section(&mut lines, view, width, layout, options);
    lines.push(Line::blank());
    recent_section(&mut lines, view, width, layout, options);

    if !view.warnings.is_empty() {
        lines.push(Line::blank());
        lines.push(Line::toned(hr("Warnings", width), Tone::Heading));
        let shown = if matches!(layout, UiLayoutMode::Full) { 3 } else { 1 };
        for warning in view.warnings.iter().rev().take(shown) {
            lines.push(Line::toned(format!("! {warning}"), Tone::Warn));
        }
        if view.warnings.len() > shown {
            lines.push(Line::toned(
                format!("  ... {} more", view.warnings.len() - shown),
                Tone::Dim,
            ));
        }
    }
    lines
}

fn runtime_section(lines: &mut Vec<Line>, view: &ViewModel, width: usize, layout: UiLayoutMode) {
    lines.push(Line::toned(hr("Monitor", width), Tone::Heading));
    lines.push(Line::plain(kv_line("Now", &now_local())));
    if !matches!(layout, UiLayoutMode::Minimal) {
        let dir = view.messages_dir.display().to_string();
        lines.push(Line::plain(kv_line(
            "Directory",
            &truncate(&dir, width.saturating_sub(13)),
        )));
        lines.push(Line::plain(kv_line(
            "Refresh",
            &format!(
                "{}s | Sessions: {} | Workflows: {}",
                view.refresh_interval_secs, view.session_count, view.workflow_count
            ),
        )));
    }
    lines.push(Line::plain(kv_line(
        "Total",
        &format!(
            "in {} | out {} | cache {} | {}",
            format_tokens(view.totals.tokens_in()),
            format_tokens(view.totals.tokens_out()),
            format_tokens(view.totals.tokens_cache()),
            format_cost_flagged(view.totals.cost, view.totals.is_estimated())
        ),
    )));
    if view.stale {
        lines.push(Line::toned(
            kv_line("Status", "stale (last refresh failed)"),
            Tone::Alert,
        ));
    }
}

fn active_section(
    lines: &mut Vec<Line>,
    view: &ViewModel,
    width: usize,
    layout: UiLayoutMode,
    options: &DisplayOptions,
) {
    lines.push(Line::toned(hr("Active Workflow", width), Tone::Heading));
    let Some(active) = &view.active else {
        lines.push(Line::plain("No sessions with usage found yet."));
        return;
    };
    let stats = &active.workflow;

    lines.push(Line::plain(kv_line(
        "Workflow",
        &truncate(&stats.title, width.saturating_sub(13)),
    )));
    lines.push(Line::plain(kv_line("Project", &stats.project)));
    if !matches!(layout, UiLayoutMode::Minimal) {
        if stats.sub_agent_count > 0 {
            let kinds = stats
                .agent_kinds
                .iter()
                .map(|kind| kind.label())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(Line::plain(kv_line(
                "Agents",
                &format!("{} sub-agent(s): {kinds}", stats.sub_agent_count),
            )));
        }
        if active.session_id != stats.workflow_id {
            lines.push(Line::plain(kv_line(
                "Session",
                &truncate(&active.session_title, width.saturating_sub(13)),
            )));
        }
    }

    let idle = active
        .last_activity
        .and_then(|last| Utc::now().signed_duration_since(last).to_std().ok())
        .map(|idle| format!(" ({} ago)", human_duration(idle)))
        .unwrap_or_default();
    lines.push(Line::toned(
        kv_line("Activity", &format!("{}{idle}", active.activity.label())),
        activity_tone(active),
    ));

    if let Some(latest) = &active.latest {
        lines.push(Line::plain(kv_line(
            "Latest",
            &format!(
                "{} | in {} out {} | {}",
                format_model_name(&latest.model_id),
                format_tokens(latest.tokens.input),
                format_tokens(latest.tokens.output),
                format_cost_flagged(latest.cost, latest.estimated)
            ),
        )));
    }
    lines.push(Line::plain(kv_line(
        "Usage",
        &format!(
            "in {} | out {} | cache {} | {}",
            format_tokens(stats.summary.tokens_in()),
            format_tokens(stats.summary.tokens_out()),
            format_tokens(stats.summary.tokens_cache()),
            format_cost_flagged(stats.summary.cost, stats.summary.is_estimated())
        ),
    )));

    let bar_width = meter_bar_width(width);
    lines.push(meter_line(
        "Session",
        active.budget_fraction,
        &format!(
            "{} / {}",
            human_duration_ms(active.elapsed_ms),
            human_duration(SESSION_BUDGET)
        ),
        bar_width,
        options.progress_bars,
    ));
    if let Some(quota) = active.quota_fraction {
        lines.push(meter_line(
            "Quota",
            quota,
            "of model session quota",
            bar_width,
            options.progress_bars,
        ));
    }
    lines.push(meter_line(
        "Context",
        active.context_fraction,
        &format!(
            "{} / {}",
            format_tokens(active.context_used),
            format_tokens(active.context_window)
        ),
        bar_width,
        options.progress_bars,
    ));
    lines.push(Line::plain(kv_line(
        "Rate",
        &format!(
            "{} ({} out in last 5m)",
            format_rate(view.output_rate),
            format_tokens(view.window_output_tokens)
        ),
    )));
}

fn recent_section(
    lines: &mut Vec<Line>,
    view: &ViewModel,
    width: usize,
    layout: UiLayoutMode,
    options: &DisplayOptions,
) {
    lines.push(Line::toned(hr("Recent Workflows", width), Tone::Heading));
    if view.recent.is_empty() {
        lines.push(Line::plain("No workflows recorded."));
        return;
    }

    let limit = match layout {
        UiLayoutMode::Full => 8,
        UiLayoutMode::Compact => 5,
        UiLayoutMode::Minimal => 3,
    };
    for (idx, stats) in view.recent.iter().take(limit).enumerate() {
        let marker = if idx == 0 { ">" } else { "-" };
        lines.push(Line::plain(format!(
            "{marker} {} | {} | {} session(s) | {}",
            truncate(&stats.title, 32),
            truncate(&stats.project, 18),
            stats.session_count,
            format_cost_flagged(stats.summary.cost, stats.summary.is_estimated())
        )));
        if !matches!(layout, UiLayoutMode::Minimal) {
            lines.push(Line::toned(
                format!(
                    "  in {} | out {} | started {} | {}",
                    format_tokens(stats.summary.tokens_in()),
                    format_tokens(stats.summary.tokens_out()),
                    format_timestamp(stats.started_at, options.offset),
                    human_duration_ms(stats.duration_ms)
                ),
                Tone::Dim,
            ));
        }
    }
}

fn activity_tone(active: &ActiveWorkflowView) -> Tone {
    match active.activity {
        ActivityStatus::Active => Tone::Good,
        ActivityStatus::Recent => Tone::Plain,
        ActivityStatus::Idle => Tone::Warn,
        ActivityStatus::Inactive => Tone::Dim,
    }
}

fn meter_line(label: &str, fraction: f64, detail: &str, bar_width: usize, bars: bool) -> Line {
    let pct = fraction * 100.0;
    let text = if bars {
        format!(
            "{label:<11}: [{}] {pct:>3.0}% {detail}",
            progress_bar(fraction, bar_width)
        )
    } else {
        format!("{label:<11}: {pct:>3.0}% {detail}")
    };
    Line::toned(text, usage_tone(fraction))
}

fn usage_tone(fraction: f64) -> Tone {
    if fraction < 0.6 {
        Tone::Good
    } else if fraction < 0.85 {
        Tone::Warn
    } else {
        Tone::Alert
    }
}

fn meter_bar_width(width: usize) -> usize {
    if width >= 140 {
        30
    } else if width >= 112 {
        24
    } else if width >= 92 {
        18
    } else if width >= 72 {
        14
    } else {
        10
    }
}

fn render_footer(out: &mut impl Write, width: usize, height: u16, colors: bool) -> Result<()> {
    if height == 0 {
        return Ok(());
    }

    let hint = truncate("Press q or Ctrl+C to quit.", width);
    if height >= 2 {
        execute!(out, MoveTo(0, height - 2), Clear(ClearType::CurrentLine))?;
        let version = Line::toned(
            center_line(
                &format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                width,
            ),
            Tone::Dim,
        );
        write!(out, "{}", version.styled(colors, Some(width)))?;

        execute!(out, MoveTo(0, height - 1), Clear(ClearType::CurrentLine))?;
        write!(out, "{hint}")?;
        return Ok(());
    }

    execute!(out, MoveTo(0, 0), Clear(ClearType::CurrentLine))?;
    write!(out, "{hint}")?;
    Ok(())
}

fn write_line(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    line: &Line,
    colors: bool,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", line.styled(colors, Some(width)))?;
    *row += 1;
    Ok(true)
}

fn kv_line(label: &str, value: &str) -> String {
    format!("{label:<11}: {value}")
}

fn hr(title: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    let core = format!(" {title} ");
    if core.len() >= width {
        return truncate(title, width);
    }

    let side = (width - core.len()) / 2;
    let right = width - core.len() - side;
    format!("{}{}{}", "-".repeat(side), core, "-".repeat(right))
}

fn select_layout_mode(width: u16, height: u16) -> UiLayoutMode {
    if width >= 104 && height >= 28 {
        UiLayoutMode::Full
    } else if width >= 76 && height >= 18 {
        UiLayoutMode::Compact
    } else {
        UiLayoutMode::Minimal
    }
}

fn center_line(text: &str, width: usize) -> String {
    let clipped = truncate(text, width);
    let left_pad = width.saturating_sub(clipped.chars().count()) / 2;
    format!("{}{}", " ".repeat(left_pad), clipped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
}

struct Table {
    columns: Vec<(&'static str, Align)>,
    rows: Vec<Vec<String>>,
    total: Vec<String>,
}

impl Table {
    fn new(columns: Vec<(&'static str, Align)>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            total: Vec::new(),
        }
    }

    fn widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, (title, _))| {
                self.rows
                    .iter()
                    .chain(std::iter::once(&self.total))
                    .filter_map(|row| row.get(idx))
                    .map(|cell| cell.chars().count())
                    .chain(std::iter::once(title.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn render(&self, style: TableStyle) -> Vec<Line> {
        let widths = self.widths();
        let header: Vec<String> = self
            .columns
            .iter()
            .map(|(title, _)| (*title).to_string())
            .collect();

        let (left, sep, right) = match style {
            TableStyle::Rich => ("│ ", " │ ", " │"),
            TableStyle::Simple => ("", " | ", ""),
            TableStyle::Minimal => ("", "  ", ""),
        };
        let row_text = |cells: &[String]| -> String {
            let padded: Vec<String> = widths
                .iter()
                .enumerate()
                .map(|(idx, width)| {
                    let cell = cells.get(idx).map(String::as_str).unwrap_or("");
                    pad(cell, *width, self.columns[idx].1)
                })
                .collect();
            format!("{left}{}{right}", padded.join(sep))
        };
        let rule = |l: &str, m: &str, r: &str, fill: &str| -> String {
            let parts: Vec<String> = widths.iter().map(|width| fill.repeat(width + 2)).collect();
            format!("{l}{}{r}", parts.join(m))
        };

        let mut lines = Vec::new();
        match style {
            TableStyle::Rich => {
                lines.push(Line::toned(rule("┌", "┬", "┐", "─"), Tone::Dim));
                lines.push(Line::toned(row_text(&header), Tone::Heading));
                lines.push(Line::toned(rule("├", "┼", "┤", "─"), Tone::Dim));
                lines.extend(self.rows.iter().map(|row| Line::plain(row_text(row))));
                lines.push(Line::toned(rule("├", "┼", "┤", "─"), Tone::Dim));
                lines.push(Line::toned(row_text(&self.total), Tone::Heading));
                lines.push(Line::toned(rule("└", "┴", "┘", "─"), Tone::Dim));
            }
            TableStyle::Simple => {
                let dashes: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
                let divider = dashes.join("-+-");
                lines.push(Line::toned(row_text(&header), Tone::Heading));
                lines.push(Line::toned(divider.clone(), Tone::Dim));
                lines.extend(self.rows.iter().map(|row| Line::plain(row_text(row))));
                lines.push(Line::toned(divider, Tone::Dim));
                lines.push(Line::toned(row_text(&self.total), Tone::Heading));
            }
            TableStyle::Minimal => {
                lines.push(Line::toned(row_text(&header), Tone::Heading));
                lines.extend(self.rows.iter().map(|row| Line::plain(row_text(row))));
                lines.push(Line::toned(row_text(&self.total), Tone::Heading));
            }
        }
        lines
    }
}

fn pad(cell: &str, width: usize, align: Align) -> String {
    match align {
        Align::Left => format!("{cell:<width$}"),
        Align::Right => format!("{cell:>width$}"),
    }
}

fn usage_cells(summary: &Summary) -> Vec<String> {
    vec![
        format_tokens(summary.tokens_in()),
        format_tokens(summary.tokens_out()),
        format_tokens(summary.tokens_cache()),
        format_cost_flagged(summary.cost, summary.is_estimated()),
    ]
}

fn usage_columns() -> Vec<(&'static str, Align)> {
    vec![
        ("Input", Align::Right),
        ("Output", Align::Right),
        ("Cache", Align::Right),
        ("Cost", Align::Right),
    ]
}

fn share_cell(part: &Summary, total: &Summary) -> String {
    let fraction = if total.cost > Decimal::ZERO {
        (part.cost / total.cost).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };
    format!("{} {:>3.0}%", progress_bar(fraction, 10), fraction * 100.0)
}

fn join_models(models: &[String]) -> String {
    truncate(
        &models
            .iter()
            .map(|model| format_model_name(model))
            .collect::<Vec<_>>()
            .join(", "),
        40,
    )
}

fn report_table(report: &Report, options: &DisplayOptions) -> Table {
    let totals = &report.totals;
    let bars = options.progress_bars;
    let offset = options.offset;

    let mut table = match &report.rows {
        ReportRows::Sessions(rows) => {
            let mut table = Table::new(
                [
                    vec![
                        ("Started", Align::Left),
                        ("Session", Align::Left),
                        ("Agent", Align::Left),
                        ("Project", Align::Left),
                        ("Models", Align::Left),
                    ],
                    usage_columns(),
                    vec![("Duration", Align::Right)],
                ]
                .concat(),
            );
            for row in rows {
                let indent = if row.depth > 0 {
                    format!("{}- ", "  ".repeat(row.depth - 1))
                } else {
                    String::new()
                };
                table.rows.push(
                    [
                        vec![
                            format_timestamp(row.started_at, offset),
                            format!("{indent}{}", truncate(&row.title, 40)),
                            row.agent.map(|kind| kind.label()).unwrap_or("-").to_string(),
                            truncate(&row.project, 20),
                            join_models(&row.models),
                        ],
                        usage_cells(&row.summary),
                        vec![human_duration_ms(row.duration_ms)],
                    ]
                    .concat(),
                );
            }
            table.total = [
                vec![
                    "Total".to_string(),
                    format!("{} session(s)", rows.len()),
                    String::new(),
                    String::new(),
                    String::new(),
                ],
                usage_cells(totals),
                vec![String::new()],
            ]
            .concat();
            table
        }
        ReportRows::Workflows(rows) => {
            let mut table = Table::new(
                [
                    vec![
                        ("Started", Align::Left),
                        ("Workflow", Align::Left),
                        ("Project", Align::Left),
                        ("Sessions", Align::Right),
                        ("Agents", Align::Left),
                    ],
                    usage_columns(),
                    vec![("Duration", Align::Right)],
                ]
                .concat(),
            );
            for row in rows {
                let agents = row
                    .agent_kinds
                    .iter()
                    .map(|kind| kind.label())
                    .collect::<Vec<_>>()
                    .join(", ");
                table.rows.push(
                    [
                        vec![
                            format_timestamp(row.started_at, offset),
                            truncate(&row.title, 40),
                            truncate(&row.project, 20),
                            row.session_count.to_string(),
                            if agents.is_empty() { "-".to_string() } else { agents },
                        ],
                        usage_cells(&row.summary),
                        vec![human_duration_ms(row.duration_ms)],
                    ]
                    .concat(),
                );
            }
            let sessions: usize = rows.iter().map(|row| row.session_count).sum();
            table.total = [
                vec![
                    "Total".to_string(),
                    format!("{} workflow(s)", rows.len()),
                    String::new(),
                    sessions.to_string(),
                    String::new(),
                ],
                usage_cells(totals),
                vec![String::new()],
            ]
            .concat();
            table
        }
        ReportRows::Buckets(rows) => {
            let mut table = Table::new(
                [
                    vec![
                        ("Period", Align::Left),
                        ("Sessions", Align::Right),
                        ("Models", Align::Left),
                    ],
                    usage_columns(),
                ]
                .concat(),
            );
            for row in rows {
                table.rows.push(
                    [
                        vec![
                            row.bucket.label(),
                            row.session_count.to_string(),
                            join_models(&row.models),
                        ],
                        usage_cells(&row.summary),
                    ]
                    .concat(),
                );
            }
            let sessions: usize = rows.iter().map(|row| row.session_count).sum();
            table.total = [
                vec!["Total".to_string(), sessions.to_string(), String::new()],
                usage_cells(totals),
            ]
            .concat();
            table
        }
        ReportRows::Models(rows) => {
            let mut table = Table::new(
                [
                    vec![
                        ("Model", Align::Left),
                        ("Sessions", Align::Right),
                        ("Calls", Align::Right),
                    ],
                    usage_columns(),
                    vec![("Rate", Align::Right), ("Last used", Align::Left)],
                ]
                .concat(),
            );
            for row in rows {
                table.rows.push(
                    [
                        vec![
                            format_model_name(&row.model_id),
                            row.session_count.to_string(),
                            row.summary.interaction_count.to_string(),
                        ],
                        usage_cells(&row.summary),
                        vec![
                            format_rate(row.summary.processing_rate()),
                            format_timestamp(row.summary.last_at, offset),
                        ],
                    ]
                    .concat(),
                );
            }
            table.total = [
                vec![
                    "Total".to_string(),
                    String::new(),
                    totals.interaction_count.to_string(),
                ],
                usage_cells(totals),
                vec![format_rate(totals.processing_rate()), String::new()],
            ]
            .concat();
            table
        }
        ReportRows::Projects(rows) => {
            let mut table = Table::new(
                [
                    vec![
                        ("Project", Align::Left),
                        ("Sessions", Align::Right),
                        ("Models", Align::Left),
                    ],
                    usage_columns(),
                ]
                .concat(),
            );
            for row in rows {
                table.rows.push(
                    [
                        vec![
                            truncate(&row.project, 30),
                            row.session_count.to_string(),
                            join_models(&row.models),
                        ],
                        usage_cells(&row.summary),
                    ]
                    .concat(),
                );
            }
            let sessions: usize = rows.iter().map(|row| row.session_count).sum();
            table.total = [
                vec!["Total".to_string(), sessions.to_string(), String::new()],
                usage_cells(totals),
            ]
            .concat();
            table
        }
    };

    let shares: Option<Vec<&Summary>> = match &report.rows {
        ReportRows::Buckets(rows) => Some(rows.iter().map(|row| &row.summary).collect()),
        ReportRows::Models(rows) => Some(rows.iter().map(|row| &row.summary).collect()),
        ReportRows::Projects(rows) => Some(rows.iter().map(|row| &row.summary).collect()),
        _ => None,
    };
    if bars && let Some(shares) = shares {
        table.columns.push(("Share", Align::Left));
        for (row, summary) in table.rows.iter_mut().zip(shares) {
            row.push(share_cell(summary, totals));
        }
        table.total.push(String::new());
    }
    table
}

fn warning_lines(warnings: &[Warning]) -> Vec<Line> {
    if warnings.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![
        Line::blank(),
        Line::toned(format!("Warnings ({})", warnings.len()), Tone::Warn),
    ];
    lines.extend(
        warnings
            .iter()
            .take(MAX_FOOTER_WARNINGS)
            .map(|warning| Line::toned(format!("  - [{}] {warning}", warning.label()), Tone::Warn)),
    );
    if warnings.len() > MAX_FOOTER_WARNINGS {
        lines.push(Line::toned(
            format!("  ... {} more", warnings.len() - MAX_FOOTER_WARNINGS),
            Tone::Dim,
        ));
    }
    lines
}

fn report_lines(report: &Report, options: &DisplayOptions) -> Vec<Line> {
    let mut lines = vec![
        Line::toned(report.title.clone(), Tone::Heading),
        Line::toned(
            format!(
                "Generated {}",
                format_timestamp(Some(report.generated_at), options.offset)
            ),
            Tone::Dim,
        ),
        Line::blank(),
    ];
    lines.extend(report_table(report, options).render(options.table_style));
    if report.totals.is_estimated() {
        lines.push(Line::toned(
            "~ marks costs that include unpriced models.",
            Tone::Dim,
        ));
    }
    lines.extend(warning_lines(&report.warnings));
    lines
}

pub fn print_report(report: &Report, options: &DisplayOptions) -> Result<()> {
    let mut out = stdout().lock();
    for line in report_lines(report, options) {
        writeln!(out, "{}", line.styled(options.colors, None))?;
    }
    out.flush()?;
    Ok(())
}

pub fn print_no_data(warnings: &[Warning], options: &DisplayOptions) -> Result<()> {
    let mut out = stdout().lock();
    writeln!(out, "No usage data found for the selected range.")?;
    for line in warning_lines(warnings) {
        writeln!(out, "{}", line.styled(options.colors, None))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ModelStats, WorkflowStats};
    use crate::session::TokenUsage;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn summary(input: u64, output: u64, cost: i64) -> Summary {
        Summary {
            tokens: TokenUsage {
                input,
                output,
                ..TokenUsage::default()
            },
            cost: Decimal::new(cost, 2),
            interaction_count: 1,
            processing_ms: 2_000,
            ..Summary::default()
        }
    }

    fn options(style: TableStyle, bars: bool) -> DisplayOptions {
        DisplayOptions {
            table_style: style,
            colors: false,
            progress_bars: bars,
            offset: FixedOffset::east_opt(0),
        }
    }

    fn model_report() -> Report {
        let rows = vec![
            ModelStats {
                model_id: "claude-sonnet-4.5".to_string(),
                session_count: 2,
                summary: summary(1_000, 400, 300),
            },
            ModelStats {
                model_id: "gpt-5".to_string(),
                session_count: 1,
                summary: summary(500, 100, 100),
            },
        ];
        let totals = rows.iter().map(|row| &row.summary).sum();
        Report {
            title: "Model Usage".to_string(),
            rows: ReportRows::Models(rows),
            totals,
            warnings: vec![Warning::UnknownModel {
                model_id: "mystery".to_string(),
            }],
            generated_at: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .expect("valid time"),
        }
    }

    fn texts(lines: &[Line]) -> Vec<String> {
        lines.iter().map(|line| line.text.clone()).collect()
    }

    #[test]
    fn usage_tone_thresholds() {
        assert_eq!(usage_tone(0.2), Tone::Good);
        assert_eq!(usage_tone(0.7), Tone::Warn);
        assert_eq!(usage_tone(0.95), Tone::Alert);
    }

    fn busy_view() -> ViewModel {
        let recent = (0..10)
            .map(|idx| WorkflowStats {
                workflow_id: format!("wf{idx}"),
                title: format!("wf{idx}"),
                project: "demo".to_string(),
                session_count: 1,
                sub_agent_count: 0,
                agent_kinds: Vec::new(),
                started_at: None,
                duration_ms: 0,
                summary: summary(10, 5, 1),
            })
            .collect();
        let warnings = (0..5)
            .map(|idx| Warning::UnknownModel {
                model_id: format!("model-{idx}"),
            })
            .collect();
        ViewModel {
            messages_dir: PathBuf::from("/data/messages"),
            recent,
            warnings,
            ..ViewModel::default()
        }
    }

    #[test]
    fn smaller_layouts_shed_dashboard_rows() {
        let view = busy_view();
        let opts = options(TableStyle::Rich, true);
        let rows_for = |layout| texts(&dashboard_lines(&view, 100, layout, &opts));
        let full = rows_for(UiLayoutMode::Full);
        let compact = rows_for(UiLayoutMode::Compact);
        let minimal = rows_for(UiLayoutMode::Minimal);
        assert!(full.len() > compact.len());
        assert!(compact.len() > minimal.len());

        let workflows = |lines: &[String]| {
            lines
                .iter()
                .filter(|line| line.starts_with("> wf") || line.starts_with("- wf"))
                .count()
        };
        assert_eq!(workflows(&full), 8);
        assert_eq!(workflows(&compact), 5);
        assert_eq!(workflows(&minimal), 3);

        let shown_warnings = |lines: &[String]| lines.iter().filter(|line| line.starts_with("! ")).count();
        assert_eq!(shown_warnings(&full), 3);
        assert_eq!(shown_warnings(&minimal), 1);
        assert_eq!(full.last().map(String::as_str), Some("  ... 2 more"));

        assert!(full[0].contains(BANNER));
        assert!(!minimal.iter().any(|line| line.contains(BANNER)));
        assert!(!minimal.iter().any(|line| line.contains("/data/messages")));
    }

    #[test]
    fn dashboard_section_rules_span_the_terminal() {
        let view = busy_view();
        let lines = texts(&dashboard_lines(
            &view,
            90,
            select_layout_mode(90, 20),
            &options(TableStyle::Rich, false),
        ));
        let rules: Vec<&String> = lines.iter().filter(|line| line.starts_with("--")).collect();
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().all(|rule| rule.chars().count() == 90));
        assert!(rules[0].contains(" Monitor "));
        assert!(lines.iter().any(|line| line.starts_with("- wf4")));
        assert!(!lines.iter().any(|line| line.starts_with("- wf5")));
        assert!(FrameBudget::new(90, 20).body_bottom() < 20);
    }

    #[test]
    fn table_rows_share_one_width() {
        let report = model_report();
        let lines = texts(&report_table(&report, &options(TableStyle::Rich, false)).render(TableStyle::Rich));
        let widths: Vec<usize> = lines.iter().map(|line| line.chars().count()).collect();
        assert!(widths.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(lines[1].contains("Model"));
        assert!(lines.iter().any(|line| line.contains("Claude-Sonnet-4.5")));
        assert!(lines[lines.len() - 2].contains("Total"));
        assert!(lines[lines.len() - 2].contains("$4.00"));
    }

    #[test]
    fn minimal_style_has_no_borders() {
        let report = model_report();
        let lines = texts(&report_lines(&report, &options(TableStyle::Minimal, false)));
        assert!(lines.iter().all(|line| !line.contains('|') && !line.contains('│')));
        let simple = texts(&report_lines(&report, &options(TableStyle::Simple, false)));
        assert!(simple.iter().any(|line| line.contains("-+-")));
    }

    #[test]
    fn progress_bars_add_share_column() {
        let report = model_report();
        let with_bars = report_table(&report, &options(TableStyle::Simple, true));
        assert_eq!(with_bars.columns.last().map(|col| col.0), Some("Share"));
        assert_eq!(with_bars.rows[0].last().map(String::as_str), Some("########--  75%"));
        let without = report_table(&report, &options(TableStyle::Simple, false));
        assert_ne!(without.columns.last().map(|col| col.0), Some("Share"));
    }

    #[test]
    fn warnings_footer_lists_each_warning() {
        let report = model_report();
        let lines = texts(&report_lines(&report, &options(TableStyle::Simple, false)));
        assert!(lines.iter().any(|line| line == "Warnings (1)"));
        assert!(lines.iter().any(|line| line.contains("mystery")));

        let many: Vec<Warning> = (0..12)
            .map(|idx| Warning::UnknownModel {
                model_id: format!("m{idx}"),
            })
            .collect();
        let footer = texts(&warning_lines(&many));
        assert_eq!(footer.last().map(String::as_str), Some("  ... 2 more"));
    }

    #[test]
    fn dashboard_without_active_workflow_says_so() {
        let view = ViewModel {
            messages_dir: PathBuf::from("/data/messages"),
            refresh_interval_secs: 5,
            ..ViewModel::default()
        };
        let lines = texts(&dashboard_lines(
            &view,
            100,
            UiLayoutMode::Compact,
            &options(TableStyle::Rich, true),
        ));
        assert!(lines.iter().any(|line| line == "No sessions with usage found yet."));
        assert!(lines.iter().any(|line| line.contains("/data/messages")));
    }

    #[test]
    fn dashboard_shows_meters_for_active_workflow() {
        let workflow = WorkflowStats {
            workflow_id: "root".to_string(),
            title: "Refactor parser".to_string(),
            project: "demo".to_string(),
            session_count: 1,
            sub_agent_count: 0,
            agent_kinds: Vec::new(),
            started_at: None,
            duration_ms: 0,
            summary: summary(100, 50, 25),
        };
        let view = ViewModel {
            active: Some(ActiveWorkflowView {
                workflow: workflow.clone(),
                session_id: "root".to_string(),
                session_title: "Refactor parser".to_string(),
                latest: None,
                last_activity: None,
                activity: ActivityStatus::Inactive,
                elapsed_ms: 9_000_000,
                budget_fraction: 0.5,
                quota_fraction: Some(0.9),
                context_used: 50_000,
                context_window: 200_000,
                context_fraction: 0.25,
            }),
            recent: vec![workflow],
            stale: true,
            ..ViewModel::default()
        };
        let lines = dashboard_lines(&view, 120, UiLayoutMode::Full, &options(TableStyle::Rich, true));
        let session = lines
            .iter()
            .find(|line| line.text.starts_with("Session"))
            .expect("session meter");
        assert!(session.text.contains("[############------------]  50% 2h 30m / 5h 0m"));
        let quota = lines
            .iter()
            .find(|line| line.text.starts_with("Quota"))
            .expect("quota meter");
        assert_eq!(quota.tone, Tone::Alert);
        assert!(lines.iter().any(|line| line.text.contains("stale")));
        assert!(lines.iter().any(|line| line.text.starts_with("> Refactor parser")));
    }

    #[test]
    fn headless_prints_only_on_change() {
        let mut renderer = HeadlessRenderer::new(Vec::new());
        let mut view = ViewModel::default();
        renderer.render(&view).expect("render");
        renderer.render(&view).expect("render");
        view.session_count = 3;
        renderer.render(&view).expect("render");
        let output = String::from_utf8(renderer.into_inner()).expect("utf8");
        assert_eq!(output.lines().count(), 2);
        assert!(output.contains("sessions 3"));
    }
}
