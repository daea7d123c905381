use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::config::LiveSettings;
use crate::cost::compute_total_cost;
use crate::error::{Result, Warning};
use crate::metrics::{Aggregator, MetricsTracker, Summary, WorkflowStats};
use crate::session::{
    Interaction, RefreshOutcome, Session, SessionParseCache, TokenUsage, validate_messages_dir,
};
use crate::workflow::{GroupingOptions, Workflow, group_sessions};

pub const SESSION_BUDGET: Duration = Duration::from_secs(5 * 60 * 60);
pub const RATE_WINDOW: Duration = Duration::from_secs(5 * 60);
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LoopState {
    Init,
    Polling,
    Render,
    ErrorBackoff { consecutive_failures: u32 },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    Recent,
    Idle,
    #[default]
    Inactive,
}

impl ActivityStatus {
    pub fn from_idle(idle: Duration) -> Self {
        match idle.as_secs() {
            0..60 => Self::Active,
            60..300 => Self::Recent,
            300..1800 => Self::Idle,
            _ => Self::Inactive,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Recent => "recent",
            Self::Idle => "idle",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    completed_at: DateTime<Utc>,
    output: u64,
    processing_ms: u64,
}

/// Trailing window of output-token events keyed by (source file, interaction),
/// so re-reading an interaction replaces its entry rather than adding to it.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: TimeDelta,
    entries: BTreeMap<(PathBuf, String), WindowEntry>,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

impl RollingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span: TimeDelta::from_std(span).unwrap_or(TimeDelta::zero()),
            entries: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, source: &Path, interaction: &Interaction, now: DateTime<Utc>) {
        let key = (source.to_path_buf(), interaction.id.clone());
        let Some(completed_at) = interaction.end_timestamp() else {
            self.entries.remove(&key);
            return;
        };
        if interaction.tokens.output == 0 || completed_at < now - self.span {
            self.entries.remove(&key);
            return;
        }
        self.entries.insert(
            key,
            WindowEntry {
                completed_at,
                output: interaction.tokens.output,
                processing_ms: interaction.processing_ms(),
            },
        );
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.span;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.completed_at >= cutoff);
        before - self.entries.len()
    }

    /// Drops every entry read from `source`.
    pub fn forget_file(&mut self, source: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(file, _), _| file != source);
        before - self.entries.len()
    }

    pub fn output_tokens(&self) -> u64 {
        self.entries.values().map(|entry| entry.output).sum()
    }

    /// Output tokens per second of processing time inside the window.
    pub fn rate(&self) -> f64 {
        let processing_ms: u64 = self.entries.values().map(|entry| entry.processing_ms).sum();
        if processing_ms == 0 {
            return 0.0;
        }
        self.output_tokens() as f64 / (processing_ms as f64 / 1000.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestInteractionView {
    pub model_id: String,
    pub tokens: TokenUsage,
    pub cost: Decimal,
    pub estimated: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveWorkflowView {
    pub workflow: WorkflowStats,
    pub session_id: String,
    pub session_title: String,
    pub latest: Option<LatestInteractionView>,
    pub last_activity: Option<DateTime<Utc>>,
    pub activity: ActivityStatus,
    pub elapsed_ms: u64,
    /// Elapsed time against the fixed five-hour session budget.
    pub budget_fraction: f64,
    pub quota_fraction: Option<f64>,
    pub context_used: u64,
    pub context_window: u64,
    pub context_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ViewModel {
    pub generated_at: Option<DateTime<Utc>>,
    pub messages_dir: PathBuf,
    pub refresh_interval_secs: u64,
    pub active: Option<ActiveWorkflowView>,
    pub recent: Vec<WorkflowStats>,
    pub totals: Summary,
    pub session_count: usize,
    pub workflow_count: usize,
    pub output_rate: f64,
    pub window_output_tokens: u64,
    pub stale: bool,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Refreshed,
    Unchanged,
    Failed { consecutive_failures: u32 },
    NotReady,
}

/// Receives each refreshed view. `wait` is the only place the loop sleeps.
pub trait Renderer {
    fn render(&mut self, view: &ViewModel) -> anyhow::Result<()>;

    /// Blocks for at most `timeout`; returns true when the user asked to stop.
    fn wait(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        thread::sleep(timeout);
        Ok(false)
    }
}

pub struct LiveMonitor<'a> {
    settings: LiveSettings,
    aggregator: Aggregator<'a>,
    cache: SessionParseCache,
    tracker: MetricsTracker,
    window: RollingWindow,
    state: LoopState,
    view: ViewModel,
    consecutive_failures: u32,
}

impl<'a> LiveMonitor<'a> {
    pub fn new(settings: LiveSettings, aggregator: Aggregator<'a>) -> Self {
        let view = ViewModel {
            messages_dir: settings.messages_dir.clone(),
            refresh_interval_secs: settings.refresh_interval.as_secs(),
            ..ViewModel::default()
        };
        Self {
            settings,
            aggregator,
            cache: SessionParseCache::default(),
            tracker: MetricsTracker::new(),
            window: RollingWindow::default(),
            state: LoopState::Init,
            view,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn view(&self) -> &ViewModel {
        &self.view
    }

    /// Validates the messages directory. Failure stops the loop for good.
    pub fn init(&mut self) -> Result<()> {
        match validate_messages_dir(&self.settings.messages_dir) {
            Ok(()) => {
                self.state = LoopState::Polling;
                Ok(())
            }
            Err(err) => {
                self.state = LoopState::Stopped;
                Err(err)
            }
        }
    }

    pub fn stop(&mut self) {
        self.state = LoopState::Stopped;
    }

    /// One poll: re-read appended data, then either rebuild the view or, when
    /// nothing changed on disk, refresh only its clock-derived fields. Only an
    /// unreadable directory counts as a failure; a file that cannot be read
    /// keeps its last parse and shows up as a warning.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if matches!(self.state, LoopState::Init | LoopState::Stopped) {
            return TickOutcome::NotReady;
        }
        self.state = LoopState::Polling;

        match self.cache.refresh(&self.settings.messages_dir) {
            Ok(refresh) => self.apply_refresh(refresh, now),
            Err(err) => self.record_failure(err.to_string(), now),
        }
    }

    fn apply_refresh(&mut self, refresh: RefreshOutcome, now: DateTime<Utc>) -> TickOutcome {
        for path in refresh.removed_files.iter().chain(&refresh.reset_files) {
            self.window.forget_file(path);
        }
        for (path, interaction) in &refresh.new_interactions {
            self.window.observe(path, interaction, now);
        }
        self.window.evict(now);

        let changed = refresh.changed();
        if changed {
            self.tracker.remove(&refresh.removed_files);
            let changed_files: HashSet<&PathBuf> = refresh.changed_files.iter().collect();
            let sessions = self.cache.sessions();
            self.tracker.update(
                &self.aggregator,
                sessions
                    .iter()
                    .filter(|session| changed_files.contains(&session.source_file)),
            );
            self.rebuild_view(sessions, now);
        } else {
            self.refresh_clock(now);
        }

        self.view.warnings.retain(|warning| {
            !matches!(
                warning,
                Warning::PersistentFailure { .. } | Warning::TransientReadError { .. }
            )
        });
        self.view.warnings.extend(refresh.read_errors);

        if self.consecutive_failures > 0 {
            tracing::info!(
                failures = self.consecutive_failures,
                "session directory readable again"
            );
        }
        self.consecutive_failures = 0;
        self.view.stale = false;
        self.state = LoopState::Render;
        if changed {
            TickOutcome::Refreshed
        } else {
            TickOutcome::Unchanged
        }
    }

    /// Drives ticks until `stop` is raised or the renderer asks to quit.
    /// Cancellation is only observed between ticks.
    pub fn run<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        stop: &AtomicBool,
    ) -> anyhow::Result<()> {
        if self.state == LoopState::Init {
            self.init()?;
        }

        while !stop.load(Ordering::Relaxed) && self.state != LoopState::Stopped {
            self.tick(Utc::now());
            renderer.render(&self.view)?;

            let deadline = Instant::now() + self.settings.refresh_interval;
            let mut quit = false;
            loop {
                let now = Instant::now();
                if now >= deadline || stop.load(Ordering::Relaxed) {
                    break;
                }
                if renderer.wait(WAIT_SLICE.min(deadline - now))? {
                    quit = true;
                    break;
                }
            }
            if quit {
                break;
            }
        }

        self.state = LoopState::Stopped;
        Ok(())
    }

    fn record_failure(&mut self, reason: String, now: DateTime<Utc>) -> TickOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;
        tracing::warn!(failures, reason = %reason, "live refresh failed; keeping previous view");

        self.refresh_clock(now);
        self.view.stale = true;
        if failures >= self.settings.failure_threshold {
            if failures == self.settings.failure_threshold {
                tracing::warn!(failures, "refresh failures passed threshold");
            }
            self.view
                .warnings
                .retain(|warning| !matches!(warning, Warning::PersistentFailure { .. }));
            self.view.warnings.push(Warning::PersistentFailure {
                consecutive_failures: failures,
                reason,
            });
        }
        self.state = LoopState::ErrorBackoff {
            consecutive_failures: failures,
        };
        TickOutcome::Failed {
            consecutive_failures: failures,
        }
    }

    fn rebuild_view(&mut self, sessions: Vec<Session>, now: DateTime<Utc>) {
        let session_count = sessions.len();
        let mut warnings = self.cache.warnings();
        warnings.extend(self.aggregator.unknown_models(&sessions));

        let options = GroupingOptions::new(
            self.settings.group_workflows,
            self.settings.infer_agent_parents,
        );
        let grouped = group_sessions(sessions, options);
        warnings.extend(grouped.warnings);

        let mut workflows: Vec<&Workflow> = grouped.workflows.iter().collect();
        workflows.sort_by(|a, b| {
            (b.end_time(), b.id()).cmp(&(a.end_time(), a.id()))
        });

        let active = workflows
            .first()
            .map(|workflow| self.active_view(workflow, now));
        let recent = workflows
            .iter()
            .take(self.settings.recent_limit)
            .map(|workflow| self.aggregator.workflow(workflow))
            .collect();

        self.view = ViewModel {
            generated_at: Some(now),
            messages_dir: self.settings.messages_dir.clone(),
            refresh_interval_secs: self.settings.refresh_interval.as_secs(),
            active,
            recent,
            totals: self.tracker.totals().clone(),
            session_count,
            workflow_count: grouped.workflows.len(),
            output_rate: self.window.rate(),
            window_output_tokens: self.window.output_tokens(),
            stale: self.view.stale,
            warnings,
        };
    }

    fn active_view(&self, workflow: &Workflow, now: DateTime<Utc>) -> ActiveWorkflowView {
        let stats = self.aggregator.workflow(workflow);
        let current = workflow
            .sessions()
            .max_by_key(|session| (session.end_time(), session.session_id.clone()))
            .unwrap_or(&workflow.root.session);

        let latest_interaction = workflow
            .sessions()
            .filter_map(Session::latest_interaction)
            .max_by_key(|interaction| interaction.end_timestamp());

        let pricing = self.aggregator.pricing();
        let (latest, context_used, context_window, quota) = match latest_interaction {
            Some(interaction) => {
                let computed =
                    compute_total_cost(&interaction.model_id, &interaction.tokens, pricing);
                let context_used = interaction
                    .tokens
                    .input
                    .saturating_add(interaction.tokens.cache());
                let view = LatestInteractionView {
                    model_id: interaction.model_id.clone(),
                    tokens: interaction.tokens,
                    cost: computed.total_cost,
                    estimated: computed.source.is_estimated(),
                    completed_at: interaction.end_timestamp(),
                };
                (
                    Some(view),
                    context_used,
                    computed.pricing.context_window,
                    computed.pricing.session_quota,
                )
            }
            None => (None, 0, crate::cost::DEFAULT_CONTEXT_WINDOW, None),
        };

        let quota_fraction = quota
            .filter(|quota| *quota > Decimal::ZERO)
            .and_then(|quota| (stats.summary.cost / quota).to_f64())
            .map(clamp_fraction);
        let context_fraction = if context_window == 0 {
            0.0
        } else {
            clamp_fraction(context_used as f64 / context_window as f64)
        };

        let mut view = ActiveWorkflowView {
            session_id: current.session_id.clone(),
            session_title: current.display_title(),
            last_activity: workflow.end_time(),
            latest,
            activity: ActivityStatus::Inactive,
            elapsed_ms: 0,
            budget_fraction: 0.0,
            quota_fraction,
            context_used,
            context_window,
            context_fraction,
            workflow: stats,
        };
        update_clock_fields(&mut view, now);
        view
    }

    fn refresh_clock(&mut self, now: DateTime<Utc>) {
        if let Some(active) = self.view.active.as_mut() {
            update_clock_fields(active, now);
        }
        self.view.output_rate = self.window.rate();
        self.view.window_output_tokens = self.window.output_tokens();
        self.view.generated_at = Some(now);
    }
}

fn update_clock_fields(view: &mut ActiveWorkflowView, now: DateTime<Utc>) {
    let elapsed = view
        .workflow
        .started_at
        .map(|start| now.signed_duration_since(start))
        .and_then(|delta| delta.to_std().ok())
        .unwrap_or_default();
    view.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    view.budget_fraction = clamp_fraction(elapsed.as_secs_f64() / SESSION_BUDGET.as_secs_f64());

    let idle = view
        .last_activity
        .map(|last| now.signed_duration_since(last))
        .and_then(|delta| delta.to_std().ok());
    view.activity = match (view.last_activity, idle) {
        (None, _) => ActivityStatus::Inactive,
        (Some(_), Some(idle)) => ActivityStatus::from_idle(idle),
        (Some(_), None) => ActivityStatus::Active,
    };
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
