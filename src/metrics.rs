use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cost::{PricingTable, compute_total_cost};
use crate::error::Warning;
use crate::session::{Interaction, Session, TokenUsage};
use crate::timeframe::{Period, TimeBucket, WeekStart};
use crate::workflow::{AgentKind, Workflow};

/// Totals for any collection of interactions. Combining two summaries is
/// associative and commutative, so partial sums can be merged in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub tokens: TokenUsage,
    pub cost: Decimal,
    /// Portion of `cost` priced by the fallback policy.
    pub estimated_cost: Decimal,
    pub interaction_count: u64,
    pub estimated_interactions: u64,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
    pub processing_ms: u64,
}

impl Summary {
    pub fn tokens_in(&self) -> u64 {
        self.tokens.input
    }

    pub fn tokens_out(&self) -> u64 {
        self.tokens.output
    }

    pub fn tokens_cache(&self) -> u64 {
        self.tokens.cache()
    }

    pub fn is_empty(&self) -> bool {
        self.interaction_count == 0
    }

    pub fn is_estimated(&self) -> bool {
        self.estimated_interactions > 0
    }

    pub fn elapsed_ms(&self) -> u64 {
        match (self.first_at, self.last_at) {
            (Some(first), Some(last)) => {
                u64::try_from(last.signed_duration_since(first).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Output tokens over the wall-clock span of the collection. Zero for an
    /// empty or zero-length span.
    pub fn output_tokens_per_second(&self) -> f64 {
        rate(self.tokens.output, self.elapsed_ms(), self.interaction_count)
    }

    /// Output tokens over the summed request processing time.
    pub fn processing_rate(&self) -> f64 {
        rate(self.tokens.output, self.processing_ms, self.interaction_count)
    }

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            tokens: self.tokens + other.tokens,
            cost: self.cost + other.cost,
            estimated_cost: self.estimated_cost + other.estimated_cost,
            interaction_count: self.interaction_count + other.interaction_count,
            estimated_interactions: self.estimated_interactions + other.estimated_interactions,
            first_at: earliest(self.first_at, other.first_at),
            last_at: latest(self.last_at, other.last_at),
            processing_ms: self.processing_ms.saturating_add(other.processing_ms),
        }
    }
}

impl Add for Summary {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.merge(&rhs)
    }
}

impl AddAssign for Summary {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.merge(&rhs);
    }
}

impl AddAssign<&Summary> for Summary {
    fn add_assign(&mut self, rhs: &Summary) {
        *self = self.merge(rhs);
    }
}

impl Sum for Summary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, item| acc + item)
    }
}

impl<'a> Sum<&'a Summary> for Summary {
    fn sum<I: Iterator<Item = &'a Summary>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, item| acc.merge(item))
    }
}

fn rate(output: u64, span_ms: u64, count: u64) -> f64 {
    if count == 0 || span_ms == 0 {
        return 0.0;
    }
    output as f64 / (span_ms as f64 / 1000.0)
}

fn earliest(left: Option<DateTime<Utc>>, right: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(left: Option<DateTime<Utc>>, right: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub workflow_id: String,
    pub title: String,
    pub project: String,
    pub agent: Option<AgentKind>,
    pub depth: usize,
    pub models: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStats {
    pub workflow_id: String,
    pub title: String,
    pub project: String,
    pub session_count: usize,
    pub sub_agent_count: usize,
    pub agent_kinds: Vec<AgentKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub model_id: String,
    pub session_count: usize,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub project: String,
    pub project_path: Option<PathBuf>,
    pub session_count: usize,
    pub models: Vec<String>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub bucket: TimeBucket,
    pub session_count: usize,
    pub models: Vec<String>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketModelStats {
    pub bucket: TimeBucket,
    pub model_id: String,
    pub session_count: usize,
    pub summary: Summary,
}

/// Reduces sessions into summaries. Holds the pricing context and the
/// calendar settings used for bucketing; `offset: None` means the host's
/// local time zone.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator<'a> {
    pricing: &'a PricingTable,
    week_start: WeekStart,
    offset: Option<FixedOffset>,
}

impl<'a> Aggregator<'a> {
    pub fn new(pricing: &'a PricingTable, week_start: WeekStart) -> Self {
        Self {
            pricing,
            week_start,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn pricing(&self) -> &'a PricingTable {
        self.pricing
    }

    pub fn week_start(&self) -> WeekStart {
        self.week_start
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self.offset {
            Some(offset) => ts.with_timezone(&offset).date_naive(),
            None => ts.with_timezone(&Local).date_naive(),
        }
    }

    pub fn bucket_for(&self, session: &Session, period: Period) -> Option<TimeBucket> {
        let start = session.anchor_time()?;
        Some(TimeBucket::containing(
            self.local_date(start),
            period,
            self.week_start,
        ))
    }

    /// Interactions without any tokens contribute nothing.
    pub fn interaction(&self, interaction: &Interaction) -> Summary {
        if !interaction.has_usage() {
            return Summary::default();
        }
        let computed = compute_total_cost(&interaction.model_id, &interaction.tokens, self.pricing);
        let estimated = computed.source.is_estimated();
        Summary {
            tokens: interaction.tokens,
            cost: computed.total_cost,
            estimated_cost: if estimated {
                computed.total_cost
            } else {
                Decimal::ZERO
            },
            interaction_count: 1,
            estimated_interactions: u64::from(estimated),
            first_at: interaction.timestamp(),
            last_at: interaction.end_timestamp(),
            processing_ms: interaction.processing_ms(),
        }
    }

    pub fn session(&self, session: &Session) -> Summary {
        session
            .interactions
            .iter()
            .map(|interaction| self.interaction(interaction))
            .sum()
    }

    pub fn summarize<'s>(&self, sessions: impl IntoIterator<Item = &'s Session>) -> Summary {
        sessions
            .into_iter()
            .map(|session| self.session(session))
            .sum()
    }

    pub fn workflow(&self, workflow: &Workflow) -> WorkflowStats {
        let summary = self.summarize(workflow.sessions());
        let started_at = workflow.start_time();
        let duration_ms = match (started_at, workflow.end_time()) {
            (Some(start), Some(end)) => {
                u64::try_from(end.signed_duration_since(start).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        };
        WorkflowStats {
            workflow_id: workflow.id().to_string(),
            title: workflow.display_title(),
            project: workflow.project_name().to_string(),
            session_count: workflow.size(),
            sub_agent_count: workflow.sub_agent_count(),
            agent_kinds: workflow.agent_kinds(),
            started_at,
            duration_ms,
            summary,
        }
    }

    pub fn by_workflow(&self, workflows: &[Workflow]) -> Vec<WorkflowStats> {
        workflows
            .iter()
            .map(|workflow| self.workflow(workflow))
            .collect()
    }

    pub fn by_session(&self, workflows: &[Workflow]) -> Vec<SessionStats> {
        workflows
            .iter()
            .flat_map(|workflow| {
                workflow.members().map(move |member| SessionStats {
                    session_id: member.session.session_id.clone(),
                    workflow_id: workflow.id().to_string(),
                    title: member.session.display_title(),
                    project: member.session.project_name.clone(),
                    agent: member.agent,
                    depth: member.depth,
                    models: member.session.models_used(),
                    started_at: member.session.start_time(),
                    duration_ms: member.session.duration_ms(),
                    summary: self.session(&member.session),
                })
            })
            .collect()
    }

    /// Splits every session by the model used per interaction.
    pub fn by_model<'s>(&self, sessions: impl IntoIterator<Item = &'s Session>) -> Vec<ModelStats> {
        let mut models: BTreeMap<&str, (Summary, HashSet<&Path>)> = BTreeMap::new();
        for session in sessions {
            for interaction in session.interactions.iter().filter(|i| i.has_usage()) {
                let entry = models.entry(interaction.model_id.as_str()).or_default();
                entry.0 += self.interaction(interaction);
                entry.1.insert(session.source_file.as_path());
            }
        }

        let mut rows: Vec<ModelStats> = models
            .into_iter()
            .map(|(model_id, (summary, sessions))| ModelStats {
                model_id: model_id.to_string(),
                session_count: sessions.len(),
                summary,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.summary
                .cost
                .cmp(&a.summary.cost)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        rows
    }

    pub fn by_project<'s>(
        &self,
        sessions: impl IntoIterator<Item = &'s Session>,
    ) -> Vec<ProjectStats> {
        let mut projects: BTreeMap<&str, ProjectStats> = BTreeMap::new();
        for session in sessions {
            let entry = projects
                .entry(session.project_name.as_str())
                .or_insert_with(|| ProjectStats {
                    project: session.project_name.clone(),
                    project_path: session.project_path.clone(),
                    session_count: 0,
                    models: Vec::new(),
                    summary: Summary::default(),
                });
            entry.session_count += 1;
            entry.models.extend(session.models_used());
            entry.summary += self.session(session);
        }

        let mut rows: Vec<ProjectStats> = projects
            .into_values()
            .map(|mut row| {
                row.models.sort();
                row.models.dedup();
                row
            })
            .collect();
        rows.sort_by(|a, b| {
            b.summary
                .cost
                .cmp(&a.summary.cost)
                .then_with(|| a.project.cmp(&b.project))
        });
        rows
    }

    /// Buckets sessions by their local start date, or by the file's
    /// modification date when no record is timestamped.
    pub fn by_bucket<'s>(
        &self,
        sessions: impl IntoIterator<Item = &'s Session>,
        period: Period,
    ) -> Vec<BucketStats> {
        let mut buckets: BTreeMap<TimeBucket, (Summary, usize, BTreeSet<String>)> =
            BTreeMap::new();
        for session in sessions {
            let Some(bucket) = self.bucket_for(session, period) else {
                tracing::debug!(session = %session.session_id, "session has no timestamp or mtime; not bucketed");
                continue;
            };
            let entry = buckets.entry(bucket).or_default();
            entry.0 += self.session(session);
            entry.1 += 1;
            entry.2.extend(session.models_used());
        }

        buckets
            .into_iter()
            .map(|(bucket, (summary, session_count, models))| BucketStats {
                bucket,
                session_count,
                models: models.into_iter().collect(),
                summary,
            })
            .collect()
    }

    pub fn by_bucket_and_model<'s>(
        &self,
        sessions: impl IntoIterator<Item = &'s Session>,
        period: Period,
    ) -> Vec<BucketModelStats> {
        let mut cells: BTreeMap<(TimeBucket, &str), (Summary, HashSet<&Path>)> = BTreeMap::new();
        for session in sessions {
            let Some(bucket) = self.bucket_for(session, period) else {
                continue;
            };
            for interaction in session.interactions.iter().filter(|i| i.has_usage()) {
                let entry = cells
                    .entry((bucket, interaction.model_id.as_str()))
                    .or_default();
                entry.0 += self.interaction(interaction);
                entry.1.insert(session.source_file.as_path());
            }
        }

        cells
            .into_iter()
            .map(|((bucket, model_id), (summary, sessions))| BucketModelStats {
                bucket,
                model_id: model_id.to_string(),
                session_count: sessions.len(),
                summary,
            })
            .collect()
    }

    /// One warning per distinct model id priced by the fallback policy.
    pub fn unknown_models<'s>(&self, sessions: impl IntoIterator<Item = &'s Session>) -> Vec<Warning> {
        let mut unknown: BTreeSet<&str> = BTreeSet::new();
        for session in sessions {
            for interaction in session.interactions.iter().filter(|i| i.has_usage()) {
                if self
                    .pricing
                    .resolve(&interaction.model_id)
                    .source
                    .is_estimated()
                {
                    unknown.insert(interaction.model_id.as_str());
                }
            }
        }
        unknown
            .into_iter()
            .map(|model_id| Warning::UnknownModel {
                model_id: model_id.to_string(),
            })
            .collect()
    }
}

/// Running per-file session summaries for the live loop. Changed files
/// replace their previous record instead of adding to it.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    sessions: HashMap<PathBuf, Summary>,
    totals: Summary,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<'s>(
        &mut self,
        aggregator: &Aggregator<'_>,
        sessions: impl IntoIterator<Item = &'s Session>,
    ) {
        for session in sessions {
            self.sessions
                .insert(session.source_file.clone(), aggregator.session(session));
        }
        self.recompute();
    }

    pub fn remove<'p>(&mut self, files: impl IntoIterator<Item = &'p PathBuf>) {
        for file in files {
            self.sessions.remove(file);
        }
        self.recompute();
    }

    pub fn totals(&self) -> &Summary {
        &self.totals
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn recompute(&mut self) {
        self.totals = self.sessions.values().sum();
    }
}
