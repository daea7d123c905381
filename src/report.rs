use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, Warning};
use crate::metrics::{
    Aggregator, BucketStats, ModelStats, ProjectStats, SessionStats, Summary, WorkflowStats,
};
use crate::session::{Session, scan_sessions};
use crate::timeframe::Period;
use crate::workflow::{GroupingOptions, Workflow, group_sessions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Sessions,
    Workflows,
    Daily,
    Weekly,
    Monthly,
    Models,
    Projects,
}

impl ReportKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::Sessions => "Sessions",
            Self::Workflows => "Workflows",
            Self::Daily => "Daily Usage",
            Self::Weekly => "Weekly Usage",
            Self::Monthly => "Monthly Usage",
            Self::Models => "Model Usage",
            Self::Projects => "Project Usage",
        }
    }

    pub fn period(self) -> Option<Period> {
        match self {
            Self::Daily => Some(Period::Day),
            Self::Weekly => Some(Period::Week),
            Self::Monthly => Some(Period::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub kind: ReportKind,
    /// Inclusive local start date.
    pub since: Option<NaiveDate>,
    /// Inclusive local end date.
    pub until: Option<NaiveDate>,
    /// Row cap for session and workflow listings, most recent first.
    pub limit: Option<usize>,
    pub grouping: GroupingOptions,
}

impl ReportRequest {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            since: None,
            until: None,
            limit: None,
            grouping: GroupingOptions::default(),
        }
    }

    fn admits(&self, date: Option<NaiveDate>) -> bool {
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        let Some(date) = date else {
            return false;
        };
        self.since.is_none_or(|since| date >= since) && self.until.is_none_or(|until| date <= until)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum ReportRows {
    Sessions(Vec<SessionStats>),
    Workflows(Vec<WorkflowStats>),
    Buckets(Vec<BucketStats>),
    Models(Vec<ModelStats>),
    Projects(Vec<ProjectStats>),
}

impl ReportRows {
    pub fn len(&self) -> usize {
        match self {
            Self::Sessions(rows) => rows.len(),
            Self::Workflows(rows) => rows.len(),
            Self::Buckets(rows) => rows.len(),
            Self::Models(rows) => rows.len(),
            Self::Projects(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn summaries(&self) -> Vec<&Summary> {
        match self {
            Self::Sessions(rows) => rows.iter().map(|row| &row.summary).collect(),
            Self::Workflows(rows) => rows.iter().map(|row| &row.summary).collect(),
            Self::Buckets(rows) => rows.iter().map(|row| &row.summary).collect(),
            Self::Models(rows) => rows.iter().map(|row| &row.summary).collect(),
            Self::Projects(rows) => rows.iter().map(|row| &row.summary).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub title: String,
    pub rows: ReportRows,
    /// Sum of the listed rows.
    pub totals: Summary,
    pub warnings: Vec<Warning>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ReportOutcome {
    Ready(Report),
    NoData { warnings: Vec<Warning> },
}

/// Grouped and date-filtered sessions shared by reports and exports.
#[derive(Debug, Default)]
pub struct Dataset {
    pub workflows: Vec<Workflow>,
    pub warnings: Vec<Warning>,
}

impl Dataset {
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.workflows.iter().flat_map(Workflow::sessions)
    }

    pub fn session_count(&self) -> usize {
        self.workflows.iter().map(Workflow::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// Groups first, then keeps workflows whose local start date is in range so a
/// workflow is never split by the filter.
pub fn prepare(
    sessions: Vec<Session>,
    mut warnings: Vec<Warning>,
    request: &ReportRequest,
    aggregator: &Aggregator<'_>,
) -> Dataset {
    let grouped = group_sessions(sessions, request.grouping);
    warnings.extend(grouped.warnings);

    let workflows: Vec<Workflow> = grouped
        .workflows
        .into_iter()
        .filter(|workflow| {
            request.admits(workflow.anchor_time().map(|ts| aggregator.local_date(ts)))
        })
        .collect();

    warnings.extend(aggregator.unknown_models(workflows.iter().flat_map(Workflow::sessions)));
    Dataset {
        workflows,
        warnings,
    }
}

pub fn load_dataset(
    messages_dir: &Path,
    request: &ReportRequest,
    aggregator: &Aggregator<'_>,
) -> Result<Dataset> {
    let scan = scan_sessions(messages_dir)?;
    tracing::debug!(
        sessions = scan.sessions.len(),
        warnings = scan.warnings.len(),
        "scanned session directory"
    );
    Ok(prepare(scan.sessions, scan.warnings, request, aggregator))
}

pub fn build_report(
    dataset: &Dataset,
    request: &ReportRequest,
    aggregator: &Aggregator<'_>,
) -> ReportOutcome {
    if dataset.is_empty() {
        return ReportOutcome::NoData {
            warnings: dataset.warnings.clone(),
        };
    }

    let rows = match request.kind {
        ReportKind::Sessions => {
            let mut rows = aggregator.by_session(&dataset.workflows);
            rows.sort_by(|a, b| {
                (b.started_at, &b.session_id).cmp(&(a.started_at, &a.session_id))
            });
            if let Some(limit) = request.limit {
                rows.truncate(limit);
            }
            ReportRows::Sessions(rows)
        }
        ReportKind::Workflows => {
            let mut rows = aggregator.by_workflow(&dataset.workflows);
            rows.sort_by(|a, b| {
                (b.started_at, &b.workflow_id).cmp(&(a.started_at, &a.workflow_id))
            });
            if let Some(limit) = request.limit {
                rows.truncate(limit);
            }
            ReportRows::Workflows(rows)
        }
        ReportKind::Daily | ReportKind::Weekly | ReportKind::Monthly => {
            let period = request.kind.period().unwrap_or(Period::Day);
            ReportRows::Buckets(aggregator.by_bucket(dataset.sessions(), period))
        }
        ReportKind::Models => ReportRows::Models(aggregator.by_model(dataset.sessions())),
        ReportKind::Projects => ReportRows::Projects(aggregator.by_project(dataset.sessions())),
    };

    let totals: Summary = rows.summaries().into_iter().sum();
    ReportOutcome::Ready(Report {
        title: request.kind.title().to_string(),
        rows,
        totals,
        warnings: dataset.warnings.clone(),
        generated_at: Utc::now(),
    })
}

/// Single synchronous pass: parse, group, aggregate.
pub fn generate(
    messages_dir: &Path,
    request: &ReportRequest,
    aggregator: &Aggregator<'_>,
) -> Result<ReportOutcome> {
    let dataset = load_dataset(messages_dir, request, aggregator)?;
    Ok(build_report(&dataset, request, aggregator))
}
