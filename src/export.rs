use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ExportFormat;
use crate::error::{MonitorError, Result};
use crate::metrics::{Aggregator, BucketModelStats, SessionStats};
use crate::report::Dataset;
use crate::session::TokenUsage;
use crate::timeframe::Period;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Sessions,
    Daily,
    Weekly,
    Monthly,
}

impl ExportKind {
    pub fn period(self) -> Option<Period> {
        match self {
            Self::Sessions => None,
            Self::Daily => Some(Period::Day),
            Self::Weekly => Some(Period::Week),
            Self::Monthly => Some(Period::Month),
        }
    }

    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

/// A flat export record. Every row knows how to lay itself out as CSV and
/// which tokens and cost it carries.
pub trait ExportRow: Serialize + DeserializeOwned {
    const HEADERS: &'static [&'static str];

    fn fields(&self) -> Vec<String>;
    fn tokens(&self) -> TokenUsage;
    fn cost(&self) -> Decimal;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExportRow {
    pub session_id: String,
    pub workflow_id: String,
    pub title: String,
    pub project: String,
    pub agent: Option<String>,
    pub depth: usize,
    /// Models joined with `;`.
    pub models: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub interactions: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub cost: Decimal,
    pub estimated: bool,
}

impl From<&SessionStats> for SessionExportRow {
    fn from(stats: &SessionStats) -> Self {
        let tokens = stats.summary.tokens;
        Self {
            session_id: stats.session_id.clone(),
            workflow_id: stats.workflow_id.clone(),
            title: stats.title.clone(),
            project: stats.project.clone(),
            agent: stats.agent.map(|kind| kind.label().to_string()),
            depth: stats.depth,
            models: stats.models.join(";"),
            started_at: stats.started_at,
            duration_ms: stats.duration_ms,
            interactions: stats.summary.interaction_count,
            input_tokens: tokens.input,
            output_tokens: tokens.output,
            reasoning_tokens: tokens.reasoning,
            cache_read_tokens: tokens.cache_read,
            cache_write_tokens: tokens.cache_write,
            total_tokens: tokens.total(),
            cost: stats.summary.cost,
            estimated: stats.summary.is_estimated(),
        }
    }
}

impl ExportRow for SessionExportRow {
    const HEADERS: &'static [&'static str] = &[
        "session_id",
        "workflow_id",
        "title",
        "project",
        "agent",
        "depth",
        "models",
        "started_at",
        "duration_ms",
        "interactions",
        "input_tokens",
        "output_tokens",
        "reasoning_tokens",
        "cache_read_tokens",
        "cache_write_tokens",
        "total_tokens",
        "cost",
        "estimated",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.session_id.clone(),
            self.workflow_id.clone(),
            self.title.clone(),
            self.project.clone(),
            self.agent.clone().unwrap_or_default(),
            self.depth.to_string(),
            self.models.clone(),
            self.started_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
            self.duration_ms.to_string(),
            self.interactions.to_string(),
            self.input_tokens.to_string(),
            self.output_tokens.to_string(),
            self.reasoning_tokens.to_string(),
            self.cache_read_tokens.to_string(),
            self.cache_write_tokens.to_string(),
            self.total_tokens.to_string(),
            self.cost.to_string(),
            self.estimated.to_string(),
        ]
    }

    fn tokens(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            reasoning: self.reasoning_tokens,
            cache_read: self.cache_read_tokens,
            cache_write: self.cache_write_tokens,
        }
    }

    fn cost(&self) -> Decimal {
        self.cost
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketModelExportRow {
    pub period: String,
    pub bucket_start: NaiveDate,
    pub bucket_end: NaiveDate,
    pub bucket: String,
    pub model_id: String,
    pub sessions: usize,
    pub interactions: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub cost: Decimal,
    pub estimated: bool,
}

impl From<&BucketModelStats> for BucketModelExportRow {
    fn from(stats: &BucketModelStats) -> Self {
        let tokens = stats.summary.tokens;
        Self {
            period: stats.bucket.period.title().to_ascii_lowercase(),
            bucket_start: stats.bucket.start,
            bucket_end: stats.bucket.end(),
            bucket: stats.bucket.label(),
            model_id: stats.model_id.clone(),
            sessions: stats.session_count,
            interactions: stats.summary.interaction_count,
            input_tokens: tokens.input,
            output_tokens: tokens.output,
            reasoning_tokens: tokens.reasoning,
            cache_read_tokens: tokens.cache_read,
            cache_write_tokens: tokens.cache_write,
            total_tokens: tokens.total(),
            cost: stats.summary.cost,
            estimated: stats.summary.is_estimated(),
        }
    }
}

impl ExportRow for BucketModelExportRow {
    const HEADERS: &'static [&'static str] = &[
        "period",
        "bucket_start",
        "bucket_end",
        "bucket",
        "model_id",
        "sessions",
        "interactions",
        "input_tokens",
        "output_tokens",
        "reasoning_tokens",
        "cache_read_tokens",
        "cache_write_tokens",
        "total_tokens",
        "cost",
        "estimated",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.period.clone(),
            self.bucket_start.to_string(),
            self.bucket_end.to_string(),
            self.bucket.clone(),
            self.model_id.clone(),
            self.sessions.to_string(),
            self.interactions.to_string(),
            self.input_tokens.to_string(),
            self.output_tokens.to_string(),
            self.reasoning_tokens.to_string(),
            self.cache_read_tokens.to_string(),
            self.cache_write_tokens.to_string(),
            self.total_tokens.to_string(),
            self.cost.to_string(),
            self.estimated.to_string(),
        ]
    }

    fn tokens(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            reasoning: self.reasoning_tokens,
            cache_read: self.cache_read_tokens,
            cache_write: self.cache_write_tokens,
        }
    }

    fn cost(&self) -> Decimal {
        self.cost
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTotals {
    pub rows: usize,
    pub tokens: TokenUsage,
    pub cost: Decimal,
}

impl ExportTotals {
    pub fn from_rows<R: ExportRow>(rows: &[R]) -> Self {
        rows.iter().fold(
            Self {
                rows: rows.len(),
                ..Self::default()
            },
            |mut totals, row| {
                totals.tokens += row.tokens();
                totals.cost += row.cost();
                totals
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub generated_at: DateTime<Utc>,
    pub tool: String,
    pub version: String,
    pub kind: ExportKind,
    pub totals: ExportTotals,
}

impl ExportMetadata {
    pub fn new<R: ExportRow>(kind: ExportKind, rows: &[R]) -> Self {
        Self {
            generated_at: Utc::now(),
            tool: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            kind,
            totals: ExportTotals::from_rows(rows),
        }
    }
}

#[derive(Serialize)]
struct WithMetadata<'a, R> {
    metadata: &'a ExportMetadata,
    rows: &'a [R],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonPayload<R> {
    WithMetadata {
        #[allow(dead_code)]
        metadata: serde_json::Value,
        rows: Vec<R>,
    },
    Bare(Vec<R>),
}

pub fn session_rows(aggregator: &Aggregator<'_>, dataset: &Dataset) -> Vec<SessionExportRow> {
    let mut stats = aggregator.by_session(&dataset.workflows);
    stats.sort_by(|a, b| (a.started_at, &a.session_id).cmp(&(b.started_at, &b.session_id)));
    stats.iter().map(SessionExportRow::from).collect()
}

pub fn bucket_model_rows(
    aggregator: &Aggregator<'_>,
    dataset: &Dataset,
    period: Period,
) -> Vec<BucketModelExportRow> {
    aggregator
        .by_bucket_and_model(dataset.sessions(), period)
        .iter()
        .map(BucketModelExportRow::from)
        .collect()
}

/// Bare JSON array, or `{ "metadata": .., "rows": [..] }` when metadata is
/// requested.
pub fn to_json<R: ExportRow>(rows: &[R], metadata: Option<&ExportMetadata>) -> Result<String> {
    let rendered = match metadata {
        Some(metadata) => serde_json::to_string_pretty(&WithMetadata { metadata, rows }),
        None => serde_json::to_string_pretty(rows),
    };
    rendered.map_err(|err| MonitorError::Export {
        reason: err.to_string(),
    })
}

/// Reads either JSON layout written by [`to_json`].
pub fn from_json<R: ExportRow>(input: &str) -> Result<Vec<R>> {
    let payload: JsonPayload<R> =
        serde_json::from_str(input).map_err(|err| MonitorError::Export {
            reason: err.to_string(),
        })?;
    Ok(match payload {
        JsonPayload::WithMetadata { rows, .. } => rows,
        JsonPayload::Bare(rows) => rows,
    })
}

pub fn to_csv<R: ExportRow>(rows: &[R]) -> String {
    let mut out = String::new();
    push_csv_line(&mut out, R::HEADERS.iter().map(|header| (*header).to_string()));
    for row in rows {
        push_csv_line(&mut out, row.fields());
    }
    out
}

fn push_csv_line(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&escape_csv(&field));
    }
    out.push_str("\r\n");
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn render<R: ExportRow>(
    rows: &[R],
    format: ExportFormat,
    metadata: Option<&ExportMetadata>,
) -> Result<String> {
    match format {
        ExportFormat::Csv => Ok(to_csv(rows)),
        ExportFormat::Json => to_json(rows, metadata),
    }
}

pub fn write_export(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| MonitorError::io(parent, err))?;
    }
    fs::write(path, contents).map_err(|err| MonitorError::io(path, err))?;
    tracing::info!(path = %path.display(), bytes = contents.len(), "wrote export");
    Ok(())
}

pub fn default_export_path(export_dir: &Path, kind: ExportKind, format: ExportFormat) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    export_dir.join(format!(
        "{}-{stamp}.{}",
        kind.file_stem(),
        format.extension()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PricingTable;
    use crate::report::{ReportKind, ReportRequest, prepare};
    use crate::session::{Interaction, Role, Session};
    use crate::timeframe::WeekStart;
    use chrono::{FixedOffset, TimeZone};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn interaction(id: &str, model: &str, input: u64, output: u64, day: u32) -> Interaction {
        let start = Utc
            .with_ymd_and_hms(2024, 3, day, 9, 0, 0)
            .single()
            .expect("valid time");
        Interaction {
            id: id.to_string(),
            role: Role::Assistant,
            model_id: model.to_string(),
            provider_id: None,
            tokens: TokenUsage {
                input,
                output,
                reasoning: 7,
                cache_read: 300,
                cache_write: 11,
            },
            started_at: Some(start),
            completed_at: Some(start + chrono::Duration::seconds(3)),
            project_path: None,
        }
    }

    fn session(id: &str, parent: Option<&str>, interactions: Vec<Interaction>) -> Session {
        Session {
            session_id: id.to_string(),
            title: Some(format!("Work, \"{id}\"")),
            project_path: Some(PathBuf::from("/src/demo")),
            project_name: "demo".to_string(),
            parent_id: parent.map(str::to_string),
            agent_name: None,
            created_at: None,
            updated_at: None,
            interactions,
            source_file: PathBuf::from(format!("/tmp/{id}.jsonl")),
            file_modified: None,
        }
    }

    fn dataset(table: &PricingTable) -> (Aggregator<'_>, Dataset) {
        let agg = Aggregator::new(table, WeekStart::Monday)
            .with_offset(FixedOffset::east_opt(0).expect("utc offset"));
        let sessions = vec![
            session(
                "a",
                None,
                vec![
                    interaction("a1", "claude-sonnet-4.5", 1_000, 200, 4),
                    interaction("a2", "gpt-5", 400, 50, 4),
                ],
            ),
            session("b", Some("a"), vec![interaction("b1", "gpt-5", 900, 90, 5)]),
            session("c", None, vec![interaction("c1", "unlisted", 5, 5, 12)]),
        ];
        let request = ReportRequest::new(ReportKind::Sessions);
        let data = prepare(sessions, Vec::new(), &request, &agg);
        (agg, data)
    }

    #[test]
    fn session_rows_survive_json_round_trip_with_totals() {
        let table = PricingTable::builtin();
        let (agg, data) = dataset(&table);
        let rows = session_rows(&agg, &data);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].workflow_id, "a");
        assert_eq!(rows[1].depth, 1);
        assert_eq!(rows[0].models, "claude-sonnet-4.5;gpt-5");

        let metadata = ExportMetadata::new(ExportKind::Sessions, &rows);
        let json = to_json(&rows, Some(&metadata)).expect("json");
        let reloaded: Vec<SessionExportRow> = from_json(&json).expect("reload");
        assert_eq!(reloaded, rows);
        assert_eq!(ExportTotals::from_rows(&reloaded), metadata.totals);
        assert_eq!(
            ExportTotals::from_rows(&reloaded).cost,
            agg.summarize(data.sessions()).cost
        );
    }

    #[test]
    fn bucket_rows_match_session_totals() {
        let table = PricingTable::builtin();
        let (agg, data) = dataset(&table);
        let sessions = ExportTotals::from_rows(&session_rows(&agg, &data));
        let buckets = bucket_model_rows(&agg, &data, Period::Week);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].bucket_start.to_string(), "2024-03-04");
        assert_eq!(buckets[1].model_id, "gpt-5");
        assert_eq!(buckets[1].sessions, 2);

        let reloaded: Vec<BucketModelExportRow> =
            from_json(&to_json(&buckets, None).expect("json")).expect("reload");
        let totals = ExportTotals::from_rows(&reloaded);
        assert_eq!(totals.tokens, sessions.tokens);
        assert_eq!(totals.cost, sessions.cost);
    }

    #[test]
    fn costs_serialize_as_decimal_strings() {
        let table = PricingTable::builtin();
        let (agg, data) = dataset(&table);
        let rows = session_rows(&agg, &data);
        let value: serde_json::Value =
            serde_json::from_str(&to_json(&rows, None).expect("json")).expect("value");
        assert!(value[0]["cost"].is_string());
    }

    #[test]
    fn csv_quotes_fields_with_separators() {
        let table = PricingTable::builtin();
        let (agg, data) = dataset(&table);
        let rows = session_rows(&agg, &data);
        let csv = to_csv(&rows);
        let mut lines = csv.split("\r\n");
        assert_eq!(lines.next(), Some(SessionExportRow::HEADERS.join(",").as_str()));
        let first = lines.next().expect("first row");
        assert!(first.starts_with("a,a,\"Work, \"\"a\"\"\",demo,"));
        assert_eq!(csv.matches("\r\n").count(), rows.len() + 1);
    }

    #[test]
    fn write_export_creates_parent_directories() {
        let tmp = TempDir::new().expect("temp dir");
        let path = default_export_path(
            &tmp.path().join("nested"),
            ExportKind::Daily,
            ExportFormat::Csv,
        );
        write_export(&path, "x\r\n").expect("write");
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".csv"));
    }
}
