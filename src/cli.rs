use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::config::{ExportFormat, TableStyle};
use crate::export::ExportKind;
use crate::report::ReportKind;
use crate::timeframe::WeekStart;

#[derive(Parser, Debug)]
#[command(
    name = "session-usage-monitor",
    version,
    about = "Token usage and cost reports for AI coding session transcripts"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Directory holding session transcripts.
    #[arg(long, global = true, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Config file (JSON).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// List every session as its own workflow.
    #[arg(long, global = true)]
    pub no_group: bool,

    #[arg(long, global = true, value_enum)]
    pub week_start: Option<WeekStart>,

    #[arg(long, global = true, value_enum)]
    pub table_style: Option<TableStyle>,

    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RangeArgs {
    /// First local date to include (YYYY-MM-DD).
    #[arg(long, value_name = "DATE")]
    pub since: Option<NaiveDate>,

    /// Last local date to include (YYYY-MM-DD).
    #[arg(long, value_name = "DATE")]
    pub until: Option<NaiveDate>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List sessions, most recent first.
    Sessions {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List workflows (main session plus its sub-agents).
    Workflows {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Usage per local day.
    Daily {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Usage per week.
    Weekly {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Usage per calendar month.
    Monthly {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Usage per model.
    Models {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Usage per project.
    Projects {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Live dashboard that follows the transcript directory.
    Live {
        /// Refresh interval in seconds.
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Write flat rows for spreadsheets or other tools.
    Export {
        #[arg(value_enum, default_value = "sessions")]
        kind: ExportKind,
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, value_enum)]
        format: Option<ExportFormat>,
        /// Output file; defaults to a timestamped file in the export directory.
        #[arg(long, short, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

impl Commands {
    pub fn report_kind(&self) -> Option<ReportKind> {
        match self {
            Self::Sessions { .. } => Some(ReportKind::Sessions),
            Self::Workflows { .. } => Some(ReportKind::Workflows),
            Self::Daily { .. } => Some(ReportKind::Daily),
            Self::Weekly { .. } => Some(ReportKind::Weekly),
            Self::Monthly { .. } => Some(ReportKind::Monthly),
            Self::Models { .. } => Some(ReportKind::Models),
            Self::Projects { .. } => Some(ReportKind::Projects),
            Self::Live { .. } | Self::Export { .. } => None,
        }
    }

    pub fn range(&self) -> RangeArgs {
        match self {
            Self::Sessions { range, .. }
            | Self::Workflows { range, .. }
            | Self::Daily { range }
            | Self::Weekly { range }
            | Self::Monthly { range }
            | Self::Models { range }
            | Self::Projects { range }
            | Self::Export { range, .. } => range.clone(),
            Self::Live { .. } => RangeArgs::default(),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Sessions { limit, .. } | Self::Workflows { limit, .. } => *limit,
            _ => None,
        }
    }
}
