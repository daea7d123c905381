use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cli::{Cli, Commands, GlobalArgs, RangeArgs};
use crate::config::{ExportFormat, MonitorConfig};
use crate::cost::PricingTable;
use crate::error::{MonitorError, RunStatus, Warning};
use crate::export::{self, ExportKind, ExportMetadata, ExportRow};
use crate::live::LiveMonitor;
use crate::metrics::Aggregator;
use crate::report::{self, ReportKind, ReportOutcome, ReportRequest};
use crate::ui::{self, DisplayOptions, HeadlessRenderer, TerminalRenderer};
use crate::workflow::GroupingOptions;

pub fn run(cli: Cli) -> Result<u8> {
    let mut config = MonitorConfig::load(cli.global.config.as_deref())
        .context("failed to load configuration")?;
    apply_cli_overrides(&mut config, &cli.global, &cli.command);

    let pricing = PricingTable::from_config(&config.pricing, config.paths.pricing_file.as_deref())
        .context("failed to build pricing table")?;
    debug!(models = pricing.len(), "pricing table ready");
    let mut aggregator = Aggregator::new(&pricing, config.analytics.week_start);
    if let Some(offset) = config.analytics.offset() {
        aggregator = aggregator.with_offset(offset);
    }

    let mut options = DisplayOptions::from_config(&config.ui).with_offset(aggregator.offset());
    if cli.global.no_color || !io::stdout().is_terminal() {
        options.colors = false;
    }

    if let Some(kind) = cli.command.report_kind() {
        let request = report_request(&config, kind, &cli.command.range(), cli.command.limit());
        return run_report(&config, &request, &aggregator, &options);
    }

    match cli.command {
        Commands::Live { .. } => run_live(&config, aggregator, options),
        Commands::Export {
            kind,
            range,
            format,
            output,
        } => run_export(&config, &aggregator, kind, &range, format, output),
        _ => Ok(RunStatus::Success.exit_code()),
    }
}

/// Command-line flags win over the config file and the environment.
pub fn apply_cli_overrides(config: &mut MonitorConfig, global: &GlobalArgs, command: &Commands) {
    if let Some(dir) = &global.dir {
        config.paths.messages_dir = dir.clone();
    }
    if global.no_group {
        config.analytics.group_workflows = false;
    }
    if let Some(week_start) = global.week_start {
        config.analytics.week_start = week_start;
    }
    if let Some(style) = global.table_style {
        config.ui.table_style = style;
    }
    if global.no_color {
        config.ui.colors = false;
    }
    if let Commands::Live {
        interval: Some(seconds),
    } = command
    {
        config.ui.live_refresh_interval = *seconds;
    }
    if config.normalize() {
        debug!("command-line values normalized");
    }
}

pub fn report_request(
    config: &MonitorConfig,
    kind: ReportKind,
    range: &RangeArgs,
    limit: Option<usize>,
) -> ReportRequest {
    ReportRequest {
        kind,
        since: range.since,
        until: range.until,
        limit,
        grouping: GroupingOptions::new(
            config.analytics.group_workflows,
            config.analytics.infer_agent_parents,
        ),
    }
}

fn run_report(
    config: &MonitorConfig,
    request: &ReportRequest,
    aggregator: &Aggregator<'_>,
    options: &DisplayOptions,
) -> Result<u8> {
    let outcome = match report::generate(&config.paths.messages_dir, request, aggregator) {
        Ok(outcome) => outcome,
        Err(err) => return fatal_or_error(err),
    };

    match outcome {
        ReportOutcome::Ready(report) => {
            log_warnings(&report.warnings);
            ui::print_report(&report, options)?;
            Ok(RunStatus::Success.exit_code())
        }
        ReportOutcome::NoData { warnings } => {
            log_warnings(&warnings);
            ui::print_no_data(&warnings, options)?;
            Ok(RunStatus::NoData.exit_code())
        }
    }
}

fn run_live(config: &MonitorConfig, aggregator: Aggregator<'_>, options: DisplayOptions) -> Result<u8> {
    let mut monitor = LiveMonitor::new(config.live_settings(), aggregator);
    if let Err(err) = monitor.init() {
        return fatal_or_error(err);
    }
    let stop = install_stop_signal()?;

    if !io::stdout().is_terminal() {
        println!("No interactive terminal detected; printing updates as lines.");
        println!("Press Ctrl+C to stop.");
        let mut renderer = HeadlessRenderer::stdout();
        monitor.run(&mut renderer, &stop)?;
        return Ok(RunStatus::Success.exit_code());
    }

    let mut renderer = TerminalRenderer::new(options);
    ui::enter_terminal()?;
    let run_result = monitor.run(&mut renderer, &stop);
    let _ = ui::leave_terminal();
    run_result?;
    Ok(RunStatus::Success.exit_code())
}

fn run_export(
    config: &MonitorConfig,
    aggregator: &Aggregator<'_>,
    kind: ExportKind,
    range: &RangeArgs,
    format: Option<ExportFormat>,
    output: Option<PathBuf>,
) -> Result<u8> {
    let request = report_request(config, ReportKind::Sessions, range, None);
    let dataset = match report::load_dataset(&config.paths.messages_dir, &request, aggregator) {
        Ok(dataset) => dataset,
        Err(err) => return fatal_or_error(err),
    };
    log_warnings(&dataset.warnings);
    if dataset.is_empty() {
        println!("No usage data found for the selected range; nothing exported.");
        return Ok(RunStatus::NoData.exit_code());
    }

    let format = format.unwrap_or(config.export.default_format);
    let include_metadata = config.export.include_metadata;
    let (row_count, contents) = match kind.period() {
        None => render_rows(
            &export::session_rows(aggregator, &dataset),
            kind,
            format,
            include_metadata,
        )?,
        Some(period) => render_rows(
            &export::bucket_model_rows(aggregator, &dataset, period),
            kind,
            format,
            include_metadata,
        )?,
    };

    let path = output
        .unwrap_or_else(|| export::default_export_path(&config.paths.export_dir, kind, format));
    export::write_export(&path, &contents)
        .with_context(|| format!("failed to write export {}", path.display()))?;
    println!("Exported {row_count} row(s) to {}", path.display());
    Ok(RunStatus::Success.exit_code())
}

fn render_rows<R: ExportRow>(
    rows: &[R],
    kind: ExportKind,
    format: ExportFormat,
    include_metadata: bool,
) -> Result<(usize, String)> {
    let metadata = include_metadata.then(|| ExportMetadata::new(kind, rows));
    let contents = export::render(rows, format, metadata.as_ref())?;
    Ok((rows.len(), contents))
}

fn fatal_or_error(err: MonitorError) -> Result<u8> {
    if err.is_fatal_input() {
        eprintln!("{err}");
        return Ok(RunStatus::FatalInput.exit_code());
    }
    Err(err.into())
}

fn log_warnings(warnings: &[Warning]) {
    for warning in warnings {
        warn!(kind = warning.label(), "{warning}");
    }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
