use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost: Decimal) -> String {
    if cost <= Decimal::ZERO {
        return "$0.00".to_string();
    }
    let places = if cost < Decimal::new(1, 2) {
        4
    } else if cost < Decimal::ONE {
        3
    } else {
        2
    };
    let rounded = cost.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    format!("${rounded:.prec$}", prec = places as usize)
}

pub fn format_cost_flagged(cost: Decimal, estimated: bool) -> String {
    if estimated {
        format!("~{}", format_cost(cost))
    } else {
        format_cost(cost)
    }
}

pub fn format_rate(tokens_per_second: f64) -> String {
    if !tokens_per_second.is_finite() || tokens_per_second <= 0.0 {
        return "-".to_string();
    }
    format!("{tokens_per_second:.1} tok/s")
}

pub fn format_model_name(model_id: &str) -> String {
    if model_id.trim().is_empty() {
        return "unknown".to_string();
    }

    let name = model_id.rsplit('/').next().unwrap_or(model_id);
    name.split('-')
        .filter(|part| !part.is_empty())
        .map(format_model_component)
        .collect::<Vec<_>>()
        .join("-")
}

fn format_model_component(component: &str) -> String {
    let lower = component.to_ascii_lowercase();
    match lower.as_str() {
        "gpt" => "GPT".to_string(),
        "codex" => "Codex".to_string(),
        "mini" => "Mini".to_string(),
        _ => {
            if lower.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
                return lower;
            }
            let mut chars = lower.chars();
            let Some(first) = chars.next() else {
                return lower;
            };
            format!("{}{}", first.to_ascii_uppercase(), chars.as_str())
        }
    }
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn human_duration_ms(ms: u64) -> String {
    human_duration(Duration::from_millis(ms))
}

/// Text bar for a fraction in `[0, 1]`; out-of-range input is clamped.
pub fn progress_bar(fraction: f64, width: usize) -> String {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("{}{}", "#".repeat(filled), "-".repeat(empty))
}

/// Truncates to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let kept: String = input.chars().take(max_chars - 3).collect();
    format!("{kept}...")
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>, offset: Option<FixedOffset>) -> String {
    let Some(ts) = ts else {
        return "-".to_string();
    };
    match offset {
        Some(offset) => ts.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string(),
        None => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    }
}

pub fn now_local() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
