use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{PricingConfig, UnknownModelPolicy};
use crate::error::{MonitorError, Result};
use crate::session::TokenUsage;

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
    pub cache_write_per_million: Decimal,
    pub cache_read_per_million: Decimal,
    pub context_window: u64,
    pub session_quota: Option<Decimal>,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::zero()
    }
}

impl ModelPricing {
    pub fn zero() -> Self {
        Self {
            input_per_million: Decimal::ZERO,
            output_per_million: Decimal::ZERO,
            cache_write_per_million: Decimal::ZERO,
            cache_read_per_million: Decimal::ZERO,
            context_window: DEFAULT_CONTEXT_WINDOW,
            session_quota: None,
        }
    }

    /// Mid-tier rates used when unknown models are billed instead of zeroed.
    pub fn conservative_default() -> Self {
        rates(dec(3, 0), dec(15, 0), dec(375, 2), dec(3, 1), DEFAULT_CONTEXT_WINDOW)
    }

    pub fn is_valid(&self) -> bool {
        [
            self.input_per_million,
            self.output_per_million,
            self.cache_write_per_million,
            self.cache_read_per_million,
        ]
        .iter()
        .all(|rate| !rate.is_sign_negative())
            && self.session_quota.is_none_or(|quota| !quota.is_sign_negative())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Exact,
    Alias,
    Normalized,
    #[default]
    Fallback,
}

impl PricingSource {
    /// Only fallback pricing is an estimate; every other source is authoritative.
    pub fn is_estimated(self) -> bool {
        matches!(self, Self::Fallback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenCostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_write_cost: Decimal,
    pub cache_read_cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CostComputation {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub resolved_model: String,
    pub breakdown: TokenCostBreakdown,
    pub total_cost: Decimal,
}

#[derive(Debug, Clone)]
pub struct PricingResolution {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub resolved_model: String,
}

/// Model pricing context: built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: BTreeMap<String, ModelPricing>,
    aliases: BTreeMap<String, String>,
    fallback: ModelPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    pub fn builtin() -> Self {
        Self {
            entries: builtin_entries(),
            aliases: BTreeMap::new(),
            fallback: ModelPricing::zero(),
        }
    }

    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            aliases: BTreeMap::new(),
            fallback: ModelPricing::zero(),
        }
    }

    /// Built-in table plus configured aliases, fallback policy and optional
    /// `models.json` overrides.
    pub fn from_config(config: &PricingConfig, pricing_file: Option<&Path>) -> Result<Self> {
        let fallback = match config.unknown_model {
            UnknownModelPolicy::Zero => ModelPricing::zero(),
            UnknownModelPolicy::DefaultRate => config.default_rate,
        };
        let mut table = Self::builtin().with_fallback(fallback);
        table.aliases = config.aliases.clone();
        if let Some(path) = pricing_file {
            table.load_overrides(path)?;
        }
        Ok(table)
    }

    pub fn with_entry(mut self, model_id: &str, pricing: ModelPricing) -> Self {
        self.entries.insert(normalize_model_key(model_id), pricing);
        self
    }

    pub fn with_fallback(mut self, fallback: ModelPricing) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads a `models.json` file in the `{"model": {"input": .., "output": ..,
    /// "cacheWrite": .., "cacheRead": .., "contextWindow": .., "sessionQuota": ..}}`
    /// shape. Entries replace built-ins with the same key.
    pub fn load_overrides(&mut self, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path).map_err(|err| MonitorError::Pricing {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let parsed: BTreeMap<String, PricingFileEntry> =
            serde_json::from_str(&raw).map_err(|err| MonitorError::Pricing {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;

        let mut loaded = 0;
        for (model, entry) in parsed {
            let key = model.trim().to_ascii_lowercase();
            let pricing = entry.into_pricing();
            if key.is_empty() || !pricing.is_valid() {
                tracing::warn!(model = %model, "ignoring invalid pricing entry");
                continue;
            }
            self.entries.insert(key, pricing);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn resolve(&self, model_id: &str) -> PricingResolution {
        let raw_key = model_id.trim().to_ascii_lowercase();
        if let Some(pricing) = self.entries.get(&raw_key) {
            return PricingResolution {
                pricing: *pricing,
                source: PricingSource::Exact,
                resolved_model: raw_key,
            };
        }

        let normalized = normalize_model_key(model_id);
        for key in [&raw_key, &normalized] {
            if let Some(target) = self.aliases.get(key)
                && let Some(pricing) = self.entries.get(target)
            {
                return PricingResolution {
                    pricing: *pricing,
                    source: PricingSource::Alias,
                    resolved_model: target.clone(),
                };
            }
        }

        if let Some(pricing) = self.entries.get(&normalized) {
            return PricingResolution {
                pricing: *pricing,
                source: PricingSource::Normalized,
                resolved_model: normalized,
            };
        }

        PricingResolution {
            pricing: self.fallback,
            source: PricingSource::Fallback,
            resolved_model: raw_key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingFileEntry {
    #[serde(default)]
    input: Decimal,
    #[serde(default)]
    output: Decimal,
    #[serde(default)]
    cache_write: Decimal,
    #[serde(default)]
    cache_read: Decimal,
    context_window: Option<u64>,
    session_quota: Option<Decimal>,
}

impl PricingFileEntry {
    fn into_pricing(self) -> ModelPricing {
        ModelPricing {
            input_per_million: self.input,
            output_per_million: self.output,
            cache_write_per_million: self.cache_write,
            cache_read_per_million: self.cache_read,
            context_window: self
                .context_window
                .filter(|window| *window > 0)
                .unwrap_or(DEFAULT_CONTEXT_WINDOW),
            session_quota: self.session_quota,
        }
    }
}

/// Prices one interaction's tokens. Reasoning tokens bill at the output rate.
pub fn compute_total_cost(
    model_id: &str,
    tokens: &TokenUsage,
    table: &PricingTable,
) -> CostComputation {
    let resolved = table.resolve(model_id);
    let pricing = resolved.pricing;

    let breakdown = TokenCostBreakdown {
        input_cost: per_million(tokens.input, pricing.input_per_million),
        output_cost: per_million(
            tokens.output.saturating_add(tokens.reasoning),
            pricing.output_per_million,
        ),
        cache_write_cost: per_million(tokens.cache_write, pricing.cache_write_per_million),
        cache_read_cost: per_million(tokens.cache_read, pricing.cache_read_per_million),
    };
    let total_cost = breakdown.input_cost
        + breakdown.output_cost
        + breakdown.cache_write_cost
        + breakdown.cache_read_cost;

    CostComputation {
        pricing,
        source: resolved.source,
        resolved_model: resolved.resolved_model,
        breakdown,
        total_cost,
    }
}

fn per_million(tokens: u64, rate: Decimal) -> Decimal {
    if tokens == 0 || rate.is_zero() {
        return Decimal::ZERO;
    }
    Decimal::from(tokens) * rate / Decimal::from(1_000_000u64)
}

/// Canonical pricing key: lowercase, provider prefix dropped, trailing
/// `-YYYYMMDD` removed, and `-4-5` style versions folded to `-4.5`.
pub fn normalize_model_key(model: &str) -> String {
    let lower = model.trim().to_ascii_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(lower.as_str());

    let mut parts: Vec<&str> = name.split('-').filter(|part| !part.is_empty()).collect();
    if parts.len() > 1
        && let Some(last) = parts.last()
        && last.len() == 8
        && last.chars().all(|ch| ch.is_ascii_digit())
    {
        parts.pop();
    }

    let mut folded: Vec<String> = Vec::with_capacity(parts.len());
    let mut idx = 0;
    while idx < parts.len() {
        let part = parts[idx];
        if idx > 0
            && idx + 1 < parts.len()
            && is_version_digit(part)
            && is_version_digit(parts[idx + 1])
        {
            folded.push(format!("{part}.{}", parts[idx + 1]));
            idx += 2;
            continue;
        }
        folded.push(part.to_string());
        idx += 1;
    }
    folded.join("-")
}

fn is_version_digit(part: &str) -> bool {
    (1..=2).contains(&part.len()) && part.chars().all(|ch| ch.is_ascii_digit())
}

fn dec(mantissa: i64, scale: u32) -> Decimal {
    Decimal::new(mantissa, scale)
}

fn rates(
    input: Decimal,
    output: Decimal,
    cache_write: Decimal,
    cache_read: Decimal,
    context_window: u64,
) -> ModelPricing {
    ModelPricing {
        input_per_million: input,
        output_per_million: output,
        cache_write_per_million: cache_write,
        cache_read_per_million: cache_read,
        context_window,
        session_quota: None,
    }
}

fn builtin_entries() -> BTreeMap<String, ModelPricing> {
    let opus_legacy = rates(dec(15, 0), dec(75, 0), dec(1875, 2), dec(15, 1), 200_000);
    let opus = rates(dec(5, 0), dec(25, 0), dec(625, 2), dec(5, 1), 200_000);
    let sonnet = rates(dec(3, 0), dec(15, 0), dec(375, 2), dec(3, 1), 200_000);
    let haiku = rates(dec(1, 0), dec(5, 0), dec(125, 2), dec(1, 1), 200_000);
    let haiku_legacy = rates(dec(8, 1), dec(4, 0), dec(1, 0), dec(8, 2), 200_000);
    let gpt5 = rates(dec(125, 2), dec(10, 0), Decimal::ZERO, dec(125, 3), 400_000);
    let gpt5_mini = rates(dec(25, 2), dec(2, 0), Decimal::ZERO, dec(25, 3), 400_000);
    let gemini_pro = rates(dec(125, 2), dec(10, 0), Decimal::ZERO, dec(31, 2), 1_048_576);
    let gemini_flash = rates(dec(3, 1), dec(25, 1), Decimal::ZERO, dec(75, 3), 1_048_576);

    let mut entries = BTreeMap::new();
    for (model, pricing) in [
        ("claude-opus-4", opus_legacy),
        ("claude-opus-4.1", opus_legacy),
        ("claude-opus-4.5", opus),
        ("claude-sonnet-4", sonnet),
        ("claude-sonnet-4.5", sonnet),
        ("claude-3.7-sonnet", sonnet),
        ("claude-3.5-sonnet", sonnet),
        ("claude-haiku-4.5", haiku),
        ("claude-3.5-haiku", haiku_legacy),
        ("gpt-5", gpt5),
        ("gpt-5-codex", gpt5),
        ("gpt-5.1", gpt5),
        ("gpt-5.1-codex", gpt5),
        ("gpt-5-mini", gpt5_mini),
        ("gemini-2.5-pro", gemini_pro),
        ("gemini-2.5-flash", gemini_flash),
    ] {
        entries.insert(model.to_string(), pricing);
    }
    entries
}
