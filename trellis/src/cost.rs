//! Cost engine: USD cost of one request from token counters and
//! settings-backed pricing.
//!
//! Pricing rows live in the settings table as
//! `pricing.{provider}.{pattern}.{input|output}` (USD per 1M tokens) plus
//! per-provider `pricing.{provider}.cache_{read|write}_multiplier`. Model
//! patterns are prefix-matched, longest pattern first, with `default` as the
//! fallback. The table is cached in memory for 60 seconds; stale reads
//! within the TTL are acceptable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::provider::TokenUsage;
use crate::store::Store;

/// How long a loaded pricing table stays valid.
pub const PRICING_CACHE_TTL: Duration = Duration::from_secs(60);

/// Provider family, for cache-billing semantics and model-prefix inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Anthropic,
    OpenAi,
    /// Local models (Ollama); never billed.
    Local,
}

impl ProviderFamily {
    /// Resolves the family from an explicit hint or the model string.
    ///
    /// A model containing a colon (`llama3:8b`) is a local model tag.
    pub fn resolve(hint: Option<&str>, model: &str) -> Self {
        match hint {
            Some("anthropic") => return Self::Anthropic,
            Some("openai") => return Self::OpenAi,
            Some("ollama") => return Self::Local,
            _ => {}
        }
        if model.contains(':') {
            Self::Local
        } else if model.starts_with("claude") {
            Self::Anthropic
        } else if model.starts_with("gpt") || model.starts_with('o') {
            Self::OpenAi
        } else {
            Self::OpenAi
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Local => "ollama",
        }
    }

    /// Whether the provider's reported input counter already contains the
    /// cache-read tokens (and must have them subtracted before billing).
    fn input_includes_cache_read(self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

/// Per-model prices in USD per million tokens.
#[derive(Debug, Clone, Copy, Default)]
struct ModelPrice {
    input: f64,
    output: f64,
}

/// Parsed pricing table for all families.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    /// `(provider key, pattern)` → price.
    prices: HashMap<(String, String), ModelPrice>,
    /// provider key → (read multiplier, write multiplier).
    multipliers: HashMap<String, (f64, f64)>,
}

impl PricingTable {
    /// Builds the table from raw settings rows.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let mut prices: HashMap<(String, String), ModelPrice> = HashMap::new();
        let mut multipliers = HashMap::new();
        for (key, value) in settings {
            let Some(rest) = key.strip_prefix("pricing.") else {
                continue;
            };
            let Ok(num) = value.parse::<f64>() else {
                continue;
            };
            let parts: Vec<&str> = rest.split('.').collect();
            match parts.as_slice() {
                [provider, "cache_read_multiplier"] => {
                    multipliers
                        .entry(provider.to_string())
                        .or_insert((0.1, 0.0))
                        .0 = num;
                }
                [provider, "cache_write_multiplier"] => {
                    multipliers
                        .entry(provider.to_string())
                        .or_insert((0.1, 0.0))
                        .1 = num;
                }
                [provider, pattern, "input"] => {
                    prices
                        .entry((provider.to_string(), pattern.to_string()))
                        .or_default()
                        .input = num;
                }
                [provider, pattern, "output"] => {
                    prices
                        .entry((provider.to_string(), pattern.to_string()))
                        .or_default()
                        .output = num;
                }
                _ => {}
            }
        }
        Self {
            prices,
            multipliers,
        }
    }

    /// Prefix-matches the model against patterns, longest first, then `default`.
    fn price_for(&self, family: ProviderFamily, model: &str) -> ModelPrice {
        let provider = family.key();
        let mut best: Option<(&str, ModelPrice)> = None;
        for ((p, pattern), price) in &self.prices {
            if p != provider || pattern == "default" {
                continue;
            }
            if model.starts_with(pattern.as_str()) {
                let longer = best.map(|(b, _)| pattern.len() > b.len()).unwrap_or(true);
                if longer {
                    best = Some((pattern, *price));
                }
            }
        }
        if let Some((_, price)) = best {
            return price;
        }
        self.prices
            .get(&(provider.to_string(), "default".to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn multipliers_for(&self, family: ProviderFamily) -> (f64, f64) {
        self.multipliers
            .get(family.key())
            .copied()
            .unwrap_or((0.1, 0.0))
    }

    /// Computes USD cost for the given usage.
    pub fn compute(&self, family: ProviderFamily, model: &str, usage: &TokenUsage) -> f64 {
        if family == ProviderFamily::Local {
            return 0.0;
        }
        let price = self.price_for(family, model);
        let (read_mult, write_mult) = self.multipliers_for(family);

        let regular_input = if family.input_includes_cache_read() {
            usage.input_tokens.saturating_sub(usage.cache_read_tokens)
        } else {
            usage.input_tokens
        };

        let million = 1_000_000.0;
        regular_input as f64 / million * price.input
            + usage.output_tokens as f64 / million * price.output
            + usage.cache_read_tokens as f64 / million * price.input * read_mult
            + usage.cache_write_tokens as f64 / million * price.input * write_mult
    }
}

/// Settings rows seeded on first run so costing works out of the box.
pub fn default_pricing_rows() -> Vec<(&'static str, &'static str)> {
    vec![
        ("pricing.anthropic.claude-opus.input", "15"),
        ("pricing.anthropic.claude-opus.output", "75"),
        ("pricing.anthropic.claude-sonnet.input", "3"),
        ("pricing.anthropic.claude-sonnet.output", "15"),
        ("pricing.anthropic.claude-haiku.input", "0.8"),
        ("pricing.anthropic.claude-haiku.output", "4"),
        ("pricing.anthropic.default.input", "3"),
        ("pricing.anthropic.default.output", "15"),
        ("pricing.anthropic.cache_read_multiplier", "0.1"),
        ("pricing.anthropic.cache_write_multiplier", "1.25"),
        ("pricing.openai.gpt-4o-mini.input", "0.15"),
        ("pricing.openai.gpt-4o-mini.output", "0.6"),
        ("pricing.openai.gpt-4o.input", "2.5"),
        ("pricing.openai.gpt-4o.output", "10"),
        ("pricing.openai.gpt-4.1.input", "2"),
        ("pricing.openai.gpt-4.1.output", "8"),
        ("pricing.openai.default.input", "2.5"),
        ("pricing.openai.default.output", "10"),
        ("pricing.openai.cache_read_multiplier", "0.1"),
        ("pricing.openai.cache_write_multiplier", "0"),
    ]
}

/// Cost engine: settings-backed pricing with a 60 s in-memory cache.
pub struct CostEngine {
    store: Arc<Store>,
    cached: Mutex<Option<(Instant, Arc<PricingTable>)>>,
}

impl CostEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    async fn table(&self) -> Result<Arc<PricingTable>, StoreError> {
        let mut guard = self.cached.lock().await;
        if let Some((loaded, table)) = guard.as_ref() {
            if loaded.elapsed() < PRICING_CACHE_TTL {
                return Ok(table.clone());
            }
        }
        let settings = self.store.settings_with_prefix("pricing.").await?;
        let table = Arc::new(PricingTable::from_settings(&settings));
        debug!(
            patterns = table.prices.len(),
            "pricing table loaded from settings"
        );
        *guard = Some((Instant::now(), table.clone()));
        Ok(table)
    }

    /// USD cost of one request. Local models always cost zero.
    pub async fn cost(
        &self,
        model: &str,
        usage: &TokenUsage,
        provider_hint: Option<&str>,
    ) -> Result<f64, StoreError> {
        let family = ProviderFamily::resolve(provider_hint, model);
        if family == ProviderFamily::Local {
            return Ok(0.0);
        }
        let table = self.table().await?;
        Ok(table.compute(family, model, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        let settings: HashMap<String, String> = default_pricing_rows()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PricingTable::from_settings(&settings)
    }

    fn usage(input: u64, output: u64, read: u64, write: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: read,
            cache_write_tokens: write,
        }
    }

    /// **Scenario**: colon-tagged models are local and never billed.
    #[test]
    fn local_models_cost_zero() {
        let family = ProviderFamily::resolve(None, "llama3:8b");
        assert_eq!(family, ProviderFamily::Local);
        assert_eq!(
            table().compute(family, "llama3:8b", &usage(1_000_000, 1_000_000, 0, 0)),
            0.0
        );
    }

    /// **Scenario**: the longest matching pattern wins over shorter ones.
    #[test]
    fn longest_pattern_first() {
        let t = table();
        // gpt-4o-mini must hit the mini row, not the gpt-4o row.
        let mini = t.compute(
            ProviderFamily::OpenAi,
            "gpt-4o-mini-2024",
            &usage(1_000_000, 0, 0, 0),
        );
        assert!((mini - 0.15).abs() < 1e-9);
        let full = t.compute(ProviderFamily::OpenAi, "gpt-4o", &usage(1_000_000, 0, 0, 0));
        assert!((full - 2.5).abs() < 1e-9);
    }

    /// **Scenario**: unmatched models fall back to the provider default row.
    #[test]
    fn default_fallback() {
        let t = table();
        let cost = t.compute(
            ProviderFamily::Anthropic,
            "claude-nova-1",
            &usage(1_000_000, 0, 0, 0),
        );
        assert!((cost - 3.0).abs() < 1e-9);
    }

    /// **Scenario**: the OpenAI family bills input minus cache reads plus the
    /// discounted cache-read rate; Anthropic bills input as reported plus
    /// read/write surcharges.
    #[test]
    fn cache_multiplier_semantics() {
        let t = table();
        // OpenAI: 1M input includes 400k cached. 600k at 2.5 + 400k at 0.25.
        let cost = t.compute(
            ProviderFamily::OpenAi,
            "gpt-4o",
            &usage(1_000_000, 0, 400_000, 0),
        );
        assert!((cost - (0.6 * 2.5 + 0.4 * 0.25)).abs() < 1e-9, "{cost}");

        // Anthropic: input already excludes reads; writes at 1.25x input price.
        let cost = t.compute(
            ProviderFamily::Anthropic,
            "claude-sonnet-4-5",
            &usage(600_000, 0, 400_000, 100_000),
        );
        let expected = 0.6 * 3.0 + 0.4 * 3.0 * 0.1 + 0.1 * 3.0 * 1.25;
        assert!((cost - expected).abs() < 1e-9, "{cost}");
    }

    /// **Scenario**: explicit hints override model-prefix inference.
    #[test]
    fn hint_overrides_prefix() {
        assert_eq!(
            ProviderFamily::resolve(Some("ollama"), "claude-sonnet-4-5"),
            ProviderFamily::Local
        );
        assert_eq!(
            ProviderFamily::resolve(None, "claude-sonnet-4-5"),
            ProviderFamily::Anthropic
        );
        assert_eq!(ProviderFamily::resolve(None, "o3-mini"), ProviderFamily::OpenAi);
    }
}
