//! Usage and cost accounting.
//!
//! `UsageTracker` consumes every settled [`GenerationResult`] and keeps
//! process-wide totals plus per-model and per-provider breakdowns.
//!
//! # Usage
//!
//! ```rust
//! use edgequake_orchestrator::usage::UsageTracker;
//!
//! let tracker = UsageTracker::new();
//! // orchestrator.submit(...) records into the tracker
//! let report = tracker.snapshot();
//! assert_eq!(report.total_requests, 0);
//! println!("{}", report);
//! ```
//!
//! Global counters are lock-free atomics. The breakdown maps sit behind a
//! short-held lock that [`UsageTracker::snapshot`] only reads.
//!
//! Cache hits count as requests and as `cache_hits`, but add no tokens or
//! cost: nothing was spent at the provider.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::traits::GenerationResult;

// ============================================================================
// Report types
// ============================================================================

/// Counters for one model or provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Settled requests, including cache hits and failures.
    pub requests: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Failed requests.
    pub errors: u64,
    /// Prompt tokens billed.
    pub prompt_tokens: u64,
    /// Completion tokens billed.
    pub completion_tokens: u64,
    /// Prompt plus completion tokens.
    pub total_tokens: u64,
    /// Estimated spend in USD.
    pub cost_usd: f64,
}

impl ModelUsage {
    fn record(&mut self, result: &GenerationResult) {
        self.requests += 1;
        if result.from_cache {
            self.cache_hits += 1;
            return;
        }
        if !result.is_success() {
            self.errors += 1;
        }
        self.prompt_tokens += result.token_usage.prompt_tokens;
        self.completion_tokens += result.token_usage.completion_tokens;
        self.total_tokens += result.token_usage.total_tokens;
        self.cost_usd += result.estimated_cost_usd;
    }
}

/// Immutable copy of the tracker state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// All settled requests.
    pub total_requests: u64,
    /// Prompt plus completion tokens over all provider calls.
    pub total_tokens: u64,
    /// Prompt tokens over all provider calls.
    pub prompt_tokens: u64,
    /// Completion tokens over all provider calls.
    pub completion_tokens: u64,
    /// Estimated spend in USD.
    pub total_cost_usd: f64,
    /// Failed requests.
    pub error_count: u64,
    /// Requests served from the cache.
    pub cache_hits: u64,
    /// Breakdown by model id.
    pub by_model: BTreeMap<String, ModelUsage>,
    /// Breakdown by provider id.
    pub by_provider: BTreeMap<String, ModelUsage>,
}

impl UsageReport {
    /// Average cost per request that reached a provider.
    pub fn avg_cost_per_call(&self) -> f64 {
        let calls = self.total_requests.saturating_sub(self.cache_hits);
        if calls == 0 {
            0.0
        } else {
            self.total_cost_usd / calls as f64
        }
    }

    /// Fraction of requests that failed.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_requests as f64
        }
    }

    /// Fraction of requests served from the cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} requests ({} cached, {} failed), {} tokens, {}",
            self.total_requests,
            self.cache_hits,
            self.error_count,
            format_tokens(self.total_tokens),
            format_cost(self.total_cost_usd)
        )?;
        for (model, usage) in &self.by_model {
            writeln!(
                f,
                "  {:<28} {:>5} req  {:>8} tok  {}",
                model,
                usage.requests,
                format_tokens(usage.total_tokens),
                format_cost(usage.cost_usd)
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Thread-safe accumulator of usage across all requests.
#[derive(Debug, Default)]
pub struct UsageTracker {
    total_requests: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    /// f64 bits.
    total_cost: AtomicU64,
    error_count: AtomicU64,
    cache_hits: AtomicU64,
    breakdown: RwLock<Breakdown>,
}

#[derive(Debug, Default)]
struct Breakdown {
    by_model: HashMap<String, ModelUsage>,
    by_provider: HashMap<String, ModelUsage>,
}

impl UsageTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one settled request.
    pub fn record(&self, result: &GenerationResult) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if result.from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            if !result.is_success() {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            let usage = result.token_usage;
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
            self.total_tokens
                .fetch_add(usage.total_tokens, Ordering::Relaxed);
            add_f64(&self.total_cost, result.estimated_cost_usd);
        }

        let mut breakdown = self
            .breakdown
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakdown
            .by_model
            .entry(result.model_id.clone())
            .or_default()
            .record(result);
        if !result.provider_id.is_empty() {
            breakdown
                .by_provider
                .entry(result.provider_id.clone())
                .or_default()
                .record(result);
        }
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> UsageReport {
        let (by_model, by_provider) = {
            let breakdown = self
                .breakdown
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                breakdown.by_model.clone().into_iter().collect(),
                breakdown.by_provider.clone().into_iter().collect(),
            )
        };

        UsageReport {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_cost_usd: f64::from_bits(self.total_cost.load(Ordering::Relaxed)),
            error_count: self.error_count.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            by_model,
            by_provider,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        let mut breakdown = self
            .breakdown
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakdown.by_model.clear();
        breakdown.by_provider.clear();
        for counter in [
            &self.total_requests,
            &self.prompt_tokens,
            &self.completion_tokens,
            &self.total_tokens,
            &self.total_cost,
            &self.error_count,
            &self.cache_hits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn add_f64(cell: &AtomicU64, delta: f64) {
    if delta == 0.0 {
        return;
    }
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + delta).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Format cost in a human-readable way.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.4}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}

/// Format token count with K/M suffixes.
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{}", tokens)
    }
}
