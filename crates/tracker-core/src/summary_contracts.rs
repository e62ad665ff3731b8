use crate::period::PeriodKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mutually exclusive authentication outcome counts for one domain and period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTotals {
    #[serde(default)]
    pub pass: u64,
    #[serde(default)]
    pub fail: u64,
    #[serde(default)]
    pub pass_dkim_only: u64,
    #[serde(default)]
    pub pass_spf_only: u64,
}

impl CategoryTotals {
    pub fn new(pass: u64, fail: u64, pass_dkim_only: u64, pass_spf_only: u64) -> Self {
        Self {
            pass,
            fail,
            pass_dkim_only,
            pass_spf_only,
        }
    }

    pub fn total_messages(&self) -> u64 {
        self.pass
            .saturating_add(self.fail)
            .saturating_add(self.pass_dkim_only)
            .saturating_add(self.pass_spf_only)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPercentages {
    pub pass: f64,
    pub fail: f64,
    pub pass_dkim_only: f64,
    pub pass_spf_only: f64,
}

/// Total message count and per-category percentages, one decimal, half-up.
/// A zero total yields all-zero percentages.
pub fn derive(totals: &CategoryTotals) -> (u64, CategoryPercentages) {
    let total = totals.total_messages();
    let percentages = CategoryPercentages {
        pass: percent_of(totals.pass, total),
        fail: percent_of(totals.fail, total),
        pass_dkim_only: percent_of(totals.pass_dkim_only, total),
        pass_spf_only: percent_of(totals.pass_spf_only, total),
    };
    (total, percentages)
}

// Integer arithmetic in tenths of a percent keeps half-up rounding exact.
fn percent_of(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let numerator = u128::from(count) * 2_000 + u128::from(total);
    let tenths = numerator / (2 * u128::from(total));
    tenths as f64 / 10.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub domain_key: String,
    pub start_date: PeriodKey,
    pub category_totals: CategoryTotals,
    pub category_percentages: CategoryPercentages,
    pub total_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("aggregate source error: {message}")]
pub struct SourceError {
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Read side of the rollup: aggregated counts per period, and the periods a
/// domain is currently summarized for.
pub trait AggregateSource {
    /// Missing data is not an error and yields zero totals.
    fn counts_for(&self, domain: &str, period: &PeriodKey) -> Result<CategoryTotals, SourceError>;

    fn known_periods(&self, domain_key: &str) -> Result<Vec<PeriodKey>, SourceError>;
}
