//! Exploration context: what has been gathered and what it cost.
//!
//! Costs are estimated as `items x average tokens per item`. The estimate is
//! a soft guardrail for the generation step that follows, not billing.

use clinscribe_core::error::BudgetExceeded;
use serde::Serialize;

/// Items gathered at or above this count, together with
/// [`SUFFICIENT_BUDGET_PERCENT`] of the budget used, are usually enough.
pub const SUFFICIENT_ITEMS: usize = 50;
pub const SUFFICIENT_BUDGET_PERCENT: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ExplorationContext {
    items: Vec<serde_json::Value>,
    tokens_used: usize,
    budget: usize,
    avg_tokens_per_item: usize,
    /// Sources that contributed items, in the order first explored
    explored: Vec<String>,
}

/// Snapshot reported by `check_budget` and returned with the items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub items: usize,
    pub tokens_used: usize,
    pub tokens_remaining: usize,
    pub budget: usize,
    pub percent_used: f64,
    pub sources_explored: Vec<String>,
    pub sufficient: bool,
}

impl ExplorationContext {
    pub fn new(budget: usize, avg_tokens_per_item: usize) -> Self {
        Self {
            items: Vec::new(),
            tokens_used: 0,
            budget,
            avg_tokens_per_item: avg_tokens_per_item.max(1),
            explored: Vec::new(),
        }
    }

    pub fn estimate(&self, item_count: usize) -> usize {
        item_count.saturating_mul(self.avg_tokens_per_item)
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.tokens_used)
    }

    /// Items that still fit in the budget.
    pub fn affordable_items(&self) -> usize {
        self.remaining() / self.avg_tokens_per_item
    }

    /// Add every item or none.
    ///
    /// On refusal the context is untouched.
    pub fn try_accumulate(&mut self, source_id: &str, items: Vec<serde_json::Value>) -> Result<usize, BudgetExceeded> {
        let requested = self.estimate(items.len());
        if requested > self.remaining() {
            return Err(BudgetExceeded {
                requested,
                used: self.tokens_used,
                budget: self.budget,
            });
        }
        Ok(self.add(source_id, items))
    }

    /// Add as many items as fit, in order. Returns how many were added.
    pub fn accumulate_within_budget(&mut self, source_id: &str, mut items: Vec<serde_json::Value>) -> usize {
        items.truncate(self.affordable_items());
        self.add(source_id, items)
    }

    fn add(&mut self, source_id: &str, items: Vec<serde_json::Value>) -> usize {
        let count = items.len();
        if count == 0 {
            return 0;
        }
        self.tokens_used += self.estimate(count);
        self.items.extend(items);
        if !self.explored.iter().any(|s| s == source_id) {
            self.explored.push(source_id.to_string());
        }
        count
    }

    pub fn items(&self) -> &[serde_json::Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<serde_json::Value> {
        self.items
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    pub fn explored_sources(&self) -> &[String] {
        &self.explored
    }

    pub fn percent_used(&self) -> f64 {
        if self.budget == 0 {
            return 100.0;
        }
        self.tokens_used as f64 * 100.0 / self.budget as f64
    }

    pub fn usage(&self) -> BudgetUsage {
        let percent_used = self.percent_used();
        BudgetUsage {
            items: self.items.len(),
            tokens_used: self.tokens_used,
            tokens_remaining: self.remaining(),
            budget: self.budget,
            percent_used,
            sources_explored: self.explored.clone(),
            sufficient: self.items.len() >= SUFFICIENT_ITEMS && percent_used >= SUFFICIENT_BUDGET_PERCENT,
        }
    }
}
