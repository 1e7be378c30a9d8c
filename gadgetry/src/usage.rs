//! Token usage tracking for LLM calls.
//!
//! Usage accumulates across iterations and subtrees; partial usage observed
//! before a provider error is still recorded.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage reported by an LLM adapter for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the input/prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,

    /// Tokens in the output/completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,

    /// Total tokens (input + output).
    #[serde(default)]
    pub total_tokens: u64,

    /// Input tokens served from a prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,

    /// Input tokens written to a prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cached_tokens: None,
            cache_creation_tokens: None,
        }
    }

    /// Set the cached-token count.
    #[must_use]
    pub const fn with_cached(mut self, cached: u64) -> Self {
        self.cached_tokens = Some(cached);
        self
    }

    /// Returns `true` if every field is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let opt_sum = |a: Option<u64>, b: Option<u64>| match (a, b) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
            cached_tokens: opt_sum(self.cached_tokens, rhs.cached_tokens),
            cache_creation_tokens: opt_sum(self.cache_creation_tokens, rhs.cache_creation_tokens),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Aggregated token totals for a subtree, as returned by
/// [`crate::tree::ExecutionTree::subtree_tokens`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    /// Total input tokens.
    pub input: u64,
    /// Total output tokens.
    pub output: u64,
    /// Total cached input tokens.
    pub cached: u64,
}

impl TokenTotals {
    /// Fold one usage record into the totals.
    pub fn absorb(&mut self, usage: &Usage) {
        self.input += usage.input_tokens;
        self.output += usage.output_tokens;
        self.cached += usage.cached_tokens.unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sums_all_fields() {
        let a = Usage::new(10, 5).with_cached(3);
        let b = Usage::new(1, 2);
        let sum = a + b;
        assert_eq!(sum.input_tokens, 11);
        assert_eq!(sum.output_tokens, 7);
        assert_eq!(sum.total_tokens, 18);
        assert_eq!(sum.cached_tokens, Some(3));
    }

    #[test]
    fn totals_absorb_treats_missing_cached_as_zero() {
        let mut totals = TokenTotals::default();
        totals.absorb(&Usage::new(4, 4));
        totals.absorb(&Usage::new(1, 1).with_cached(2));
        assert_eq!(totals.input, 5);
        assert_eq!(totals.output, 5);
        assert_eq!(totals.cached, 2);
    }
}
