//! Topic-exchange routing rules.
//!
//! Routing keys are `.`-delimited words (`task.checkout.completed`). A binding
//! pattern uses the same syntax plus two wildcards:
//!
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! ```
//! use tasksync_core::routing::RoutingPattern;
//!
//! let pattern = RoutingPattern::new("task.checkout.#");
//! assert!(pattern.matches("task.checkout.completed"));
//! assert!(pattern.matches("task.checkout"));
//! assert!(!pattern.matches("task.created"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing key of checkout completion events.
pub const CHECKOUT_COMPLETED: &str = "task.checkout.completed";

/// Binding pattern used by every checkout consumer.
pub const CHECKOUT_ALL: &str = "task.checkout.#";

/// A binding pattern for a topic exchange.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingPattern(String);

impl RoutingPattern {
    /// Wrap a pattern string.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `routing_key` is routed to a queue bound with this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&pattern, &key)
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}
