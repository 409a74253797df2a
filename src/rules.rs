//! Keyword rules for intent resolution
//!
//! A rule pairs a set of required keywords with a fixed response. A
//! `RuleSet` is the ordered, validated collection of rules plus the
//! fallback used when nothing matches.

mod catalog;
mod matcher;
mod normalize;

#[cfg(test)]
mod proptests;

#[allow(unused_imports)] // Public API re-exports
pub use catalog::{RuleCatalog, RuleConfig, RuleSetConfig};
pub use matcher::RuleMatcher;
pub use normalize::NormalizedText;

use thiserror::Error;

/// Errors raised while building a rule set
#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("Rule set has no fallback response")]
    MissingFallback,
    #[error("Rule {index} has no keywords")]
    NoKeywords { index: usize },
    #[error("Rule {index} has a blank keyword")]
    BlankKeyword { index: usize },
    #[error("Rule {index} has a blank response")]
    BlankResponse { index: usize },
    #[error("Failed to read rule catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse rule catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A single keyword-conjunction rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    keywords: Vec<String>,
    response: String,
    priority: i32,
}

impl Rule {
    pub fn new<I, S>(keywords: I, response: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .collect(),
            response: response.into(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    /// True when every keyword occurs somewhere in the text
    pub fn matches(&self, text: &NormalizedText) -> bool {
        self.keywords.iter().all(|k| text.contains(k))
    }

    fn validate(&self, index: usize) -> Result<(), RuleSetError> {
        if self.keywords.is_empty() {
            return Err(RuleSetError::NoKeywords { index });
        }
        if self.keywords.iter().any(String::is_empty) {
            return Err(RuleSetError::BlankKeyword { index });
        }
        if self.response.trim().is_empty() {
            return Err(RuleSetError::BlankResponse { index });
        }
        Ok(())
    }
}

/// Validated rules in evaluation order, plus the fallback response
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    fallback_response: String,
}

impl RuleSet {
    /// Validate and order the rules.
    ///
    /// Rules are evaluated by descending priority; equal priorities keep
    /// declaration order (the sort is stable).
    pub fn new(
        mut rules: Vec<Rule>,
        fallback_response: impl Into<String>,
    ) -> Result<Self, RuleSetError> {
        let fallback_response = fallback_response.into();
        if fallback_response.trim().is_empty() {
            return Err(RuleSetError::MissingFallback);
        }
        for (index, rule) in rules.iter().enumerate() {
            rule.validate(index)?;
        }
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        Ok(Self {
            rules,
            fallback_response,
        })
    }

    #[cfg(test)]
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn fallback_response(&self) -> &str {
        &self.fallback_response
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Fluent construction of a `RuleSet`
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    rules: Vec<Rule>,
    fallback_response: Option<String>,
}

#[cfg(test)]
impl RuleSetBuilder {
    #[must_use]
    pub fn rule<I, S>(mut self, keywords: I, response: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules.push(Rule::new(keywords, response));
        self
    }

    #[must_use]
    pub fn fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback_response = Some(response.into());
        self
    }

    pub fn build(self) -> Result<RuleSet, RuleSetError> {
        let fallback = self.fallback_response.ok_or(RuleSetError::MissingFallback)?;
        RuleSet::new(self.rules, fallback)
    }
}
