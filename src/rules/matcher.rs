//! Rule evaluation

use super::{NormalizedText, Rule, RuleSet};

/// Resolves free-form text to a response using a fixed `RuleSet`
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    rules: RuleSet,
}

impl RuleMatcher {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// First rule, in evaluation order, whose keywords all occur in the input
    pub fn find(&self, input: &str) -> Option<&Rule> {
        let text = NormalizedText::new(input);
        if text.is_blank() {
            return None;
        }
        self.rules.rules().iter().find(|rule| rule.matches(&text))
    }

    /// Response for the input, or the fallback when no rule matches.
    ///
    /// Total and pure: the same input always yields the same response.
    pub fn resolve(&self, input: &str) -> &str {
        self.find(input)
            .map_or(self.rules.fallback_response(), Rule::response)
    }

    #[cfg(test)]
    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }
}
