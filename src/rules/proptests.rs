//! Property-based tests for rule matching

use super::*;
use proptest::prelude::*;

fn arb_keyword() -> impl Strategy<Value = String> {
    "[a-z]{2,6}"
}

fn arb_rule() -> impl Strategy<Value = Rule> {
    (
        proptest::collection::vec(arb_keyword(), 1..4),
        "[A-Za-z ]{1,20}[a-z]",
        -2i32..3,
    )
        .prop_map(|(keywords, response, priority)| {
            Rule::new(keywords, response).with_priority(priority)
        })
}

fn arb_rule_set() -> impl Strategy<Value = RuleSet> {
    proptest::collection::vec(arb_rule(), 0..6)
        .prop_map(|rules| RuleSet::new(rules, "fallback").unwrap())
}

proptest! {
    /// resolve never returns an empty response and always returns either
    /// some rule's response or the fallback
    #[test]
    fn prop_resolve_is_total(rules in arb_rule_set(), input in ".{0,40}") {
        let matcher = RuleMatcher::new(rules);
        let reply = matcher.resolve(&input);
        prop_assert!(!reply.is_empty());
        let known = reply == matcher.rule_set().fallback_response()
            || matcher.rule_set().rules().iter().any(|r| r.response() == reply);
        prop_assert!(known);
    }

    /// Whitespace-only input always resolves to the fallback
    #[test]
    fn prop_blank_input_falls_back(rules in arb_rule_set(), input in "[ \t\n]{0,10}") {
        let matcher = RuleMatcher::new(rules);
        prop_assert_eq!(matcher.resolve(&input), "fallback");
    }

    /// An input built from a rule's keywords resolves to that rule unless an
    /// earlier rule in evaluation order also matches
    #[test]
    fn prop_first_full_match_wins(
        rules in arb_rule_set(),
        pick in any::<prop::sample::Index>(),
        noise in "[0-9 ]{0,5}",
    ) {
        prop_assume!(!rules.is_empty());
        let idx = pick.index(rules.len());
        let target = &rules.rules()[idx];
        let input = format!("{noise}{}{noise}", target.keywords().join(" ").to_uppercase());
        let text = NormalizedText::new(&input);

        let matcher = RuleMatcher::new(rules.clone());
        let first = rules.rules().iter().position(|r| r.matches(&text));
        prop_assert!(first.is_some_and(|f| f <= idx));
        prop_assert_eq!(matcher.resolve(&input), rules.rules()[first.unwrap()].response());
    }

    /// Case never affects the outcome
    #[test]
    fn prop_case_insensitive(rules in arb_rule_set(), input in "[a-zA-Z ]{0,30}") {
        let matcher = RuleMatcher::new(rules);
        prop_assert_eq!(
            matcher.resolve(&input.to_uppercase()),
            matcher.resolve(&input.to_lowercase())
        );
    }
}
