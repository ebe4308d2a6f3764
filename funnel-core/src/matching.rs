use std::borrow::Cow;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::definition::{Condition, Field, FunnelDefinition, Operator, StepDefinition};
use crate::hit::Hit;

#[derive(Debug, Clone)]
enum Pattern {
    // Already case-folded and query-stripped as the condition asks
    Literal(String),
    // None when the pattern failed to compile; such a condition never matches
    Regex(Option<Regex>),
}

/// A condition prepared for repeated evaluation.
#[derive(Debug, Clone)]
pub struct ConditionMatcher {
    field: Field,
    operator: Operator,
    case_sensitive: bool,
    strip_query: bool,
    pattern: Pattern,
}

impl ConditionMatcher {
    pub fn new(condition: &Condition) -> Self {
        let strip_query = condition.field == Field::Url && condition.ignore_query_params;

        let pattern = if condition.operator == Operator::Regex {
            // The pattern is not query-stripped: `?` is a quantifier here
            let compiled = RegexBuilder::new(&condition.pattern)
                .case_insensitive(!condition.case_sensitive)
                .build();
            match compiled {
                Ok(regex) => Pattern::Regex(Some(regex)),
                Err(e) => {
                    warn!(pattern = %condition.pattern, "invalid regex in funnel condition: {}", e);
                    Pattern::Regex(None)
                }
            }
        } else {
            let mut literal: &str = &condition.pattern;
            if strip_query {
                literal = strip_query_string(literal);
            }
            Pattern::Literal(fold_case(literal, condition.case_sensitive).into_owned())
        };

        Self {
            field: condition.field,
            operator: condition.operator,
            case_sensitive: condition.case_sensitive,
            strip_query,
            pattern,
        }
    }

    pub fn matches(&self, hit: &Hit) -> bool {
        let raw = hit.field(self.field);
        let value: &str = if self.strip_query {
            strip_query_string(&raw)
        } else {
            &raw
        };

        match &self.pattern {
            Pattern::Regex(Some(regex)) => regex.is_match(value),
            Pattern::Regex(None) => false,
            Pattern::Literal(pattern) => self
                .operator
                .test_literal(&fold_case(value, self.case_sensitive), pattern),
        }
    }
}

fn strip_query_string(value: &str) -> &str {
    value.split('?').next().unwrap_or_default()
}

fn fold_case(value: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(value.to_lowercase())
    }
}

/// Matches hits against one step: true if any condition matches.
#[derive(Debug, Clone)]
pub struct StepMatcher {
    required: bool,
    conditions: Vec<ConditionMatcher>,
}

impl StepMatcher {
    pub fn new(step: &StepDefinition) -> Self {
        Self {
            required: step.required,
            conditions: step.conditions.iter().map(ConditionMatcher::new).collect(),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// A step without conditions never matches.
    pub fn matches(&self, hit: &Hit) -> bool {
        self.conditions.iter().any(|condition| condition.matches(hit))
    }
}

/// One-off evaluation of a step against a hit. Prefer a [`StepMatcher`]
/// (or a [`CompiledFunnel`]) when the same step is tested repeatedly.
pub fn match_step(step: &StepDefinition, hit: &Hit) -> bool {
    StepMatcher::new(step).matches(hit)
}

/// A funnel definition with every step's conditions compiled.
#[derive(Debug, Clone)]
pub struct CompiledFunnel {
    definition: FunnelDefinition,
    steps: Vec<StepMatcher>,
}

impl CompiledFunnel {
    pub fn compile(definition: FunnelDefinition) -> Self {
        let steps = definition.steps.iter().map(StepMatcher::new).collect();
        Self { definition, steps }
    }

    pub fn definition(&self) -> &FunnelDefinition {
        &self.definition
    }

    pub fn id(&self) -> i64 {
        self.definition.id
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The first step at or after `from` that matches `hit`, scanning left
    /// to right. An unmatched required step ends the scan: a hit can't reach
    /// past it. Earlier steps win when a hit matches several.
    pub fn first_match(&self, from: usize, hit: &Hit) -> Option<usize> {
        for (index, step) in self.steps.iter().enumerate().skip(from) {
            if step.matches(hit) {
                return Some(index);
            }
            if step.is_required() {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn url(pattern: &str, operator: Operator) -> Condition {
        Condition::new(Field::Url, operator, pattern)
    }

    fn matches(condition: Condition, hit: &Hit) -> bool {
        ConditionMatcher::new(&condition).matches(hit)
    }

    #[test_case(Operator::Equals, "/Cart", "/cart", true ; "equals folds case")]
    #[test_case(Operator::NotEquals, "/cart", "/cart", false ; "not equals")]
    #[test_case(Operator::Contains, "CART", "/shop/cart/1", true ; "contains folds case")]
    #[test_case(Operator::NotContains, "basket", "/shop/cart/1", true ; "not contains")]
    #[test_case(Operator::StartsWith, "/shop", "/shop/cart", true ; "starts with")]
    #[test_case(Operator::NotStartsWith, "/shop", "/shop/cart", false ; "not starts with")]
    #[test_case(Operator::EndsWith, "/cart", "/shop/cart", true ; "ends with")]
    #[test_case(Operator::NotEndsWith, "/cart", "/shop/cart", false ; "not ends with")]
    #[test_case(Operator::Regex, r"^/shop/\w+/\d+$", "/shop/cart/12", true ; "regex")]
    #[test_case(Operator::Regex, r"cart/\d", "/shop/CART/1", true ; "regex folds case")]
    #[test_case(Operator::Regex, "checkout", "/shop/cart", false ; "regex no match")]
    fn operators(operator: Operator, pattern: &str, value: &str, expected: bool) {
        assert_eq!(matches(url(pattern, operator), &Hit::page_view(value)), expected);
    }

    #[test_case(Operator::Contains)]
    #[test_case(Operator::Equals)]
    fn case_sensitivity(operator: Operator) {
        let hit = Hit::page_view("/Checkout/Done");
        let pattern = "/checkout/done";

        assert!(matches(url(pattern, operator), &hit));
        assert!(!matches(url(pattern, operator).case_sensitive(), &hit));
    }

    #[test]
    fn case_sensitive_regex() {
        let hit = Hit::page_view("/Checkout");
        assert!(!matches(url("checkout", Operator::Regex).case_sensitive(), &hit));
        assert!(matches(url("Checkout", Operator::Regex).case_sensitive(), &hit));
    }

    #[test]
    fn ignore_query_params() {
        let hit = Hit::page_view("http://x/y?a=1");

        assert!(matches(url("http://x/y", Operator::Equals).ignoring_query_params(), &hit));
        assert!(!matches(url("http://x/y", Operator::Equals), &hit));
        // stripping applies to the pattern as well
        assert!(matches(
            url("http://x/y?b=2", Operator::Equals).ignoring_query_params(),
            &hit
        ));
        // and keeps the chosen operator
        assert!(matches(url("x/y", Operator::EndsWith).ignoring_query_params(), &hit));
        assert!(!matches(url("x/y", Operator::EndsWith), &hit));
    }

    #[test]
    fn ignore_query_params_only_applies_to_url() {
        let hit = Hit {
            page_title: Some("Results?page=2".to_string()),
            ..Default::default()
        };
        let condition =
            Condition::new(Field::PageTitle, Operator::Equals, "Results").ignoring_query_params();

        assert!(!matches(condition, &hit));
    }

    #[test]
    fn regex_with_ignored_query_keeps_quantifiers() {
        let hit = Hit::page_view("/products?id=3");
        let condition = url("^/products?$", Operator::Regex).ignoring_query_params();
        assert!(matches(condition, &hit));
    }

    #[test_case("(unclosed" ; "open group")]
    #[test_case("[a-" ; "open class")]
    #[test_case("*leading" ; "dangling repetition")]
    #[test_case(r"\p{NotAClass}" ; "unknown class")]
    fn invalid_regex_never_matches(pattern: &str) {
        let matcher = ConditionMatcher::new(&url(pattern, Operator::Regex));
        for value in ["", "(unclosed", "[a-", "*leading", "/anything"] {
            assert!(!matcher.matches(&Hit::page_view(value)));
        }
    }

    #[test]
    fn missing_field_reads_empty() {
        let hit = Hit::event("video", "play");

        assert!(!matches(url("/", Operator::Contains), &hit));
        assert!(matches(url("/", Operator::NotContains), &hit));
        assert!(matches(url("", Operator::Equals), &hit));
    }

    #[test_case(0, false)]
    #[test_case(1, true)]
    #[test_case(2, true)]
    #[test_case(3, true)]
    #[test_case(5, true)]
    fn conditions_are_or_combined(count: usize, expected: bool) {
        // only the last condition can match
        let mut conditions: Vec<Condition> = (1..count)
            .map(|i| url(&format!("/nope-{i}"), Operator::Equals))
            .collect();
        if count > 0 {
            conditions.push(url("/yes", Operator::Equals));
        }
        let step = StepDefinition::new("step", conditions);

        assert_eq!(match_step(&step, &Hit::page_view("/yes")), expected);
    }

    #[test]
    fn no_condition_matching_means_no_match() {
        let step = StepDefinition::new(
            "step",
            vec![url("/a", Operator::Equals), url("/b", Operator::Equals)],
        );
        assert!(!match_step(&step, &Hit::page_view("/c")));
    }

    fn funnel(steps: Vec<StepDefinition>) -> CompiledFunnel {
        CompiledFunnel::compile(FunnelDefinition::new(1, 1, steps))
    }

    fn step(path: &str) -> StepDefinition {
        StepDefinition::new(path, vec![url(path, Operator::Contains)])
    }

    #[test]
    fn first_match_prefers_earliest_step() {
        let funnel = funnel(vec![step("/a"), step("/a/b"), step("/c")]);

        assert_eq!(funnel.first_match(0, &Hit::page_view("/a/b")), Some(0));
        assert_eq!(funnel.first_match(1, &Hit::page_view("/a/b")), Some(1));
        assert_eq!(funnel.first_match(0, &Hit::page_view("/c")), Some(2));
        assert_eq!(funnel.first_match(0, &Hit::page_view("/z")), None);
    }

    #[test]
    fn first_match_stops_at_unmatched_required_step() {
        let funnel = funnel(vec![step("/a"), step("/b").required(), step("/c")]);

        assert_eq!(funnel.first_match(0, &Hit::page_view("/c")), None);
        assert_eq!(funnel.first_match(0, &Hit::page_view("/b")), Some(1));
        assert_eq!(funnel.first_match(2, &Hit::page_view("/c")), Some(2));
    }
}
