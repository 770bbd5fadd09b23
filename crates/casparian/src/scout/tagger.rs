//! Tag resolution (§4.2 "Tagging"): RoutingRules are evaluated in
//! priority-descending order (ties broken by rule id ascending — already the
//! order `CasparianDb::list_routing_rules` returns them in); every matching
//! rule contributes its tag, not just the first.

use super::error::{Result, ScoutError};
use casparian_db::RoutingRule;
use globset::{Glob, GlobMatcher};

struct CompiledRule {
    tag: String,
    matcher: GlobMatcher,
}

pub struct Tagger {
    rules: Vec<CompiledRule>,
}

impl Tagger {
    /// `rules` must already be priority-ordered (as returned by
    /// `list_routing_rules`); this does not re-sort them.
    pub fn new(rules: &[RoutingRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = Glob::new(&rule.pattern)
                .map_err(|e| ScoutError::Pattern(rule.pattern.clone(), e.to_string()))?
                .compile_matcher();
            compiled.push(CompiledRule { tag: rule.tag.clone(), matcher });
        }
        Ok(Self { rules: compiled })
    }

    /// The deterministic tag set for `rel_path`: every rule whose pattern
    /// matches contributes its tag, in rule order, deduplicated.
    pub fn tags_for(&self, rel_path: &str) -> Vec<String> {
        let mut tags = Vec::new();
        for rule in &self.rules {
            if rule.matcher.is_match(rel_path) && !tags.contains(&rule.tag) {
                tags.push(rule.tag.clone());
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, pattern: &str, tag: &str, priority: i64) -> RoutingRule {
        RoutingRule { id, pattern: pattern.to_string(), tag: tag.to_string(), priority }
    }

    #[test]
    fn all_matching_rules_contribute_tags() {
        let rules = vec![rule(1, "*.csv", "csv", 10), rule(2, "nightly/*", "nightly", 5)];
        let tagger = Tagger::new(&rules).unwrap();
        let tags = tagger.tags_for("nightly/data.csv");
        assert_eq!(tags, vec!["csv".to_string(), "nightly".to_string()]);
    }

    #[test]
    fn no_match_yields_empty_tag_set() {
        let rules = vec![rule(1, "*.csv", "csv", 10)];
        let tagger = Tagger::new(&rules).unwrap();
        assert!(tagger.tags_for("data.json").is_empty());
    }

    #[test]
    fn duplicate_tags_from_different_rules_are_deduplicated() {
        let rules = vec![rule(1, "exports/*.csv", "csv", 20), rule(2, "*.csv", "csv", 10)];
        let tagger = Tagger::new(&rules).unwrap();
        assert_eq!(tagger.tags_for("exports/a.csv"), vec!["csv".to_string()]);
    }

    #[test]
    fn invalid_pattern_is_rejected_at_construction() {
        let rules = vec![rule(1, "[unterminated", "tag", 1)];
        assert!(Tagger::new(&rules).is_err());
    }
}
