//! Case selection patterns
//!
//! Patterns are dotted case ids where `*` stands for any run of characters,
//! so `9.*` selects every case in family 9 and `12.1.1*` selects 12.1.1,
//! 12.1.10 through 12.1.18. A pattern without `*` is a literal case id.
//! Agent patterns in exclusion rules use the same `*` syntax against the
//! testee's agent string. All matching is anchored at both ends.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::case_id::CaseId;
use crate::catalog::CaseCatalog;
use crate::error::{ConfigurationError, ConfigurationErrors, Result};

/// Anchored glob match where `*` matches any (possibly empty) run
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    // position of the last `*` and the text index it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, absorbed)) = backtrack {
            pi = star + 1;
            ti = absorbed + 1;
            backtrack = Some((star, absorbed + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// A parsed case selection pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasePattern {
    Literal(CaseId),
    Wildcard(String),
}

impl CasePattern {
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidPattern(raw.to_string());
        if raw.is_empty() {
            return Err(invalid());
        }
        if !raw.contains('*') {
            return raw.parse::<CaseId>().map(CasePattern::Literal);
        }
        let well_formed = raw.split('.').all(|segment| {
            !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit() || b == b'*')
        });
        if well_formed {
            Ok(CasePattern::Wildcard(raw.to_string()))
        } else {
            Err(invalid())
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, CasePattern::Wildcard(_))
    }

    pub fn matches(&self, id: &CaseId) -> bool {
        match self {
            CasePattern::Literal(literal) => literal == id,
            CasePattern::Wildcard(glob) => glob_match(glob, &id.to_string()),
        }
    }
}

impl fmt::Display for CasePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CasePattern::Literal(id) => write!(f, "{}", id),
            CasePattern::Wildcard(glob) => f.write_str(glob),
        }
    }
}

/// Cases excluded for agents matching a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExclusion {
    pub agent: String,
    pub cases: Vec<CasePattern>,
}

impl AgentExclusion {
    pub fn applies_to(&self, agent: &str) -> bool {
        glob_match(&self.agent, agent)
    }
}

/// Is `id` excluded for `agent` by any of `rules`?
pub fn is_excluded_for_agent(rules: &[AgentExclusion], agent: &str, id: &CaseId) -> bool {
    rules
        .iter()
        .any(|rule| rule.applies_to(agent) && rule.cases.iter().any(|p| p.matches(id)))
}

/// Expands patterns against one catalog
#[derive(Debug, Clone, Copy)]
pub struct PatternResolver<'a> {
    catalog: &'a CaseCatalog,
}

impl<'a> PatternResolver<'a> {
    pub fn new(catalog: &'a CaseCatalog) -> Self {
        Self { catalog }
    }

    fn expand_into(
        &self,
        raw: &str,
        out: &mut BTreeSet<CaseId>,
        errors: &mut Vec<ConfigurationError>,
    ) {
        match CasePattern::parse(raw) {
            Ok(CasePattern::Literal(id)) => {
                if self.catalog.contains(&id) {
                    out.insert(id);
                } else {
                    errors.push(ConfigurationError::UnknownCase(raw.to_string()));
                }
            }
            Ok(pattern) => {
                out.extend(self.catalog.ids().filter(|id| pattern.matches(id)).cloned());
            }
            Err(e) => errors.push(e),
        }
    }

    fn expand<S: AsRef<str>>(&self, patterns: &[S]) -> Result<BTreeSet<CaseId>> {
        let mut out = BTreeSet::new();
        let mut errors = Vec::new();
        for raw in patterns {
            self.expand_into(raw.as_ref(), &mut out, &mut errors);
        }
        ConfigurationErrors::check(errors)?;
        Ok(out)
    }

    /// Case ids selected by `patterns`, deduplicated and numerically sorted
    pub fn resolve<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<CaseId>> {
        Ok(self.expand(patterns)?.into_iter().collect())
    }

    /// Case ids removed by `patterns`
    pub fn resolve_excludes<S: AsRef<str>>(&self, patterns: &[S]) -> Result<BTreeSet<CaseId>> {
        self.expand(patterns)
    }

    /// Parse per-agent exclusion rules
    pub fn resolve_agent_excludes(
        &self,
        rules: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<AgentExclusion>> {
        let mut errors = Vec::new();
        let mut out = Vec::with_capacity(rules.len());
        for (agent, patterns) in rules {
            let mut cases = Vec::with_capacity(patterns.len());
            for raw in patterns {
                match CasePattern::parse(raw) {
                    Ok(CasePattern::Literal(id)) if !self.catalog.contains(&id) => {
                        errors.push(ConfigurationError::UnknownCase(raw.clone()))
                    }
                    Ok(pattern) => cases.push(pattern),
                    Err(e) => errors.push(e),
                }
            }
            out.push(AgentExclusion {
                agent: agent.clone(),
                cases,
            });
        }
        ConfigurationErrors::check(errors)?;
        Ok(out)
    }

    /// The ordered list of cases `agent` runs
    pub fn resolve_for_agent<S: AsRef<str>>(
        &self,
        include: &[S],
        exclude: &[S],
        agent_rules: &[AgentExclusion],
        agent: &str,
    ) -> Result<Vec<CaseId>> {
        let mut errors = Vec::new();
        let mut included = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        for raw in include {
            self.expand_into(raw.as_ref(), &mut included, &mut errors);
        }
        for raw in exclude {
            self.expand_into(raw.as_ref(), &mut excluded, &mut errors);
        }
        ConfigurationErrors::check(errors)?;

        Ok(included
            .difference(&excluded)
            .filter(|id| !is_excluded_for_agent(agent_rules, agent, id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CaseCatalog;
    use crate::error::Error;
    use proptest::prelude::*;

    fn catalog() -> CaseCatalog {
        CaseCatalog::standard().unwrap()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "9.1.2"));
        assert!(glob_match("9.*", "9.1.2"));
        assert!(!glob_match("9.*", "19.1.2"));
        assert!(glob_match("12.1.1*", "12.1.18"));
        assert!(glob_match("12.1.1*", "12.1.1"));
        assert!(!glob_match("12.1.1*", "12.1.2"));
        assert!(glob_match("*.1", "9.1"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("AutobahnPython*", "AutobahnPython/0.6.0"));
        assert!(!glob_match("Autobahn", "AutobahnPython"));
    }

    #[test]
    fn test_pattern_parse() {
        assert!(matches!(CasePattern::parse("9.1.2"), Ok(CasePattern::Literal(_))));
        assert!(CasePattern::parse("9.*").unwrap().is_wildcard());
        assert!(CasePattern::parse("*").unwrap().is_wildcard());
        for bad in ["", "9..1", "9.a", "9.*x", ".9"] {
            assert_eq!(
                CasePattern::parse(bad),
                Err(ConfigurationError::InvalidPattern(bad.to_string())),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_resolve_sorts_numerically() {
        let c = catalog();
        let ids = PatternResolver::new(&c).resolve(&["9.7.*", "9.1.1"]).unwrap();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered[0], "9.1.1");
        assert_eq!(rendered[1], "9.7.1");
        assert_eq!(rendered.last().unwrap(), "9.7.6");

        let ids = PatternResolver::new(&c).resolve(&["6.2*"]).unwrap();
        let pos = |s: &str| ids.iter().position(|id| id.to_string() == s).unwrap();
        assert!(pos("6.2.4") < pos("6.20.1"));
    }

    #[test]
    fn test_overlapping_patterns_deduplicate() {
        let c = catalog();
        let r = PatternResolver::new(&c);
        let once = r.resolve(&["1.*"]).unwrap();
        let twice = r.resolve(&["1.*", "1.1.*", "1.2.3"]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_and_malformed_patterns_collected() {
        let c = catalog();
        let err = PatternResolver::new(&c)
            .resolve(&["99.1", "9.x", "1.*"])
            .unwrap_err();
        let Error::Configuration(errors) = err else {
            panic!("expected configuration errors");
        };
        assert_eq!(errors.0.len(), 2);
        assert!(errors.0.contains(&ConfigurationError::UnknownCase("99.1".into())));
        assert!(errors.0.contains(&ConfigurationError::InvalidPattern("9.x".into())));
    }

    #[test]
    fn test_agent_exclusion_precedence() {
        let c = catalog();
        let r = PatternResolver::new(&c);
        let mut rules = BTreeMap::new();
        rules.insert("Chrome*".to_string(), vec!["9.*".to_string()]);
        let rules = r.resolve_agent_excludes(&rules).unwrap();
        let no_excludes: [&str; 0] = [];

        let chrome = r
            .resolve_for_agent(&["9.1.1", "1.1.1"], &no_excludes, &rules, "Chrome/120")
            .unwrap();
        assert_eq!(chrome, vec!["1.1.1".parse().unwrap()]);

        let firefox = r
            .resolve_for_agent(&["9.1.1", "1.1.1"], &no_excludes, &rules, "Firefox/121")
            .unwrap();
        assert_eq!(firefox.len(), 2);
        assert!(is_excluded_for_agent(&rules, "Chrome", &"9.1.1".parse().unwrap()));
        assert!(!is_excluded_for_agent(&rules, "MyChrome", &"9.1.1".parse().unwrap()));
    }

    proptest! {
        #[test]
        fn prop_excluding_a_subfamily_removes_it(sub in 1u32..9) {
            let c = catalog();
            let r = PatternResolver::new(&c);
            let all = r.resolve(&["9.*"]).unwrap();
            let excluded = r.resolve_excludes(&[format!("9.{}.*", sub)]).unwrap();
            let left: Vec<_> = all.iter().filter(|id| !excluded.contains(id)).collect();
            prop_assert!(left.iter().all(|id| id.segments()[..2] != [9, sub]));
            prop_assert_eq!(left.len() + excluded.len(), all.len());
        }

        #[test]
        fn prop_resolution_is_idempotent(family in 1u32..14) {
            let c = catalog();
            let r = PatternResolver::new(&c);
            let patterns = [format!("{}.*", family), "7.7.*".to_string()];
            let excludes = ["7.7.1".to_string()];
            let first = r.resolve_for_agent(&patterns, &excludes, &[], "agent").unwrap();
            let second = r.resolve_for_agent(&patterns, &excludes, &[], "agent").unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_literal_glob_matches_only_itself(a in "[0-9]{1,3}", b in "[0-9]{1,3}") {
            prop_assert_eq!(glob_match(&a, &b), a == b);
        }
    }
}
