//! Filter Engine (spec §4.3): compiles include/exclude rule lists into ordered
//! `(Regex, negated)` pairs and evaluates them against dataset, snapshot, property,
//! and environment-variable names. Exclude beats include; dataset exclusion is
//! sticky — once an ancestor is excluded, its descendants are excluded without
//! re-evaluation (enforced by the planner in `planner.rs`, which never recurses past
//! an excluded node).
//!
//! Grounded on the teacher's `Regex::new` usage (`__basic_snap_retention_criteria`)
//! and `other_examples/d816266a_tangybbq-rdump__src-zfs.rs.rs`'s `Exclusions`
//! (`Vec<Regex>` + `is_excluded`), generalized to include/exclude pairs with `!`
//! negation and literal-name-to-anchored-regex translation.

use regex::Regex;

/// One compiled rule: a regex plus whether it was declared with a leading `!`
/// (negates the match — i.e. this rule excludes a name that would otherwise match).
#[derive(Debug, Clone)]
pub struct Rule {
    pub regex: Regex,
    pub negated: bool,
}

/// An ordered, compiled include or exclude list (spec §3: `FilterSpec`).
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    pub fn compile(raw: &[String]) -> anyhow::Result<RuleList> {
        let mut rules = Vec::with_capacity(raw.len());
        for entry in raw {
            rules.push(compile_one(entry)?);
        }
        Ok(RuleList { rules })
    }

    /// `N` matches this list iff at least one rule matches, with that rule's own
    /// negation applied (spec §4.3: "N matches the list iff at least one pair
    /// matches (with negation applied)").
    pub fn matches(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r.regex.is_match(name) != r.negated)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_one(entry: &str) -> anyhow::Result<Rule> {
    let (negated, pattern) = match entry.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, entry),
    };
    Ok(Rule { regex: Regex::new(pattern)?, negated })
}

/// Translates a user-friendly literal dataset name (as given to `--include`/
/// `--exclude`) into an anchored regex, per spec §4.3: an absolute path (leading
/// `/`) is matched against the dataset's absolute path; a relative path is matched
/// against the path relative to the replication root.
pub fn literal_dataset_rule(literal: &str) -> String {
    let (negated_prefix, rest) = match literal.strip_prefix('!') {
        Some(r) => ("!", r),
        None => ("", literal),
    };
    let anchored = if let Some(abs) = rest.strip_prefix('/') {
        format!("^/{}$", regex::escape(abs))
    } else {
        format!("^{}$", regex::escape(rest))
    };
    format!("{negated_prefix}{anchored}")
}

/// Compiled include+exclude pair for one axis (datasets, snapshots, properties, or
/// env vars). A name is selected iff it matches `include` and does not match
/// `exclude` (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub include: RuleList,
    pub exclude: RuleList,
}

impl FilterSpec {
    pub fn new(include: RuleList, exclude: RuleList) -> Self {
        FilterSpec { include, exclude }
    }

    /// An empty include list is treated as "include everything" — the common case
    /// where the caller only supplied `--exclude`.
    pub fn selects(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.matches(name);
        included && !self.exclude.matches(name)
    }
}

/// Reads one rule entry per line from a filter file (the `@file`/`+file`
/// indirection named in spec §6/§9), kept as a pure loader outside the Filter
/// Engine proper. Blank lines and `#`-comments are skipped.
pub fn load_rules_file(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Filters `vars` (name, value) pairs by a [`FilterSpec`] applied to the name only,
/// reusing the same compiled-rule matcher as dataset/snapshot filtering (spec §6:
/// environment variables are filtered per the same include/exclude grammar).
pub fn filter_env_vars(vars: impl IntoIterator<Item = (String, String)>, spec: &FilterSpec) -> Vec<(String, String)> {
    vars.into_iter().filter(|(name, _)| spec.selects(name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(include: &[&str], exclude: &[&str]) -> FilterSpec {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        FilterSpec::new(RuleList::compile(&include).unwrap(), RuleList::compile(&exclude).unwrap())
    }

    #[test]
    fn empty_include_means_everything() {
        let f = spec(&[], &["^tmp$"]);
        assert!(f.selects("foo"));
        assert!(!f.selects("tmp"));
    }

    #[test]
    fn exclude_beats_include() {
        let f = spec(&["^foo$", "^tmp$"], &["^tmp$"]);
        assert!(f.selects("foo"));
        assert!(!f.selects("tmp"));
    }

    #[test]
    fn negated_rule_excludes_a_match() {
        let f = spec(&[], &["!^keep$"]);
        // "!^keep$" as an exclude rule: matches (is_match) iff NOT "keep". So "other"
        // is excluded, "keep" is not.
        assert!(!f.selects("other"));
        assert!(f.selects("keep"));
    }

    #[test]
    fn literal_dataset_rule_is_anchored() {
        assert_eq!(literal_dataset_rule("foo/bar"), "^foo/bar$");
        assert_eq!(literal_dataset_rule("/foo/bar"), "^/foo/bar$");
        assert_eq!(literal_dataset_rule("!foo"), "!^foo$");
    }

    #[test]
    fn literal_dataset_rule_escapes_regex_metacharacters() {
        let rule = literal_dataset_rule("a.b+c");
        let compiled = compile_one(&rule).unwrap();
        assert!(compiled.regex.is_match("a.b+c"));
        assert!(!compiled.regex.is_match("aXbXc"));
    }

    #[test]
    fn filters_env_vars_by_name() {
        let f = spec(&[], &["^SECRET_.*$"]);
        let vars = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("SECRET_KEY".to_string(), "xyz".to_string()),
        ];
        let filtered = filter_env_vars(vars, &f);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "PATH");
    }
}
