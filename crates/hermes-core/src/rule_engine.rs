//! Rule engine for intercepted requests.
//!
//! A rule pairs a request matcher with a single action. Rules are evaluated in
//! list order and the first enabled rule that matches wins; later rules are
//! never consulted for that request.
//!
//! ## Matching
//!
//! - `methods`: empty, containing `*`, or containing the request method
//! - `hosts` / `urls`: case-insensitive substring, any entry may hit
//! - `headers`: every matcher must be satisfied by at least one header

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::headers::{HeaderMap, HeaderPair};

/// What to do with a matched exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RuleAction {
    /// Forward unchanged.
    #[default]
    None,
    /// Hold the request before forwarding it.
    Delay {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Rewrite request headers before forwarding and recording.
    OverrideHeaders(Vec<HeaderPair>),
    /// Abort the client connection without contacting the upstream.
    Close,
}

impl RuleAction {
    /// Wire name of the action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::None => "none",
            RuleAction::Delay { .. } => "delay",
            RuleAction::OverrideHeaders(_) => "overrideHeaders",
            RuleAction::Close => "close",
        }
    }

    /// Delay to apply, zero for every other kind.
    pub fn delay_ms(&self) -> u64 {
        match self {
            RuleAction::Delay { delay_ms } => *delay_ms,
            _ => 0,
        }
    }

    /// Header overrides to apply, empty for every other kind.
    pub fn override_headers(&self) -> &[HeaderPair] {
        match self {
            RuleAction::OverrideHeaders(pairs) => pairs,
            _ => &[],
        }
    }
}

/// Request matcher of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RuleMatch {
    /// Uppercase method names or `*`.
    pub methods: Vec<String>,
    /// Host substrings.
    pub hosts: Vec<String>,
    /// URL substrings.
    pub urls: Vec<String>,
    /// Header name/value substrings; an empty side matches anything.
    pub headers: Vec<HeaderPair>,
}

/// A normalized interception rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Disabled rules are never matched.
    pub enabled: bool,
    /// Conditions a request must meet.
    pub matcher: RuleMatch,
    /// What happens to a matching request.
    pub action: RuleAction,
}

impl Rule {
    /// Creates an enabled rule that matches every request.
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            matcher: RuleMatch::default(),
            action,
        }
    }

    /// Returns the rule with the given matcher.
    pub fn with_match(mut self, matcher: RuleMatch) -> Self {
        self.matcher = matcher;
        self
    }

    /// Returns the rule with the given enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns true if this rule applies to the request.
    pub fn matches(&self, info: &RuleRequestInfo<'_>) -> bool {
        if !self.enabled {
            return false;
        }

        let methods = &self.matcher.methods;
        if !methods.is_empty() && !methods.iter().any(|m| m == "*") {
            let method = info.method.to_ascii_uppercase();
            if !methods.iter().any(|m| *m == method) {
                return false;
            }
        }

        if !matches_substring_list(info.host, &self.matcher.hosts) {
            return false;
        }
        if !matches_substring_list(info.url, &self.matcher.urls) {
            return false;
        }

        self.matcher
            .headers
            .iter()
            .all(|matcher| header_matches(info.headers, matcher))
    }
}

/// On-disk record shape: every action field is present, unused ones zeroed.
#[derive(Serialize)]
struct RuleRecord<'a> {
    id: &'a str,
    name: &'a str,
    enabled: bool,
    #[serde(rename = "match")]
    matcher: &'a RuleMatch,
    actions: ActionRecord<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    delay_ms: u64,
    override_headers: &'a [HeaderPair],
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RuleRecord {
            id: &self.id,
            name: &self.name,
            enabled: self.enabled,
            matcher: &self.matcher,
            actions: ActionRecord {
                kind: self.action.kind(),
                delay_ms: self.action.delay_ms(),
                override_headers: self.action.override_headers(),
            },
        }
        .serialize(serializer)
    }
}

/// Request descriptor the rules are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RuleRequestInfo<'a> {
    /// Uppercase request method.
    pub method: &'a str,
    /// Authority of the target.
    pub host: &'a str,
    /// Full target URL.
    pub url: &'a str,
    /// Request headers before any override.
    pub headers: &'a HeaderMap,
}

fn matches_substring_list(value: &str, list: &[String]) -> bool {
    if list.is_empty() {
        return true;
    }
    let haystack = value.to_lowercase();
    list.iter()
        .any(|pattern| haystack.contains(&pattern.to_lowercase()))
}

fn header_matches(headers: &HeaderMap, matcher: &HeaderPair) -> bool {
    let name_needle = matcher.name.to_lowercase();
    let value_needle = matcher.value.to_lowercase();
    headers.iter().any(|(name, value)| {
        if !name_needle.is_empty() && !name.to_lowercase().contains(&name_needle) {
            return false;
        }
        if !value_needle.is_empty() && !value.to_lowercase().contains(&value_needle) {
            return false;
        }
        true
    })
}

/// Returns the first enabled rule matching the request.
pub fn first_match<'r>(rules: &'r [Rule], info: &RuleRequestInfo<'_>) -> Option<&'r Rule> {
    rules.iter().find(|rule| rule.matches(info))
}

/// Holds the active rule list as an immutable snapshot.
///
/// Readers clone the `Arc` and evaluate without holding the lock; updates swap
/// the whole list.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RuleEngine {
    /// Creates an engine with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine with the given rules.
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Current rule snapshot.
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        Arc::clone(&self.rules.read())
    }

    /// Replaces the rule list.
    pub fn replace(&self, rules: Vec<Rule>) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Number of rules (enabled or not).
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluates the request against the current snapshot.
    pub fn evaluate(&self, info: &RuleRequestInfo<'_>) -> Option<Rule> {
        let rules = self.snapshot();
        first_match(&rules, info).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::headers_from_pairs;

    fn info<'a>(method: &'a str, url: &'a str, host: &'a str, headers: &'a HeaderMap) -> RuleRequestInfo<'a> {
        RuleRequestInfo {
            method,
            host,
            url,
            headers,
        }
    }

    fn matcher(methods: &[&str], hosts: &[&str], urls: &[&str]) -> RuleMatch {
        RuleMatch {
            methods: methods.iter().map(|s| s.to_string()).collect(),
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            urls: urls.iter().map(|s| s.to_string()).collect(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn empty_matcher_matches_everything() {
        let headers = HeaderMap::new();
        let rule = Rule::new("r1", "all", RuleAction::None);
        assert!(rule.matches(&info("GET", "http://a.com/", "a.com", &headers)));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let headers = HeaderMap::new();
        let rule = Rule::new("r1", "off", RuleAction::Close).with_enabled(false);
        assert!(!rule.matches(&info("GET", "http://a.com/", "a.com", &headers)));
    }

    #[test]
    fn method_matching() {
        let headers = HeaderMap::new();
        let rule = Rule::new("r1", "post", RuleAction::None).with_match(matcher(&["POST"], &[], &[]));
        assert!(rule.matches(&info("post", "http://a.com/", "a.com", &headers)));
        assert!(!rule.matches(&info("GET", "http://a.com/", "a.com", &headers)));
    }

    #[test]
    fn wildcard_method_still_checks_hosts() {
        let headers = HeaderMap::new();
        let rule = Rule::new("r1", "wild", RuleAction::None)
            .with_match(matcher(&["*"], &["example.com"], &[]));
        assert!(rule.matches(&info("DELETE", "http://example.com/", "example.com", &headers)));
        assert!(!rule.matches(&info("DELETE", "http://other.org/", "other.org", &headers)));
    }

    #[test]
    fn host_and_url_substrings_ignore_case() {
        let headers = HeaderMap::new();
        let rule = Rule::new("r1", "api", RuleAction::None)
            .with_match(matcher(&[], &["API.example"], &["/V1/"]));
        assert!(rule.matches(&info(
            "GET",
            "https://api.example.com/v1/items",
            "api.example.com",
            &headers
        )));
        assert!(!rule.matches(&info(
            "GET",
            "https://api.example.com/v2/items",
            "api.example.com",
            &headers
        )));
    }

    #[test]
    fn header_matchers_all_required() {
        let headers = headers_from_pairs([("Authorization", "Bearer abc"), ("accept", "application/json")]);
        let mut m = RuleMatch::default();
        m.headers = vec![HeaderPair::new("authorization", ""), HeaderPair::new("", "JSON")];
        let rule = Rule::new("r1", "auth", RuleAction::None).with_match(m.clone());
        assert!(rule.matches(&info("GET", "http://a/", "a", &headers)));

        m.headers.push(HeaderPair::new("x-missing", ""));
        let rule = Rule::new("r1", "auth", RuleAction::None).with_match(m);
        assert!(!rule.matches(&info("GET", "http://a/", "a", &headers)));
    }

    #[test]
    fn first_match_wins() {
        let headers = HeaderMap::new();
        let rules = vec![
            Rule::new("delay", "delay zero", RuleAction::Delay { delay_ms: 0 }),
            Rule::new("close", "close all", RuleAction::Close),
        ];
        let hit = first_match(&rules, &info("GET", "http://a.com/", "a.com", &headers)).unwrap();
        assert_eq!(hit.id, "delay");
        assert_ne!(hit.action, RuleAction::Close);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let headers = HeaderMap::new();
        let engine = RuleEngine::with_rules(vec![
            Rule::new("a", "off", RuleAction::Close).with_enabled(false),
            Rule::new("b", "on", RuleAction::Delay { delay_ms: 5 }),
        ]);
        let hit = engine.evaluate(&info("GET", "http://a.com/", "a.com", &headers)).unwrap();
        assert_eq!(hit.id, "b");
    }

    #[test]
    fn engine_replace_swaps_snapshot() {
        let engine = RuleEngine::new();
        assert!(engine.is_empty());
        let before = engine.snapshot();
        engine.replace(vec![Rule::new("a", "A", RuleAction::Close)]);
        assert_eq!(before.len(), 0);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn serializes_with_zeroed_unused_fields() {
        let rule = Rule::new("r1", "close", RuleAction::Close);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["actions"]["type"], "close");
        assert_eq!(json["actions"]["delayMs"], 0);
        assert_eq!(json["actions"]["overrideHeaders"].as_array().unwrap().len(), 0);
        assert_eq!(json["match"]["methods"].as_array().unwrap().len(), 0);
    }
}
