//! Rule file loading, normalization and persistence.
//!
//! Rules are read leniently: missing fields get defaults, legacy documents
//! without an action `type` are inferred from the other action fields, and both
//! `{ "rules": [...] }` and a bare array are accepted. Normalization happens
//! once here; the engine only ever sees [`Rule`] values.

use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::headers::HeaderPair;
use crate::rule_engine::{Rule, RuleAction, RuleMatch};

/// Header pair as written by hand; either side may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHeaderPair {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Matcher section of a raw rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMatch {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub headers: Vec<RawHeaderPair>,
}

/// Action section of a raw rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActions {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Number or numeric string.
    #[serde(default)]
    pub delay_ms: Option<serde_json::Value>,
    #[serde(default)]
    pub override_headers: Vec<RawHeaderPair>,
}

/// A rule as it appears in a rules document, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, rename = "match")]
    pub matcher: RawMatch,
    #[serde(default)]
    pub actions: RawActions,
}

/// Accepted rules document shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RulesDocument {
    Wrapped {
        #[serde(default)]
        rules: Vec<RawRule>,
    },
    Bare(Vec<RawRule>),
}

#[derive(Serialize)]
struct RulesDocumentRef<'a> {
    rules: &'a [Rule],
}

fn normalize_list(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_pairs(list: &[RawHeaderPair]) -> Vec<HeaderPair> {
    list.iter()
        .map(|pair| {
            HeaderPair::new(
                pair.name.as_deref().unwrap_or_default().trim(),
                pair.value.as_deref().unwrap_or_default().trim(),
            )
        })
        .filter(|pair| !pair.name.is_empty() || !pair.value.is_empty())
        .collect()
}

fn parse_delay(value: Option<&serde_json::Value>) -> u64 {
    let delay = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if delay.is_finite() && delay > 0.0 {
        delay as u64
    } else {
        0
    }
}

impl RawRule {
    /// Normalizes the rule at position `index` of its document.
    pub fn normalize(&self, index: usize) -> Rule {
        let delay_ms = parse_delay(self.actions.delay_ms.as_ref());
        let overrides = normalize_pairs(&self.actions.override_headers);

        let action = match self.actions.kind.as_deref() {
            Some("none") => RuleAction::None,
            Some("delay") => RuleAction::Delay { delay_ms },
            Some("overrideHeaders") => RuleAction::OverrideHeaders(overrides),
            Some("close") => RuleAction::Close,
            // legacy documents carry no type
            _ if delay_ms > 0 => RuleAction::Delay { delay_ms },
            _ if !overrides.is_empty() => RuleAction::OverrideHeaders(overrides),
            _ => RuleAction::None,
        };

        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("rule-{}-{}", Utc::now().timestamp_millis(), index),
        };
        let name = match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Rule {}", index + 1),
        };

        Rule {
            id,
            name,
            enabled: self.enabled != Some(false),
            matcher: RuleMatch {
                methods: normalize_list(&self.matcher.methods)
                    .into_iter()
                    .map(|m| m.to_ascii_uppercase())
                    .collect(),
                hosts: normalize_list(&self.matcher.hosts),
                urls: normalize_list(&self.matcher.urls),
                headers: normalize_pairs(&self.matcher.headers),
            },
            action,
        }
    }
}

/// Normalizes a list of raw rules, assigning defaults by position.
pub fn normalize_rules(raw: &[RawRule]) -> Vec<Rule> {
    raw.iter()
        .enumerate()
        .map(|(index, rule)| rule.normalize(index))
        .collect()
}

/// Re-applies normalization to rules built in code.
pub fn normalize_rule_values(rules: &[Rule]) -> Result<Vec<Rule>> {
    let raw: Vec<RawRule> = serde_json::from_value(serde_json::to_value(rules)?)?;
    Ok(normalize_rules(&raw))
}

/// Parses a rules document (`{ "rules": [...] }` or a bare array).
pub fn parse_rules(json: &str) -> Result<Vec<Rule>> {
    let raw = match serde_json::from_str::<RulesDocument>(json)? {
        RulesDocument::Wrapped { rules } => rules,
        RulesDocument::Bare(rules) => rules,
    };
    Ok(normalize_rules(&raw))
}

/// Serializes rules as a pretty-printed `{ "rules": [...] }` document.
pub fn rules_to_json(rules: &[Rule]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&RulesDocumentRef { rules })?)
}

/// Loads rules from a file. A missing file yields an empty list.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    if !path.exists() {
        tracing::debug!("Rules file {:?} does not exist, starting empty", path);
        return Ok(Vec::new());
    }
    let json = fs::read_to_string(path)?;
    let rules = parse_rules(&json)?;
    tracing::info!("Loaded {} rules from {:?}", rules.len(), path);
    Ok(rules)
}

/// Writes rules to a file, creating parent directories as needed.
pub fn save_rules(path: &Path, rules: &[Rule]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, rules_to_json(rules)?)?;
    tracing::debug!("Saved {} rules to {:?}", rules.len(), path);
    Ok(())
}
