//! Policy documents
//!
//! A policy is a JSON document scoped to one relying service:
//!
//! ```json
//! {
//!   "policyId": "spep-1-default",
//!   "targets": ["/default/*"],
//!   "rules": [
//!     { "ruleId": "A", "effect": "permit", "targets": ["/default/*"],
//!       "condition": { "op": "string-equal", "attribute": "uid", "values": ["beddoes"] } }
//!   ]
//! }
//! ```
//!
//! Parsing compiles targets and regex conditions up front. A rule or
//! condition that cannot be compiled is kept as [`RuleSlot::Malformed`] or
//! [`RuleCondition::Malformed`] and never applies; it does not fail the policy.

use idp_common::{AttributeRecord, Decision};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::error::{PolicyError, Result};

// ============================================================================
// Targets
// ============================================================================

/// A resource target: exact match, or anchored regex match with bare `*` as `.*`
#[derive(Debug, Clone)]
pub struct TargetPattern {
    raw: String,
    regex: Option<Regex>,
}

impl TargetPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let regex = anchored(&expand_wildcards(&raw)).ok();
        Self { raw, regex }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, resource: &str) -> bool {
        self.raw == resource
            || self
                .regex
                .as_ref()
                .map(|regex| regex.is_match(resource))
                .unwrap_or(false)
    }
}

/// Whole-string regex; the bare pattern must compile first so unbalanced
/// groups cannot escape the anchors
fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(pattern)?;
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Rewrite `*` into `.*` unless it already quantifies something
fn expand_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut prev: Option<char> = None;
    for c in pattern.chars() {
        if c == '*' && !matches!(prev, Some('.') | Some('\\') | Some(']') | Some(')')) {
            out.push_str(".*");
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modifier {
    NormalizeToLowerCase,
    NormalizeSpace,
}

fn normalize(value: &str, modifiers: &[Modifier]) -> String {
    let mut value = value.to_string();
    for modifier in modifiers {
        value = match modifier {
            Modifier::NormalizeToLowerCase => value.to_lowercase(),
            Modifier::NormalizeSpace => value.trim().to_string(),
        };
    }
    value
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum ExpressionDocument {
    And { args: Vec<ExpressionDocument> },
    Or { args: Vec<ExpressionDocument> },
    Not { arg: Box<ExpressionDocument> },
    StringEqual(StringMatchDocument),
    StringRegexMatch(StringMatchDocument),
}

#[derive(Debug, Deserialize)]
struct StringMatchDocument {
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    modifiers: Vec<Modifier>,
}

/// Compiled boolean expression over subject attributes
#[derive(Debug, Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    StringEqual {
        attribute: String,
        values: Vec<String>,
        modifiers: Vec<Modifier>,
    },
    StringRegexMatch {
        attribute: String,
        patterns: Vec<Regex>,
        modifiers: Vec<Modifier>,
    },
}

impl Condition {
    fn compile(doc: ExpressionDocument) -> std::result::Result<Self, String> {
        Ok(match doc {
            ExpressionDocument::And { args } => Condition::And(Self::compile_all(args)?),
            ExpressionDocument::Or { args } => Condition::Or(Self::compile_all(args)?),
            ExpressionDocument::Not { arg } => Condition::Not(Box::new(Self::compile(*arg)?)),
            ExpressionDocument::StringEqual(m) => {
                let (attribute, values) = Self::designator(m.attribute, m.values)?;
                let values = values.iter().map(|v| normalize(v, &m.modifiers)).collect();
                Condition::StringEqual {
                    attribute,
                    values,
                    modifiers: m.modifiers,
                }
            }
            ExpressionDocument::StringRegexMatch(m) => {
                let (attribute, values) = Self::designator(m.attribute, m.values)?;
                let patterns = values
                    .iter()
                    .map(|v| anchored(v).map_err(|e| e.to_string()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Condition::StringRegexMatch {
                    attribute,
                    patterns,
                    modifiers: m.modifiers,
                }
            }
        })
    }

    fn evaluate_all(args: &[Condition], subject: &IndexMap<String, AttributeRecord>) -> Option<Vec<bool>> {
        args.iter().map(|arg| arg.evaluate(subject)).collect()
    }

    fn compile_all(args: Vec<ExpressionDocument>) -> std::result::Result<Vec<Self>, String> {
        if args.is_empty() {
            return Err("boolean function needs at least one argument".to_string());
        }
        args.into_iter().map(Self::compile).collect()
    }

    fn designator(
        attribute: Option<String>,
        values: Vec<String>,
    ) -> std::result::Result<(String, Vec<String>), String> {
        let attribute = attribute
            .filter(|a| !a.is_empty())
            .ok_or_else(|| "string function needs an attribute designator".to_string())?;
        if values.is_empty() {
            return Err(format!("string function on '{}' needs a value", attribute));
        }
        Ok((attribute, values))
    }

    /// `None` when the subject lacks any referenced attribute, wherever it
    /// appears in the expression
    pub fn evaluate(&self, subject: &IndexMap<String, AttributeRecord>) -> Option<bool> {
        match self {
            Condition::And(args) => Some(Self::evaluate_all(args, subject)?.into_iter().all(|v| v)),
            Condition::Or(args) => Some(Self::evaluate_all(args, subject)?.into_iter().any(|v| v)),
            Condition::Not(arg) => arg.evaluate(subject).map(|v| !v),
            Condition::StringEqual {
                attribute,
                values,
                modifiers,
            } => {
                let record = subject.get(attribute)?;
                Some(record.values.iter().any(|subject_value| {
                    let subject_value = normalize(subject_value, modifiers);
                    values.iter().any(|v| *v == subject_value)
                }))
            }
            Condition::StringRegexMatch {
                attribute,
                patterns,
                modifiers,
            } => {
                let record = subject.get(attribute)?;
                Some(record.values.iter().any(|subject_value| {
                    let subject_value = normalize(subject_value, modifiers);
                    patterns.iter().any(|p| p.is_match(&subject_value))
                }))
            }
        }
    }
}

// ============================================================================
// Rules and policies
// ============================================================================

#[derive(Debug, Clone)]
pub enum RuleCondition {
    Always,
    Expr(Condition),
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_id: String,
    pub effect: Decision,
    /// Empty means the policy targets apply
    pub targets: Vec<TargetPattern>,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone)]
pub enum RuleSlot {
    Rule(Rule),
    Malformed { rule_id: Option<String>, reason: String },
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub policy_id: String,
    pub description: Option<String>,
    pub targets: Vec<TargetPattern>,
    pub rules: Vec<RuleSlot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    policy_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    rules: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDocument {
    rule_id: String,
    effect: Decision,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    condition: Option<serde_json::Value>,
}

impl Policy {
    pub fn parse(document: &str) -> Result<Self> {
        let doc: PolicyDocument =
            serde_json::from_str(document).map_err(|e| PolicyError::Parse(e.to_string()))?;
        if doc.policy_id.is_empty() {
            return Err(PolicyError::Parse("policyId is empty".to_string()));
        }

        let rules = doc.rules.into_iter().map(Self::compile_rule).collect();

        Ok(Self {
            policy_id: doc.policy_id,
            description: doc.description,
            targets: doc.targets.into_iter().map(TargetPattern::new).collect(),
            rules,
        })
    }

    fn compile_rule(value: serde_json::Value) -> RuleSlot {
        let rule_id = value
            .get("ruleId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let doc: RuleDocument = match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(e) => {
                return RuleSlot::Malformed {
                    rule_id,
                    reason: e.to_string(),
                }
            }
        };

        let condition = match doc.condition {
            None => RuleCondition::Always,
            Some(raw) => match serde_json::from_value::<ExpressionDocument>(raw) {
                Ok(expr) => match Condition::compile(expr) {
                    Ok(condition) => RuleCondition::Expr(condition),
                    Err(reason) => RuleCondition::Malformed(reason),
                },
                Err(e) => RuleCondition::Malformed(e.to_string()),
            },
        };

        RuleSlot::Rule(Rule {
            rule_id: doc.rule_id,
            effect: doc.effect,
            targets: doc.targets.into_iter().map(TargetPattern::new).collect(),
            condition,
        })
    }

    /// A policy without targets covers every resource
    pub fn covers(&self, resource: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t.matches(resource))
    }

    pub fn target_strings(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(TargetPattern::as_str)
    }
}

impl Rule {
    /// The matched target, `Some(None)` when no targets apply at all
    pub fn matched_target<'a>(
        &'a self,
        policy_targets: &'a [TargetPattern],
        resource: &str,
    ) -> Option<Option<&'a str>> {
        let targets = if self.targets.is_empty() {
            policy_targets
        } else {
            &self.targets
        };
        if targets.is_empty() {
            return Some(None);
        }
        targets
            .iter()
            .find(|t| t.matches(resource))
            .map(|t| Some(t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(pairs: &[(&str, &[&str])]) -> IndexMap<String, AttributeRecord> {
        pairs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    AttributeRecord::new(values.iter().map(|v| v.to_string()).collect()),
                )
            })
            .collect()
    }

    fn condition(json: serde_json::Value) -> RuleCondition {
        let doc = serde_json::json!({
            "policyId": "p", "rules": [{ "ruleId": "r", "effect": "permit", "condition": json }]
        });
        match Policy::parse(&doc.to_string()).unwrap().rules.remove(0) {
            RuleSlot::Rule(rule) => rule.condition,
            RuleSlot::Malformed { reason, .. } => panic!("rule malformed: {}", reason),
        }
    }

    #[test]
    fn test_wildcard_targets() {
        let t = TargetPattern::new("/default/*");
        assert!(t.matches("/default/private/x"));
        assert!(t.matches("/default/"));
        assert!(!t.matches("/other/default/x"));

        let t = TargetPattern::new("/default/.*");
        assert!(t.matches("/default/public/x"));

        let t = TargetPattern::new("/exact");
        assert!(t.matches("/exact"));
        assert!(!t.matches("/exact/more"));
    }

    #[test]
    fn test_invalid_regex_target_only_matches_exactly() {
        let t = TargetPattern::new("/bad/[");
        assert!(t.matches("/bad/["));
        assert!(!t.matches("/bad/x"));
    }

    #[test]
    fn test_unbalanced_group_target_stays_anchored() {
        let t = TargetPattern::new("/a)|(/b");
        assert!(t.matches("/a)|(/b"));
        assert!(!t.matches("/a"));
        assert!(!t.matches("/prefix/a"));
        assert!(!t.matches("x/b"));
    }

    #[test]
    fn test_unbalanced_group_condition_is_malformed() {
        let cond = condition(serde_json::json!({
            "op": "string-regex-match", "attribute": "uid", "values": ["a)|(b"]
        }));
        assert!(matches!(cond, RuleCondition::Malformed(_)));
    }

    #[test]
    fn test_string_equal_with_modifiers() {
        let cond = condition(serde_json::json!({
            "op": "string-equal", "attribute": "uid", "values": ["Beddoes"],
            "modifiers": ["normalize-space", "normalize-to-lower-case"]
        }));
        let RuleCondition::Expr(cond) = cond else { panic!("expected expression") };

        assert_eq!(cond.evaluate(&subject(&[("uid", &["  BEDDOES "])])), Some(true));
        assert_eq!(cond.evaluate(&subject(&[("uid", &["zitelli"])])), Some(false));
        assert_eq!(cond.evaluate(&subject(&[("mail", &["x"])])), None);
    }

    #[test]
    fn test_boolean_functions() {
        let cond = condition(serde_json::json!({
            "op": "and", "args": [
                { "op": "string-regex-match", "attribute": "type", "values": ["staff|student"] },
                { "op": "not", "arg": { "op": "string-equal", "attribute": "uid", "values": ["blocked"] } }
            ]
        }));
        let RuleCondition::Expr(cond) = cond else { panic!("expected expression") };

        assert_eq!(
            cond.evaluate(&subject(&[("type", &["staff"]), ("uid", &["beddoes"])])),
            Some(true)
        );
        assert_eq!(
            cond.evaluate(&subject(&[("type", &["staffer"]), ("uid", &["beddoes"])])),
            Some(false)
        );
        assert_eq!(
            cond.evaluate(&subject(&[("type", &["student"]), ("uid", &["blocked"])])),
            Some(false)
        );
    }

    #[test]
    fn test_missing_designator_is_malformed() {
        let cond = condition(serde_json::json!({ "op": "string-equal", "values": ["x"] }));
        assert!(matches!(cond, RuleCondition::Malformed(_)));

        let cond = condition(serde_json::json!({ "op": "string-equal", "attribute": "uid" }));
        assert!(matches!(cond, RuleCondition::Malformed(_)));

        let cond = condition(serde_json::json!({ "op": "integer-equal", "attribute": "uid", "values": ["1"] }));
        assert!(matches!(cond, RuleCondition::Malformed(_)));
    }

    #[test]
    fn test_malformed_rule_does_not_fail_policy() {
        let doc = serde_json::json!({
            "policyId": "p",
            "rules": [
                { "ruleId": "broken" },
                { "ruleId": "ok", "effect": "deny" }
            ]
        });
        let policy = Policy::parse(&doc.to_string()).unwrap();

        assert!(matches!(&policy.rules[0], RuleSlot::Malformed { rule_id: Some(id), .. } if id == "broken"));
        assert!(matches!(&policy.rules[1], RuleSlot::Rule(r) if r.effect == Decision::Deny));
    }

    #[test]
    fn test_unparseable_policy_is_an_error() {
        assert!(matches!(Policy::parse("{not json"), Err(PolicyError::Parse(_))));
        assert!(matches!(Policy::parse(r#"{"policyId": ""}"#), Err(PolicyError::Parse(_))));
    }

    #[test]
    fn test_rule_inherits_policy_targets() {
        let doc = serde_json::json!({
            "policyId": "p",
            "targets": ["/admin/*"],
            "rules": [{ "ruleId": "r", "effect": "permit" }]
        });
        let policy = Policy::parse(&doc.to_string()).unwrap();
        let RuleSlot::Rule(rule) = &policy.rules[0] else { panic!("expected rule") };

        assert_eq!(rule.matched_target(&policy.targets, "/admin/x"), Some(Some("/admin/*")));
        assert_eq!(rule.matched_target(&policy.targets, "/public"), None);
        assert_eq!(rule.matched_target(&[], "/anything"), Some(None));
    }
}
