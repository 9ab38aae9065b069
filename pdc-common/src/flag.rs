//! Feature-flag model and deterministic per-user evaluation.
//!
//! Evaluation order: targeting rules first (ordered, first match wins),
//! then the fallthrough — either a fixed variation or a percentage-weighted
//! rollout. Rollout membership is decided by bucketing the `(user, flag)`
//! pair with a stable 32-bit hash, so a user's exposure never flickers as
//! the rollout percentage grows or the process restarts.

use crate::types::FlagKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Variation key used for the "on" side of a percentage rollout.
pub const VARIATION_ENABLED: &str = "enabled";
/// Variation key used for the "off" side of a percentage rollout.
pub const VARIATION_DISABLED: &str = "disabled";

/// A named variation a flag can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub key: String,
    pub value: Value,
}

/// Clause operator over a context attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseOp {
    In,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    GreaterThan,
    LessThan,
}

/// A single condition inside a targeting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub attribute: String,
    pub op: ClauseOp,
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Ordered targeting rule; matches iff every clause matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingRule {
    pub clauses: Vec<Clause>,
    /// Variation served when the rule matches.
    pub variation: String,
}

/// One entry of a weighted rollout, walked in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedVariation {
    pub variation: String,
    /// Weight in percentage points; weights are cumulative in declared order.
    pub weight: f64,
}

/// Percentage-weighted fallthrough rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRollout {
    pub variations: Vec<WeightedVariation>,
}

/// What a flag serves when no targeting rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Fallthrough {
    /// Serve a fixed variation.
    Variation { variation: String },
    /// Serve by deterministic bucket against cumulative weights.
    Rollout { rollout: WeightedRollout },
}

/// A feature flag scoped to an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: FlagKey,
    /// Ordered variations; the first is conventionally the "on" side.
    pub variations: Vec<Variation>,
    /// Ordered targeting rules, first match wins.
    #[serde(default)]
    pub rules: Vec<TargetingRule>,
    pub fallthrough: Fallthrough,
    /// Current rollout percentage for the enabled side, mirrored in the
    /// fallthrough weights while a progressive rollout drives this flag.
    pub rollout_percentage: f64,
    /// Environment scope, e.g. "production".
    pub environment: String,
    /// Variation served when a referenced variation key is unknown.
    pub default_variation: String,
}

/// Evaluation context for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalContext {
    pub user_id: String,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub segment: Option<String>,
    /// Free-form attributes addressable from clauses.
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

impl EvalContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "user_id" => Some(Value::String(self.user_id.clone())),
            "user_type" => self.user_type.clone().map(Value::String),
            "platform" => self.platform.clone().map(Value::String),
            "version" => self.version.clone().map(Value::String),
            "country" => self.country.clone().map(Value::String),
            "segment" => self.segment.clone().map(Value::String),
            other => self.custom.get(other).cloned(),
        }
    }
}

// ── Bucketing ──────────────────────────────────────────────────────────────

/// 32-bit multiply-add rolling hash, wrapping at each step.
fn string_hash(input: &str) -> i32 {
    let mut hash: i32 = 0;
    for ch in input.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(ch as i32);
    }
    hash
}

/// Deterministic bucket in `[0, 100)` with 3-decimal resolution for a
/// `(user, flag)` pair. Stable across calls and process restarts.
pub fn bucket_for(user_id: &str, flag_key: &FlagKey) -> f64 {
    let hash = string_hash(&format!("{}:{}", user_id, flag_key.as_str()));
    (hash.unsigned_abs() % 100_000) as f64 / 1000.0
}

// ── Clause matching ────────────────────────────────────────────────────────

fn value_as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

fn value_as_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn clause_matches(clause: &Clause, context: &EvalContext) -> bool {
    let matched = match context.attribute(&clause.attribute) {
        Some(attr) => clause.values.iter().any(|candidate| match clause.op {
            ClauseOp::In => *candidate == attr,
            ClauseOp::Contains => match (value_as_str(&attr), value_as_str(candidate)) {
                (Some(a), Some(c)) => a.contains(c),
                _ => false,
            },
            ClauseOp::StartsWith => match (value_as_str(&attr), value_as_str(candidate)) {
                (Some(a), Some(c)) => a.starts_with(c),
                _ => false,
            },
            ClauseOp::EndsWith => match (value_as_str(&attr), value_as_str(candidate)) {
                (Some(a), Some(c)) => a.ends_with(c),
                _ => false,
            },
            ClauseOp::Matches => match (value_as_str(&attr), value_as_str(candidate)) {
                (Some(a), Some(pattern)) => match regex::Regex::new(pattern) {
                    Ok(re) => re.is_match(a),
                    Err(err) => {
                        warn!("Invalid clause pattern '{}': {}", pattern, err);
                        false
                    }
                },
                _ => false,
            },
            ClauseOp::GreaterThan => match (value_as_num(&attr), value_as_num(candidate)) {
                (Some(a), Some(c)) => a > c,
                _ => false,
            },
            ClauseOp::LessThan => match (value_as_num(&attr), value_as_num(candidate)) {
                (Some(a), Some(c)) => a < c,
                _ => false,
            },
        }),
        None => false,
    };
    if clause.negate { !matched } else { matched }
}

fn rule_matches(rule: &TargetingRule, context: &EvalContext) -> bool {
    !rule.clauses.is_empty()
        && rule
            .clauses
            .iter()
            .all(|clause| clause_matches(clause, context))
}

// ── Flag construction and evaluation ───────────────────────────────────────

impl FeatureFlag {
    /// A boolean flag with a percentage-weighted fallthrough rollout, the
    /// shape the rollout engine materializes on creation.
    pub fn percentage_rollout(
        key: FlagKey,
        environment: impl Into<String>,
        percentage: f64,
    ) -> Self {
        let percentage = percentage.clamp(0.0, 100.0);
        Self {
            key,
            variations: vec![
                Variation {
                    key: VARIATION_ENABLED.to_string(),
                    value: Value::Bool(true),
                },
                Variation {
                    key: VARIATION_DISABLED.to_string(),
                    value: Value::Bool(false),
                },
            ],
            rules: Vec::new(),
            fallthrough: Fallthrough::Rollout {
                rollout: WeightedRollout {
                    variations: vec![
                        WeightedVariation {
                            variation: VARIATION_ENABLED.to_string(),
                            weight: percentage,
                        },
                        WeightedVariation {
                            variation: VARIATION_DISABLED.to_string(),
                            weight: 100.0 - percentage,
                        },
                    ],
                },
            },
            rollout_percentage: percentage,
            environment: environment.into(),
            default_variation: VARIATION_DISABLED.to_string(),
        }
    }

    /// Atomically reshape the fallthrough weights to a new percentage.
    ///
    /// Only meaningful for flags with a two-sided weighted fallthrough; a
    /// fixed fallthrough is left untouched.
    pub fn set_rollout_percentage(&mut self, percentage: f64) {
        let percentage = percentage.clamp(0.0, 100.0);
        self.rollout_percentage = percentage;
        if let Fallthrough::Rollout { rollout } = &mut self.fallthrough {
            for weighted in &mut rollout.variations {
                if weighted.variation == VARIATION_ENABLED {
                    weighted.weight = percentage;
                } else if weighted.variation == VARIATION_DISABLED {
                    weighted.weight = 100.0 - percentage;
                }
            }
        }
    }

    fn variation_value(&self, key: &str) -> Option<Value> {
        self.variations
            .iter()
            .find(|v| v.key == key)
            .map(|v| v.value.clone())
    }

    /// Value of the named variation, or of the flag default when unknown.
    fn variation_or_default(&self, key: &str) -> Value {
        self.variation_value(key)
            .or_else(|| self.variation_value(&self.default_variation))
            .unwrap_or(Value::Null)
    }

    /// Evaluate the flag for one context.
    pub fn evaluate(&self, context: &EvalContext) -> Value {
        // 1. Ordered targeting rules, first match wins.
        for rule in &self.rules {
            if rule_matches(rule, context) {
                return self.variation_or_default(&rule.variation);
            }
        }

        // 2. Fallthrough.
        match &self.fallthrough {
            Fallthrough::Rollout { rollout } => {
                let bucket = bucket_for(&context.user_id, &self.key);
                let mut cumulative = 0.0;
                for weighted in &rollout.variations {
                    cumulative += weighted.weight;
                    if cumulative > bucket {
                        return self.variation_or_default(&weighted.variation);
                    }
                }
                self.variation_or_default(&self.default_variation)
            }
            Fallthrough::Variation { variation } => self.variation_or_default(variation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn flag_key() -> FlagKey {
        FlagKey::new("rollout_checkout")
    }

    fn string_clause(attribute: &str, op: ClauseOp, value: &str) -> Clause {
        Clause {
            attribute: attribute.to_string(),
            op,
            values: vec![json!(value)],
            negate: false,
        }
    }

    #[test]
    fn bucket_is_stable_across_calls() {
        let key = flag_key();
        let first = bucket_for("user-42", &key);
        let second = bucket_for("user-42", &key);
        assert_eq!(first, second);
        assert!((0.0..100.0).contains(&first));
    }

    #[test]
    fn bucket_differs_across_flags() {
        let a = bucket_for("user-42", &FlagKey::new("rollout_checkout"));
        let b = bucket_for("user-42", &FlagKey::new("rollout_search"));
        // Not a hard guarantee, but these specific pairs do differ and any
        // regression in the hash would show up here.
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn bucket_always_in_range(user in ".{0,32}", key in ".{1,32}") {
            let bucket = bucket_for(&user, &FlagKey::new(key));
            prop_assert!((0.0..100.0).contains(&bucket));
        }

        #[test]
        fn bucket_deterministic(user in ".{0,32}", key in ".{1,32}") {
            let flag = FlagKey::new(key);
            prop_assert_eq!(bucket_for(&user, &flag), bucket_for(&user, &flag));
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut flag = FeatureFlag::percentage_rollout(flag_key(), "production", 0.0);
        flag.variations.push(Variation {
            key: "beta".to_string(),
            value: json!("beta"),
        });
        flag.variations.push(Variation {
            key: "internal".to_string(),
            value: json!("internal"),
        });
        flag.rules = vec![
            TargetingRule {
                clauses: vec![string_clause("user_type", ClauseOp::In, "employee")],
                variation: "internal".to_string(),
            },
            TargetingRule {
                // Also matches employees; must never be reached for them.
                clauses: vec![string_clause("user_type", ClauseOp::Contains, "emp")],
                variation: "beta".to_string(),
            },
        ];

        let mut context = EvalContext::for_user("u1");
        context.user_type = Some("employee".to_string());
        assert_eq!(flag.evaluate(&context), json!("internal"));
    }

    #[test]
    fn clause_operators() {
        let context = {
            let mut c = EvalContext::for_user("u1");
            c.platform = Some("ios-17.2".to_string());
            c.custom.insert("build".to_string(), json!(412));
            c
        };

        let cases = [
            (string_clause("platform", ClauseOp::StartsWith, "ios"), true),
            (string_clause("platform", ClauseOp::EndsWith, "17.2"), true),
            (string_clause("platform", ClauseOp::Contains, "android"), false),
            (string_clause("platform", ClauseOp::Matches, r"^ios-\d+"), true),
            (string_clause("platform", ClauseOp::In, "ios-17.2"), true),
            (
                Clause {
                    attribute: "build".to_string(),
                    op: ClauseOp::GreaterThan,
                    values: vec![json!(400)],
                    negate: false,
                },
                true,
            ),
            (
                Clause {
                    attribute: "build".to_string(),
                    op: ClauseOp::LessThan,
                    values: vec![json!(400)],
                    negate: false,
                },
                false,
            ),
        ];
        for (clause, expected) in cases {
            assert_eq!(
                clause_matches(&clause, &context),
                expected,
                "{:?}",
                clause.op
            );
        }
    }

    #[test]
    fn negated_clause_inverts_result() {
        let mut clause = string_clause("country", ClauseOp::In, "DE");
        clause.negate = true;
        let mut context = EvalContext::for_user("u1");
        context.country = Some("FR".to_string());
        assert!(clause_matches(&clause, &context));
        context.country = Some("DE".to_string());
        assert!(!clause_matches(&clause, &context));
    }

    #[test]
    fn missing_attribute_fails_clause_and_negation_applies() {
        let clause = string_clause("segment", ClauseOp::In, "power");
        let context = EvalContext::for_user("u1");
        assert!(!clause_matches(&clause, &context));
        let mut negated = clause;
        negated.negate = true;
        assert!(clause_matches(&negated, &context));
    }

    #[test]
    fn weighted_rollout_walks_cumulative_weights_around_the_bucket() {
        let key = flag_key();
        let bucket = bucket_for("user-42", &key);

        // First weight strictly above the bucket: enabled side serves.
        let mut flag = FeatureFlag::percentage_rollout(key.clone(), "production", 0.0);
        flag.set_rollout_percentage((bucket + 0.001).min(100.0));
        assert_eq!(
            flag.evaluate(&EvalContext::for_user("user-42")),
            json!(true)
        );

        // Cumulative weight equal to the bucket does not exceed it.
        flag.set_rollout_percentage(bucket);
        assert_eq!(
            flag.evaluate(&EvalContext::for_user("user-42")),
            json!(false)
        );
    }

    #[test]
    fn zero_and_full_percentage_are_absolute() {
        let mut flag = FeatureFlag::percentage_rollout(flag_key(), "production", 0.0);
        for user in ["a", "b", "c", "user-42", "user-9000"] {
            assert_eq!(flag.evaluate(&EvalContext::for_user(user)), json!(false));
        }
        flag.set_rollout_percentage(100.0);
        for user in ["a", "b", "c", "user-42", "user-9000"] {
            assert_eq!(flag.evaluate(&EvalContext::for_user(user)), json!(true));
        }
    }

    #[test]
    fn exposure_is_monotonic_in_percentage() {
        // A user inside the rollout at p% stays inside at any higher
        // percentage: the bucket is fixed, only the boundary moves.
        let mut flag = FeatureFlag::percentage_rollout(flag_key(), "production", 0.0);
        let users: Vec<String> = (0..200).map(|i| format!("user-{i}")).collect();
        let mut previously_enabled: Vec<&String> = Vec::new();
        for pct in [5.0, 10.0, 25.0, 50.0, 75.0, 100.0] {
            flag.set_rollout_percentage(pct);
            let enabled: Vec<&String> = users
                .iter()
                .filter(|u| flag.evaluate(&EvalContext::for_user(u.as_str())) == json!(true))
                .collect();
            for user in &previously_enabled {
                assert!(enabled.contains(user), "{user} fell out at {pct}%");
            }
            previously_enabled = enabled;
        }
    }

    #[test]
    fn fixed_fallthrough_and_unknown_variation_fall_back_to_default() {
        let mut flag = FeatureFlag::percentage_rollout(flag_key(), "production", 50.0);
        flag.fallthrough = Fallthrough::Variation {
            variation: "no_such_variation".to_string(),
        };
        // default_variation is "disabled" => false.
        assert_eq!(
            flag.evaluate(&EvalContext::for_user("user-42")),
            json!(false)
        );
    }
}
