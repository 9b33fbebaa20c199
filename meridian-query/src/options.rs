//! Typed query options.
//!
//! Parsed from the options object a query arrives with; unknown fields are
//! ignored. Process-wide defaults live in [`GLOBAL_DEFAULTS`] and are
//! applied through [`QueryOptions::sanitize`], which also enforces the
//! memory-limit override rule: when overrides are not allowed, a query may
//! lower the configured limit but never raise or clear it.

use lazy_static::lazy_static;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;
use std::sync::RwLock;

use crate::error::EngineError;

/// Profiling detail requested for a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ProfileLevel {
    #[default]
    None,
    Basic,
    Detailed,
}

impl From<u64> for ProfileLevel {
    fn from(v: u64) -> Self {
        match v {
            0 => ProfileLevel::None,
            1 => ProfileLevel::Basic,
            _ => ProfileLevel::Detailed,
        }
    }
}

/// `profile` historically accepts both a bool and an integer.
fn de_profile<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ProfileLevel, D::Error> {
    let v = Value::deserialize(deserializer)?;
    Ok(match v {
        Value::Bool(true) => ProfileLevel::Basic,
        Value::Bool(false) | Value::Null => ProfileLevel::None,
        Value::Number(n) => ProfileLevel::from(n.as_u64().unwrap_or(0)),
        _ => ProfileLevel::None,
    })
}

/// The `optimizer` sub-object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions {
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Process-wide defaults and policies for query options.
#[derive(Clone, Debug)]
pub struct OptionsDefaults {
    pub memory_limit: u64,
    /// When false, queries may only lower the memory limit.
    pub allow_memory_limit_override: bool,
    pub max_number_of_plans: usize,
    pub max_nodes_per_callstack: usize,
    pub max_dnf_condition_members: usize,
    pub max_runtime: f64,
    pub ttl: f64,
}

impl Default for OptionsDefaults {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            allow_memory_limit_override: true,
            max_number_of_plans: 128,
            max_nodes_per_callstack: 250,
            max_dnf_condition_members: 786_432,
            max_runtime: 0.0,
            ttl: 600.0,
        }
    }
}

lazy_static! {
    /// The process-wide option defaults, set once at startup.
    pub static ref GLOBAL_DEFAULTS: RwLock<OptionsDefaults> = RwLock::new(OptionsDefaults::default());
}

/// Per-query options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub memory_limit: u64,
    pub max_number_of_plans: usize,
    pub max_warning_count: usize,
    pub max_nodes_per_callstack: usize,
    pub spill_over_threshold_num_rows: u64,
    pub spill_over_threshold_memory_usage: u64,
    #[serde(rename = "maxDNFConditionMembers")]
    pub max_dnf_condition_members: usize,
    pub max_runtime: f64,
    pub satellite_sync_wait: f64,
    pub ttl: f64,
    #[serde(deserialize_with = "de_profile")]
    pub profile: ProfileLevel,
    pub traversal_profile: bool,
    pub all_plans: bool,
    pub verbose_plans: bool,
    pub explain_internals: bool,
    pub stream: bool,
    pub allow_retry: bool,
    pub silent: bool,
    pub fail_on_warning: bool,
    pub cache: bool,
    pub full_count: bool,
    pub count: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_one_shard_attribute_value: Option<String>,
    pub optimizer: OptimizerOptions,
    pub shard_ids: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        let defaults = GLOBAL_DEFAULTS.read().expect("defaults lock poisoned").clone();
        Self {
            memory_limit: defaults.memory_limit,
            max_number_of_plans: defaults.max_number_of_plans,
            max_warning_count: 10,
            max_nodes_per_callstack: defaults.max_nodes_per_callstack,
            spill_over_threshold_num_rows: 5_000_000,
            spill_over_threshold_memory_usage: 128 * 1024 * 1024,
            max_dnf_condition_members: defaults.max_dnf_condition_members,
            max_runtime: defaults.max_runtime,
            satellite_sync_wait: 60.0,
            ttl: defaults.ttl,
            profile: ProfileLevel::None,
            traversal_profile: false,
            all_plans: false,
            verbose_plans: false,
            explain_internals: false,
            stream: false,
            allow_retry: false,
            silent: false,
            fail_on_warning: false,
            cache: false,
            full_count: false,
            count: false,
            force_one_shard_attribute_value: None,
            optimizer: OptimizerOptions::default(),
            shard_ids: Vec::new(),
        }
    }
}

impl QueryOptions {
    /// Parse from the options object of a query request. Unknown fields
    /// are ignored; a null or missing object yields the defaults.
    pub fn from_value(v: &Value) -> Result<Self, EngineError> {
        if v.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(v.clone())
            .map_err(|e| EngineError::MalformedPlan(format!("bad query options: {}", e)))
    }

    /// Clamp against the process-wide policy.
    pub fn sanitize(&mut self, defaults: &OptionsDefaults) {
        if !defaults.allow_memory_limit_override && defaults.memory_limit > 0 {
            // Only decreases below the configured limit are honored.
            if self.memory_limit == 0 || self.memory_limit > defaults.memory_limit {
                self.memory_limit = defaults.memory_limit;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_a_typical_options_object() {
        let opts = QueryOptions::from_value(&json!({
            "memoryLimit": 1024,
            "fullCount": true,
            "profile": 2,
            "maxDNFConditionMembers": 16,
            "optimizer": {"rules": ["-all", "+use-indexes"]},
            "shardIds": ["s1", "s2"],
            "somethingUnknown": {"ignored": true},
        }))
        .unwrap();

        assert_eq!(opts.memory_limit, 1024);
        assert!(opts.full_count);
        assert_eq!(opts.profile, ProfileLevel::Detailed);
        assert_eq!(opts.max_dnf_condition_members, 16);
        assert_eq!(opts.optimizer.rules, vec!["-all", "+use-indexes"]);
        assert_eq!(opts.shard_ids, vec!["s1", "s2"]);
    }

    #[test]
    fn profile_accepts_bool_and_integer() {
        let a = QueryOptions::from_value(&json!({"profile": true})).unwrap();
        assert_eq!(a.profile, ProfileLevel::Basic);
        let b = QueryOptions::from_value(&json!({"profile": false})).unwrap();
        assert_eq!(b.profile, ProfileLevel::None);
        let c = QueryOptions::from_value(&json!({"profile": 1})).unwrap();
        assert_eq!(c.profile, ProfileLevel::Basic);
    }

    #[test]
    fn memory_limit_override_rule() {
        let defaults = OptionsDefaults {
            memory_limit: 1000,
            allow_memory_limit_override: false,
            ..OptionsDefaults::default()
        };

        // Raising is clamped back.
        let mut opts = QueryOptions::from_value(&json!({"memoryLimit": 5000})).unwrap();
        opts.sanitize(&defaults);
        assert_eq!(opts.memory_limit, 1000);

        // Clearing (0 = unlimited) is clamped back.
        let mut opts = QueryOptions::from_value(&json!({"memoryLimit": 0})).unwrap();
        opts.sanitize(&defaults);
        assert_eq!(opts.memory_limit, 1000);

        // Lowering is honored.
        let mut opts = QueryOptions::from_value(&json!({"memoryLimit": 500})).unwrap();
        opts.sanitize(&defaults);
        assert_eq!(opts.memory_limit, 500);

        // With overrides allowed, anything goes.
        let permissive = OptionsDefaults {
            allow_memory_limit_override: true,
            ..defaults
        };
        let mut opts = QueryOptions::from_value(&json!({"memoryLimit": 5000})).unwrap();
        opts.sanitize(&permissive);
        assert_eq!(opts.memory_limit, 5000);
    }
}
