//! Transactions applied to the store.
//!
//! The wire shape of a write transaction is an array
//! `[operations, preconditions?, clientId?]`. Operations are an object
//! keyed by path; each value is either a literal (shorthand for `set`) or
//! an operator object `{"op": "...", ...}`. Preconditions are an object
//! keyed by path whose values are either a literal (exact match) or an
//! operator object (`old`, `oldNot`, `oldEmpty`, `isArray`, `in`).

use serde_json::Value;

use crate::error::AgencyError;

/// A single write operation at a path.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Set the value, optionally expiring after `ttl` seconds.
    Set { new: Value, ttl: Option<u64> },
    /// Remove the key and its subtree.
    Delete,
    /// Append to the array at the path, creating one as needed.
    Push(Value),
    /// Prepend to the array at the path, creating one as needed.
    Prepend(Value),
    /// Remove the last array element. A non-array becomes an empty array.
    Pop,
    /// Remove the first array element. A non-array becomes an empty array.
    Shift,
    /// Add `step` to the numeric value at the path (missing counts as 0).
    Increment { step: i64 },
    /// Register an observer URL for the path.
    Observe { url: String },
    /// Deregister an observer URL for the path.
    Unobserve { url: String },
}

/// A single precondition at a path.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    /// The stored value equals the given one exactly.
    Old(Value),
    /// The stored value differs from the given one.
    OldNot(Value),
    /// The path is absent (true) or present (false).
    OldEmpty(bool),
    /// The stored value is (or is not) an array.
    IsArray(bool),
    /// The array at the path contains the given element.
    In(Value),
}

/// A parsed write transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteTransaction {
    pub ops: Vec<(String, Op)>,
    pub preconditions: Vec<(String, Precondition)>,
    pub client_id: Option<String>,
}

impl WriteTransaction {
    /// A transaction with a single `set` and no preconditions.
    pub fn single_set(path: impl Into<String>, new: Value) -> Self {
        Self {
            ops: vec![(path.into(), Op::Set { new, ttl: None })],
            preconditions: Vec::new(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_precondition(mut self, path: impl Into<String>, pre: Precondition) -> Self {
        self.preconditions.push((path.into(), pre));
        self
    }

    pub fn with_op(mut self, path: impl Into<String>, op: Op) -> Self {
        self.ops.push((path.into(), op));
        self
    }

    /// Parse a transaction from its wire shape.
    pub fn from_value(v: &Value) -> Result<Self, AgencyError> {
        let parts = v
            .as_array()
            .ok_or_else(|| AgencyError::MalformedTransaction("transaction must be an array".into()))?;
        if parts.is_empty() || parts.len() > 3 {
            return Err(AgencyError::MalformedTransaction(format!(
                "transaction must have 1..=3 elements, got {}",
                parts.len()
            )));
        }

        let ops = parse_ops(&parts[0])?;
        let preconditions = match parts.get(1) {
            Some(p) => parse_preconditions(p)?,
            None => Vec::new(),
        };
        let client_id = match parts.get(2) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(AgencyError::MalformedTransaction(format!(
                    "client id must be a string, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            ops,
            preconditions,
            client_id,
        })
    }

    /// Serialize the operations object (the log payload of this trx).
    pub fn ops_to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (path, op) in &self.ops {
            obj.insert(path.clone(), op_to_value(op));
        }
        Value::Object(obj)
    }

    /// Serialize the full wire shape.
    pub fn to_value(&self) -> Value {
        let mut parts = vec![self.ops_to_value()];
        if !self.preconditions.is_empty() || self.client_id.is_some() {
            let mut pre = serde_json::Map::new();
            for (path, p) in &self.preconditions {
                pre.insert(path.clone(), precondition_to_value(p));
            }
            parts.push(Value::Object(pre));
        }
        if let Some(cid) = &self.client_id {
            parts.push(Value::String(cid.clone()));
        }
        Value::Array(parts)
    }
}

/// Parse an operations object (path to literal-or-operator).
pub fn parse_ops(v: &Value) -> Result<Vec<(String, Op)>, AgencyError> {
    let obj = v
        .as_object()
        .ok_or_else(|| AgencyError::MalformedTransaction("operations must be an object".into()))?;
    let mut out = Vec::with_capacity(obj.len());
    for (path, spec) in obj {
        out.push((path.clone(), parse_op(spec)?));
    }
    Ok(out)
}

fn parse_op(spec: &Value) -> Result<Op, AgencyError> {
    let obj = match spec.as_object() {
        Some(obj) if obj.contains_key("op") => obj,
        // A literal value, or an object without "op", is a plain set.
        _ => {
            return Ok(Op::Set {
                new: spec.clone(),
                ttl: None,
            })
        }
    };

    let name = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| AgencyError::MalformedTransaction("operator name must be a string".into()))?;

    let new = || obj.get("new").cloned().unwrap_or(Value::Null);
    match name {
        "set" => Ok(Op::Set {
            new: new(),
            ttl: obj.get("ttl").and_then(Value::as_u64).filter(|t| *t > 0),
        }),
        "delete" => Ok(Op::Delete),
        "push" => Ok(Op::Push(new())),
        "prepend" => Ok(Op::Prepend(new())),
        "pop" => Ok(Op::Pop),
        "shift" => Ok(Op::Shift),
        "increment" => Ok(Op::Increment {
            step: obj.get("step").and_then(Value::as_i64).unwrap_or(1),
        }),
        "observe" => Ok(Op::Observe {
            url: observer_url(obj)?,
        }),
        "unobserve" => Ok(Op::Unobserve {
            url: observer_url(obj)?,
        }),
        other => Err(AgencyError::MalformedTransaction(format!("unknown operator {:?}", other))),
    }
}

fn observer_url(obj: &serde_json::Map<String, Value>) -> Result<String, AgencyError> {
    obj.get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AgencyError::MalformedTransaction("observe requires a url".into()))
}

/// Parse a preconditions object (path to literal-or-operator).
pub fn parse_preconditions(v: &Value) -> Result<Vec<(String, Precondition)>, AgencyError> {
    let obj = v
        .as_object()
        .ok_or_else(|| AgencyError::MalformedTransaction("preconditions must be an object".into()))?;
    let mut out = Vec::new();
    for (path, spec) in obj {
        match spec.as_object() {
            Some(op) if is_precondition_operator(op) => {
                if let Some(v) = op.get("old") {
                    out.push((path.clone(), Precondition::Old(v.clone())));
                }
                if let Some(v) = op.get("oldNot") {
                    out.push((path.clone(), Precondition::OldNot(v.clone())));
                }
                if let Some(b) = op.get("oldEmpty").and_then(Value::as_bool) {
                    out.push((path.clone(), Precondition::OldEmpty(b)));
                }
                if let Some(b) = op.get("isArray").and_then(Value::as_bool) {
                    out.push((path.clone(), Precondition::IsArray(b)));
                }
                if let Some(v) = op.get("in") {
                    out.push((path.clone(), Precondition::In(v.clone())));
                }
            }
            // Anything else is an exact-match literal, objects included.
            _ => out.push((path.clone(), Precondition::Old(spec.clone()))),
        }
    }
    Ok(out)
}

const PRECONDITION_KEYS: &[&str] = &["old", "oldNot", "oldEmpty", "isArray", "in"];

fn is_precondition_operator(obj: &serde_json::Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| PRECONDITION_KEYS.contains(&k.as_str()))
}

fn op_to_value(op: &Op) -> Value {
    match op {
        Op::Set { new, ttl } => match ttl {
            None => serde_json::json!({"op": "set", "new": new}),
            Some(t) => serde_json::json!({"op": "set", "new": new, "ttl": t}),
        },
        Op::Delete => serde_json::json!({"op": "delete"}),
        Op::Push(v) => serde_json::json!({"op": "push", "new": v}),
        Op::Prepend(v) => serde_json::json!({"op": "prepend", "new": v}),
        Op::Pop => serde_json::json!({"op": "pop"}),
        Op::Shift => serde_json::json!({"op": "shift"}),
        Op::Increment { step } => serde_json::json!({"op": "increment", "step": step}),
        Op::Observe { url } => serde_json::json!({"op": "observe", "url": url}),
        Op::Unobserve { url } => serde_json::json!({"op": "unobserve", "url": url}),
    }
}

fn precondition_to_value(p: &Precondition) -> Value {
    match p {
        Precondition::Old(v) => serde_json::json!({"old": v}),
        Precondition::OldNot(v) => serde_json::json!({"oldNot": v}),
        Precondition::OldEmpty(b) => serde_json::json!({"oldEmpty": b}),
        Precondition::IsArray(b) => serde_json::json!({"isArray": b}),
        Precondition::In(v) => serde_json::json!({"in": v}),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_literal_set_and_operator_forms() {
        let trx = WriteTransaction::from_value(&json!([
            {"/a/b": 12, "/a/c": {"op": "set", "new": "x", "ttl": 5}},
            {"/a/b": {"oldEmpty": true}},
            "cid-1"
        ]))
        .unwrap();

        assert_eq!(trx.ops.len(), 2);
        assert_eq!(trx.client_id.as_deref(), Some("cid-1"));
        assert!(trx
            .ops
            .iter()
            .any(|(p, op)| p == "/a/c" && matches!(op, Op::Set { ttl: Some(5), .. })));
        assert_eq!(trx.preconditions, vec![("/a/b".to_string(), Precondition::OldEmpty(true))]);
    }

    #[test]
    fn object_without_operator_keys_is_literal_precondition() {
        let pres = parse_preconditions(&json!({"/k": {"foo": 1}})).unwrap();
        assert_eq!(pres, vec![("/k".to_string(), Precondition::Old(json!({"foo": 1})))]);
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = WriteTransaction::from_value(&json!([{"/k": {"op": "frobnicate"}}]));
        assert!(matches!(err, Err(AgencyError::MalformedTransaction(_))));
    }

    #[test]
    fn wire_round_trip() {
        let trx = WriteTransaction::single_set("/x", json!({"v": 1}))
            .with_precondition("/x", Precondition::OldEmpty(true))
            .with_client_id("cid-9");
        let back = WriteTransaction::from_value(&trx.to_value()).unwrap();
        assert_eq!(back.client_id.as_deref(), Some("cid-9"));
        assert_eq!(back.preconditions.len(), 1);
    }
}
