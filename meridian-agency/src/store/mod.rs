//! The hierarchical key/value store replicated through the agency log.
//!
//! The store is a tree of nodes addressed by slash-separated paths. Leaf
//! values are opaque structured documents; writing an object at a path
//! expands it into child nodes, so subtree reads reconstruct the object.
//! Writes arrive as atomic [`WriteTransaction`]s whose preconditions are
//! checked against the current tree before any operation applies.
//!
//! Keys written with a `ttl` expire after that many seconds; expiry is
//! observable through the same prefix-trigger mechanism as ordinary writes.

mod transaction;

pub use transaction::parse_ops;
pub use transaction::parse_preconditions;
pub use transaction::Op;
pub use transaction::Precondition;
pub use transaction::WriteTransaction;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::AgencyError;

/// One node of the store tree. Either an inner node (children) or a leaf
/// (value); leaf writes clear children and vice versa.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, Node>,
    /// Absolute expiry in epoch milliseconds, if the key carries a TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn to_value(&self) -> Value {
        if let Some(v) = &self.value {
            return v.clone();
        }
        let mut obj = serde_json::Map::new();
        for (key, child) in &self.children {
            obj.insert(key.clone(), child.to_value());
        }
        Value::Object(obj)
    }
}

/// Result of one read query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// True when every requested path exists.
    pub success: bool,
    /// The requested subtrees, nested under their path segments.
    pub value: Value,
}

/// The key/value tree plus observers, TTL bookkeeping and prefix triggers.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Store {
    root: Node,
    /// Observer URLs per path, maintained by the observe/unobserve ops.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    observers: BTreeMap<String, BTreeSet<String>>,
    /// Expiry queue of `(expires_at_ms, path)`, earliest first.
    #[serde(skip)]
    ttl_queue: BinaryHeap<Reverse<(u64, String)>>,
    /// Post-commit notifiers by path prefix.
    #[serde(skip)]
    triggers: Vec<(String, mpsc::UnboundedSender<String>)>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the tree and observers without the registered triggers.
    /// Used when forking the tentative state off the committed one.
    pub fn clone_data(&self) -> Self {
        Self {
            root: self.root.clone(),
            observers: self.observers.clone(),
            ttl_queue: self.ttl_queue.clone(),
            triggers: Vec::new(),
        }
    }

    /// Drop all data. Triggers stay registered.
    pub fn clear(&mut self) {
        self.root = Node::default();
        self.observers.clear();
        self.ttl_queue.clear();
    }

    /// Register a post-commit notifier for all paths under `prefix`. The
    /// touched path is sent for every matching write, delete and expiry.
    pub fn register_prefix_trigger(&mut self, prefix: impl Into<String>, tx: mpsc::UnboundedSender<String>) {
        self.triggers.push((normalize(&prefix.into()), tx));
    }

    /// Read the value at `path`, reconstructing objects from subtrees.
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut node = &self.root;
        for seg in segments(path) {
            node = node.children.get(seg)?;
        }
        Some(node.to_value())
    }

    /// Whether `path` exists in the tree.
    pub fn has(&self, path: &str) -> bool {
        let mut node = &self.root;
        for seg in segments(path) {
            match node.children.get(seg) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    /// Batch subtree reads: one result per query, each query being a list
    /// of paths merged into a single nested object.
    pub fn read(&self, queries: &[Vec<String>]) -> Vec<ReadResult> {
        queries
            .iter()
            .map(|paths| {
                let mut success = true;
                let mut out = Value::Object(serde_json::Map::new());
                for path in paths {
                    match self.get(path) {
                        Some(v) => insert_nested(&mut out, path, v),
                        None => success = false,
                    }
                }
                ReadResult { success, value: out }
            })
            .collect()
    }

    /// The whole tree as a plain value (client-facing snapshot shape).
    pub fn to_value(&self) -> Value {
        self.root.to_value()
    }

    /// Serialize tree plus observers for compaction snapshots and
    /// follower catch-up. TTL metadata travels inside the nodes.
    pub fn to_snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a store from a snapshot produced by [`Store::to_snapshot`].
    pub fn from_snapshot(v: &Value) -> Result<Self, AgencyError> {
        let mut store: Store = serde_json::from_value(v.clone())
            .map_err(|e| AgencyError::MalformedTransaction(format!("bad store snapshot: {}", e)))?;
        store.rebuild_ttl_queue();
        Ok(store)
    }

    /// Restore this store in place from a snapshot, keeping triggers.
    pub fn restore_from_snapshot(&mut self, v: &Value) -> Result<(), AgencyError> {
        let incoming = Store::from_snapshot(v)?;
        self.root = incoming.root;
        self.observers = incoming.observers;
        self.ttl_queue = incoming.ttl_queue;
        Ok(())
    }

    fn rebuild_ttl_queue(&mut self) {
        fn walk(node: &Node, path: &str, queue: &mut BinaryHeap<Reverse<(u64, String)>>) {
            if let Some(at) = node.expires_at {
                queue.push(Reverse((at, path.to_string())));
            }
            for (key, child) in &node.children {
                walk(child, &format!("{}/{}", path, key), queue);
            }
        }
        self.ttl_queue.clear();
        let root = self.root.clone();
        walk(&root, "", &mut self.ttl_queue);
    }

    /// Check a transaction's preconditions against the current tree.
    pub fn check(&self, preconditions: &[(String, Precondition)]) -> bool {
        preconditions.iter().all(|(path, pre)| {
            let current = self.get(path);
            match pre {
                Precondition::Old(want) => current.as_ref() == Some(want),
                Precondition::OldNot(want) => current.as_ref() != Some(want),
                Precondition::OldEmpty(empty) => current.is_none() == *empty,
                Precondition::IsArray(want) => current.map(|v| v.is_array()).unwrap_or(false) == *want,
                Precondition::In(elem) => current
                    .as_ref()
                    .and_then(Value::as_array)
                    .map(|a| a.contains(elem))
                    .unwrap_or(false),
            }
        })
    }

    /// Apply one transaction atomically. A failed precondition leaves the
    /// tree untouched and is reported as [`AgencyError::PreconditionFailed`].
    pub fn apply_transaction(&mut self, trx: &WriteTransaction, now_ms: u64) -> Result<Vec<String>, AgencyError> {
        if !self.check(&trx.preconditions) {
            return Err(AgencyError::PreconditionFailed);
        }
        Ok(self.apply_ops(&trx.ops, now_ms))
    }

    /// Apply a committed log payload: an array of operation objects.
    /// Preconditions were already checked when the entry was appended.
    pub fn apply_log_payload(&mut self, payload: &Value, now_ms: u64) -> Result<Vec<String>, AgencyError> {
        let trxs = payload
            .as_array()
            .ok_or_else(|| AgencyError::MalformedTransaction("log payload must be an array".into()))?;
        let mut touched = Vec::new();
        for ops in trxs {
            let ops = parse_ops(ops)?;
            touched.extend(self.apply_ops(&ops, now_ms));
        }
        Ok(touched)
    }

    /// Apply operations unconditionally, fire matching triggers, return
    /// the touched paths.
    pub fn apply_ops(&mut self, ops: &[(String, Op)], now_ms: u64) -> Vec<String> {
        let mut touched = Vec::with_capacity(ops.len());
        for (path, op) in ops {
            let path = normalize(path);
            match op {
                Op::Set { new, ttl } => {
                    let node = self.ensure(&path);
                    set_value(node, new);
                    node.expires_at = ttl.map(|t| now_ms + t * 1000);
                    if let Some(at) = node.expires_at {
                        self.ttl_queue.push(Reverse((at, path.clone())));
                    }
                }
                Op::Delete => self.delete(&path),
                Op::Push(v) => self.mutate_array(&path, |a| a.push(v.clone())),
                Op::Prepend(v) => self.mutate_array(&path, |a| a.insert(0, v.clone())),
                Op::Pop => self.mutate_array(&path, |a| {
                    a.pop();
                }),
                Op::Shift => self.mutate_array(&path, |a| {
                    if !a.is_empty() {
                        a.remove(0);
                    }
                }),
                Op::Increment { step } => {
                    let node = self.ensure(&path);
                    let current = node.value.as_ref().and_then(Value::as_i64).unwrap_or(0);
                    set_value(node, &Value::from(current + step));
                }
                Op::Observe { url } => {
                    self.observers.entry(path.clone()).or_default().insert(url.clone());
                }
                Op::Unobserve { url } => {
                    if let Some(urls) = self.observers.get_mut(&path) {
                        urls.remove(url);
                        if urls.is_empty() {
                            self.observers.remove(&path);
                        }
                    }
                }
            }
            touched.push(path);
        }
        self.notify(&touched);
        touched
    }

    /// Remove all expired keys at `now_ms`, firing triggers for each.
    pub fn clear_expired(&mut self, now_ms: u64) -> Vec<String> {
        let mut touched = Vec::new();
        while let Some(Reverse((at, path))) = self.ttl_queue.peek().cloned() {
            if at > now_ms {
                break;
            }
            self.ttl_queue.pop();
            // The key may have been rewritten (new expiry) or deleted since
            // this queue entry was pushed; only an exact match expires it.
            let live = self
                .lookup(&path)
                .map(|node| node.expires_at == Some(at))
                .unwrap_or(false);
            if live {
                self.delete(&path);
                touched.push(path);
            }
        }
        self.notify(&touched);
        touched
    }

    /// Registered observer URLs for a path.
    pub fn observers_of(&self, path: &str) -> Option<&BTreeSet<String>> {
        self.observers.get(&normalize(path))
    }

    fn notify(&self, touched: &[String]) {
        for (prefix, tx) in &self.triggers {
            for path in touched {
                if path_has_prefix(path, prefix) {
                    let _ = tx.send(path.clone());
                }
            }
        }
    }

    fn lookup(&self, path: &str) -> Option<&Node> {
        let mut node = &self.root;
        for seg in segments(path) {
            node = node.children.get(seg)?;
        }
        Some(node)
    }

    fn ensure(&mut self, path: &str) -> &mut Node {
        let mut node = &mut self.root;
        for seg in segments(path) {
            // An intermediate leaf becomes an inner node.
            node.value = None;
            node = node.children.entry(seg.to_string()).or_default();
        }
        node
    }

    fn delete(&mut self, path: &str) {
        let segs: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = segs.split_last() else {
            self.root = Node::default();
            return;
        };
        let mut node = &mut self.root;
        for seg in parents {
            match node.children.get_mut(*seg) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.children.remove(*last);
    }

    fn mutate_array(&mut self, path: &str, f: impl FnOnce(&mut Vec<Value>)) {
        let node = self.ensure(path);
        let mut arr = match node.value.take() {
            Some(Value::Array(a)) => a,
            // Array ops on anything else start from an empty array; a push
            // or prepend then yields a one-element array.
            _ => Vec::new(),
        };
        f(&mut arr);
        node.children.clear();
        node.value = Some(Value::Array(arr));
    }
}

fn set_value(node: &mut Node, v: &Value) {
    node.children.clear();
    match v {
        Value::Object(obj) => {
            node.value = None;
            for (key, sub) in obj {
                let child = node.children.entry(key.clone()).or_default();
                set_value(child, sub);
            }
        }
        other => node.value = Some(other.clone()),
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for seg in segments(path) {
        out.push('/');
        out.push_str(seg);
    }
    out
}

/// Prefix match on segment boundaries: `/a/b` covers `/a/b` and `/a/b/c`
/// but not `/a/bc`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn insert_nested(out: &mut Value, path: &str, v: Value) {
    let mut node = out;
    let segs: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = segs.split_last() else {
        *node = v;
        return;
    };
    for seg in parents {
        let obj = match node {
            Value::Object(obj) => obj,
            other => {
                *other = Value::Object(serde_json::Map::new());
                match other {
                    Value::Object(obj) => obj,
                    _ => unreachable!(),
                }
            }
        };
        node = obj.entry(seg.to_string()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    match node {
        Value::Object(obj) => {
            obj.insert(last.to_string(), v);
        }
        other => {
            let mut obj = serde_json::Map::new();
            obj.insert(last.to_string(), v);
            *other = Value::Object(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn set(store: &mut Store, path: &str, v: Value) {
        store.apply_ops(&[(path.to_string(), Op::Set { new: v, ttl: None })], 0);
    }

    #[test]
    fn object_writes_expand_into_subtrees() {
        let mut store = Store::new();
        set(&mut store, "/cluster/a", json!({"x": 1, "y": {"z": true}}));
        set(&mut store, "/cluster/b", json!(42));

        assert_eq!(store.get("/cluster/a/y/z"), Some(json!(true)));
        assert_eq!(
            store.get("/cluster"),
            Some(json!({"a": {"x": 1, "y": {"z": true}}, "b": 42}))
        );
    }

    #[test]
    fn scalar_overwrites_subtree() {
        let mut store = Store::new();
        set(&mut store, "/k/a", json!(1));
        set(&mut store, "/k", json!("flat"));
        assert_eq!(store.get("/k"), Some(json!("flat")));
        assert_eq!(store.get("/k/a"), None);
    }

    #[test]
    fn array_operators() {
        let mut store = Store::new();
        let ops = vec![
            ("/q".to_string(), Op::Push(json!(1))),
            ("/q".to_string(), Op::Push(json!(2))),
            ("/q".to_string(), Op::Prepend(json!(0))),
        ];
        store.apply_ops(&ops, 0);
        assert_eq!(store.get("/q"), Some(json!([0, 1, 2])));

        store.apply_ops(&[("/q".to_string(), Op::Shift)], 0);
        store.apply_ops(&[("/q".to_string(), Op::Pop)], 0);
        assert_eq!(store.get("/q"), Some(json!([1])));

        // Pop on a scalar turns it into an empty array.
        set(&mut store, "/s", json!("notanarray"));
        store.apply_ops(&[("/s".to_string(), Op::Pop)], 0);
        assert_eq!(store.get("/s"), Some(json!([])));
    }

    #[test]
    fn increment_defaults_missing_to_zero() {
        let mut store = Store::new();
        store.apply_ops(&[("/n".to_string(), Op::Increment { step: 1 })], 0);
        store.apply_ops(&[("/n".to_string(), Op::Increment { step: 4 })], 0);
        assert_eq!(store.get("/n"), Some(json!(5)));
    }

    #[test]
    fn precondition_failure_leaves_tree_untouched() {
        let mut store = Store::new();
        set(&mut store, "/k", json!("v0"));

        let trx = WriteTransaction::single_set("/k", json!("v1"))
            .with_precondition("/k", Precondition::Old(json!("other")));
        let res = store.apply_transaction(&trx, 0);
        assert!(matches!(res, Err(AgencyError::PreconditionFailed)));
        assert_eq!(store.get("/k"), Some(json!("v0")));

        let trx = WriteTransaction::single_set("/k", json!("v1"))
            .with_precondition("/k", Precondition::Old(json!("v0")));
        store.apply_transaction(&trx, 0).unwrap();
        assert_eq!(store.get("/k"), Some(json!("v1")));
    }

    #[test]
    fn precondition_operators() {
        let mut store = Store::new();
        set(&mut store, "/arr", json!([1, 2, 3]));

        assert!(store.check(&[("/arr".into(), Precondition::IsArray(true))]));
        assert!(store.check(&[("/arr".into(), Precondition::In(json!(2)))]));
        assert!(!store.check(&[("/arr".into(), Precondition::In(json!(9)))]));
        assert!(store.check(&[("/missing".into(), Precondition::OldEmpty(true))]));
        assert!(!store.check(&[("/arr".into(), Precondition::OldEmpty(true))]));
        assert!(store.check(&[("/arr".into(), Precondition::OldNot(json!([1])))]));
    }

    #[test]
    fn ttl_expiry_fires_trigger() {
        let mut store = Store::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.register_prefix_trigger("/tmp", tx);

        store.apply_ops(
            &[("/tmp/lock".to_string(), Op::Set { new: json!("held"), ttl: Some(2) })],
            1_000,
        );
        assert_eq!(rx.try_recv().unwrap(), "/tmp/lock");

        // Not yet expired.
        assert!(store.clear_expired(2_000).is_empty());
        assert_eq!(store.get("/tmp/lock"), Some(json!("held")));

        let gone = store.clear_expired(3_500);
        assert_eq!(gone, vec!["/tmp/lock".to_string()]);
        assert_eq!(store.get("/tmp/lock"), None);
        assert_eq!(rx.try_recv().unwrap(), "/tmp/lock");
    }

    #[test]
    fn rewritten_key_does_not_expire_from_stale_queue_entry() {
        let mut store = Store::new();
        store.apply_ops(
            &[("/tmp/k".to_string(), Op::Set { new: json!(1), ttl: Some(1) })],
            0,
        );
        // Rewrite without a TTL before expiry.
        store.apply_ops(&[("/tmp/k".to_string(), Op::Set { new: json!(2), ttl: None })], 500);
        assert!(store.clear_expired(5_000).is_empty());
        assert_eq!(store.get("/tmp/k"), Some(json!(2)));
    }

    #[test]
    fn triggers_match_on_segment_boundaries() {
        let mut store = Store::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.register_prefix_trigger("/a/b", tx);

        set(&mut store, "/a/bc", json!(1));
        assert!(rx.try_recv().is_err());

        set(&mut store, "/a/b/c", json!(1));
        assert_eq!(rx.try_recv().unwrap(), "/a/b/c");
    }

    #[test]
    fn batch_read_reports_missing_paths() {
        let mut store = Store::new();
        set(&mut store, "/x/y", json!(7));

        let results = store.read(&[
            vec!["/x/y".to_string()],
            vec!["/x/y".to_string(), "/nope".to_string()],
        ]);
        assert!(results[0].success);
        assert_eq!(results[0].value, json!({"x": {"y": 7}}));
        assert!(!results[1].success);
        assert_eq!(results[1].value, json!({"x": {"y": 7}}));
    }

    #[test]
    fn snapshot_round_trip_preserves_ttl() {
        let mut store = Store::new();
        set(&mut store, "/a", json!({"b": 1}));
        store.apply_ops(
            &[("/tmp".to_string(), Op::Set { new: json!("x"), ttl: Some(1) })],
            0,
        );

        let snap = store.to_snapshot();
        let mut restored = Store::from_snapshot(&snap).unwrap();
        assert_eq!(restored.get("/a/b"), Some(json!(1)));

        let gone = restored.clear_expired(10_000);
        assert_eq!(gone, vec!["/tmp".to_string()]);
    }

    #[test]
    fn observers_registered_and_removed() {
        let mut store = Store::new();
        store.apply_ops(
            &[(
                "/watched".to_string(),
                Op::Observe { url: "http://cb".to_string() },
            )],
            0,
        );
        assert!(store.observers_of("/watched").unwrap().contains("http://cb"));

        store.apply_ops(
            &[(
                "/watched".to_string(),
                Op::Unobserve { url: "http://cb".to_string() },
            )],
            0,
        );
        assert!(store.observers_of("/watched").is_none());
    }
}
