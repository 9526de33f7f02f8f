//! Task reconciliation: deep merge, diffs and divergence hashing.
//!
//! Merging is JSON-level but driven by a closed per-field policy on the
//! task's known sub-documents (see [`field_policy`]). Arrays are atomic
//! values and `null` in an update deletes the key.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::MergeError;
use crate::task::{Command, NodeMeta, Task};

/// How a top-level task key is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Identity keys: a non-null incoming value overwrites.
    Identity,
    /// Hop-local or transient keys: replaced wholesale, never merged.
    Replace,
    /// Everything else: recursive deep merge.
    Merge,
}

/// Policy for a top-level task key.
pub fn field_policy(key: &str) -> FieldPolicy {
    match key {
        "id" | "instanceId" | "familyId" | "type" => FieldPolicy::Identity,
        "node" | "processor" | "command" | "commandArgs" | "error" => FieldPolicy::Replace,
        _ => FieldPolicy::Merge,
    }
}

/// Keys that never take part in the divergence hash.
const HASH_EXCLUDED_KEYS: &[&str] = &[
    "node",
    "nodes",
    "processor",
    "processors",
    "user",
    "users",
    "permissions",
    "meta",
    "connections",
    "command",
    "commandArgs",
    "tokens",
];

/// Keys dropped before a task is persisted.
const TRANSIENT_KEYS: &[&str] = &["node", "processor", "command", "commandArgs"];

// ── Deep merge ──────────────────────────────────────────────────────────

/// Merge `update` into `prev`.
///
/// Objects merge key by key, `null` removes a key, arrays and scalars
/// replace. Merging an empty object is a no-op.
pub fn deep_merge(prev: &Value, update: &Value) -> Value {
    match (prev, update) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut out = base.clone();
            for (key, value) in changes {
                if value.is_null() {
                    out.remove(key);
                    continue;
                }
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => strip_nulls(value),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, other) => strip_nulls(other),
    }
}

/// Remove `null` object entries recursively. Array slots are left alone.
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Merge a partial task into the committed one.
pub fn merge_task(stored: &Task, incoming: &Value) -> Result<Task, MergeError> {
    let Value::Object(update) = incoming else {
        return Err(MergeError::NotAnObject {
            what: "incoming task".into(),
        });
    };

    let mut base = match stored.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    for (key, value) in update {
        // `processor` is the legacy name of the hop sub-document.
        let target = if key == "processor" { "node" } else { key.as_str() };
        match field_policy(target) {
            FieldPolicy::Identity => {
                if value.is_null() {
                    continue;
                }
                if target == "id"
                    && let (Some(Value::String(old)), Value::String(new)) = (base.get("id"), value)
                    && old != new
                {
                    return Err(MergeError::IdChanged {
                        stored: old.clone(),
                        incoming: new.clone(),
                    });
                }
                base.insert(target.to_string(), value.clone());
            }
            FieldPolicy::Replace => {
                if value.is_null() {
                    base.remove(target);
                } else {
                    base.insert(target.to_string(), value.clone());
                }
            }
            FieldPolicy::Merge => {
                if value.is_null() {
                    base.remove(target);
                    continue;
                }
                let merged = match base.get(target) {
                    Some(existing) => deep_merge(existing, value),
                    None => strip_nulls(value),
                };
                base.insert(target.to_string(), merged);
            }
        }
    }

    Ok(serde_json::from_value(Value::Object(base))?)
}

// ── Diffs ───────────────────────────────────────────────────────────────

/// Values of `current` that differ from `reference`.
///
/// Nested objects are diffed recursively; arrays are compared whole. A
/// `null` in `current` is kept as a deletion marker. Returns `None` when
/// nothing differs.
pub fn object_difference(current: &Value, reference: &Value) -> Option<Value> {
    if current == reference {
        return None;
    }
    match (current, reference) {
        (Value::Object(cur), Value::Object(refm)) => {
            let mut out = Map::new();
            for (key, value) in cur {
                match refm.get(key) {
                    None => {
                        out.insert(key.clone(), value.clone());
                    }
                    Some(old) => {
                        if let Some(diff) = object_difference(value, old) {
                            out.insert(key.clone(), diff);
                        }
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => Some(current.clone()),
    }
}

/// Values of `a` at keys present in both `a` and `b` whose values differ.
pub fn intersection_with_different_values(a: &Value, b: &Value) -> Option<Value> {
    if a == b {
        return None;
    }
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out = Map::new();
            for (key, va) in ma {
                let Some(vb) = mb.get(key) else { continue };
                if va.is_object() && vb.is_object() {
                    if let Some(diff) = intersection_with_different_values(va, vb) {
                        out.insert(key.clone(), diff);
                    }
                } else if va != vb {
                    out.insert(key.clone(), va.clone());
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => Some(a.clone()),
    }
}

/// `null` for every key of `orig` that is missing from `now`.
pub fn absent_keys_as_null(orig: &Value, now: &Value) -> Option<Value> {
    let (Value::Object(mo), Value::Object(mn)) = (orig, now) else {
        return None;
    };
    let mut out = Map::new();
    for (key, value) in mo {
        match mn.get(key) {
            None => {
                out.insert(key.clone(), Value::Null);
            }
            Some(other) => {
                if let Some(diff) = absent_keys_as_null(value, other) {
                    out.insert(key.clone(), diff);
                }
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Drop `null` entries below the top level. Nested objects left with only
/// nulls are removed entirely; top-level nulls and array slots are kept.
pub fn remove_null_keys(value: &mut Value) {
    let Value::Object(map) = value else { return };
    map.retain(|_, child| !prune_nested(child));
}

/// Strip nulls inside a nested value. Returns true when an object was left
/// with nothing but nulls and should be removed by the caller.
fn prune_nested(value: &mut Value) -> bool {
    match value {
        Value::Object(map) if !map.is_empty() => {
            map.retain(|_, child| !child.is_null() && !prune_nested(child));
            map.is_empty()
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                if prune_nested(item) {
                    *item = Value::Object(Map::new());
                }
            }
            false
        }
        _ => false,
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn remove_empty_keys(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            remove_empty_keys(child);
        }
        map.retain(|_, v| !is_empty_container(v));
    }
}

/// The part of a task every node and the hub agree on.
pub fn clean_for_hash(task: &Value) -> Value {
    let Value::Object(map) = task else {
        return Value::Object(Map::new());
    };
    let mut copy = map.clone();
    for key in HASH_EXCLUDED_KEYS {
        copy.remove(*key);
    }
    if let Some(Value::Object(state)) = copy.get_mut("state") {
        state.remove("last");
    }
    let mut cleaned = Value::Object(copy);
    remove_empty_keys(&mut cleaned);
    cleaned
}

// ── Hashing ─────────────────────────────────────────────────────────────

/// djb2 over UTF-16 code units, matching the browser nodes bit for bit.
pub fn djb2(input: &str) -> u32 {
    let mut hash: i32 = 5381;
    for unit in input.encode_utf16() {
        hash = hash.wrapping_mul(33) ^ i32::from(unit);
    }
    hash as u32
}

/// JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Hash of the shared content of a task document.
pub fn task_hash(task: &Value) -> u32 {
    djb2(&canonical_json(&clean_for_hash(task)))
}

/// Outcome of comparing the sender's view against the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    /// Not applicable (sync, start, full-document exchange, no hash sent).
    Skipped,
    Match,
    Mismatch { local: u32, remote: u32 },
}

impl HashCheck {
    /// Apply the severity rule: a mismatch on a change this node authored is
    /// a local bug and fails; a remote mismatch is logged and tolerated.
    pub fn enforce(
        self,
        instance_id: &str,
        message_id: &str,
        authored_here: bool,
    ) -> Result<(), MergeError> {
        match self {
            HashCheck::Mismatch { local, remote } if authored_here => {
                Err(MergeError::HashMismatch {
                    instance_id: instance_id.to_string(),
                    message_id: message_id.to_string(),
                    local,
                    remote,
                })
            }
            HashCheck::Mismatch { local, remote } => {
                warn!(
                    instance_id = %instance_id,
                    message_id = %message_id,
                    local,
                    remote,
                    "Task hash mismatch from remote node, continuing with local merge"
                );
                Ok(())
            }
            HashCheck::Match | HashCheck::Skipped => Ok(()),
        }
    }
}

/// Check that the values the sender changed had, on the sender, the same
/// prior values as `stored` has here.
pub fn check_hash_diff(stored: &Task, incoming: &Value, node: &NodeMeta) -> HashCheck {
    let args = node.args();
    if args.sync || node.command == Some(Command::Start) || node.wants_full_task() {
        return HashCheck::Skipped;
    }
    let Some(remote) = incoming
        .get("meta")
        .and_then(|m| m.get("hashDiff"))
        .and_then(Value::as_u64)
    else {
        return HashCheck::Skipped;
    };
    let remote = remote as u32;

    let prior = intersection_with_different_values(&stored.to_value(), incoming)
        .map(|v| clean_for_hash(&v))
        .unwrap_or_else(|| Value::Object(Map::new()));
    if prior.as_object().is_some_and(Map::is_empty) {
        return HashCheck::Match;
    }
    let local = djb2(&canonical_json(&prior));
    if local == remote {
        HashCheck::Match
    } else {
        debug!(prior = %prior, "Hash mismatch prior values");
        HashCheck::Mismatch { local, remote }
    }
}

fn strip_keys(value: &mut Value, keys: &[&str]) {
    if let Value::Object(map) = value {
        for key in keys {
            map.remove(*key);
        }
    }
}

/// Build the partial document sent for an `update`: what changed relative to
/// `last`, `null` for removed keys, plus identity, the hop metadata and a
/// `meta.hashDiff` over the prior values of the changed keys.
pub fn outbound_diff(last: &Task, task: &Task) -> Value {
    let mut prev = last.to_value();
    let mut cur = task.to_value();
    strip_keys(&mut prev, &["node", "processor", "meta", "command", "commandArgs"]);
    strip_keys(&mut cur, &["node", "processor", "meta", "command", "commandArgs"]);

    let mut diff = object_difference(&cur, &prev).unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(nulls) = absent_keys_as_null(&prev, &cur) {
        diff = merge_deletions(diff, nulls);
    }

    let prior = intersection_with_different_values(&prev, &diff)
        .map(|v| clean_for_hash(&v))
        .unwrap_or_else(|| Value::Object(Map::new()));
    let hash_diff = djb2(&canonical_json(&prior));

    let mut out = match diff {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(id) = &task.instance_id {
        out.insert("instanceId".into(), Value::String(id.clone()));
    }
    if let Some(id) = &task.id {
        out.insert("id".into(), Value::String(id.clone()));
    }
    if let Some(node) = &task.node {
        out.insert(
            "node".into(),
            serde_json::to_value(node).unwrap_or(Value::Null),
        );
    }
    let mut meta = task.meta.clone().unwrap_or_default();
    meta.hash_diff = Some(hash_diff);
    out.insert(
        "meta".into(),
        serde_json::to_value(meta).unwrap_or(Value::Null),
    );
    Value::Object(out)
}

/// Overlay `null` deletion markers onto a diff without clobbering changes.
fn merge_deletions(diff: Value, nulls: Value) -> Value {
    match (diff, nulls) {
        (Value::Object(mut d), Value::Object(n)) => {
            for (key, marker) in n {
                let entry = match d.remove(&key) {
                    Some(existing @ Value::Object(_)) if marker.is_object() => {
                        merge_deletions(existing, marker)
                    }
                    Some(existing) => existing,
                    None => marker,
                };
                d.insert(key, entry);
            }
            Value::Object(d)
        }
        (d, _) => d,
    }
}

/// The storage form of a task: no hop metadata, no pending command, no
/// nested nulls.
pub fn prepare_for_storage(task: &Task) -> Result<Task, MergeError> {
    let mut value = task.to_value();
    strip_keys(&mut value, TRANSIENT_KEYS);
    remove_null_keys(&mut value);
    Ok(serde_json::from_value(value)?)
}
