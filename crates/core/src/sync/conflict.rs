//! Conflict resolver: decides whether a local write may proceed, can be
//! merged, or must be flagged for the operator.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::records::{FieldRecord, MergePolicy, RemoteSnapshot};

/// Outcome of probing a local record against the current remote state.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No concurrent remote edit; the local payload may be upserted as-is.
    Proceed,
    /// Disjoint field-level changes were merged; upsert the merged payload.
    ProceedMerged(Value),
    /// Local and remote diverged in overlapping fields; flag the record.
    Flag,
}

/// Resolve local record `local` against remote snapshot `remote`.
///
/// Rules, in order:
/// 1. remote absent → proceed (never synced before).
/// 2. remote timestamp equals the last one the engine observed and the
///    remote payload still matches the last-synced snapshot → proceed
///    (pure local change wins).
/// 3. equal timestamps but a diverged remote payload (clock skew) → flag;
///    guessing a winner risks silent data loss.
/// 4. remote newer → diff both sides against the last-synced snapshot;
///    disjoint changes merge under a `FieldLevel` policy, anything else
///    flags.
pub fn resolve(local: &FieldRecord, remote: Option<&RemoteSnapshot>) -> Resolution {
    let remote = match remote {
        Some(snapshot) => snapshot,
        None => return Resolution::Proceed,
    };

    let base = local.synced_payload.as_ref();

    match local.remote_updated_at {
        Some(observed) if remote.remote_updated_at == observed => {
            match base {
                // Timestamp unchanged but content drifted from our base:
                // clock-skewed concurrent write. Never guess a winner.
                Some(base) if &remote.payload != base => Resolution::Flag,
                _ => Resolution::Proceed,
            }
        }
        Some(observed) if remote.remote_updated_at < observed => {
            // Remote replied with something older than we already saw
            // (stale replica); our observation stands.
            Resolution::Proceed
        }
        Some(_) => resolve_newer_remote(local, remote, base),
        None => {
            // Remote row exists but this engine never observed it. Identical
            // content is a harmless duplicate submission; anything else is
            // divergence.
            if remote.payload == local.payload {
                Resolution::Proceed
            } else {
                Resolution::Flag
            }
        }
    }
}

fn resolve_newer_remote(
    local: &FieldRecord,
    remote: &RemoteSnapshot,
    base: Option<&Value>,
) -> Resolution {
    let base = match base {
        Some(base) => base,
        // Newer remote and no merge base to diff against: conservative flag.
        None => return Resolution::Flag,
    };

    if &remote.payload == base {
        // Timestamp bump only (e.g. a remote touch); local change wins.
        return Resolution::Proceed;
    }

    match local.record_type.merge_policy() {
        MergePolicy::WholeRecord => Resolution::Flag,
        MergePolicy::FieldLevel => merge_field_level(base, &local.payload, &remote.payload),
    }
}

/// Three-way merge over top-level object keys. Overlapping changed keys
/// flag; disjoint changes combine into a merged payload.
fn merge_field_level(base: &Value, local: &Value, remote: &Value) -> Resolution {
    let (base_map, local_map, remote_map) = match (base, local, remote) {
        (Value::Object(b), Value::Object(l), Value::Object(r)) => (b, l, r),
        // Non-object payloads cannot be field-merged.
        _ => return Resolution::Flag,
    };

    let local_changed = changed_keys(base_map, local_map);
    let remote_changed = changed_keys(base_map, remote_map);

    if local_changed.intersection(&remote_changed).next().is_some() {
        return Resolution::Flag;
    }

    let mut merged = base_map.clone();
    for key in &remote_changed {
        match remote_map.get(key.as_str()) {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key.as_str());
            }
        }
    }
    for key in &local_changed {
        match local_map.get(key.as_str()) {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key.as_str());
            }
        }
    }

    Resolution::ProceedMerged(Value::Object(merged))
}

/// Keys added, removed, or modified between `base` and `next`.
fn changed_keys(
    base: &serde_json::Map<String, Value>,
    next: &serde_json::Map<String, Value>,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (key, value) in next {
        if base.get(key) != Some(value) {
            changed.insert(key.clone());
        }
    }
    for key in base.keys() {
        if !next.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}
