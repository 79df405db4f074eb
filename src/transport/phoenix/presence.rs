use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Deserialize)]
pub struct RawPresenceMeta {
    pub phx_ref: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPresenceEntries {
    pub metas: Vec<RawPresenceMeta>,
}

pub type RawPresenceState = HashMap<String, RawPresenceEntries>;

#[derive(Debug, Clone, Deserialize)]
pub struct RawPresenceDiff {
    #[serde(default)]
    pub joins: RawPresenceState,
    #[serde(default)]
    pub leaves: RawPresenceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// Who joined and who left in one presence update.
#[derive(Debug, Default)]
pub struct PresenceChanges {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

impl PresenceChanges {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }

    /// Payloads for join handlers: `{key, newPresences}`
    pub fn join_payloads(&self) -> Vec<Value> {
        let mut keys: Vec<&String> = self.joins.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| json!({ "key": key, "newPresences": self.joins[key] }))
            .collect()
    }

    /// Payloads for leave handlers: `{key, leftPresences}`
    pub fn leave_payloads(&self) -> Vec<Value> {
        let mut keys: Vec<&String> = self.leaves.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| json!({ "key": key, "leftPresences": self.leaves[key] }))
            .collect()
    }
}

/// Local mirror of the server-side presence map of one channel.
///
/// Diffs that arrive before the first full state for the current join are
/// queued and applied once that state lands.
#[derive(Debug, Default)]
pub struct Presence {
    state: PresenceState,
    pending_diffs: Vec<RawPresenceDiff>,
    join_ref: Option<String>,
}

impl Presence {
    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    pub fn state_json(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    /// True until a full state has been received for `join_ref`.
    pub fn in_pending_sync_state(&self, join_ref: Option<&str>) -> bool {
        self.join_ref.is_none() || self.join_ref.as_deref() != join_ref
    }

    pub fn add_pending_diff(&mut self, diff: RawPresenceDiff) {
        self.pending_diffs.push(diff);
    }

    /// Replaces the whole state, then applies any queued diffs.
    pub fn sync_state(&mut self, raw: RawPresenceState, join_ref: String) -> PresenceChanges {
        let new_state = transform_state(raw);
        let new_refs: HashSet<String> = refs_of(&new_state);
        let current_refs: HashSet<String> = refs_of(&self.state);

        let joins = filter_metas(&new_state, |meta| !current_refs.contains(&meta.presence_ref));
        let leaves = filter_metas(&self.state, |meta| !new_refs.contains(&meta.presence_ref));

        self.state = new_state;
        self.join_ref = Some(join_ref);

        let mut changes = PresenceChanges { joins, leaves };
        for diff in std::mem::take(&mut self.pending_diffs) {
            let applied = self.sync_diff(diff);
            changes.joins.extend(applied.joins);
            changes.leaves.extend(applied.leaves);
        }
        changes
    }

    /// Applies an incremental join/leave diff.
    pub fn sync_diff(&mut self, diff: RawPresenceDiff) -> PresenceChanges {
        let joins = transform_state(diff.joins);
        let leaves = transform_state(diff.leaves);

        for (key, new_metas) in &joins {
            let joined_refs: HashSet<&String> =
                new_metas.iter().map(|meta| &meta.presence_ref).collect();
            let entry = self.state.entry(key.clone()).or_default();
            entry.retain(|meta| !joined_refs.contains(&meta.presence_ref));
            entry.extend(new_metas.iter().cloned());
        }

        for (key, left_metas) in &leaves {
            let left_refs: HashSet<&String> =
                left_metas.iter().map(|meta| &meta.presence_ref).collect();
            if let Some(entry) = self.state.get_mut(key) {
                entry.retain(|meta| !left_refs.contains(&meta.presence_ref));
                if entry.is_empty() {
                    self.state.remove(key);
                }
            }
        }

        PresenceChanges { joins, leaves }
    }

    /// Forgets everything, used when the channel is joined again.
    pub fn reset(&mut self) {
        self.state.clear();
        self.pending_diffs.clear();
        self.join_ref = None;
    }
}

fn transform_state(raw: RawPresenceState) -> PresenceState {
    raw.into_iter()
        .map(|(key, entries)| {
            let metas = entries
                .metas
                .into_iter()
                .map(|raw_meta| PresenceMeta {
                    presence_ref: raw_meta.phx_ref.unwrap_or_default(),
                    data: raw_meta.data,
                })
                .collect();
            (key, metas)
        })
        .collect()
}

fn refs_of(state: &PresenceState) -> HashSet<String> {
    state
        .values()
        .flat_map(|metas| metas.iter().map(|meta| meta.presence_ref.clone()))
        .collect()
}

fn filter_metas(state: &PresenceState, keep: impl Fn(&PresenceMeta) -> bool) -> PresenceState {
    state
        .iter()
        .filter_map(|(key, metas)| {
            let kept: Vec<PresenceMeta> =
                metas.iter().filter(|meta| keep(*meta)).cloned().collect();
            (!kept.is_empty()).then(|| (key.clone(), kept))
        })
        .collect()
}
