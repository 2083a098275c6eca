//! Secondary lookups from query dimensions to memory ids.
//!
//! Keys are scoped by owning NPC, because each participant holds its own copy
//! of an event. Every lookup returns ids newest first. Callers resolve ids
//! against the owner's memory and must skip ids that no longer resolve: the
//! index may briefly reference memories a concurrent processing pass removed.

use std::collections::{BTreeMap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use parking_lot::RwLock;

use crate::event::{EventType, MemoryEvent};
use crate::types::{MemoryId, MemoryRef, NpcId, Timestamp};

/// How multiple participants or tags combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Memory must match every value.
    #[default]
    All,
    /// Memory must match at least one value.
    Any,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    event_type: EventType,
    participants: Vec<NpcId>,
    tags: Vec<String>,
    timestamp: Timestamp,
}

#[derive(Debug, Default)]
struct IndexInner {
    by_type: HashMap<(NpcId, EventType), HashSet<MemoryId>>,
    by_participant: HashMap<(NpcId, NpcId), HashSet<MemoryId>>,
    by_tag: HashMap<(NpcId, String), HashSet<MemoryId>>,
    recent: HashMap<NpcId, BTreeMap<(Timestamp, MemoryId), OrderedFloat<f64>>>,
    entries: HashMap<MemoryRef, IndexEntry>,
}

impl IndexInner {
    fn newest_first(&self, owner: NpcId, ids: impl IntoIterator<Item = MemoryId>) -> Vec<MemoryId> {
        let mut keyed: Vec<(Timestamp, MemoryId)> = ids
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .get(&MemoryRef { owner, id })
                    .map(|e| (e.timestamp, id))
            })
            .collect();
        keyed.sort_unstable_by(|a, b| b.cmp(a));
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    fn combine<'a>(
        &self,
        owner: NpcId,
        sets: impl Iterator<Item = Option<&'a HashSet<MemoryId>>>,
        mode: MatchMode,
    ) -> Vec<MemoryId> {
        let mut acc: Option<HashSet<MemoryId>> = None;
        for set in sets {
            let set = set.cloned().unwrap_or_default();
            acc = Some(match (acc, mode) {
                (None, _) => set,
                (Some(prev), MatchMode::All) => prev.intersection(&set).copied().collect(),
                (Some(mut prev), MatchMode::Any) => {
                    prev.extend(set);
                    prev
                }
            });
        }
        self.newest_first(owner, acc.unwrap_or_default())
    }
}

/// Thread-safe memory index shared by the store and its queries.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    inner: RwLock<IndexInner>,
}

impl MemoryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `memory` as held by `owner`. Re-adding an id replaces its entry.
    pub fn add(&self, owner: NpcId, memory: &MemoryEvent) {
        let key = MemoryRef { owner, id: memory.id };
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            remove_locked(&mut inner, key);
        }

        let participants = memory.participant_set();
        inner
            .by_type
            .entry((owner, memory.event_type()))
            .or_default()
            .insert(memory.id);
        for p in &participants {
            inner.by_participant.entry((owner, *p)).or_default().insert(memory.id);
        }
        for tag in &memory.tags {
            inner.by_tag.entry((owner, tag.clone())).or_default().insert(memory.id);
        }
        inner
            .recent
            .entry(owner)
            .or_default()
            .insert((memory.timestamp, memory.id), OrderedFloat(memory.current_importance));
        inner.entries.insert(
            key,
            IndexEntry {
                event_type: memory.event_type(),
                participants,
                tags: memory.tags.clone(),
                timestamp: memory.timestamp,
            },
        );
    }

    /// Drop a memory from every lookup. Returns `false` if it was not indexed.
    pub fn remove(&self, key: MemoryRef) -> bool {
        remove_locked(&mut self.inner.write(), key)
    }

    /// Record a new (decayed) importance for an indexed memory.
    pub fn update_importance(&self, key: MemoryRef, importance: f64) {
        let mut inner = self.inner.write();
        let Some(timestamp) = inner.entries.get(&key).map(|e| e.timestamp) else {
            return;
        };
        if let Some(recent) = inner.recent.get_mut(&key.owner) {
            recent.insert((timestamp, key.id), OrderedFloat(importance));
        }
    }

    /// Drop every entry owned by `owner`.
    pub fn remove_owner(&self, owner: NpcId) {
        let mut inner = self.inner.write();
        let keys: Vec<MemoryRef> = inner.entries.keys().filter(|k| k.owner == owner).copied().collect();
        for key in keys {
            remove_locked(&mut inner, key);
        }
        inner.recent.remove(&owner);
    }

    /// `owner`'s memories of `event_type`.
    #[must_use]
    pub fn find_memories_by_type(&self, owner: NpcId, event_type: EventType) -> Vec<MemoryId> {
        let inner = self.inner.read();
        let ids = inner.by_type.get(&(owner, event_type)).cloned().unwrap_or_default();
        inner.newest_first(owner, ids)
    }

    /// `owner`'s memories involving all (or any) of `participants`.
    /// An empty participant list matches nothing.
    #[must_use]
    pub fn find_memories_by_participants(&self, owner: NpcId, participants: &[NpcId], mode: MatchMode) -> Vec<MemoryId> {
        let inner = self.inner.read();
        inner.combine(
            owner,
            participants.iter().map(|p| inner.by_participant.get(&(owner, *p))),
            mode,
        )
    }

    /// `owner`'s memories carrying all (or any) of `tags`.
    /// An empty tag list matches nothing.
    #[must_use]
    pub fn find_memories_by_tags(&self, owner: NpcId, tags: &[String], mode: MatchMode) -> Vec<MemoryId> {
        let inner = self.inner.read();
        inner.combine(
            owner,
            tags.iter().map(|t| inner.by_tag.get(&(owner, t.clone()))),
            mode,
        )
    }

    /// Up to `limit` of `owner`'s newest memories with importance at least
    /// `min_importance`.
    #[must_use]
    pub fn find_recent_memories(&self, owner: NpcId, limit: usize, min_importance: f64) -> Vec<MemoryId> {
        let inner = self.inner.read();
        inner.recent.get(&owner).map_or_else(Vec::new, |recent| {
            recent
                .iter()
                .rev()
                .filter(|(_, importance)| importance.0 >= min_importance)
                .take(limit)
                .map(|((_, id), _)| *id)
                .collect()
        })
    }

    /// Number of indexed memories across all owners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop empty buckets left behind by removals. Returns how many went.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.by_type.len() + inner.by_participant.len() + inner.by_tag.len() + inner.recent.len();
        inner.by_type.retain(|_, s| !s.is_empty());
        inner.by_participant.retain(|_, s| !s.is_empty());
        inner.by_tag.retain(|_, s| !s.is_empty());
        inner.recent.retain(|_, r| !r.is_empty());
        before - (inner.by_type.len() + inner.by_participant.len() + inner.by_tag.len() + inner.recent.len())
    }
}

fn remove_locked(inner: &mut IndexInner, key: MemoryRef) -> bool {
    let Some(entry) = inner.entries.remove(&key) else {
        return false;
    };
    if let Some(set) = inner.by_type.get_mut(&(key.owner, entry.event_type)) {
        set.remove(&key.id);
    }
    for p in &entry.participants {
        if let Some(set) = inner.by_participant.get_mut(&(key.owner, *p)) {
            set.remove(&key.id);
        }
    }
    for tag in entry.tags {
        if let Some(set) = inner.by_tag.get_mut(&(key.owner, tag)) {
            set.remove(&key.id);
        }
    }
    if let Some(recent) = inner.recent.get_mut(&key.owner) {
        recent.remove(&(entry.timestamp, key.id));
    }
    true
}
