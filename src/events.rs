use crate::string_hash::StringHash;
use bevy_ecs::entity::Entity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const EVENT_SHARDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntityClipEvent {
    pub entity: Entity,
    pub int_param: i32,
    pub float_param: f32,
}

#[derive(Default)]
struct EventShard {
    events: Mutex<HashMap<StringHash, Vec<EntityClipEvent>>>,
}

// Frame-scoped multi-map: producers insert concurrently, listeners read after the join.
pub struct ClipEventTable {
    shards: Arc<[EventShard; EVENT_SHARDS]>,
}

impl Default for ClipEventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipEventTable {
    pub fn new() -> Self {
        Self { shards: Arc::new(std::array::from_fn(|_| EventShard::default())) }
    }

    pub fn writer(&self) -> ClipEventWriter {
        ClipEventWriter { shards: Arc::clone(&self.shards) }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.events.lock().values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.events.lock().values().all(Vec::is_empty))
    }

    pub fn take(&self, function_name_hash: StringHash) -> Vec<EntityClipEvent> {
        let shard = &self.shards[shard_index(function_name_hash)];
        shard.events.lock().remove(&function_name_hash).unwrap_or_default()
    }

    pub fn drain(&self) -> HashMap<StringHash, Vec<EntityClipEvent>> {
        let mut drained = HashMap::new();
        for shard in self.shards.iter() {
            for (hash, events) in shard.events.lock().drain() {
                if !events.is_empty() {
                    drained.insert(hash, events);
                }
            }
        }
        drained
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.events.lock().clear();
        }
    }
}

#[derive(Clone)]
pub struct ClipEventWriter {
    shards: Arc<[EventShard; EVENT_SHARDS]>,
}

impl ClipEventWriter {
    pub fn push(&self, function_name_hash: StringHash, event: EntityClipEvent) {
        let shard = &self.shards[shard_index(function_name_hash)];
        shard.events.lock().entry(function_name_hash).or_default().push(event);
    }
}

fn shard_index(hash: StringHash) -> usize {
    hash.value() as usize % EVENT_SHARDS
}
