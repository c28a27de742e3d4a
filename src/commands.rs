use bevy_ecs::entity::Entity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const COMMAND_SHARDS: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct AnimationCommand {
    pub entity: Entity,
    pub clip_index: u32,
    pub time: f32,
    pub weight: f32,
    pub pose_index: u32,
    pub skeleton_hash: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AnimationCommandGpu {
    pub clip_index: u32,
    pub pose_index: u32,
    pub time: f32,
    pub weight: f32,
}

impl From<&AnimationCommand> for AnimationCommandGpu {
    fn from(command: &AnimationCommand) -> Self {
        Self {
            clip_index: command.clip_index,
            pose_index: command.pose_index,
            time: command.time,
            weight: command.weight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnimationCommandBatch {
    pub skeleton_hash: u32,
    pub skeleton_index: u32,
    pub bone_count: u32,
    pub start_index: u32,
    pub count: u32,
}

#[derive(Default)]
struct CommandShard {
    groups: Mutex<HashMap<u32, Vec<AnimationCommand>>>,
}

pub struct CommandQueue {
    shards: Arc<[CommandShard; COMMAND_SHARDS]>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self { shards: Arc::new(std::array::from_fn(|_| CommandShard::default())) }
    }

    pub fn writer(&self) -> CommandWriter {
        CommandWriter { shards: Arc::clone(&self.shards) }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.groups.lock().values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.groups.lock().values().all(Vec::is_empty))
    }

    // Skeleton hashes shard disjointly, so merging the shard maps never collides.
    pub fn drain_grouped(&self) -> HashMap<u32, Vec<AnimationCommand>> {
        let mut grouped = HashMap::new();
        for shard in self.shards.iter() {
            for (skeleton_hash, commands) in shard.groups.lock().drain() {
                if !commands.is_empty() {
                    grouped.insert(skeleton_hash, commands);
                }
            }
        }
        grouped
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.groups.lock().clear();
        }
    }
}

#[derive(Clone)]
pub struct CommandWriter {
    shards: Arc<[CommandShard; COMMAND_SHARDS]>,
}

impl CommandWriter {
    pub fn push(&self, command: AnimationCommand) {
        let shard = &self.shards[shard_index(command.skeleton_hash)];
        shard.groups.lock().entry(command.skeleton_hash).or_default().push(command);
    }
}

fn shard_index(skeleton_hash: u32) -> usize {
    skeleton_hash as usize % COMMAND_SHARDS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(skeleton_hash: u32, clip_index: u32) -> AnimationCommand {
        AnimationCommand {
            entity: Entity::from_raw(clip_index),
            clip_index,
            time: 0.25,
            weight: 1.0,
            pose_index: clip_index,
            skeleton_hash,
        }
    }

    #[test]
    fn drain_groups_by_skeleton() {
        let queue = CommandQueue::new();
        let writer = queue.writer();
        writer.push(command(7, 0));
        writer.push(command(9, 1));
        writer.push(command(7, 2));
        assert_eq!(queue.len(), 3);

        let grouped = queue.drain_grouped();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&7].len(), 2);
        assert_eq!(grouped[&9].len(), 1);
        assert_eq!(grouped[&7][0].clip_index, 0);
        assert_eq!(grouped[&7][1].clip_index, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn writers_share_storage() {
        let queue = CommandQueue::new();
        let first = queue.writer();
        let second = first.clone();
        first.push(command(1, 0));
        second.push(command(1, 1));
        assert_eq!(queue.drain_grouped()[&1].len(), 2);
    }

    #[test]
    fn clear_discards_pending_commands() {
        let queue = CommandQueue::new();
        queue.writer().push(command(3, 0));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.drain_grouped().is_empty());
    }

    #[test]
    fn gpu_layout_matches_command_fields() {
        let gpu = AnimationCommandGpu::from(&command(5, 11));
        assert_eq!(gpu.clip_index, 11);
        assert_eq!(gpu.pose_index, 11);
        assert_eq!(gpu.time, 0.25);
        assert_eq!(gpu.weight, 1.0);
        assert_eq!(std::mem::size_of::<AnimationCommandGpu>(), 16);
    }
}
