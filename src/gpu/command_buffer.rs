use super::{GpuContext, SkeletonBufferManager, StorageBuffer};
use crate::commands::{AnimationCommand, AnimationCommandBatch, AnimationCommandGpu};
use crate::config::CrowdConfig;
use anyhow::Result;
use std::collections::HashMap;

#[derive(Default)]
pub struct BatchPlan {
    pub batches: Vec<AnimationCommandBatch>,
    pub commands: Vec<AnimationCommandGpu>,
    pub pose_slots: u32,
    pub dropped_unregistered: u32,
    pub dropped_undiscovered: u32,
}

impl BatchPlan {
    pub fn total_commands(&self) -> u32 {
        self.commands.len() as u32
    }
}

// Lays commands out as one contiguous run per skeleton, in discovery order.
// Whatever remains in `grouped` afterwards was not discovered this frame.
pub fn plan_batches(
    discovered: &[u32],
    grouped: &mut HashMap<u32, Vec<AnimationCommand>>,
    mut resolve_skeleton: impl FnMut(u32) -> Option<(u32, u32)>,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    for &skeleton_hash in discovered {
        let Some(commands) = grouped.remove(&skeleton_hash) else {
            continue;
        };
        if commands.is_empty() {
            continue;
        }
        let Some((skeleton_index, bone_count)) = resolve_skeleton(skeleton_hash) else {
            plan.dropped_unregistered += commands.len() as u32;
            continue;
        };
        let start_index = plan.commands.len() as u32;
        for command in &commands {
            plan.pose_slots = plan.pose_slots.max(command.pose_index + 1);
            plan.commands.push(AnimationCommandGpu::from(command));
        }
        plan.batches.push(AnimationCommandBatch {
            skeleton_hash,
            skeleton_index,
            bone_count,
            start_index,
            count: commands.len() as u32,
        });
    }
    plan.dropped_undiscovered =
        grouped.drain().map(|(_, commands)| commands.len() as u32).sum();
    plan
}

// Transient per-frame storage: contents are fully rewritten every frame, so
// growth never preserves old data.
pub struct AnimationCommandBufferManager {
    commands: StorageBuffer<AnimationCommandGpu>,
}

impl AnimationCommandBufferManager {
    pub fn new(gpu: &GpuContext, config: &CrowdConfig) -> Result<Self> {
        let commands = StorageBuffer::new(
            gpu,
            "Crowd Commands",
            config.initial_command_capacity as usize,
            wgpu::BufferUsages::STORAGE,
        )?;
        Ok(Self { commands })
    }

    pub fn build_batches(
        &mut self,
        gpu: &GpuContext,
        discovered: &[u32],
        mut grouped: HashMap<u32, Vec<AnimationCommand>>,
        skeletons: &SkeletonBufferManager,
    ) -> Result<BatchPlan> {
        let plan = plan_batches(discovered, &mut grouped, |hash| {
            let index = skeletons.skeleton_index(hash)?;
            let bone_count = skeletons.bone_count(index)?;
            Some((index, bone_count))
        });
        if plan.dropped_unregistered > 0 {
            eprintln!(
                "[crowd] Dropped {} commands referencing unregistered skeletons this frame.",
                plan.dropped_unregistered
            );
        }
        if plan.dropped_undiscovered > 0 {
            eprintln!(
                "[crowd] Dropped {} commands referencing undiscovered skeletons this frame.",
                plan.dropped_undiscovered
            );
        }
        self.commands.clear();
        self.commands.ensure_capacity(gpu, plan.commands.len(), false);
        self.commands.write(gpu, 0, &plan.commands)?;
        Ok(plan)
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        self.commands.buffer()
    }

    pub fn generation(&self) -> u64 {
        self.commands.generation()
    }
}
