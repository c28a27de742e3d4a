use crate::clip::Clip;
use crate::commands::{AnimationCommandBatch, CommandQueue, CommandWriter};
use crate::config::CrowdConfig;
use crate::events::{ClipEventTable, ClipEventWriter, EntityClipEvent};
use crate::gpu::{
    dispatch_group_count, AnimationCommandBufferManager, BindingDesc, BindingKind,
    ClipBufferManager, ComputeProgram, ComputeProgramDesc, GpuContext, SkeletonBufferManager,
    StorageBuffer,
};
use crate::jobs::ProducerJoinSet;
use crate::skeleton::{SkeletonDefinition, MAX_BONES_PER_SKELETON};
use crate::string_hash::{self, StringHash};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

pub type PoseMatrixGpu = [[f32; 4]; 4];

const CROWD_POSE_SHADER: &str = include_str!("../assets/shaders/crowd_pose.wgsl");
const CROWD_KERNEL: &str = "crowd_pose_main";
const CROWD_THREAD_GROUP_SIZE: u32 = 64;
const INITIAL_BATCH_CAPACITY: usize = 64;

const CROWD_BINDINGS: &[BindingDesc<'static>] = &[
    BindingDesc { name: "g_clip_samples", group: 0, slot: 0, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_clip_records", group: 0, slot: 1, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_commands", group: 0, slot: 2, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_skeleton_records", group: 0, slot: 3, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_skeleton_bones", group: 0, slot: 4, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_skeleton_masks", group: 0, slot: 5, kind: BindingKind::StorageRead },
    BindingDesc { name: "g_pose_matrices", group: 0, slot: 6, kind: BindingKind::StorageReadWrite },
    BindingDesc { name: "g_batch", group: 1, slot: 0, kind: BindingKind::UniformDynamic },
];

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BatchParamsGpu {
    pub bone_count: u32,
    pub command_start: u32,
    pub command_count: u32,
    pub skeleton_index: u32,
}

#[cfg(feature = "crowd_stats")]
#[derive(Clone, Copy, Debug, Default)]
pub struct CrowdStats {
    pub frames: u64,
    pub commands: u32,
    pub batches: u32,
    pub dispatches: u32,
    pub dropped_commands: u32,
}

// Shared handles producer tasks capture; everything here is safe to use off
// the orchestrator thread.
#[derive(Clone)]
pub struct FrameContext {
    pub clip_lookup: Arc<HashMap<u32, u32>>,
    pub skeleton_lookup: Arc<HashMap<u32, u32>>,
    pub mask_lookup: Arc<HashMap<(u32, u32), u32>>,
    pub commands: CommandWriter,
    pub events: ClipEventWriter,
}

impl FrameContext {
    pub fn clip_index(&self, hash_code: u32) -> Option<u32> {
        self.clip_lookup.get(&hash_code).copied()
    }

    pub fn skeleton_index(&self, hash_code: u32) -> Option<u32> {
        self.skeleton_lookup.get(&hash_code).copied()
    }

    pub fn mask_slot(&self, skeleton_hash: u32, mask_name: StringHash) -> Option<u32> {
        self.mask_lookup.get(&(skeleton_hash, mask_name.value())).copied()
    }
}

pub struct AnimationSystem {
    gpu: Arc<GpuContext>,
    program: ComputeProgram,
    clips: ClipBufferManager,
    skeletons: SkeletonBufferManager,
    commands: AnimationCommandBufferManager,
    poses: StorageBuffer<PoseMatrixGpu>,
    batch_buffer: wgpu::Buffer,
    batch_capacity: usize,
    batch_stride: u64,
    bind_group: Option<wgpu::BindGroup>,
    batch_bind_group: Option<wgpu::BindGroup>,
    bound_generation: Option<u64>,
    join_set: ProducerJoinSet,
    command_queue: CommandQueue,
    events: ClipEventTable,
    installed_debug_names: bool,
    #[cfg(feature = "crowd_stats")]
    stats: CrowdStats,
}

impl AnimationSystem {
    pub fn new(gpu: Arc<GpuContext>, config: CrowdConfig) -> Result<Self> {
        config.validate()?;
        let installed_debug_names = config.debug_string_table;
        if installed_debug_names {
            string_hash::install_debug_names();
        }
        let program = ComputeProgram::new(
            &gpu.device,
            CROWD_POSE_SHADER,
            &ComputeProgramDesc {
                label: "Crowd Pose",
                kernel: CROWD_KERNEL,
                thread_group_size: CROWD_THREAD_GROUP_SIZE,
                bindings: CROWD_BINDINGS,
            },
        )?;
        let clips = ClipBufferManager::new(&gpu, &config)?;
        let skeletons = SkeletonBufferManager::new(&gpu, &config)?;
        let commands = AnimationCommandBufferManager::new(&gpu, &config)?;
        let poses = StorageBuffer::new(
            &gpu,
            "Crowd Pose Matrices",
            config.initial_pose_capacity as usize * MAX_BONES_PER_SKELETON,
            wgpu::BufferUsages::STORAGE,
        )?;
        let batch_stride = gpu.uniform_stride(std::mem::size_of::<BatchParamsGpu>() as u64);
        let batch_buffer = create_batch_buffer(&gpu, INITIAL_BATCH_CAPACITY, batch_stride);
        Ok(Self {
            gpu,
            program,
            clips,
            skeletons,
            commands,
            poses,
            batch_buffer,
            batch_capacity: INITIAL_BATCH_CAPACITY,
            batch_stride,
            bind_group: None,
            batch_bind_group: None,
            bound_generation: None,
            join_set: ProducerJoinSet::new(),
            command_queue: CommandQueue::new(),
            events: ClipEventTable::new(),
            installed_debug_names,
            #[cfg(feature = "crowd_stats")]
            stats: CrowdStats::default(),
        })
    }

    pub fn register_clip(&mut self, clip: &Clip) -> Result<u32> {
        self.clips.register_clip(&self.gpu, clip)
    }

    pub fn register_skeleton(&mut self, skeleton: &SkeletonDefinition) -> Result<u32> {
        self.skeletons.register_skeleton(&self.gpu, skeleton)
    }

    pub fn frame_context(&self) -> FrameContext {
        FrameContext {
            clip_lookup: self.clips.lookup(),
            skeleton_lookup: self.skeletons.lookup(),
            mask_lookup: self.skeletons.mask_lookup(),
            commands: self.command_queue.writer(),
            events: self.events.writer(),
        }
    }

    pub fn spawn_producer<F>(&mut self, task: F) -> Result<()>
    where
        F: FnOnce(FrameContext) -> Result<()> + Send + 'static,
    {
        let context = self.frame_context();
        self.join_set.spawn(move || task(context))
    }

    pub fn add_producer(&mut self, handle: JoinHandle<Result<()>>) {
        self.join_set.add(handle);
    }

    pub fn drain_events(&self) -> HashMap<StringHash, Vec<EntityClipEvent>> {
        self.events.drain()
    }

    pub fn take_events(&self, function_name_hash: StringHash) -> Vec<EntityClipEvent> {
        self.events.take(function_name_hash)
    }

    pub fn clear_events(&self) {
        self.events.clear();
    }

    pub fn pose_buffer(&self) -> &wgpu::Buffer {
        self.poses.buffer()
    }

    #[cfg(feature = "crowd_stats")]
    pub fn stats(&self) -> CrowdStats {
        self.stats
    }

    // One frame: join producers, group their commands by skeleton, upload the
    // grouped runs, then dispatch one compute batch per skeleton.
    pub fn update(&mut self, discovered_skeletons: &[u32]) -> Result<()> {
        self.join_set.wait_all()?;
        let grouped = self.command_queue.drain_grouped();
        let plan =
            self.commands.build_batches(&self.gpu, discovered_skeletons, grouped, &self.skeletons)?;

        #[cfg(feature = "crowd_stats")]
        {
            self.stats.frames += 1;
            self.stats.commands = plan.total_commands();
            self.stats.batches = plan.batches.len() as u32;
            self.stats.dispatches = 0;
            self.stats.dropped_commands = plan.dropped_unregistered + plan.dropped_undiscovered;
        }

        if plan.batches.is_empty() {
            return Ok(());
        }

        let needed_matrices = plan.pose_slots as usize * MAX_BONES_PER_SKELETON;
        self.poses.ensure_capacity(&self.gpu, needed_matrices, false);
        self.write_batch_params(&plan.batches);
        self.ensure_bind_groups()?;
        let bind_group = self.bind_group.as_ref().context("Crowd bind group missing")?;
        let batch_bind_group =
            self.batch_bind_group.as_ref().context("Crowd batch bind group missing")?;

        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Crowd Pose Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Crowd Pose Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.program.pipeline());
            pass.set_bind_group(0, bind_group, &[]);
            for (index, batch) in plan.batches.iter().enumerate() {
                if batch.count == 0 {
                    continue;
                }
                let offset = (index as u64 * self.batch_stride) as u32;
                pass.set_bind_group(1, batch_bind_group, &[offset]);
                let groups = dispatch_group_count(batch.count, self.program.thread_group_size());
                pass.dispatch_workgroups(groups, 1, 1);
                #[cfg(feature = "crowd_stats")]
                {
                    self.stats.dispatches += 1;
                }
            }
        }
        self.gpu.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn write_batch_params(&mut self, batches: &[AnimationCommandBatch]) {
        if batches.len() > self.batch_capacity {
            let mut capacity = self.batch_capacity.max(1);
            while capacity < batches.len() {
                capacity *= 2;
            }
            self.batch_buffer = create_batch_buffer(&self.gpu, capacity, self.batch_stride);
            self.batch_capacity = capacity;
            self.batch_bind_group = None;
        }
        let stride = self.batch_stride as usize;
        let mut staging = vec![0u8; batches.len() * stride];
        for (index, batch) in batches.iter().enumerate() {
            let params = BatchParamsGpu {
                bone_count: batch.bone_count,
                command_start: batch.start_index,
                command_count: batch.count,
                skeleton_index: batch.skeleton_index,
            };
            let offset = index * stride;
            staging[offset..offset + std::mem::size_of::<BatchParamsGpu>()]
                .copy_from_slice(bytemuck::bytes_of(&params));
        }
        self.gpu.queue.write_buffer(&self.batch_buffer, 0, &staging);
    }

    fn ensure_bind_groups(&mut self) -> Result<()> {
        let generation = self.clips.generation()
            + self.skeletons.generation()
            + self.commands.generation()
            + self.poses.generation();
        if self.bound_generation != Some(generation) {
            self.bind_group = None;
            self.bound_generation = Some(generation);
        }
        if self.bind_group.is_none() {
            let bind_group = self.program.create_bind_group(
                &self.gpu.device,
                0,
                &[
                    ("g_clip_samples", self.clips.sample_buffer().as_entire_binding()),
                    ("g_clip_records", self.clips.record_buffer().as_entire_binding()),
                    ("g_commands", self.commands.buffer().as_entire_binding()),
                    ("g_skeleton_records", self.skeletons.record_buffer().as_entire_binding()),
                    ("g_skeleton_bones", self.skeletons.bone_buffer().as_entire_binding()),
                    ("g_skeleton_masks", self.skeletons.mask_buffer().as_entire_binding()),
                    ("g_pose_matrices", self.poses.buffer().as_entire_binding()),
                ],
            )?;
            self.bind_group = Some(bind_group);
        }
        if self.batch_bind_group.is_none() {
            let binding = wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &self.batch_buffer,
                offset: 0,
                size: wgpu::BufferSize::new(std::mem::size_of::<BatchParamsGpu>() as u64),
            });
            let bind_group =
                self.program.create_bind_group(&self.gpu.device, 1, &[("g_batch", binding)])?;
            self.batch_bind_group = Some(bind_group);
        }
        Ok(())
    }
}

impl Drop for AnimationSystem {
    fn drop(&mut self) {
        if self.installed_debug_names {
            string_hash::teardown_debug_names();
        }
    }
}

fn create_batch_buffer(gpu: &GpuContext, capacity: usize, stride: u64) -> wgpu::Buffer {
    gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Crowd Batch Params"),
        size: capacity as u64 * stride,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_params_layout_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<BatchParamsGpu>(), 16);
    }

    #[test]
    fn binding_table_matches_the_shader() {
        let names: Vec<&str> = CROWD_BINDINGS.iter().map(|binding| binding.name).collect();
        for name in &names {
            assert!(CROWD_POSE_SHADER.contains(name), "shader is missing binding {name}");
        }
        assert!(CROWD_POSE_SHADER.contains(&format!("fn {CROWD_KERNEL}")));
        assert!(CROWD_POSE_SHADER.contains(&format!("@workgroup_size({CROWD_THREAD_GROUP_SIZE}")));
    }
}
