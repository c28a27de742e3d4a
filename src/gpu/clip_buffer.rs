use super::{GpuContext, StorageBuffer};
use crate::clip::{Clip, WrapMode};
use crate::config::CrowdConfig;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub const CLIP_FLAG_LOOP: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClipRecordGpu {
    pub sample_start: u32,
    pub bone_count: u32,
    pub frame_count: u32,
    pub flags: u32,
    pub frame_rate: f32,
    pub length: f32,
    pub _pad: [u32; 2],
}

// One shared sample buffer for every uploaded clip, deduplicated by content
// hash; the record table is the index that dispatches address clips through.
pub struct ClipBufferManager {
    samples: StorageBuffer<[f32; 4]>,
    records: StorageBuffer<ClipRecordGpu>,
    records_cpu: Vec<ClipRecordGpu>,
    lookup: HashMap<u32, u32>,
    shared_lookup: Arc<HashMap<u32, u32>>,
}

impl ClipBufferManager {
    pub fn new(gpu: &GpuContext, config: &CrowdConfig) -> Result<Self> {
        let samples = StorageBuffer::new(
            gpu,
            "Crowd Clip Samples",
            config.initial_clip_sample_capacity as usize,
            wgpu::BufferUsages::STORAGE,
        )?;
        let records = StorageBuffer::new(
            gpu,
            "Crowd Clip Records",
            config.initial_clip_record_capacity as usize,
            wgpu::BufferUsages::STORAGE,
        )?;
        Ok(Self {
            samples,
            records,
            records_cpu: Vec::new(),
            lookup: HashMap::new(),
            shared_lookup: Arc::new(HashMap::new()),
        })
    }

    // Idempotent: re-registering a known hash returns the existing index
    // without touching the GPU.
    pub fn register_clip(&mut self, gpu: &GpuContext, clip: &Clip) -> Result<u32> {
        if let Some(&index) = self.lookup.get(&clip.hash_code) {
            return Ok(index);
        }
        let packed = clip.packed_samples();
        let sample_start = self.samples.push(gpu, &packed)?;
        let mut flags = 0;
        if clip.wrap_mode == WrapMode::Loop {
            flags |= CLIP_FLAG_LOOP;
        }
        let record = ClipRecordGpu {
            sample_start,
            bone_count: clip.bone_count() as u32,
            frame_count: clip.frame_count,
            flags,
            frame_rate: clip.frame_rate,
            length: clip.length,
            _pad: [0; 2],
        };
        let clip_index = self.records_cpu.len() as u32;
        self.records.push(gpu, &[record])?;
        self.records_cpu.push(record);
        self.lookup.insert(clip.hash_code, clip_index);
        self.shared_lookup = Arc::new(self.lookup.clone());
        Ok(clip_index)
    }

    pub fn clip_index(&self, hash_code: u32) -> Option<u32> {
        self.lookup.get(&hash_code).copied()
    }

    pub fn clip_count(&self) -> u32 {
        self.records_cpu.len() as u32
    }

    pub fn record(&self, clip_index: u32) -> Option<&ClipRecordGpu> {
        self.records_cpu.get(clip_index as usize)
    }

    pub fn lookup(&self) -> Arc<HashMap<u32, u32>> {
        Arc::clone(&self.shared_lookup)
    }

    pub fn sample_buffer(&self) -> &wgpu::Buffer {
        self.samples.buffer()
    }

    pub fn record_buffer(&self) -> &wgpu::Buffer {
        self.records.buffer()
    }

    pub fn sample_len(&self) -> usize {
        self.samples.len()
    }

    pub fn generation(&self) -> u64 {
        self.samples.generation() + self.records.generation()
    }
}
