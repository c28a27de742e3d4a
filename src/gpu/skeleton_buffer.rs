use super::{GpuContext, StorageBuffer};
use crate::config::CrowdConfig;
use crate::skeleton::SkeletonDefinition;
use crate::string_hash::StringHash;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

const INITIAL_RECORD_CAPACITY: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BoneGpu {
    pub rest_translation: [f32; 4],
    pub rest_rotation: [f32; 4],
    pub rest_scale: [f32; 4],
    pub inverse_bind: [[f32; 4]; 4],
    pub parent: i32,
    pub _pad: [i32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkeletonRecordGpu {
    pub bone_start: u32,
    pub bone_count: u32,
    pub mask_start: u32,
    pub mask_count: u32,
}

pub struct SkeletonBufferManager {
    bones: StorageBuffer<BoneGpu>,
    masks: StorageBuffer<f32>,
    records: StorageBuffer<SkeletonRecordGpu>,
    records_cpu: Vec<SkeletonRecordGpu>,
    lookup: HashMap<u32, u32>,
    shared_lookup: Arc<HashMap<u32, u32>>,
    mask_lookup: HashMap<(u32, u32), u32>,
    shared_mask_lookup: Arc<HashMap<(u32, u32), u32>>,
}

impl SkeletonBufferManager {
    pub fn new(gpu: &GpuContext, config: &CrowdConfig) -> Result<Self> {
        let bones = StorageBuffer::new(
            gpu,
            "Crowd Skeleton Bones",
            config.initial_bone_capacity as usize,
            wgpu::BufferUsages::STORAGE,
        )?;
        let masks = StorageBuffer::new(
            gpu,
            "Crowd Skeleton Masks",
            config.initial_mask_capacity as usize,
            wgpu::BufferUsages::STORAGE,
        )?;
        let records = StorageBuffer::new(
            gpu,
            "Crowd Skeleton Records",
            INITIAL_RECORD_CAPACITY,
            wgpu::BufferUsages::STORAGE,
        )?;
        Ok(Self {
            bones,
            masks,
            records,
            records_cpu: Vec::new(),
            lookup: HashMap::new(),
            shared_lookup: Arc::new(HashMap::new()),
            mask_lookup: HashMap::new(),
            shared_mask_lookup: Arc::new(HashMap::new()),
        })
    }

    pub fn register_skeleton(
        &mut self,
        gpu: &GpuContext,
        skeleton: &SkeletonDefinition,
    ) -> Result<u32> {
        if let Some(&index) = self.lookup.get(&skeleton.hash_code) {
            return Ok(index);
        }

        let bone_data: Vec<BoneGpu> = skeleton
            .bones
            .iter()
            .map(|bone| BoneGpu {
                rest_translation: bone.rest_translation.extend(0.0).to_array(),
                rest_rotation: bone.rest_rotation.to_array(),
                rest_scale: bone.rest_scale.extend(0.0).to_array(),
                inverse_bind: bone.inverse_bind.to_cols_array_2d(),
                parent: bone.parent.map(|p| p as i32).unwrap_or(-1),
                _pad: [0; 3],
            })
            .collect();
        let bone_start = self.bones.push(gpu, &bone_data)?;

        // Mask-major: each mask contributes bone_count weights back to back.
        let mut mask_weights: Vec<f32> = Vec::with_capacity(skeleton.masks.len() * skeleton.bone_count());
        for mask in skeleton.masks.iter() {
            mask_weights.extend_from_slice(&mask.weights);
        }
        let mask_start =
            if mask_weights.is_empty() { 0 } else { self.masks.push(gpu, &mask_weights)? };

        let record = SkeletonRecordGpu {
            bone_start,
            bone_count: skeleton.bone_count() as u32,
            mask_start,
            mask_count: skeleton.masks.len() as u32,
        };
        let skeleton_index = self.records_cpu.len() as u32;
        self.records.push(gpu, &[record])?;
        self.records_cpu.push(record);

        self.lookup.insert(skeleton.hash_code, skeleton_index);
        self.shared_lookup = Arc::new(self.lookup.clone());
        for (slot, mask) in skeleton.masks.iter().enumerate() {
            let mask_hash = StringHash::of(&mask.name).value();
            self.mask_lookup.insert((skeleton.hash_code, mask_hash), slot as u32);
        }
        self.shared_mask_lookup = Arc::new(self.mask_lookup.clone());
        Ok(skeleton_index)
    }

    pub fn skeleton_index(&self, hash_code: u32) -> Option<u32> {
        self.lookup.get(&hash_code).copied()
    }

    pub fn bone_count(&self, skeleton_index: u32) -> Option<u32> {
        self.records_cpu.get(skeleton_index as usize).map(|record| record.bone_count)
    }

    pub fn record(&self, skeleton_index: u32) -> Option<&SkeletonRecordGpu> {
        self.records_cpu.get(skeleton_index as usize)
    }

    pub fn skeleton_count(&self) -> u32 {
        self.records_cpu.len() as u32
    }

    pub fn lookup(&self) -> Arc<HashMap<u32, u32>> {
        Arc::clone(&self.shared_lookup)
    }

    pub fn mask_lookup(&self) -> Arc<HashMap<(u32, u32), u32>> {
        Arc::clone(&self.shared_mask_lookup)
    }

    pub fn bone_buffer(&self) -> &wgpu::Buffer {
        self.bones.buffer()
    }

    pub fn mask_buffer(&self) -> &wgpu::Buffer {
        self.masks.buffer()
    }

    pub fn record_buffer(&self) -> &wgpu::Buffer {
        self.records.buffer()
    }

    pub fn generation(&self) -> u64 {
        self.bones.generation() + self.masks.generation() + self.records.generation()
    }
}
