use super::GpuContext;
use anyhow::{bail, Result};
use std::marker::PhantomData;

// Growable typed GPU buffer. Capacity only ever increases; `generation` bumps
// on every reallocation so dependent bind groups know to rebuild.
pub struct StorageBuffer<T> {
    buffer: wgpu::Buffer,
    capacity: usize,
    len: usize,
    generation: u64,
    label: &'static str,
    usage: wgpu::BufferUsages,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> StorageBuffer<T> {
    pub fn new(
        gpu: &GpuContext,
        label: &'static str,
        capacity: usize,
        usage: wgpu::BufferUsages,
    ) -> Result<Self> {
        if capacity == 0 {
            bail!("Buffer '{label}' cannot be created with zero capacity");
        }
        let usage = usage | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        let buffer = create_buffer::<T>(gpu, label, capacity, usage);
        Ok(Self { buffer, capacity, len: 0, generation: 0, label, usage, _marker: PhantomData })
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn ensure_capacity(&mut self, gpu: &GpuContext, needed: usize, preserve: bool) {
        if needed <= self.capacity {
            return;
        }
        let mut capacity = self.capacity.max(1);
        while capacity < needed {
            capacity *= 2;
        }
        let new_buffer = create_buffer::<T>(gpu, self.label, capacity, self.usage);
        if preserve && self.len > 0 {
            let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Crowd Buffer Grow"),
            });
            encoder.copy_buffer_to_buffer(
                &self.buffer,
                0,
                &new_buffer,
                0,
                (self.len * std::mem::size_of::<T>()) as u64,
            );
            gpu.queue.submit(Some(encoder.finish()));
        } else {
            self.len = 0;
        }
        self.buffer = new_buffer;
        self.capacity = capacity;
        self.generation += 1;
    }

    pub fn write(&mut self, gpu: &GpuContext, offset: usize, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len();
        if end > self.capacity {
            bail!(
                "Buffer '{}' write of {} elements at {} exceeds capacity {}",
                self.label,
                data.len(),
                offset,
                self.capacity
            );
        }
        gpu.queue.write_buffer(
            &self.buffer,
            (offset * std::mem::size_of::<T>()) as u64,
            bytemuck::cast_slice(data),
        );
        self.len = self.len.max(end);
        Ok(())
    }

    // Appends with a data-preserving grow; returns the start element index.
    pub fn push(&mut self, gpu: &GpuContext, data: &[T]) -> Result<u32> {
        let start = self.len;
        self.ensure_capacity(gpu, start + data.len(), true);
        self.write(gpu, start, data)?;
        Ok(start as u32)
    }
}

fn create_buffer<T>(
    gpu: &GpuContext,
    label: &'static str,
    capacity: usize,
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (capacity * std::mem::size_of::<T>()) as u64,
        usage,
        mapped_at_creation: false,
    })
}
