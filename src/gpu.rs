use anyhow::{bail, Context, Result};
use std::collections::HashMap;

pub mod buffer;
pub mod clip_buffer;
pub mod command_buffer;
pub mod skeleton_buffer;

pub use buffer::StorageBuffer;
pub use clip_buffer::{ClipBufferManager, ClipRecordGpu};
pub use command_buffer::{plan_batches, AnimationCommandBufferManager, BatchPlan};
pub use skeleton_buffer::{BoneGpu, SkeletonBufferManager, SkeletonRecordGpu};

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn new_headless() -> Result<Self> {
        pollster::block_on(Self::init_headless())
    }

    async fn init_headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request compute adapter")?;
        let mut required_limits = adapter.limits();
        required_limits.max_storage_buffers_per_shader_stage =
            required_limits.max_storage_buffers_per_shader_stage.max(8);
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Crowd Compute Device"),
            required_features: wgpu::Features::empty(),
            required_limits,
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request compute device")?;
        Ok(Self { device, queue })
    }

    pub fn uniform_stride(&self, size: u64) -> u64 {
        let align = self.device.limits().min_uniform_buffer_offset_alignment.max(1) as u64;
        size.div_ceil(align) * align
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    StorageRead,
    StorageReadWrite,
    UniformDynamic,
}

#[derive(Clone, Copy, Debug)]
pub struct BindingDesc<'a> {
    pub name: &'a str,
    pub group: u32,
    pub slot: u32,
    pub kind: BindingKind,
}

pub struct ComputeProgramDesc<'a> {
    pub label: &'a str,
    pub kernel: &'a str,
    pub thread_group_size: u32,
    pub bindings: &'a [BindingDesc<'a>],
}

pub struct ComputeProgram {
    pipeline: wgpu::ComputePipeline,
    layouts: Vec<(u32, wgpu::BindGroupLayout)>,
    slots: HashMap<String, (u32, u32)>,
    thread_group_size: u32,
    label: String,
}

impl ComputeProgram {
    pub fn new(device: &wgpu::Device, source: &str, desc: &ComputeProgramDesc) -> Result<Self> {
        if desc.thread_group_size == 0 {
            bail!("Compute program '{}' declares a zero thread-group size", desc.label);
        }
        if !source.contains(&format!("fn {}", desc.kernel)) {
            bail!("Compute program '{}' is missing kernel '{}'", desc.label, desc.kernel);
        }
        let declared = parse_workgroup_size(source);
        if declared != Some(desc.thread_group_size) {
            bail!(
                "Compute program '{}' declares thread-group size {} but the shader uses {:?}",
                desc.label,
                desc.thread_group_size,
                declared
            );
        }

        let declarations = parse_wgsl_bindings(source);
        let mut slots = HashMap::new();
        let mut groups: HashMap<u32, Vec<(u32, BindingKind)>> = HashMap::new();
        for binding in desc.bindings {
            let Some(declaration) =
                declarations.iter().find(|decl| decl.name == binding.name)
            else {
                bail!("Compute program '{}' is missing binding '{}'", desc.label, binding.name);
            };
            if declaration.group != binding.group || declaration.binding != binding.slot {
                bail!(
                    "Compute program '{}' binding '{}' resolves to group {} slot {}, expected group {} slot {}",
                    desc.label,
                    binding.name,
                    declaration.group,
                    declaration.binding,
                    binding.group,
                    binding.slot
                );
            }
            if !declaration.space.matches(binding.kind) {
                bail!(
                    "Compute program '{}' binding '{}' is declared as {} in the shader",
                    desc.label,
                    binding.name,
                    declaration.space.label()
                );
            }
            slots.insert(binding.name.to_string(), (binding.group, binding.slot));
            groups.entry(binding.group).or_default().push((binding.slot, binding.kind));
        }

        let mut group_indices: Vec<u32> = groups.keys().copied().collect();
        group_indices.sort_unstable();
        let mut layouts = Vec::with_capacity(group_indices.len());
        for group in group_indices {
            let mut entries = groups.remove(&group).unwrap_or_default();
            entries.sort_unstable_by_key(|(slot, _)| *slot);
            let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
                .iter()
                .map(|(slot, kind)| wgpu::BindGroupLayoutEntry {
                    binding: *slot,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: match kind {
                            BindingKind::StorageRead => {
                                wgpu::BufferBindingType::Storage { read_only: true }
                            }
                            BindingKind::StorageReadWrite => {
                                wgpu::BufferBindingType::Storage { read_only: false }
                            }
                            BindingKind::UniformDynamic => wgpu::BufferBindingType::Uniform,
                        },
                        has_dynamic_offset: matches!(kind, BindingKind::UniformDynamic),
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{} BGL {group}", desc.label)),
                entries: &layout_entries,
            });
            layouts.push((group, layout));
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let layout_refs: Vec<&wgpu::BindGroupLayout> =
            layouts.iter().map(|(_, layout)| layout).collect();
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{} Layout", desc.label)),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(desc.label),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(desc.kernel),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        Ok(Self {
            pipeline,
            layouts,
            slots,
            thread_group_size: desc.thread_group_size,
            label: desc.label.to_string(),
        })
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    pub fn thread_group_size(&self) -> u32 {
        self.thread_group_size
    }

    pub fn binding_slot(&self, name: &str) -> Option<(u32, u32)> {
        self.slots.get(name).copied()
    }

    pub fn bind_group_layout(&self, group: u32) -> Option<&wgpu::BindGroupLayout> {
        self.layouts.iter().find(|(index, _)| *index == group).map(|(_, layout)| layout)
    }

    // Entries are matched by binding name; every name must belong to `group`.
    pub fn create_bind_group(
        &self,
        device: &wgpu::Device,
        group: u32,
        entries: &[(&str, wgpu::BindingResource)],
    ) -> Result<wgpu::BindGroup> {
        let layout = self
            .bind_group_layout(group)
            .with_context(|| format!("Compute program '{}' has no bind group {group}", self.label))?;
        let mut resolved = Vec::with_capacity(entries.len());
        for (name, resource) in entries {
            let Some((resolved_group, slot)) = self.binding_slot(name) else {
                bail!("Compute program '{}' has no binding named '{name}'", self.label);
            };
            if resolved_group != group {
                bail!(
                    "Compute program '{}' binding '{name}' belongs to group {resolved_group}, not {group}",
                    self.label
                );
            }
            resolved.push(wgpu::BindGroupEntry { binding: slot, resource: resource.clone() });
        }
        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{} BG {group}", self.label)),
            layout,
            entries: &resolved,
        }))
    }
}

pub fn dispatch_group_count(count: u32, thread_group_size: u32) -> u32 {
    if count == 0 {
        0
    } else {
        count.div_ceil(thread_group_size.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WgslSpace {
    Uniform,
    StorageRead,
    StorageReadWrite,
}

impl WgslSpace {
    fn matches(self, kind: BindingKind) -> bool {
        matches!(
            (self, kind),
            (WgslSpace::Uniform, BindingKind::UniformDynamic)
                | (WgslSpace::StorageRead, BindingKind::StorageRead)
                | (WgslSpace::StorageReadWrite, BindingKind::StorageReadWrite)
        )
    }

    fn label(self) -> &'static str {
        match self {
            WgslSpace::Uniform => "var<uniform>",
            WgslSpace::StorageRead => "var<storage, read>",
            WgslSpace::StorageReadWrite => "var<storage, read_write>",
        }
    }
}

#[derive(Clone, Debug)]
struct WgslBindingDecl {
    name: String,
    group: u32,
    binding: u32,
    space: WgslSpace,
}

// Expects one declaration per line, the form this crate's shaders use.
fn parse_wgsl_bindings(source: &str) -> Vec<WgslBindingDecl> {
    let mut declarations = Vec::new();
    for line in source.lines() {
        let Some(rest) = line.trim_start().strip_prefix("@group(") else {
            continue;
        };
        let Some((group, rest)) = parse_attribute_index(rest) else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix("@binding(") else {
            continue;
        };
        let Some((binding, rest)) = parse_attribute_index(rest) else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix("var") else {
            continue;
        };
        let (space, rest) = if let Some(rest) = rest.strip_prefix('<') {
            let Some(end) = rest.find('>') else {
                continue;
            };
            let space_text = rest[..end].trim();
            let space = if space_text == "uniform" {
                WgslSpace::Uniform
            } else if space_text.starts_with("storage") {
                if space_text.contains("read_write") {
                    WgslSpace::StorageReadWrite
                } else {
                    WgslSpace::StorageRead
                }
            } else {
                continue;
            };
            (space, &rest[end + 1..])
        } else {
            continue;
        };
        let name: String =
            rest.trim_start().chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
        if name.is_empty() {
            continue;
        }
        declarations.push(WgslBindingDecl { name, group, binding, space });
    }
    declarations
}

fn parse_attribute_index(rest: &str) -> Option<(u32, &str)> {
    let end = rest.find(')')?;
    let value = rest[..end].trim().parse().ok()?;
    Some((value, &rest[end + 1..]))
}

// Reads the first @workgroup_size attribute; this crate ships single-kernel shaders.
fn parse_workgroup_size(source: &str) -> Option<u32> {
    let start = source.find("@workgroup_size(")? + "@workgroup_size(".len();
    let rest = &source[start..];
    let end = rest.find([',', ')'])?;
    rest[..end].trim().parse().ok()
}
