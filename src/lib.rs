pub mod authoring;
pub mod clip;
pub mod clip_builder;
pub mod commands;
pub mod config;
pub mod ecs;
pub mod events;
pub mod gpu;
pub mod jobs;
pub mod skeleton;
pub mod string_hash;
pub mod system;
pub mod type_registry;

pub use clip::{load_clip, save_clip, Clip, ClipEvent, WrapMode};
pub use clip_builder::{build_clip, build_clip_for_skeleton};
pub use commands::{AnimationCommand, AnimationCommandBatch, CommandQueue, CommandWriter};
pub use config::CrowdConfig;
pub use events::{ClipEventTable, ClipEventWriter, EntityClipEvent};
pub use gpu::GpuContext;
pub use jobs::ProducerJoinSet;
pub use skeleton::{SkeletonDefinition, SkeletonMask, MAX_BONES_PER_SKELETON};
pub use string_hash::StringHash;
pub use system::{AnimationSystem, FrameContext};
