use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::thread;

#[derive(Debug, Clone, Deserialize)]
pub struct CrowdConfig {
    #[serde(default = "CrowdConfig::default_producer_threads")]
    pub producer_threads: u32,
    #[serde(default = "CrowdConfig::default_clip_sample_capacity")]
    pub initial_clip_sample_capacity: u32,
    #[serde(default = "CrowdConfig::default_clip_record_capacity")]
    pub initial_clip_record_capacity: u32,
    #[serde(default = "CrowdConfig::default_command_capacity")]
    pub initial_command_capacity: u32,
    #[serde(default = "CrowdConfig::default_bone_capacity")]
    pub initial_bone_capacity: u32,
    #[serde(default = "CrowdConfig::default_mask_capacity")]
    pub initial_mask_capacity: u32,
    #[serde(default = "CrowdConfig::default_pose_capacity")]
    pub initial_pose_capacity: u32,
    #[serde(default)]
    pub debug_string_table: bool,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            producer_threads: Self::default_producer_threads(),
            initial_clip_sample_capacity: Self::default_clip_sample_capacity(),
            initial_clip_record_capacity: Self::default_clip_record_capacity(),
            initial_command_capacity: Self::default_command_capacity(),
            initial_bone_capacity: Self::default_bone_capacity(),
            initial_mask_capacity: Self::default_mask_capacity(),
            initial_pose_capacity: Self::default_pose_capacity(),
            debug_string_table: false,
        }
    }
}

impl CrowdConfig {
    const fn default_producer_threads() -> u32 {
        0
    }

    const fn default_clip_sample_capacity() -> u32 {
        16384
    }

    const fn default_clip_record_capacity() -> u32 {
        64
    }

    const fn default_command_capacity() -> u32 {
        1024
    }

    const fn default_bone_capacity() -> u32 {
        256
    }

    const fn default_mask_capacity() -> u32 {
        256
    }

    const fn default_pose_capacity() -> u32 {
        256
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("[crowd] Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    // Zero-capacity buffers cannot be created; catch the mistake at setup time.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("initial_clip_sample_capacity", self.initial_clip_sample_capacity),
            ("initial_clip_record_capacity", self.initial_clip_record_capacity),
            ("initial_command_capacity", self.initial_command_capacity),
            ("initial_bone_capacity", self.initial_bone_capacity),
            ("initial_mask_capacity", self.initial_mask_capacity),
            ("initial_pose_capacity", self.initial_pose_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                bail!("Crowd config field '{name}' must be non-zero");
            }
        }
        Ok(())
    }

    pub fn resolved_producer_threads(&self) -> usize {
        if self.producer_threads == 0 {
            thread::available_parallelism().map(|n| n.get().clamp(2, 4)).unwrap_or(2)
        } else {
            self.producer_threads as usize
        }
    }
}
