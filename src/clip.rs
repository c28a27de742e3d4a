use crate::string_hash::StringHash;
use anyhow::{bail, Context, Result};
use bincode::Options;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const CLIP_MAGIC: [u8; 4] = *b"SCLP";
const CLIP_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapMode {
    Once,
    Loop,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipEvent {
    pub function_name_hash: StringHash,
    pub int_param: i32,
    pub float_param: f32,
    pub time: f32,
}

#[derive(Clone, Debug)]
pub struct Clip {
    pub name: Arc<str>,
    pub frame_rate: f32,
    pub length: f32,
    pub frame_count: u32,
    pub wrap_mode: WrapMode,
    pub bindings: Arc<[StringHash]>,
    pub local_translations: Arc<[Vec3]>,
    pub local_rotations: Arc<[Quat]>,
    pub local_scales: Arc<[Vec3]>,
    pub events: Arc<[ClipEvent]>,
    pub hash_code: u32,
}

impl Clip {
    pub fn bone_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn sample_frame_count(&self) -> u32 {
        self.frame_count + 1
    }

    pub fn sample_len(&self) -> usize {
        self.sample_frame_count() as usize * self.bone_count()
    }

    pub fn sample_index(&self, frame: u32, bone_index: u32) -> usize {
        frame as usize * self.bone_count() + bone_index as usize
    }

    pub fn last_frame_error(&self) -> f32 {
        self.length * self.frame_rate - self.frame_count as f32
    }

    pub fn binding_index(&self, bone: StringHash) -> Option<u32> {
        self.bindings.iter().position(|candidate| *candidate == bone).map(|index| index as u32)
    }

    // Rotation block, then translation, then scale; each (frame_count+1)*bone_count vec4s.
    pub fn packed_samples(&self) -> Vec<[f32; 4]> {
        let mut packed: Vec<[f32; 4]> = Vec::with_capacity(self.sample_len() * 3);
        for rotation in self.local_rotations.iter() {
            packed.push(rotation.to_array());
        }
        for translation in self.local_translations.iter() {
            packed.push([translation.x, translation.y, translation.z, 0.0]);
        }
        for scale in self.local_scales.iter() {
            packed.push([scale.x, scale.y, scale.z, 0.0]);
        }
        packed
    }

    pub fn events_in_window(&self, previous: f32, current: f32) -> SmallVec<[ClipEvent; 4]> {
        let mut fired: SmallVec<[ClipEvent; 4]> = SmallVec::new();
        if self.events.is_empty() || current <= previous || self.length <= 0.0 {
            return fired;
        }
        // Windows are half-open on the left, except the very first advance:
        // a window opening at playback start still fires events authored at t = 0.
        let at_start = previous <= 0.0;
        match self.wrap_mode {
            WrapMode::Once => {
                let from = previous.min(self.length);
                let to = current.min(self.length);
                for event in self.events.iter() {
                    let opened = if at_start { event.time >= from } else { event.time > from };
                    if opened && event.time <= to {
                        fired.push(*event);
                    }
                }
            }
            WrapMode::Loop => {
                if current - previous >= self.length {
                    fired.extend(self.events.iter().copied());
                    return fired;
                }
                let from = previous.rem_euclid(self.length);
                let to = current.rem_euclid(self.length);
                if to >= from {
                    for event in self.events.iter() {
                        let opened = if at_start { event.time >= from } else { event.time > from };
                        if opened && event.time <= to {
                            fired.push(*event);
                        }
                    }
                } else {
                    for event in self.events.iter() {
                        if event.time > from || event.time <= to {
                            fired.push(*event);
                        }
                    }
                }
            }
        }
        fired
    }

    pub fn compute_content_hash(&self) -> Result<u32> {
        let blob = ClipBlob::from_clip(self, 0);
        let bytes = bincode_options().serialize(&blob).context("Failed to hash clip contents")?;
        let digest = blake3::hash(&bytes);
        let head: [u8; 4] = digest.as_bytes()[..4].try_into().expect("blake3 digest is 32 bytes");
        Ok(u32::from_le_bytes(head))
    }

    fn validate(&self) -> Result<()> {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            bail!("Clip '{}' has invalid frame rate {}", self.name, self.frame_rate);
        }
        if !self.length.is_finite() || self.length <= 0.0 {
            bail!("Clip '{}' has invalid length {}", self.name, self.length);
        }
        if self.frame_count != (self.length * self.frame_rate).floor() as u32 {
            bail!("Clip '{}' frame count {} does not match length and rate", self.name, self.frame_count);
        }
        let expected = self.sample_len();
        if self.local_translations.len() != expected
            || self.local_rotations.len() != expected
            || self.local_scales.len() != expected
        {
            bail!(
                "Clip '{}' sample arrays are inconsistent (expected {}, got {}/{}/{})",
                self.name,
                expected,
                self.local_translations.len(),
                self.local_rotations.len(),
                self.local_scales.len()
            );
        }
        if self.events.windows(2).any(|pair| pair[0].time > pair[1].time) {
            bail!("Clip '{}' events are not ordered by time", self.name);
        }
        Ok(())
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

#[derive(Serialize, Deserialize)]
struct ClipBlob {
    name: String,
    frame_rate: f32,
    length: f32,
    frame_count: u32,
    wrap_mode: WrapMode,
    bindings: Vec<u32>,
    local_translations: Vec<[f32; 3]>,
    local_rotations: Vec<[f32; 4]>,
    local_scales: Vec<[f32; 3]>,
    events: Vec<ClipEvent>,
    hash_code: u32,
}

impl ClipBlob {
    fn from_clip(clip: &Clip, hash_code: u32) -> Self {
        Self {
            name: clip.name.to_string(),
            frame_rate: clip.frame_rate,
            length: clip.length,
            frame_count: clip.frame_count,
            wrap_mode: clip.wrap_mode,
            bindings: clip.bindings.iter().map(|binding| binding.value()).collect(),
            local_translations: clip.local_translations.iter().map(|v| v.to_array()).collect(),
            local_rotations: clip.local_rotations.iter().map(|q| q.to_array()).collect(),
            local_scales: clip.local_scales.iter().map(|v| v.to_array()).collect(),
            events: clip.events.to_vec(),
            hash_code,
        }
    }

    fn into_clip(self) -> Clip {
        Clip {
            name: Arc::<str>::from(self.name),
            frame_rate: self.frame_rate,
            length: self.length,
            frame_count: self.frame_count,
            wrap_mode: self.wrap_mode,
            bindings: self.bindings.iter().map(|value| StringHash::from_raw(*value)).collect(),
            local_translations: self.local_translations.iter().map(|v| Vec3::from_array(*v)).collect(),
            local_rotations: self
                .local_rotations
                .iter()
                .map(|q| Quat::from_xyzw(q[0], q[1], q[2], q[3]))
                .collect(),
            local_scales: self.local_scales.iter().map(|v| Vec3::from_array(*v)).collect(),
            events: Arc::from(self.events.into_boxed_slice()),
            hash_code: self.hash_code,
        }
    }
}

pub fn save_clip(clip: &Clip, path: impl AsRef<Path>) -> Result<()> {
    let path_ref = path.as_ref();
    let blob = ClipBlob::from_clip(clip, clip.hash_code);
    let payload = bincode_options().serialize(&blob).context("Failed to serialize clip")?;
    let mut bytes: Vec<u8> = Vec::with_capacity(payload.len() + 8);
    bytes.extend_from_slice(&CLIP_MAGIC);
    bytes.extend_from_slice(&CLIP_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    fs::write(path_ref, bytes)
        .with_context(|| format!("Failed to write clip to {}", path_ref.display()))?;
    Ok(())
}

pub fn load_clip(path: impl AsRef<Path>) -> Result<Arc<Clip>> {
    let path_ref = path.as_ref();
    let bytes =
        fs::read(path_ref).with_context(|| format!("Failed to read clip from {}", path_ref.display()))?;
    if bytes.len() < 8 || bytes[..4] != CLIP_MAGIC {
        bail!("File {} is not a baked clip", path_ref.display());
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("checked header length"));
    if version != CLIP_VERSION {
        bail!("Clip {} has unsupported version {version}", path_ref.display());
    }
    let blob: ClipBlob = bincode_options()
        .deserialize(&bytes[8..])
        .with_context(|| format!("Failed to decode clip from {}", path_ref.display()))?;
    let clip = blob.into_clip();
    clip.validate()?;
    let rehashed = clip.compute_content_hash()?;
    if rehashed != clip.hash_code {
        bail!(
            "Clip {} content hash mismatch (stored {:08x}, computed {:08x})",
            path_ref.display(),
            clip.hash_code,
            rehashed
        );
    }
    Ok(Arc::new(clip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_clip(frame_rate: f32, length: f32, bone_count: usize) -> Clip {
        let frame_count = (length * frame_rate).floor() as u32;
        let sample_len = (frame_count as usize + 1) * bone_count;
        let bindings: Vec<StringHash> =
            (0..bone_count).map(|index| StringHash::of(&format!("bone_{index}"))).collect();
        let mut clip = Clip {
            name: Arc::<str>::from("test"),
            frame_rate,
            length,
            frame_count,
            wrap_mode: WrapMode::Loop,
            bindings: Arc::from(bindings.into_boxed_slice()),
            local_translations: vec![Vec3::ZERO; sample_len].into(),
            local_rotations: vec![Quat::IDENTITY; sample_len].into(),
            local_scales: vec![Vec3::ONE; sample_len].into(),
            events: Arc::from(Vec::new().into_boxed_slice()),
            hash_code: 0,
        };
        clip.hash_code = clip.compute_content_hash().expect("hash");
        clip
    }

    fn with_events(mut clip: Clip, times: &[f32]) -> Clip {
        let events: Vec<ClipEvent> = times
            .iter()
            .map(|time| ClipEvent {
                function_name_hash: StringHash::of("footstep"),
                int_param: 0,
                float_param: 0.0,
                time: *time,
            })
            .collect();
        clip.events = Arc::from(events.into_boxed_slice());
        clip.hash_code = clip.compute_content_hash().expect("hash");
        clip
    }

    #[test]
    fn frame_math_matches_reference_scenario() {
        let clip = test_clip(30.0, 1.05, 2);
        assert_eq!(clip.frame_count, 31);
        assert_eq!(clip.sample_frame_count(), 32);
        assert_eq!(clip.sample_len(), 64);
        assert!((clip.last_frame_error() - 0.5).abs() < 1e-4);
        assert_eq!(clip.sample_index(3, 1), 7);
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let clip = test_clip(30.0, 1.0, 1);
        let again = test_clip(30.0, 1.0, 1);
        assert_eq!(clip.hash_code, again.hash_code);
        assert_eq!(clip.compute_content_hash().expect("hash"), clip.hash_code);
        let longer = test_clip(30.0, 2.0, 1);
        assert_ne!(clip.hash_code, longer.hash_code);
    }

    #[test]
    fn packed_samples_follow_block_layout() {
        let clip = test_clip(30.0, 0.1, 2);
        let packed = clip.packed_samples();
        assert_eq!(packed.len(), clip.sample_len() * 3);
        assert_eq!(packed[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(packed[clip.sample_len()], [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(packed[clip.sample_len() * 2], [1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn looped_event_window_wraps() {
        let clip = with_events(test_clip(30.0, 1.0, 1), &[0.25, 0.75]);
        let fired = clip.events_in_window(0.2, 0.3);
        assert_eq!(fired.len(), 1);
        assert!((fired[0].time - 0.25).abs() < 1e-6);
        let wrapped = clip.events_in_window(0.9, 1.1);
        assert_eq!(wrapped.len(), 0);
        let wrapped = clip.events_in_window(0.7, 1.3);
        assert_eq!(wrapped.len(), 2);
        let full_lap = clip.events_in_window(0.0, 2.5);
        assert_eq!(full_lap.len(), 2);
    }

    #[test]
    fn start_of_clip_events_fire_on_the_first_advance() {
        let mut clip = with_events(test_clip(30.0, 1.0, 1), &[0.0, 0.75]);
        clip.wrap_mode = WrapMode::Once;
        let fired = clip.events_in_window(0.0, 0.5);
        assert_eq!(fired.len(), 1);
        assert!((fired[0].time - 0.0).abs() < 1e-6);
        // Later windows stay half-open on the left.
        assert!(clip.events_in_window(0.5, 0.7).is_empty());

        clip.wrap_mode = WrapMode::Loop;
        let fired = clip.events_in_window(0.0, 0.5);
        assert_eq!(fired.len(), 1);
        // Mid-lap windows only pick up later events; t = 0 waits for the wrap.
        assert_eq!(clip.events_in_window(0.5, 0.75).len(), 1);
        let wrapped = clip.events_in_window(0.9, 1.05);
        assert_eq!(wrapped.len(), 1);
        assert!((wrapped[0].time - 0.0).abs() < 1e-6);
    }

    #[test]
    fn one_shot_event_window_clamps() {
        let mut clip = with_events(test_clip(30.0, 1.0, 1), &[0.25, 0.75]);
        clip.wrap_mode = WrapMode::Once;
        let fired = clip.events_in_window(0.5, 5.0);
        assert_eq!(fired.len(), 1);
        assert!((fired[0].time - 0.75).abs() < 1e-6);
        assert!(clip.events_in_window(1.0, 2.0).is_empty());
    }
}
