use anyhow::{anyhow, bail, Context, Result};
use gltf::animation::util::{ReadOutputs, Rotations};
use gltf::animation::{Interpolation, Property};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CurveFamily {
    Translation,
    Rotation,
    Scale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CurveProperty {
    TranslationX,
    TranslationY,
    TranslationZ,
    RotationX,
    RotationY,
    RotationZ,
    RotationW,
    ScaleX,
    ScaleY,
    ScaleZ,
}

impl CurveProperty {
    pub fn parse(name: &str) -> Option<Self> {
        let property = match name {
            "translation.x" => CurveProperty::TranslationX,
            "translation.y" => CurveProperty::TranslationY,
            "translation.z" => CurveProperty::TranslationZ,
            "rotation.x" => CurveProperty::RotationX,
            "rotation.y" => CurveProperty::RotationY,
            "rotation.z" => CurveProperty::RotationZ,
            "rotation.w" => CurveProperty::RotationW,
            "scale.x" => CurveProperty::ScaleX,
            "scale.y" => CurveProperty::ScaleY,
            "scale.z" => CurveProperty::ScaleZ,
            _ => return None,
        };
        Some(property)
    }

    pub fn name(self) -> &'static str {
        match self {
            CurveProperty::TranslationX => "translation.x",
            CurveProperty::TranslationY => "translation.y",
            CurveProperty::TranslationZ => "translation.z",
            CurveProperty::RotationX => "rotation.x",
            CurveProperty::RotationY => "rotation.y",
            CurveProperty::RotationZ => "rotation.z",
            CurveProperty::RotationW => "rotation.w",
            CurveProperty::ScaleX => "scale.x",
            CurveProperty::ScaleY => "scale.y",
            CurveProperty::ScaleZ => "scale.z",
        }
    }

    pub fn family(self) -> CurveFamily {
        match self {
            CurveProperty::TranslationX | CurveProperty::TranslationY | CurveProperty::TranslationZ => {
                CurveFamily::Translation
            }
            CurveProperty::RotationX
            | CurveProperty::RotationY
            | CurveProperty::RotationZ
            | CurveProperty::RotationW => CurveFamily::Rotation,
            CurveProperty::ScaleX | CurveProperty::ScaleY | CurveProperty::ScaleZ => CurveFamily::Scale,
        }
    }

}

#[derive(Clone, Debug, PartialEq)]
pub struct CurveBinding {
    pub path: Arc<str>,
    pub property: CurveProperty,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CurveKey {
    pub time: f32,
    pub value: f32,
}

#[derive(Clone, Debug)]
pub struct ScalarCurve {
    keys: Arc<[CurveKey]>,
}

impl ScalarCurve {
    pub fn from_keys(keys: Vec<CurveKey>) -> Result<Self> {
        if keys.is_empty() {
            bail!("Curve must contain at least one key");
        }
        let mut sorted = keys;
        for key in &sorted {
            if !key.time.is_finite() || !key.value.is_finite() {
                bail!("Curve contains non-finite key data");
            }
            if key.time < 0.0 {
                bail!("Curve key time cannot be negative");
            }
        }
        sorted.sort_by(|a, b| a.time.total_cmp(&b.time));
        let mut deduped: Vec<CurveKey> = Vec::with_capacity(sorted.len());
        for key in sorted {
            if let Some(last) = deduped.last_mut() {
                if (key.time - last.time).abs() <= f32::EPSILON {
                    last.value = key.value;
                    continue;
                }
            }
            deduped.push(key);
        }
        Ok(Self { keys: Arc::from(deduped.into_boxed_slice()) })
    }

    pub fn constant(value: f32) -> Self {
        Self { keys: Arc::from(vec![CurveKey { time: 0.0, value }].into_boxed_slice()) }
    }

    pub fn keys(&self) -> &[CurveKey] {
        &self.keys
    }

    pub fn last_time(&self) -> f32 {
        self.keys.last().map(|key| key.time).unwrap_or(0.0)
    }

    pub fn evaluate(&self, time: f32) -> f32 {
        let keys = &self.keys;
        let first = keys[0];
        if keys.len() == 1 || time <= first.time {
            return first.value;
        }
        let last = keys[keys.len() - 1];
        if time >= last.time {
            return last.value;
        }
        let upper = keys.partition_point(|key| key.time <= time);
        let a = keys[upper - 1];
        let b = keys[upper];
        let span = b.time - a.time;
        if span <= f32::EPSILON {
            return b.value;
        }
        let t = (time - a.time) / span;
        a.value + (b.value - a.value) * t
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionSpace {
    #[default]
    Generic,
    Root,
    Humanoid,
}

#[derive(Clone, Debug)]
pub struct SourceEvent {
    pub function_name: String,
    pub int_param: i32,
    pub float_param: f32,
    pub time: f32,
}

#[derive(Clone)]
pub struct SourceClip {
    pub name: Arc<str>,
    pub frame_rate: f32,
    pub length: f32,
    pub looped: bool,
    pub motion: MotionSpace,
    pub curves: Vec<(CurveBinding, ScalarCurve)>,
    pub events: Vec<SourceEvent>,
}

impl SourceClip {
    pub fn curve(&self, path: &str, property: CurveProperty) -> Option<&ScalarCurve> {
        self.curves
            .iter()
            .find(|(binding, _)| binding.property == property && binding.path.as_ref() == path)
            .map(|(_, curve)| curve)
    }

    pub fn bone_paths(&self) -> Vec<Arc<str>> {
        let mut seen: Vec<Arc<str>> = Vec::new();
        for (binding, _) in &self.curves {
            if !seen.iter().any(|path| path.as_ref() == binding.path.as_ref()) {
                seen.push(Arc::clone(&binding.path));
            }
        }
        seen
    }

    pub fn max_key_time(&self) -> f32 {
        self.curves.iter().map(|(_, curve)| curve.last_time()).fold(0.0_f32, f32::max)
    }
}

#[derive(Deserialize)]
struct SourceClipFile {
    name: String,
    #[serde(default = "SourceClipFile::default_frame_rate")]
    frame_rate: f32,
    #[serde(default)]
    length: Option<f32>,
    #[serde(default = "SourceClipFile::default_looped")]
    looped: bool,
    #[serde(default)]
    motion: MotionSpace,
    curves: Vec<SourceCurveFile>,
    #[serde(default)]
    events: Vec<SourceEventFile>,
}

impl SourceClipFile {
    const fn default_frame_rate() -> f32 {
        30.0
    }

    const fn default_looped() -> bool {
        true
    }
}

#[derive(Deserialize)]
struct SourceCurveFile {
    path: String,
    property: String,
    keys: Vec<[f32; 2]>,
}

#[derive(Deserialize)]
struct SourceEventFile {
    function: String,
    #[serde(default)]
    int_param: i32,
    #[serde(default)]
    float_param: f32,
    time: f32,
}

pub fn parse_source_clip_bytes(bytes: &[u8]) -> Result<SourceClip> {
    let file: SourceClipFile =
        serde_json::from_slice(bytes).context("Failed to parse source clip JSON")?;
    let mut curves: Vec<(CurveBinding, ScalarCurve)> = Vec::with_capacity(file.curves.len());
    for entry in file.curves {
        let property = CurveProperty::parse(&entry.property).ok_or_else(|| {
            anyhow!("Source clip '{}' references unknown curve property '{}'", file.name, entry.property)
        })?;
        let keys = entry.keys.iter().map(|[time, value]| CurveKey { time: *time, value: *value }).collect();
        let curve = ScalarCurve::from_keys(keys)
            .with_context(|| format!("Invalid curve '{}' / '{}'", entry.path, entry.property))?;
        curves.push((CurveBinding { path: Arc::<str>::from(entry.path), property }, curve));
    }
    let mut events: Vec<SourceEvent> = file
        .events
        .into_iter()
        .map(|event| SourceEvent {
            function_name: event.function,
            int_param: event.int_param,
            float_param: event.float_param,
            time: event.time,
        })
        .collect();
    events.sort_by(|a, b| a.time.total_cmp(&b.time));
    let mut clip = SourceClip {
        name: Arc::<str>::from(file.name),
        frame_rate: file.frame_rate,
        length: file.length.unwrap_or(0.0),
        looped: file.looped,
        motion: file.motion,
        curves,
        events,
    };
    if file.length.is_none() {
        clip.length = clip.max_key_time();
    }
    Ok(clip)
}

pub fn load_source_clip(path: impl AsRef<Path>) -> Result<SourceClip> {
    let path_ref = path.as_ref();
    let bytes = fs::read(path_ref)
        .with_context(|| format!("Failed to read source clip from {}", path_ref.display()))?;
    parse_source_clip_bytes(&bytes)
}

pub fn load_source_clip_from_gltf(
    path: impl AsRef<Path>,
    animation_name: Option<&str>,
    frame_rate: f32,
) -> Result<SourceClip> {
    let path_ref = path.as_ref();
    let (document, buffers, _) = gltf::import(path_ref)
        .with_context(|| format!("Failed to import GLTF animation from {}", path_ref.display()))?;

    let animation = match animation_name {
        Some(name) => document
            .animations()
            .find(|animation| animation.name() == Some(name))
            .ok_or_else(|| anyhow!("GLTF '{}' has no animation named '{name}'", path_ref.display()))?,
        None => document
            .animations()
            .next()
            .ok_or_else(|| anyhow!("GLTF '{}' contains no animations", path_ref.display()))?,
    };
    let clip_name: Arc<str> = animation
        .name()
        .map(Arc::<str>::from)
        .unwrap_or_else(|| Arc::<str>::from(format!("animation_{}", animation.index())));

    let mut curves: Vec<(CurveBinding, ScalarCurve)> = Vec::new();
    for channel in animation.channels() {
        let target_node = channel.target().node();
        let bone_path: Arc<str> = target_node
            .name()
            .map(Arc::<str>::from)
            .unwrap_or_else(|| Arc::<str>::from(format!("node_{}", target_node.index())));

        match channel.sampler().interpolation() {
            Interpolation::Linear | Interpolation::Step => {}
            Interpolation::CubicSpline => {
                eprintln!(
                    "[clip] animation '{}' uses CubicSpline interpolation; skipping channel (node {}).",
                    clip_name,
                    target_node.index()
                );
                continue;
            }
        }

        let reader = channel.reader(|buffer| Some(&buffers[buffer.index()]));
        let Some(inputs) = reader.read_inputs() else {
            continue;
        };
        let times: Vec<f32> = inputs.collect();
        if times.is_empty() {
            continue;
        }
        let Some(outputs) = reader.read_outputs() else {
            continue;
        };

        match (channel.target().property(), outputs) {
            (Property::Translation, ReadOutputs::Translations(values)) => {
                let components: Vec<[f32; 3]> = values.collect();
                push_component_curves(
                    &mut curves,
                    &bone_path,
                    &times,
                    &components,
                    &[CurveProperty::TranslationX, CurveProperty::TranslationY, CurveProperty::TranslationZ],
                )?;
            }
            (Property::Scale, ReadOutputs::Scales(values)) => {
                let components: Vec<[f32; 3]> = values.collect();
                push_component_curves(
                    &mut curves,
                    &bone_path,
                    &times,
                    &components,
                    &[CurveProperty::ScaleX, CurveProperty::ScaleY, CurveProperty::ScaleZ],
                )?;
            }
            (Property::Rotation, ReadOutputs::Rotations(rotations)) => {
                let components = convert_rotations(rotations);
                push_component_curves(
                    &mut curves,
                    &bone_path,
                    &times,
                    &components,
                    &[
                        CurveProperty::RotationX,
                        CurveProperty::RotationY,
                        CurveProperty::RotationZ,
                        CurveProperty::RotationW,
                    ],
                )?;
            }
            _ => {}
        }
    }

    if curves.is_empty() {
        bail!("GLTF animation '{}' produced no transform curves", clip_name);
    }

    let mut clip = SourceClip {
        name: clip_name,
        frame_rate,
        length: 0.0,
        looped: true,
        motion: MotionSpace::Generic,
        curves,
        events: Vec::new(),
    };
    clip.length = clip.max_key_time();
    Ok(clip)
}

fn push_component_curves<const N: usize>(
    curves: &mut Vec<(CurveBinding, ScalarCurve)>,
    bone_path: &Arc<str>,
    times: &[f32],
    values: &[[f32; N]],
    properties: &[CurveProperty; N],
) -> Result<()> {
    if values.len() != times.len() {
        bail!("Animation channel time/value count mismatch ({} vs {})", times.len(), values.len());
    }
    for (component, property) in properties.iter().enumerate() {
        let keys = times
            .iter()
            .zip(values.iter())
            .map(|(time, value)| CurveKey { time: *time, value: value[component] })
            .collect();
        let curve = ScalarCurve::from_keys(keys)
            .with_context(|| format!("Invalid channel '{}' / '{}'", bone_path, property.name()))?;
        curves.push((CurveBinding { path: Arc::clone(bone_path), property: *property }, curve));
    }
    Ok(())
}

fn convert_rotations(rotations: Rotations) -> Vec<[f32; 4]> {
    rotations
        .into_f32()
        .map(|components| {
            let length_sq: f32 = components.iter().map(|c| c * c).sum();
            if length_sq > 0.0 {
                let inv = length_sq.sqrt().recip();
                [components[0] * inv, components[1] * inv, components[2] * inv, components[3] * inv]
            } else {
                [0.0, 0.0, 0.0, 1.0]
            }
        })
        .collect()
}
