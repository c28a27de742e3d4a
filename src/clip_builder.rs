use crate::authoring::{CurveFamily, CurveProperty, MotionSpace, ScalarCurve, SourceClip};
use crate::clip::{Clip, ClipEvent, WrapMode};
use crate::skeleton::SkeletonDefinition;
use crate::string_hash::StringHash;
use anyhow::{anyhow, bail, Result};
use glam::{Quat, Vec3, Vec4};
use std::collections::HashMap;
use std::sync::Arc;

pub fn build_clip(source: &SourceClip, bone_filter: Option<&[String]>) -> Result<Option<Arc<Clip>>> {
    check_source(source)?;
    let bones = collect_bone_order(source, bone_filter)?;
    if bones.is_empty() {
        return Ok(None);
    }
    let curve_index = index_curves(source);
    Ok(Some(bake(source, &curve_index, bones)?))
}

// Bone order follows the skeleton, so the baked bindings line up with its bone indices.
pub fn build_clip_for_skeleton(
    source: &SourceClip,
    skeleton: &SkeletonDefinition,
) -> Result<Arc<Clip>> {
    check_source(source)?;
    let curve_index = index_curves(source);
    let bones: Vec<Arc<str>> = skeleton.bones.iter().map(|bone| Arc::clone(&bone.name)).collect();
    bake(source, &curve_index, bones)
}

fn check_source(source: &SourceClip) -> Result<()> {
    if source.motion != MotionSpace::Generic {
        bail!("Clip '{}' uses root or humanoid motion, which crowd baking does not support", source.name);
    }
    if !source.frame_rate.is_finite() || source.frame_rate <= 0.0 {
        bail!("Clip '{}' has invalid frame rate {}", source.name, source.frame_rate);
    }
    if !source.length.is_finite() || source.length <= 0.0 {
        bail!("Clip '{}' has invalid length {}", source.name, source.length);
    }
    Ok(())
}

fn index_curves<'a>(source: &'a SourceClip) -> HashMap<(&'a str, CurveProperty), &'a ScalarCurve> {
    source
        .curves
        .iter()
        .map(|(binding, curve)| ((binding.path.as_ref(), binding.property), curve))
        .collect()
}

fn collect_bone_order(source: &SourceClip, bone_filter: Option<&[String]>) -> Result<Vec<Arc<str>>> {
    let mut translation_bones: Vec<Arc<str>> = Vec::new();
    let mut rotation_bones: Vec<Arc<str>> = Vec::new();
    let mut scale_bones: Vec<Arc<str>> = Vec::new();
    for (binding, _) in &source.curves {
        if let Some(filter) = bone_filter {
            if !filter.iter().any(|path| path.as_str() == binding.path.as_ref()) {
                continue;
            }
        }
        let family_bones = match binding.property.family() {
            CurveFamily::Translation => &mut translation_bones,
            CurveFamily::Rotation => &mut rotation_bones,
            CurveFamily::Scale => &mut scale_bones,
        };
        if !family_bones.iter().any(|path| path.as_ref() == binding.path.as_ref()) {
            family_bones.push(Arc::clone(&binding.path));
        }
    }

    if translation_bones.len() != rotation_bones.len() || translation_bones.len() != scale_bones.len() {
        bail!(
            "Clip '{}' has mismatched track families ({} translation, {} rotation, {} scale bones)",
            source.name,
            translation_bones.len(),
            rotation_bones.len(),
            scale_bones.len()
        );
    }
    for path in &translation_bones {
        let covered = rotation_bones.iter().any(|p| p.as_ref() == path.as_ref())
            && scale_bones.iter().any(|p| p.as_ref() == path.as_ref());
        if !covered {
            bail!("Clip '{}' track families do not cover the same bones ('{}')", source.name, path);
        }
    }
    Ok(translation_bones)
}

fn bake(
    source: &SourceClip,
    curve_index: &HashMap<(&str, CurveProperty), &ScalarCurve>,
    bones: Vec<Arc<str>>,
) -> Result<Arc<Clip>> {
    let bone_count = bones.len();

    let frame_count = (source.length * source.frame_rate).floor() as u32;
    let last_frame_error = source.length * source.frame_rate - frame_count as f32;
    let sample_len = (frame_count as usize + 1) * bone_count;

    let mut rotations = vec![Quat::IDENTITY; sample_len];
    let mut translations = vec![Vec3::ZERO; sample_len];
    let mut scales = vec![Vec3::ONE; sample_len];

    for (bone_index, path) in bones.iter().enumerate() {
        let rotation_curves = [
            fetch_curve(curve_index, source, path, CurveProperty::RotationX)?,
            fetch_curve(curve_index, source, path, CurveProperty::RotationY)?,
            fetch_curve(curve_index, source, path, CurveProperty::RotationZ)?,
            fetch_curve(curve_index, source, path, CurveProperty::RotationW)?,
        ];
        bake_rotation_track(
            &rotation_curves,
            frame_count,
            source.frame_rate,
            source.length,
            last_frame_error,
            bone_count,
            bone_index,
            &mut rotations,
        );

        let translation_curves = [
            fetch_curve(curve_index, source, path, CurveProperty::TranslationX)?,
            fetch_curve(curve_index, source, path, CurveProperty::TranslationY)?,
            fetch_curve(curve_index, source, path, CurveProperty::TranslationZ)?,
        ];
        bake_vec3_track(
            &translation_curves,
            frame_count,
            source.frame_rate,
            source.length,
            last_frame_error,
            bone_count,
            bone_index,
            &mut translations,
        );

        let scale_curves = [
            fetch_curve(curve_index, source, path, CurveProperty::ScaleX)?,
            fetch_curve(curve_index, source, path, CurveProperty::ScaleY)?,
            fetch_curve(curve_index, source, path, CurveProperty::ScaleZ)?,
        ];
        bake_vec3_track(
            &scale_curves,
            frame_count,
            source.frame_rate,
            source.length,
            last_frame_error,
            bone_count,
            bone_index,
            &mut scales,
        );
    }

    let mut events: Vec<ClipEvent> = source
        .events
        .iter()
        .map(|event| ClipEvent {
            function_name_hash: StringHash::of(&event.function_name),
            int_param: event.int_param,
            float_param: event.float_param,
            time: event.time,
        })
        .collect();
    events.sort_by(|a, b| a.time.total_cmp(&b.time));

    let mut clip = Clip {
        name: Arc::clone(&source.name),
        frame_rate: source.frame_rate,
        length: source.length,
        frame_count,
        wrap_mode: if source.looped { WrapMode::Loop } else { WrapMode::Once },
        bindings: bones.iter().map(|path| StringHash::of(path)).collect(),
        local_translations: Arc::from(translations.into_boxed_slice()),
        local_rotations: Arc::from(rotations.into_boxed_slice()),
        local_scales: Arc::from(scales.into_boxed_slice()),
        events: Arc::from(events.into_boxed_slice()),
        hash_code: 0,
    };
    clip.hash_code = clip.compute_content_hash()?;
    Ok(Arc::new(clip))
}

fn fetch_curve<'a>(
    curve_index: &HashMap<(&str, CurveProperty), &'a ScalarCurve>,
    source: &SourceClip,
    path: &str,
    property: CurveProperty,
) -> Result<&'a ScalarCurve> {
    curve_index.get(&(path, property)).copied().ok_or_else(|| {
        anyhow!("Clip '{}' is missing curve '{}' for bone '{}'", source.name, property.name(), path)
    })
}

#[allow(clippy::too_many_arguments)]
fn bake_vec3_track(
    curves: &[&ScalarCurve; 3],
    frame_count: u32,
    frame_rate: f32,
    length: f32,
    last_frame_error: f32,
    bone_count: usize,
    bone_index: usize,
    dest: &mut [Vec3],
) {
    let mut last = evaluate_vec3(curves, 0.0);
    for frame in 0..frame_count {
        last = evaluate_vec3(curves, frame as f32 / frame_rate);
        dest[frame as usize * bone_count + bone_index] = last;
    }
    let at_duration = evaluate_vec3(curves, length);
    dest[frame_count as usize * bone_count + bone_index] =
        correct_last_frame_vec3(last, at_duration, last_frame_error);
}

#[allow(clippy::too_many_arguments)]
fn bake_rotation_track(
    curves: &[&ScalarCurve; 4],
    frame_count: u32,
    frame_rate: f32,
    length: f32,
    last_frame_error: f32,
    bone_count: usize,
    bone_index: usize,
    dest: &mut [Quat],
) {
    let mut last = evaluate_rotation(curves, 0.0);
    for frame in 0..frame_count {
        last = evaluate_rotation(curves, frame as f32 / frame_rate);
        dest[frame as usize * bone_count + bone_index] = Quat::from_vec4(last);
    }
    let at_duration = evaluate_rotation(curves, length);
    let corrected = correct_last_frame_vec4(last, at_duration, last_frame_error);
    dest[frame_count as usize * bone_count + bone_index] = Quat::from_vec4(corrected);
}

fn evaluate_vec3(curves: &[&ScalarCurve; 3], time: f32) -> Vec3 {
    Vec3::new(curves[0].evaluate(time), curves[1].evaluate(time), curves[2].evaluate(time))
}

fn evaluate_rotation(curves: &[&ScalarCurve; 4], time: f32) -> Vec4 {
    let raw = Vec4::new(
        curves[0].evaluate(time),
        curves[1].evaluate(time),
        curves[2].evaluate(time),
        curves[3].evaluate(time),
    );
    let length_sq = raw.length_squared();
    if length_sq > 0.0 {
        raw / length_sq.sqrt()
    } else {
        Vec4::new(0.0, 0.0, 0.0, 1.0)
    }
}

fn extrapolate_component(before: f32, at_duration: f32, last_frame_error: f32) -> f32 {
    if last_frame_error < 1.0 {
        let t = 1.0 / (1.0 - last_frame_error);
        before + (at_duration - before) * t
    } else {
        at_duration
    }
}

pub fn correct_last_frame_vec3(before: Vec3, at_duration: Vec3, last_frame_error: f32) -> Vec3 {
    Vec3::new(
        extrapolate_component(before.x, at_duration.x, last_frame_error),
        extrapolate_component(before.y, at_duration.y, last_frame_error),
        extrapolate_component(before.z, at_duration.z, last_frame_error),
    )
}

pub fn correct_last_frame_vec4(before: Vec4, at_duration: Vec4, last_frame_error: f32) -> Vec4 {
    Vec4::new(
        extrapolate_component(before.x, at_duration.x, last_frame_error),
        extrapolate_component(before.y, at_duration.y, last_frame_error),
        extrapolate_component(before.z, at_duration.z, last_frame_error),
        extrapolate_component(before.w, at_duration.w, last_frame_error),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::{CurveBinding, CurveKey, SourceEvent};

    fn linear_curve(slope: f32) -> ScalarCurve {
        ScalarCurve::from_keys(vec![
            CurveKey { time: 0.0, value: 0.0 },
            CurveKey { time: 10.0, value: slope * 10.0 },
        ])
        .expect("curve")
    }

    fn push_bone(curves: &mut Vec<(CurveBinding, ScalarCurve)>, path: &str) {
        let path: Arc<str> = Arc::from(path);
        let properties = [
            (CurveProperty::TranslationX, linear_curve(1.0)),
            (CurveProperty::TranslationY, ScalarCurve::constant(0.0)),
            (CurveProperty::TranslationZ, ScalarCurve::constant(0.0)),
            (CurveProperty::RotationX, ScalarCurve::constant(0.0)),
            (CurveProperty::RotationY, ScalarCurve::constant(0.0)),
            (CurveProperty::RotationZ, ScalarCurve::constant(0.0)),
            (CurveProperty::RotationW, ScalarCurve::constant(1.0)),
            (CurveProperty::ScaleX, ScalarCurve::constant(1.0)),
            (CurveProperty::ScaleY, ScalarCurve::constant(1.0)),
            (CurveProperty::ScaleZ, ScalarCurve::constant(1.0)),
        ];
        for (property, curve) in properties {
            curves.push((CurveBinding { path: Arc::clone(&path), property }, curve));
        }
    }

    fn source_clip(paths: &[&str], frame_rate: f32, length: f32) -> SourceClip {
        let mut curves = Vec::new();
        for path in paths {
            push_bone(&mut curves, path);
        }
        SourceClip {
            name: Arc::from("test_clip"),
            frame_rate,
            length,
            looped: true,
            motion: MotionSpace::Generic,
            curves,
            events: Vec::new(),
        }
    }

    #[test]
    fn bakes_reference_scenario() {
        let source = source_clip(&["hips", "spine"], 30.0, 1.05);
        let clip = build_clip(&source, None).expect("build").expect("clip");
        assert_eq!(clip.frame_count, 31);
        assert!((clip.last_frame_error() - 0.5).abs() < 1e-4);
        assert_eq!(clip.bone_count(), 2);
        assert_eq!(clip.local_translations.len(), 32 * 2);
        assert_eq!(clip.local_rotations.len(), 32 * 2);
        assert_eq!(clip.local_scales.len(), 32 * 2);
        assert_eq!(clip.bindings[0], StringHash::of("hips"));
        assert_eq!(clip.bindings[1], StringHash::of("spine"));

        let trailing = clip.local_translations[clip.sample_index(31, 0)];
        let before = clip.local_translations[clip.sample_index(30, 0)];
        assert!((before.x - 1.0).abs() < 1e-5);
        assert!((trailing.x - 1.1).abs() < 1e-4);
    }

    #[test]
    fn exact_multiple_length_stores_duration_value() {
        let source = source_clip(&["hips"], 30.0, 1.0);
        let clip = build_clip(&source, None).expect("build").expect("clip");
        assert_eq!(clip.frame_count, 30);
        assert!(clip.last_frame_error().abs() < 1e-5);
        let trailing = clip.local_translations[clip.sample_index(30, 0)];
        assert!((trailing.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn extrapolation_limits() {
        assert!((extrapolate_component(1.0, 2.0, 0.0) - 2.0).abs() < 1e-6);
        assert!((extrapolate_component(1.0, 2.0, 0.5) - 3.0).abs() < 1e-6);
        let near_one = extrapolate_component(1.0, 2.0, 1.0 - 1e-7);
        assert!(near_one.abs() > 1e5);
        assert_eq!(extrapolate_component(1.0, 2.0, 1.0), 2.0);
    }

    #[test]
    fn rejects_root_and_humanoid_motion() {
        let mut source = source_clip(&["hips"], 30.0, 1.0);
        source.motion = MotionSpace::Root;
        assert!(build_clip(&source, None).is_err());
        source.motion = MotionSpace::Humanoid;
        assert!(build_clip(&source, None).is_err());
    }

    #[test]
    fn rejects_missing_component_curve() {
        let mut source = source_clip(&["hips"], 30.0, 1.0);
        source
            .curves
            .retain(|(binding, _)| binding.property != CurveProperty::RotationW);
        let error = build_clip(&source, None).expect_err("missing component must fail");
        assert!(format!("{error}").contains("rotation.w"));
    }

    #[test]
    fn rejects_mismatched_track_families() {
        let mut source = source_clip(&["hips"], 30.0, 1.0);
        source
            .curves
            .retain(|(binding, _)| binding.property.family() != CurveFamily::Scale);
        assert!(build_clip(&source, None).is_err());
    }

    #[test]
    fn bone_filter_limits_output_and_empty_filter_yields_none() {
        let source = source_clip(&["hips", "spine"], 30.0, 1.0);
        let filter = vec!["spine".to_string()];
        let clip = build_clip(&source, Some(&filter)).expect("build").expect("clip");
        assert_eq!(clip.bone_count(), 1);
        assert_eq!(clip.bindings[0], StringHash::of("spine"));

        let unrelated = vec!["tail".to_string()];
        assert!(build_clip(&source, Some(&unrelated)).expect("build").is_none());
    }

    #[test]
    fn identical_inputs_bake_identical_hashes() {
        let source = source_clip(&["hips", "spine"], 30.0, 1.05);
        let first = build_clip(&source, None).expect("build").expect("clip");
        let second = build_clip(&source, None).expect("build").expect("clip");
        assert_eq!(first.hash_code, second.hash_code);
    }

    #[test]
    fn events_are_hashed_and_ordered() {
        let mut source = source_clip(&["hips"], 30.0, 1.0);
        source.events = vec![
            SourceEvent { function_name: "land".into(), int_param: 2, float_param: 0.5, time: 0.9 },
            SourceEvent { function_name: "jump".into(), int_param: 1, float_param: 0.0, time: 0.1 },
        ];
        let clip = build_clip(&source, None).expect("build").expect("clip");
        assert_eq!(clip.events.len(), 2);
        assert_eq!(clip.events[0].function_name_hash, StringHash::of("jump"));
        assert_eq!(clip.events[1].function_name_hash, StringHash::of("land"));
        assert!(clip.events[0].time < clip.events[1].time);
    }

    #[test]
    fn wrap_mode_follows_loop_flag() {
        let mut source = source_clip(&["hips"], 30.0, 1.0);
        source.looped = false;
        let clip = build_clip(&source, None).expect("build").expect("clip");
        assert_eq!(clip.wrap_mode, WrapMode::Once);
    }

    fn test_skeleton(names: &[&str]) -> Arc<SkeletonDefinition> {
        use crate::skeleton::Bone;
        use glam::Mat4;
        let bones = names
            .iter()
            .enumerate()
            .map(|(index, name)| Bone {
                name: Arc::from(*name),
                parent: index.checked_sub(1).map(|p| p as u32),
                rest_translation: Vec3::ZERO,
                rest_rotation: Quat::IDENTITY,
                rest_scale: Vec3::ONE,
                inverse_bind: Mat4::IDENTITY,
            })
            .collect();
        SkeletonDefinition::new("test_rig", bones, Vec::new()).expect("skeleton")
    }

    #[test]
    fn skeleton_build_follows_bone_order() {
        let source = source_clip(&["spine", "hips"], 30.0, 1.0);
        let skeleton = test_skeleton(&["hips", "spine"]);
        let clip = build_clip_for_skeleton(&source, &skeleton).expect("clip");
        assert_eq!(clip.bindings[0], StringHash::of("hips"));
        assert_eq!(clip.bindings[1], StringHash::of("spine"));
        assert!(skeleton.binding_matches(&clip));
    }

    #[test]
    fn skeleton_build_requires_every_bone() {
        let source = source_clip(&["hips"], 30.0, 1.0);
        let skeleton = test_skeleton(&["hips", "spine"]);
        let error = build_clip_for_skeleton(&source, &skeleton).expect_err("spine has no curves");
        assert!(format!("{error}").contains("spine"));
    }
}
