use crate::clip::Clip;
use crate::string_hash::StringHash;
use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat4, Quat, Vec3};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

// Per-thread pose cache bound in the compute kernel; keep in sync with crowd_pose.wgsl.
pub const MAX_BONES_PER_SKELETON: usize = 64;

#[derive(Clone)]
pub struct Bone {
    pub name: Arc<str>,
    pub parent: Option<u32>,
    pub rest_translation: Vec3,
    pub rest_rotation: Quat,
    pub rest_scale: Vec3,
    pub inverse_bind: Mat4,
}

impl Bone {
    pub fn name_hash(&self) -> StringHash {
        StringHash::of(&self.name)
    }
}

#[derive(Clone)]
pub struct SkeletonMask {
    pub name: Arc<str>,
    pub weights: Arc<[f32]>,
}

#[derive(Clone)]
pub struct SkeletonDefinition {
    pub name: Arc<str>,
    pub bones: Arc<[Bone]>,
    pub masks: Arc<[SkeletonMask]>,
    pub hash_code: u32,
}

impl SkeletonDefinition {
    pub fn new(
        name: impl Into<Arc<str>>,
        bones: Vec<Bone>,
        masks: Vec<SkeletonMask>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if bones.is_empty() {
            bail!("Skeleton '{name}' has no bones");
        }
        if bones.len() > MAX_BONES_PER_SKELETON {
            bail!(
                "Skeleton '{name}' has {} bones; the crowd kernel supports at most {}",
                bones.len(),
                MAX_BONES_PER_SKELETON
            );
        }
        for (index, bone) in bones.iter().enumerate() {
            if let Some(parent) = bone.parent {
                if parent as usize >= index {
                    bail!(
                        "Skeleton '{name}' bone '{}' ({index}) must come after its parent ({parent})",
                        bone.name
                    );
                }
            }
        }
        for mask in &masks {
            if mask.weights.len() != bones.len() {
                bail!(
                    "Skeleton '{name}' mask '{}' has {} weights for {} bones",
                    mask.name,
                    mask.weights.len(),
                    bones.len()
                );
            }
            if mask.weights.iter().any(|weight| !weight.is_finite() || !(0.0..=1.0).contains(weight)) {
                bail!("Skeleton '{name}' mask '{}' has weights outside [0, 1]", mask.name);
            }
        }
        let hash_code = content_hash(&name, &bones, &masks);
        Ok(Arc::new(Self {
            name,
            bones: Arc::from(bones.into_boxed_slice()),
            masks: Arc::from(masks.into_boxed_slice()),
            hash_code,
        }))
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    pub fn bone_index(&self, name: &str) -> Option<u32> {
        self.bones.iter().position(|bone| bone.name.as_ref() == name).map(|index| index as u32)
    }

    pub fn mask_index(&self, name: &str) -> Option<u32> {
        self.masks.iter().position(|mask| mask.name.as_ref() == name).map(|index| index as u32)
    }

    // A clip drives this rig only when its bindings mirror the bone order exactly.
    pub fn binding_matches(&self, clip: &Clip) -> bool {
        clip.bone_count() == self.bones.len()
            && self
                .bones
                .iter()
                .zip(clip.bindings.iter())
                .all(|(bone, binding)| bone.name_hash() == *binding)
    }
}

fn content_hash(name: &str, bones: &[Bone], masks: &[SkeletonMask]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&(bones.len() as u32).to_le_bytes());
    for bone in bones {
        hasher.update(bone.name.as_bytes());
        hasher.update(&bone.parent.map(|p| p as i64).unwrap_or(-1).to_le_bytes());
        for component in bone.rest_translation.to_array() {
            hasher.update(&component.to_le_bytes());
        }
        for component in bone.rest_rotation.to_array() {
            hasher.update(&component.to_le_bytes());
        }
        for component in bone.rest_scale.to_array() {
            hasher.update(&component.to_le_bytes());
        }
        for component in bone.inverse_bind.to_cols_array() {
            hasher.update(&component.to_le_bytes());
        }
    }
    hasher.update(&(masks.len() as u32).to_le_bytes());
    for mask in masks {
        hasher.update(mask.name.as_bytes());
        for weight in mask.weights.iter() {
            hasher.update(&weight.to_le_bytes());
        }
    }
    let digest = hasher.finalize();
    let head: [u8; 4] = digest.as_bytes()[..4].try_into().expect("blake3 digest is 32 bytes");
    u32::from_le_bytes(head)
}

pub fn load_skeleton_from_gltf(path: impl AsRef<Path>) -> Result<Arc<SkeletonDefinition>> {
    let path_ref = path.as_ref();
    let (document, buffers, _) = gltf::import(path_ref)
        .with_context(|| format!("Failed to import GLTF skeleton from {}", path_ref.display()))?;

    let mut skins = document.skins();
    let skin =
        skins.next().ok_or_else(|| anyhow!("GLTF '{}' does not contain a skin", path_ref.display()))?;
    if skins.next().is_some() {
        eprintln!(
            "[crowd] GLTF '{}' contains multiple skins; only the first will be imported.",
            path_ref.display()
        );
    }

    let skeleton_name: Arc<str> = Arc::<str>::from(
        skin.name()
            .map(|s| s.to_string())
            .or_else(|| {
                path_ref.file_stem().and_then(|stem| stem.to_str()).map(|stem| format!("{stem}_skeleton"))
            })
            .unwrap_or_else(|| "skeleton".to_string()),
    );

    let joint_nodes: Vec<_> = skin.joints().collect();
    if joint_nodes.is_empty() {
        bail!("GLTF '{}' skin '{}' has no joints", path_ref.display(), skeleton_name);
    }

    let node_to_joint: HashMap<usize, u32> =
        joint_nodes.iter().enumerate().map(|(idx, node)| (node.index(), idx as u32)).collect();

    let mut parent_by_joint: Vec<Option<u32>> = vec![None; joint_nodes.len()];
    for (parent_idx, node) in joint_nodes.iter().enumerate() {
        for child in node.children() {
            if let Some(&child_joint) = node_to_joint.get(&child.index()) {
                parent_by_joint[child_joint as usize] = Some(parent_idx as u32);
            }
        }
    }

    let skin_reader = skin.reader(|buffer| Some(&buffers[buffer.index()]));
    let mut inverse_bind = vec![Mat4::IDENTITY; joint_nodes.len()];
    if let Some(reader) = skin_reader.read_inverse_bind_matrices() {
        for (idx, matrix) in reader.enumerate() {
            if idx < inverse_bind.len() {
                inverse_bind[idx] = Mat4::from_cols_array_2d(&matrix);
            }
        }
    }

    // The kernel composes poses in a single forward pass, so parents must precede children.
    let order = toposort_joints(&parent_by_joint)?;
    let mut remapped = vec![0u32; joint_nodes.len()];
    for (new_index, old_index) in order.iter().enumerate() {
        remapped[*old_index as usize] = new_index as u32;
    }

    let mut bones: Vec<Bone> = Vec::with_capacity(joint_nodes.len());
    for old_index in &order {
        let node = &joint_nodes[*old_index as usize];
        let (t, r, s) = node.transform().decomposed();
        let rotation = Quat::from_xyzw(r[0], r[1], r[2], r[3]);
        let rotation = if rotation.length_squared() > 0.0 { rotation.normalize() } else { Quat::IDENTITY };
        let joint_name = node
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("joint_{old_index}"));
        bones.push(Bone {
            name: Arc::<str>::from(joint_name),
            parent: parent_by_joint[*old_index as usize].map(|parent| remapped[parent as usize]),
            rest_translation: Vec3::from_array(t),
            rest_rotation: rotation,
            rest_scale: Vec3::from_array(s),
            inverse_bind: inverse_bind[*old_index as usize],
        });
    }

    SkeletonDefinition::new(skeleton_name, bones, Vec::new())
}

fn toposort_joints(parent_by_joint: &[Option<u32>]) -> Result<Vec<u32>> {
    let mut order: Vec<u32> = Vec::with_capacity(parent_by_joint.len());
    let mut placed = vec![false; parent_by_joint.len()];
    while order.len() < parent_by_joint.len() {
        let mut advanced = false;
        for (index, parent) in parent_by_joint.iter().enumerate() {
            if placed[index] {
                continue;
            }
            let ready = match parent {
                None => true,
                Some(parent) => placed[*parent as usize],
            };
            if ready {
                placed[index] = true;
                order.push(index as u32);
                advanced = true;
            }
        }
        if !advanced {
            bail!("Skeleton joint hierarchy contains a cycle");
        }
    }
    Ok(order)
}
