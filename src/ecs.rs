use crate::clip::{Clip, WrapMode};
use crate::commands::AnimationCommand;
use crate::events::EntityClipEvent;
use crate::skeleton::SkeletonDefinition;
use crate::system::{AnimationSystem, FrameContext};
use crate::type_registry::{TypeRegistry, TypeTag};
use anyhow::Result;
use bevy_ecs::prelude::*;
use bevy_ecs::world::EntityWorldMut;
use serde::Deserialize;
use std::sync::Arc;

// ---------- Components ----------

#[derive(Component, Clone)]
pub struct SharedSkeleton(pub Arc<SkeletonDefinition>);

impl SharedSkeleton {
    pub fn hash_code(&self) -> u32 {
        self.0.hash_code
    }
}

#[derive(Component, Clone)]
pub struct CrowdAnimator {
    pub clip: Arc<Clip>,
    pub time: f32,
    pub speed: f32,
    pub weight: f32,
    pub pose_index: u32,
    pub playing: bool,
}

impl CrowdAnimator {
    pub fn new(clip: Arc<Clip>, pose_index: u32) -> Self {
        Self { clip, time: 0.0, speed: 1.0, weight: 1.0, pose_index, playing: true }
    }

    pub fn play(&mut self, clip: Arc<Clip>) {
        self.clip = clip;
        self.time = 0.0;
        self.playing = true;
    }
}

// ---------- Resources ----------

#[derive(Resource, Clone, Copy, Default)]
pub struct TimeDelta(pub f32);

// Snapshot of the current frame's lookups and writers; refreshed by the host
// after clip/skeleton registration so producer systems see the new indices.
#[derive(Resource, Clone)]
pub struct CrowdFrameContext(pub FrameContext);

#[derive(Resource)]
pub struct CrowdAnimationHost {
    system: AnimationSystem,
}

impl CrowdAnimationHost {
    pub fn new(system: AnimationSystem) -> Self {
        Self { system }
    }

    pub fn system(&self) -> &AnimationSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut AnimationSystem {
        &mut self.system
    }

    pub fn refresh_context(world: &mut World) {
        let context = world.resource::<CrowdAnimationHost>().system.frame_context();
        world.insert_resource(CrowdFrameContext(context));
    }

    // Joins producers, batches whatever they queued, and dispatches. Runs
    // after the producer schedule; exclusive world access keeps it serial.
    pub fn run_frame(world: &mut World) -> Result<()> {
        let discovered = discovered_skeletons(world);
        let mut host = world.resource_mut::<CrowdAnimationHost>();
        host.system.update(&discovered)
    }
}

// Distinct rigs in use this frame, first-seen order.
pub fn discovered_skeletons(world: &mut World) -> Vec<u32> {
    let mut query = world.query::<&SharedSkeleton>();
    let mut discovered: Vec<u32> = Vec::new();
    for skeleton in query.iter(world) {
        let hash = skeleton.hash_code();
        if !discovered.contains(&hash) {
            discovered.push(hash);
        }
    }
    discovered
}

// ---------- Producer system ----------

// Advances every animator, fires the clip events its window crossed, and
// queues one animation command per entity for this frame's batches.
pub fn sys_advance_crowd(
    dt: Res<TimeDelta>,
    context: Res<CrowdFrameContext>,
    mut animators: Query<(Entity, &SharedSkeleton, &mut CrowdAnimator)>,
) {
    let context = &context.0;
    let mut unresolved_clips = 0u32;
    for (entity, skeleton, mut animator) in animators.iter_mut() {
        let previous = animator.time;
        if animator.playing && animator.speed > 0.0 && dt.0 > 0.0 {
            let advanced = previous + dt.0 * animator.speed;
            for event in animator.clip.events_in_window(previous, advanced) {
                context.events.push(
                    event.function_name_hash,
                    EntityClipEvent {
                        entity,
                        int_param: event.int_param,
                        float_param: event.float_param,
                    },
                );
            }
            match animator.clip.wrap_mode {
                WrapMode::Once => {
                    if advanced >= animator.clip.length {
                        animator.time = animator.clip.length;
                        animator.playing = false;
                    } else {
                        animator.time = advanced;
                    }
                }
                WrapMode::Loop => {
                    animator.time = advanced.rem_euclid(animator.clip.length);
                }
            }
        }

        let Some(clip_index) = context.clip_index(animator.clip.hash_code) else {
            unresolved_clips += 1;
            continue;
        };
        context.commands.push(AnimationCommand {
            entity,
            clip_index,
            time: animator.time,
            weight: animator.weight,
            pose_index: animator.pose_index,
            skeleton_hash: skeleton.hash_code(),
        });
    }
    if unresolved_clips > 0 {
        eprintln!("[crowd] {unresolved_clips} animators reference unregistered clips this frame.");
    }
}

// ---------- Prefabs ----------

// Installs an extra component on a freshly spawned actor; registered against
// a TypeTag so scene files can name behaviors without reflection.
pub type ComponentInstaller = fn(&mut EntityWorldMut);

#[derive(Clone, Debug, Deserialize)]
pub struct CrowdActorPrefab {
    pub skeleton: String,
    pub clip: String,
    #[serde(default = "CrowdActorPrefab::default_weight")]
    pub weight: f32,
    #[serde(default = "CrowdActorPrefab::default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub extras: Vec<TypeTag>,
}

impl CrowdActorPrefab {
    const fn default_weight() -> f32 {
        1.0
    }

    const fn default_speed() -> f32 {
        1.0
    }
}

// Unknown extra tags are logged by the registry and skipped; the actor still
// spawns with its skeleton and animator.
pub fn spawn_crowd_actor(
    world: &mut World,
    prefab: &CrowdActorPrefab,
    skeleton: Arc<SkeletonDefinition>,
    clip: Arc<Clip>,
    pose_index: u32,
    installers: &TypeRegistry<ComponentInstaller>,
) -> Entity {
    let mut animator = CrowdAnimator::new(clip, pose_index);
    animator.weight = prefab.weight;
    animator.speed = prefab.speed;
    let mut entity = world.spawn((SharedSkeleton(skeleton), animator));
    for tag in &prefab.extras {
        if let Some(installer) = installers.resolve(tag) {
            installer(&mut entity);
        }
    }
    entity.id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandQueue;
    use crate::events::ClipEventTable;
    use crate::string_hash::StringHash;
    use glam::{Quat, Vec3};
    use std::collections::HashMap;

    fn test_clip(wrap_mode: WrapMode, event_times: &[f32]) -> Arc<Clip> {
        let frame_rate = 30.0;
        let length = 1.0;
        let frame_count = (length * frame_rate) as u32;
        let sample_len = frame_count as usize + 1;
        let events: Vec<crate::clip::ClipEvent> = event_times
            .iter()
            .map(|time| crate::clip::ClipEvent {
                function_name_hash: StringHash::of("footstep"),
                int_param: 1,
                float_param: 2.0,
                time: *time,
            })
            .collect();
        let mut clip = Clip {
            name: Arc::from("walk"),
            frame_rate,
            length,
            frame_count,
            wrap_mode,
            bindings: Arc::from(vec![StringHash::of("hips")].into_boxed_slice()),
            local_translations: vec![Vec3::ZERO; sample_len].into(),
            local_rotations: vec![Quat::IDENTITY; sample_len].into(),
            local_scales: vec![Vec3::ONE; sample_len].into(),
            events: Arc::from(events.into_boxed_slice()),
            hash_code: 0,
        };
        clip.hash_code = clip.compute_content_hash().expect("hash");
        Arc::new(clip)
    }

    fn test_skeleton() -> Arc<SkeletonDefinition> {
        use crate::skeleton::Bone;
        use glam::Mat4;
        SkeletonDefinition::new(
            "rig",
            vec![Bone {
                name: Arc::from("hips"),
                parent: None,
                rest_translation: Vec3::ZERO,
                rest_rotation: Quat::IDENTITY,
                rest_scale: Vec3::ONE,
                inverse_bind: Mat4::IDENTITY,
            }],
            Vec::new(),
        )
        .expect("skeleton")
    }

    fn test_context(
        clip: &Clip,
        queue: &CommandQueue,
        events: &ClipEventTable,
    ) -> CrowdFrameContext {
        let mut clip_lookup = HashMap::new();
        clip_lookup.insert(clip.hash_code, 0u32);
        CrowdFrameContext(FrameContext {
            clip_lookup: Arc::new(clip_lookup),
            skeleton_lookup: Arc::new(HashMap::new()),
            mask_lookup: Arc::new(HashMap::new()),
            commands: queue.writer(),
            events: events.writer(),
        })
    }

    fn world_with_actor(clip: Arc<Clip>, context: CrowdFrameContext, dt: f32) -> (World, Entity) {
        let mut world = World::new();
        world.insert_resource(TimeDelta(dt));
        world.insert_resource(context);
        let entity =
            world.spawn((SharedSkeleton(test_skeleton()), CrowdAnimator::new(clip, 3))).id();
        (world, entity)
    }

    fn run_advance(world: &mut World) {
        let mut schedule = Schedule::default();
        schedule.add_systems(sys_advance_crowd);
        schedule.run(world);
    }

    #[test]
    fn advance_emits_commands_and_events() {
        let clip = test_clip(WrapMode::Loop, &[0.25]);
        let queue = CommandQueue::new();
        let events = ClipEventTable::new();
        let context = test_context(&clip, &queue, &events);
        let (mut world, entity) = world_with_actor(Arc::clone(&clip), context, 0.3);
        run_advance(&mut world);

        let grouped = queue.drain_grouped();
        let skeleton_hash = test_skeleton().hash_code;
        assert_eq!(grouped[&skeleton_hash].len(), 1);
        let command = grouped[&skeleton_hash][0];
        assert_eq!(command.entity, entity);
        assert_eq!(command.clip_index, 0);
        assert_eq!(command.pose_index, 3);
        assert!((command.time - 0.3).abs() < 1e-6);

        let fired = events.take(StringHash::of("footstep"));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].entity, entity);
        assert_eq!(fired[0].int_param, 1);
    }

    #[test]
    fn looping_animator_wraps_its_time() {
        let clip = test_clip(WrapMode::Loop, &[]);
        let queue = CommandQueue::new();
        let events = ClipEventTable::new();
        let context = test_context(&clip, &queue, &events);
        let (mut world, entity) = world_with_actor(clip, context, 1.25);
        run_advance(&mut world);
        let animator = world.get::<CrowdAnimator>(entity).expect("animator");
        assert!((animator.time - 0.25).abs() < 1e-5);
        assert!(animator.playing);
    }

    #[test]
    fn one_shot_animator_clamps_and_stops() {
        let clip = test_clip(WrapMode::Once, &[]);
        let queue = CommandQueue::new();
        let events = ClipEventTable::new();
        let context = test_context(&clip, &queue, &events);
        let (mut world, entity) = world_with_actor(clip, context, 2.0);
        run_advance(&mut world);
        let animator = world.get::<CrowdAnimator>(entity).expect("animator");
        assert_eq!(animator.time, 1.0);
        assert!(!animator.playing);

        // A finished animator still holds its final pose on the GPU.
        run_advance(&mut world);
        let skeleton_hash = test_skeleton().hash_code;
        let grouped = queue.drain_grouped();
        assert_eq!(grouped[&skeleton_hash].len(), 2);
    }

    #[test]
    fn unregistered_clip_queues_no_command() {
        let clip = test_clip(WrapMode::Loop, &[]);
        let queue = CommandQueue::new();
        let events = ClipEventTable::new();
        let context = CrowdFrameContext(FrameContext {
            clip_lookup: Arc::new(HashMap::new()),
            skeleton_lookup: Arc::new(HashMap::new()),
            mask_lookup: Arc::new(HashMap::new()),
            commands: queue.writer(),
            events: events.writer(),
        });
        let (mut world, _) = world_with_actor(clip, context, 0.1);
        run_advance(&mut world);
        assert!(queue.is_empty());
    }

    #[test]
    fn discovery_dedups_shared_rigs() {
        let skeleton = test_skeleton();
        let mut world = World::new();
        world.spawn(SharedSkeleton(Arc::clone(&skeleton)));
        world.spawn(SharedSkeleton(Arc::clone(&skeleton)));
        let discovered = discovered_skeletons(&mut world);
        assert_eq!(discovered, vec![skeleton.hash_code]);
    }

    #[derive(Component)]
    struct PrefabMarker;

    #[test]
    fn prefab_spawns_with_known_extras_only() {
        fn install_marker(entity: &mut EntityWorldMut) {
            entity.insert(PrefabMarker);
        }

        let prefab: CrowdActorPrefab = serde_json::from_str(
            r#"{
                "skeleton": "rig",
                "clip": "walk",
                "speed": 0.5,
                "extras": ["marker", "missing_behavior"]
            }"#,
        )
        .expect("parse");
        assert_eq!(prefab.weight, 1.0);

        let mut installers: TypeRegistry<ComponentInstaller> = TypeRegistry::new();
        installers.register("marker", install_marker as ComponentInstaller);

        let mut world = World::new();
        let clip = test_clip(WrapMode::Loop, &[]);
        let entity =
            spawn_crowd_actor(&mut world, &prefab, test_skeleton(), clip, 0, &installers);
        let animator = world.get::<CrowdAnimator>(entity).expect("animator");
        assert_eq!(animator.speed, 0.5);
        assert!(world.get::<PrefabMarker>(entity).is_some());
    }
}
