//! The physics worker thread: owns the rigid-body world, applies staged
//! edits at tick boundaries, steps the engine, walks contact manifolds and
//! writes poses back for the main thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use glam::{Quat, Vec3, Vec4};
use log::debug;
use parking_lot::Mutex;
use rapier3d::na;
use rapier3d::prelude::*;

use super::{CollisionPair, PhysCategory, PhysShared, AVATAR_MASS, GRAVITY, PRIM_MASS};
use crate::types::{LocalId, REGION_SIZE, TERRAIN_GRID};

const TICK: f64 = 1.0 / 60.0;
/// Longest single sleep between shutdown checks.
const MAX_NAP: Duration = Duration::from_millis(10);

/// Contact normals within 30° of +Z ground an avatar.
const COLLIDE_DOWN_COS: f32 = 0.866;

// collision filter groups
const COL_GROUND: u32 = 0x1;
const COL_PRIM: u32 = 0x2;
const COL_PHYS_PRIM: u32 = 0x4;
const COL_AVATAR: u32 = 0x8;
const COL_BORDER: u32 = 0x10;

const AVATAR_COLLIDES: u32 = COL_GROUND | COL_PRIM | COL_PHYS_PRIM | COL_AVATAR | COL_BORDER;
const PRIM_COLLIDES: u32 = COL_AVATAR | COL_PHYS_PRIM;
const PHYS_PRIM_COLLIDES: u32 = COL_GROUND | COL_PRIM | COL_PHYS_PRIM | COL_AVATAR;
const GROUND_COLLIDES: u32 = COL_AVATAR | COL_PHYS_PRIM;
const BORDER_COLLIDES: u32 = COL_AVATAR;

fn groups(membership: u32, filter: u32) -> InteractionGroups {
    InteractionGroups::new(
        Group::from_bits_truncate(membership),
        Group::from_bits_truncate(filter),
    )
}

fn vec3(v: Vec3) -> na::Vector3<Real> {
    na::Vector3::new(v.x, v.y, v.z)
}

fn from_na(v: &na::Vector3<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

fn iso(pos: Vec3, rot: Quat) -> Isometry<Real> {
    Isometry::from_parts(
        na::Translation3::new(pos.x, pos.y, pos.z),
        na::UnitQuaternion::from_quaternion(na::Quaternion::new(rot.w, rot.x, rot.y, rot.z)),
    )
}

struct Engine {
    pipeline: PhysicsPipeline,
    integration: IntegrationParameters,
    islands: IslandManager,
    broad_phase: BroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd: CCDSolver,
    gravity: na::Vector3<Real>,
    /// Tracked body handles keyed by root local id.
    tracked: HashMap<LocalId, RigidBodyHandle>,
    /// Reverse map for the contact walk.
    owners: HashMap<RigidBodyHandle, LocalId>,
    ground: ColliderHandle,
}

impl Engine {
    fn new(heights: Vec<f32>) -> Self {
        let mut bodies = RigidBodySet::new();
        let mut colliders = ColliderSet::new();

        // Ground heightfield. The engine's heightfield is y-up, so rotate it
        // into the z-up world frame; rows are flipped so row 0 lands at the
        // far y edge after rotation.
        let grid = TERRAIN_GRID;
        let matrix = na::DMatrix::from_fn(grid, grid, |i, j| heights[(grid - 1 - i) * grid + j]);
        let field = SharedShape::heightfield(matrix, na::Vector3::new(REGION_SIZE, 1.0, REGION_SIZE));
        let ground_rot =
            na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), std::f32::consts::FRAC_PI_2);
        let ground_body = bodies.insert(RigidBodyBuilder::fixed().build());
        let ground = colliders.insert_with_parent(
            ColliderBuilder::new(field)
                .position(Isometry::from_parts(
                    na::Translation3::new(REGION_SIZE / 2.0, REGION_SIZE / 2.0, 0.0),
                    ground_rot,
                ))
                .collision_groups(groups(COL_GROUND, GROUND_COLLIDES))
                .build(),
            ground_body,
            &mut bodies,
        );

        // sim borders: four inward-facing halfspaces, avatars only
        let border_body = bodies.insert(RigidBodyBuilder::fixed().build());
        let borders = [
            (SharedShape::halfspace(na::Vector3::x_axis()), Vec3::ZERO),
            (SharedShape::halfspace(na::Vector3::y_axis()), Vec3::ZERO),
            (
                SharedShape::halfspace(-na::Vector3::x_axis()),
                Vec3::new(REGION_SIZE, 0.0, 0.0),
            ),
            (
                SharedShape::halfspace(-na::Vector3::y_axis()),
                Vec3::new(0.0, REGION_SIZE, 0.0),
            ),
        ];
        for (shape, pos) in borders {
            colliders.insert_with_parent(
                ColliderBuilder::new(shape)
                    .translation(vec3(pos))
                    .collision_groups(groups(COL_BORDER, BORDER_COLLIDES))
                    .build(),
                border_body,
                &mut bodies,
            );
        }

        Self {
            pipeline: PhysicsPipeline::new(),
            integration: IntegrationParameters::default(),
            islands: IslandManager::new(),
            broad_phase: BroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies,
            colliders,
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd: CCDSolver::new(),
            gravity: na::Vector3::new(0.0, 0.0, -GRAVITY),
            tracked: HashMap::new(),
            owners: HashMap::new(),
            ground,
        }
    }

    fn remove_body(&mut self, local_id: LocalId) {
        if let Some(handle) = self.tracked.remove(&local_id) {
            self.owners.remove(&handle);
            self.bodies.remove(
                handle,
                &mut self.islands,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        }
    }

    fn step(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd,
            None,
            &(),
            &(),
        );
    }
}

/// Apply every staged edit: deletions, body creation, shape swaps, pose
/// pushes and gravity flips. Called with the staging mutex held.
fn apply_changes(engine: &mut Engine, shared: &mut PhysShared) {
    let changed: Vec<LocalId> = shared.changed.drain().collect();
    for local_id in changed {
        let Some(rec) = shared.objs.get_mut(&local_id) else { continue };

        if rec.is_deleted {
            engine.remove_body(local_id);
            shared.objs.remove(&local_id);
            shared.physical.remove(&local_id);
            continue;
        }

        if !rec.child_updates.is_empty() {
            // fold child transform edits into the shape before rebuild
            let mut shape = rec.new_shape.take().unwrap_or_else(|| rec.shape.clone());
            for (index, (pos, rot)) in rec.child_updates.drain() {
                if let Some(child) = shape.children.get_mut(index) {
                    child.local_pos = pos;
                    child.rot = rot;
                }
            }
            rec.new_shape = Some(shape);
        }

        let needs_build =
            rec.new_shape.is_some() || !engine.tracked.contains_key(&local_id);
        if needs_build {
            engine.remove_body(local_id);
            if let Some(new_shape) = rec.new_shape.take() {
                rec.shape = new_shape;
            }
            if rec.category == PhysCategory::Phantom {
                continue;
            }

            let builder = match rec.category {
                PhysCategory::Dynamic => RigidBodyBuilder::dynamic(),
                _ => RigidBodyBuilder::kinematic_position_based(),
            };
            let mut builder = builder
                .position(iso(rec.pos, rec.rot))
                .linear_damping(0.1)
                .angular_damping(0.2);
            if rec.is_avatar {
                builder = builder.lock_rotations();
            }
            let handle = engine.bodies.insert(builder.build());

            let (group, filter, mass) = if rec.is_avatar {
                (COL_AVATAR, AVATAR_COLLIDES, AVATAR_MASS)
            } else if rec.category == PhysCategory::Dynamic {
                (COL_PHYS_PRIM, PHYS_PRIM_COLLIDES, PRIM_MASS)
            } else {
                (COL_PRIM, PRIM_COLLIDES, 0.0)
            };
            let mut collider = ColliderBuilder::new(rec.shape.build())
                .collision_groups(groups(group, filter));
            if mass > 0.0 {
                collider = collider.mass(mass);
            }
            engine
                .colliders
                .insert_with_parent(collider.build(), handle, &mut engine.bodies);

            if rec.is_avatar {
                if let Some(body) = engine.bodies.get_mut(handle) {
                    body.set_gravity_scale(if rec.is_flying { 0.0 } else { 1.0 }, true);
                }
                rec.flying_changed = false;
            }
            engine.tracked.insert(local_id, handle);
            engine.owners.insert(handle, local_id);
            rec.pos_update = false;
            continue;
        }

        let Some(&handle) = engine.tracked.get(&local_id) else { continue };
        let Some(body) = engine.bodies.get_mut(handle) else { continue };

        if rec.pos_update {
            let pose = iso(rec.pos, rec.rot);
            if body.is_kinematic() {
                body.set_next_kinematic_position(pose);
            }
            body.set_position(pose, true);
            rec.pos_update = false;
        }
        if rec.flying_changed {
            body.set_gravity_scale(if rec.is_flying { 0.0 } else { 1.0 }, true);
            rec.flying_changed = false;
        }
        if rec.impulse != Vec3::ZERO {
            body.apply_impulse(vec3(rec.impulse), true);
            rec.impulse = Vec3::ZERO;
        }
    }
}

/// Walk contact manifolds: avatar grounding + footfall planes, and
/// prim/prim collision pairs.
fn collect_contacts(engine: &Engine, shared: &mut PhysShared) {
    for rec in shared.objs.values_mut() {
        if rec.is_avatar {
            rec.footfall = Vec4::new(0.0, 0.0, 1.0, 0.0);
        }
    }
    let mut grounded: HashMap<LocalId, bool> = HashMap::new();
    let mut batch: Vec<CollisionPair> = Vec::new();

    for pair in engine.narrow_phase.contact_pairs() {
        let Some(c1) = engine.colliders.get(pair.collider1) else { continue };
        let Some(c2) = engine.colliders.get(pair.collider2) else { continue };
        let id1 = c1.parent().and_then(|h| engine.owners.get(&h)).copied();
        let id2 = c2.parent().and_then(|h| engine.owners.get(&h)).copied();

        for manifold in &pair.manifolds {
            let normal = manifold.data.normal; // collider1 -> collider2
            for point in &manifold.points {
                if point.dist >= 0.005 {
                    continue;
                }
                let world_point = c1.position() * point.local_p1;

                // avatar grounding: one side is an avatar, the other is not
                for (av_id, other_id, n) in [
                    (id1, id2, -normal),
                    (id2, id1, normal),
                ] {
                    let Some(av_id) = av_id else { continue };
                    let av_is_avatar =
                        shared.objs.get(&av_id).map(|r| r.is_avatar).unwrap_or(false);
                    let other_is_avatar = other_id
                        .and_then(|o| shared.objs.get(&o))
                        .map(|o| o.is_avatar)
                        .unwrap_or(false);
                    if !av_is_avatar || other_is_avatar {
                        continue;
                    }
                    // n points from the avatar toward the support here;
                    // grounded when that direction is mostly downward
                    if n.z < -COLLIDE_DOWN_COS {
                        grounded.insert(av_id, true);
                        if pair.collider1 != engine.ground && pair.collider2 != engine.ground {
                            let p = from_na(&world_point.coords);
                            let up = from_na(&-n);
                            if let Some(av) = shared.objs.get_mut(&av_id) {
                                av.footfall = Vec4::new(up.x, up.y, up.z, -up.dot(p));
                            }
                        }
                    }
                }

                // prim/prim pairs, both sides tracked
                if let (Some(a), Some(b)) = (id1, id2) {
                    let a_prim = shared.objs.get(&a).map(|r| !r.is_avatar).unwrap_or(false);
                    let b_prim = shared.objs.get(&b).map(|r| !r.is_avatar).unwrap_or(false);
                    if a_prim && b_prim {
                        let part_of = |rec_id: LocalId, subshape: u32| -> LocalId {
                            shared
                                .objs
                                .get(&rec_id)
                                .and_then(|r| r.parts.get(subshape as usize))
                                .copied()
                                .unwrap_or(rec_id)
                        };
                        batch.push(CollisionPair {
                            collidee: part_of(a, manifold.subshape1),
                            collider: b,
                        });
                        batch.push(CollisionPair {
                            collidee: part_of(b, manifold.subshape2),
                            collider: a,
                        });
                    }
                }
            }
        }
    }

    for (local_id, rec) in shared.objs.iter_mut() {
        if !rec.is_avatar {
            continue;
        }
        if grounded.get(local_id).copied().unwrap_or(false) {
            rec.collide_down_ticks = if rec.collide_down_ticks >= 0 {
                rec.collide_down_ticks + 1
            } else {
                1
            };
        } else {
            rec.collide_down_ticks = if rec.collide_down_ticks <= 0 {
                rec.collide_down_ticks - 1
            } else {
                -1
            };
        }
    }

    shared.collisions.push_back(batch);
}

pub(crate) fn run(shared: Arc<Mutex<PhysShared>>, tick_tx: Sender<()>, heights: Vec<f32>) {
    let mut engine = Engine::new(heights);
    let start = Instant::now();
    let mut next_step = 0.0_f64;

    loop {
        // tick start: apply staged edits, then read back poses
        {
            let mut guard = shared.lock();
            apply_changes(&mut engine, &mut guard);

            let physical: Vec<LocalId> = guard.physical.iter().copied().collect();
            for local_id in physical {
                let Some(&handle) = engine.tracked.get(&local_id) else { continue };
                let Some(body) = engine.bodies.get(handle) else { continue };
                if let Some(rec) = guard.objs.get_mut(&local_id) {
                    let t = body.position();
                    rec.pos = from_na(&t.translation.vector);
                    let q = t.rotation;
                    rec.rot = Quat::from_xyzw(q.i, q.j, q.k, q.w);
                    rec.velocity = from_na(body.linvel());
                }
            }
        }
        // poke the main thread; a full slot means a poke is already pending
        let _ = tick_tx.try_send(());

        // sleep to the tick boundary in short naps so shutdown stays prompt
        loop {
            let remaining = next_step - start.elapsed().as_secs_f64();
            if remaining <= 0.0 {
                break;
            }
            std::thread::sleep(MAX_NAP.min(Duration::from_secs_f64(remaining)));
            if shared.lock().shutdown {
                break;
            }
        }
        next_step = start.elapsed().as_secs_f64() + TICK;

        {
            let mut guard = shared.lock();
            if guard.shutdown {
                debug!("physics worker shutting down");
                return;
            }
            apply_changes(&mut engine, &mut guard);

            // avatar locomotion: convert target velocity into an impulse
            let physical: Vec<LocalId> = guard.physical.iter().copied().collect();
            for local_id in physical {
                let Some(rec) = guard.objs.get(&local_id) else { continue };
                if !rec.is_avatar {
                    continue;
                }
                let target = rec.target_velocity;
                let flying = rec.is_flying;
                let Some(&handle) = engine.tracked.get(&local_id) else { continue };
                let Some(body) = engine.bodies.get_mut(handle) else { continue };
                let mut impulse = (vec3(target) - body.linvel()) * 0.9 * AVATAR_MASS;
                if !flying {
                    impulse.z = 0.0;
                }
                body.apply_impulse(impulse, false);
                if target != Vec3::ZERO {
                    body.wake_up(true);
                }
            }
        }

        engine.step();

        {
            let mut guard = shared.lock();
            collect_contacts(&engine, &mut guard);
        }
    }
}
