//! Physics bridge.
//!
//! A worker thread owns the rigid-body world. One mutex guards the staging
//! area the two threads share: the per-object records, the `changed` set of
//! pending edits, the `physical` set needing per-tick pose readback, and the
//! deque of per-tick collision batches. The main thread edits records and
//! marks them changed at any time; the worker applies all pending edits at
//! each tick boundary, steps the engine, then writes poses back.

pub mod shapes;
mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use glam::{Quat, Vec3, Vec4};
use log::debug;
use parking_lot::Mutex;

use crate::terrain::Terrain;
use crate::types::{LocalId, ObjUpd, PrimFlags};
use crate::world::{ObjectBody, World, WorldObject};

pub use shapes::{ChildPart, PartShape, ShapeDesc};

pub const GRAVITY: f32 = 9.8;
pub const AVATAR_MASS: f32 = 50.0;
pub const PRIM_MASS: f32 = 10.0;

/// Pose changes smaller than this never reach clients.
pub const POS_UPDATE_THRESHOLD: f32 = 0.01;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// How a body participates in collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysCategory {
    /// Not simulated at all; no body exists.
    Phantom,
    /// Kinematic: collided with but never moved by the engine.
    Static,
    /// Fully simulated with mass.
    Dynamic,
}

/// One tracked object, keyed by its root local id.
pub struct PhysObj {
    pub shape: ShapeDesc,
    /// Pending shape swap, applied at the next tick boundary.
    pub new_shape: Option<ShapeDesc>,
    /// Root + children local ids in linkset index order.
    pub parts: Vec<LocalId>,
    pub is_avatar: bool,
    pub category: PhysCategory,
    pub pos: Vec3,
    pub rot: Quat,
    /// Set by the main thread to push a pose into the engine.
    pub pos_update: bool,
    pub target_velocity: Vec3,
    /// Accumulated impulse, applied then cleared each tick.
    pub impulse: Vec3,
    pub is_flying: bool,
    pub flying_changed: bool,
    pub is_deleted: bool,
    /// Child transform edits waiting to be folded into the compound shape,
    /// keyed by linkset child index.
    pub child_updates: HashMap<usize, (Vec3, Quat)>,
    // readback, written by the worker
    pub velocity: Vec3,
    pub footfall: Vec4,
    /// Positive while grounded, negative while airborne (tick counts).
    pub collide_down_ticks: i32,
}

/// A prim/prim contact recorded during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollisionPair {
    pub collidee: LocalId,
    pub collider: LocalId,
}

pub(crate) struct PhysShared {
    pub objs: HashMap<LocalId, PhysObj>,
    pub changed: HashSet<LocalId>,
    pub physical: HashSet<LocalId>,
    pub collisions: VecDeque<Vec<CollisionPair>>,
    pub shutdown: bool,
}

// ---------------------------------------------------------------------------
// Main-thread bridge
// ---------------------------------------------------------------------------

pub struct PhysicsBridge {
    shared: Arc<Mutex<PhysShared>>,
    /// Pose last delivered to clients, for the update threshold.
    last_sent: HashMap<LocalId, (Vec3, Quat)>,
    /// Fired by the worker after each readback pass.
    tick_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

/// Snapshot a world object into the record fields the worker consumes.
fn snapshot_shape(world: &World, obj: &WorldObject) -> (ShapeDesc, Vec<LocalId>) {
    match &obj.body {
        ObjectBody::Avatar(_) => (ShapeDesc::avatar(), vec![obj.local_id]),
        ObjectBody::Prim(prim) => {
            let mut parts = vec![obj.local_id];
            let mut children = Vec::new();
            for child_id in &prim.children {
                if let Some(child) = world.get(*child_id) {
                    parts.push(child.local_id);
                    if let Some(child_prim) = child.as_prim() {
                        children.push(ChildPart {
                            shape: PartShape::Prim {
                                shape: child_prim.shape.clone(),
                                size: child.scale,
                            },
                            local_pos: child.local_pos,
                            rot: child.rot,
                        });
                    }
                }
            }
            (
                ShapeDesc {
                    root: PartShape::Prim {
                        shape: prim.shape.clone(),
                        size: obj.scale,
                    },
                    children,
                },
                parts,
            )
        }
    }
}

fn categorize(obj: &WorldObject) -> PhysCategory {
    match &obj.body {
        ObjectBody::Avatar(_) => PhysCategory::Dynamic,
        ObjectBody::Prim(prim) => {
            if prim.flags.contains(PrimFlags::PHANTOM) || obj.parent.is_some() {
                // child prims collide through their root's compound shape
                PhysCategory::Phantom
            } else if prim.flags.contains(PrimFlags::PHYSICAL) {
                PhysCategory::Dynamic
            } else {
                PhysCategory::Static
            }
        }
    }
}

impl PhysicsBridge {
    /// Spawn the physics worker over the region terrain. Fatal if the
    /// thread cannot be created.
    pub fn spawn(terrain: &Terrain) -> Self {
        let shared = Arc::new(Mutex::new(PhysShared {
            objs: HashMap::new(),
            changed: HashSet::new(),
            physical: HashSet::new(),
            collisions: VecDeque::new(),
            shutdown: false,
        }));
        let (tick_tx, tick_rx) = bounded::<()>(1);
        let heights = terrain.raw().to_vec();
        let shared_worker = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("physics-worker".into())
            .spawn(move || worker::run(shared_worker, tick_tx, heights))
            .expect("cannot create physics worker thread");
        Self {
            shared,
            last_sent: HashMap::new(),
            tick_rx,
            worker: Some(worker),
        }
    }

    // -----------------------------------------------------------------------
    // Edits from the main thread
    // -----------------------------------------------------------------------

    /// Add or update an object's record from its world state. This is the
    /// single entry point for property changes; which record fields refresh
    /// depends on the update flags.
    pub fn upd_object(&mut self, world: &World, obj: &WorldObject, flags: ObjUpd) {
        let category = categorize(obj);
        let mut shared = self.shared.lock();
        let is_new = !shared.objs.contains_key(&obj.local_id);

        if is_new && category == PhysCategory::Phantom && !obj.is_avatar() {
            // nothing to track; phantom means no body at all
            return;
        }

        if is_new || flags.contains(ObjUpd::CREATED) {
            let (shape, parts) = snapshot_shape(world, obj);
            shared.objs.insert(
                obj.local_id,
                PhysObj {
                    shape,
                    new_shape: None,
                    parts,
                    is_avatar: obj.is_avatar(),
                    category,
                    pos: obj.world_pos,
                    rot: obj.rot,
                    pos_update: true,
                    target_velocity: Vec3::ZERO,
                    impulse: Vec3::ZERO,
                    is_flying: false,
                    flying_changed: false,
                    is_deleted: false,
                    child_updates: HashMap::new(),
                    velocity: Vec3::ZERO,
                    footfall: Vec4::new(0.0, 0.0, 1.0, 0.0),
                    collide_down_ticks: 0,
                },
            );
            if category == PhysCategory::Dynamic {
                shared.physical.insert(obj.local_id);
            }
            shared.changed.insert(obj.local_id);
            self.last_sent.insert(obj.local_id, (obj.world_pos, obj.rot));
            return;
        }

        let (new_shape, new_parts, new_category) = {
            let needs_shape = flags
                .intersects(ObjUpd::SHAPE | ObjUpd::SCALE | ObjUpd::CHILDREN | ObjUpd::FLAGS);
            if needs_shape {
                let (shape, parts) = snapshot_shape(world, obj);
                (Some(shape), Some(parts), category)
            } else {
                (None, None, category)
            }
        };

        let Some(rec) = shared.objs.get_mut(&obj.local_id) else { return };
        if flags.intersects(ObjUpd::POSROT) {
            rec.pos = obj.world_pos;
            rec.rot = obj.rot;
            rec.pos_update = true;
        }
        if let Some(shape) = new_shape {
            rec.new_shape = Some(shape);
        }
        if let Some(parts) = new_parts {
            rec.parts = parts;
        }
        if rec.category != new_category {
            rec.category = new_category;
            // category changes force a body rebuild
            if rec.new_shape.is_none() {
                rec.new_shape = Some(rec.shape.clone());
            }
            if new_category == PhysCategory::Dynamic {
                shared.physical.insert(obj.local_id);
            } else {
                shared.physical.remove(&obj.local_id);
            }
        }
        shared.changed.insert(obj.local_id);
    }

    /// Record a child prim's new transform within its root's compound.
    pub fn upd_child_transform(
        &mut self,
        root: LocalId,
        child_index: usize,
        local_pos: Vec3,
        rot: Quat,
    ) {
        let mut shared = self.shared.lock();
        if let Some(rec) = shared.objs.get_mut(&root) {
            rec.child_updates.insert(child_index, (local_pos, rot));
            shared.changed.insert(root);
        }
    }

    pub fn del_object(&mut self, local_id: LocalId) {
        let mut shared = self.shared.lock();
        if let Some(rec) = shared.objs.get_mut(&local_id) {
            rec.is_deleted = true;
            shared.changed.insert(local_id);
        }
        self.last_sent.remove(&local_id);
    }

    pub fn set_target_velocity(&mut self, local_id: LocalId, velocity: Vec3) {
        let mut shared = self.shared.lock();
        if let Some(rec) = shared.objs.get_mut(&local_id) {
            rec.target_velocity = velocity;
        }
    }

    pub fn set_avatar_flying(&mut self, local_id: LocalId, flying: bool) {
        let mut shared = self.shared.lock();
        if let Some(rec) = shared.objs.get_mut(&local_id) {
            if rec.is_flying != flying {
                rec.is_flying = flying;
                rec.flying_changed = true;
                shared.changed.insert(local_id);
            }
        }
    }

    pub fn apply_impulse(&mut self, local_id: LocalId, impulse: Vec3, local: bool) {
        let mut shared = self.shared.lock();
        if let Some(rec) = shared.objs.get_mut(&local_id) {
            let impulse = if local { rec.rot * impulse } else { impulse };
            rec.impulse += impulse;
            shared.changed.insert(local_id);
        }
    }

    /// Grounded tick counter for an avatar: positive while standing.
    pub fn grounded_ticks(&self, local_id: LocalId) -> i32 {
        self.shared
            .lock()
            .objs
            .get(&local_id)
            .map(|r| r.collide_down_ticks)
            .unwrap_or(0)
    }

    /// True when the worker signalled a completed tick since the last call.
    pub fn tick_ready(&self) -> bool {
        self.tick_rx.try_recv().is_ok()
    }

    // -----------------------------------------------------------------------
    // Readback into the world
    // -----------------------------------------------------------------------

    /// Apply pose readbacks (with the 0.01 threshold) and drain collision
    /// batches. Avatar footfall planes are written into their world bodies.
    pub fn pump(&mut self, world: &mut World) -> Vec<Vec<CollisionPair>> {
        struct Readback {
            local_id: LocalId,
            pos: Vec3,
            rot: Quat,
            velocity: Vec3,
            footfall: Option<Vec4>,
        }

        let (readbacks, batches) = {
            let mut shared = self.shared.lock();
            let mut readbacks = Vec::new();
            for local_id in shared.physical.iter().copied() {
                let Some(rec) = shared.objs.get(&local_id) else { continue };
                readbacks.push(Readback {
                    local_id,
                    pos: rec.pos,
                    rot: rec.rot,
                    velocity: rec.velocity,
                    footfall: rec.is_avatar.then_some(rec.footfall),
                });
            }
            let batches: Vec<_> = shared.collisions.drain(..).collect();
            (readbacks, batches)
        };

        for rb in readbacks {
            let Some(id) = world.by_local_id(rb.local_id).map(|o| o.id) else { continue };
            let (last_pos, last_rot) = self
                .last_sent
                .get(&rb.local_id)
                .copied()
                .unwrap_or((Vec3::MAX, Quat::IDENTITY));
            let moved = (rb.pos - last_pos).abs().max_element() > POS_UPDATE_THRESHOLD
                || (rb.rot.to_array().iter())
                    .zip(last_rot.to_array().iter())
                    .any(|(a, b)| (a - b).abs() > POS_UPDATE_THRESHOLD);
            if moved {
                self.last_sent.insert(rb.local_id, (rb.pos, rb.rot));
                world.move_obj_from_phys(id, rb.pos, rb.rot, rb.velocity);
            }
            if let Some(footfall) = rb.footfall {
                if let Some(av) = world.get_mut(id).and_then(|o| o.as_avatar_mut()) {
                    av.footfall = footfall;
                }
            }
        }
        batches
    }

    pub fn shutdown(&mut self) {
        self.shared.lock().shutdown = true;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("physics worker joined");
        }
    }
}

impl Drop for PhysicsBridge {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}
