//! The world model: an arena of objects addressed by UUID plus a local-id
//! table, the spatial octree, link/sit/attachment operations and chat
//! dispatch.
//!
//! Objects form a tree through parent/child *handles*, never owning
//! references; children are removed before parents on deletion. Mutations
//! append [`WorldEvent`]s which the owning region drains each tick to fan
//! out client updates and physics edits.

pub mod octree;
pub mod prim;

use glam::{Quat, Vec3, Vec4};
use log::{debug, warn};
use uuid::Uuid;

use crate::scripting::ScriptHandle;
use crate::types::{
    from_parent_frame, to_parent_frame, ChatMessage, LocalId, ObjUpd, ATTACH_TO_LAST,
    NUM_ATTACH_POINTS,
};

pub use octree::{ChatListener, ChatTarget, Octree};
pub use prim::{ExtraParams, Prim, PrimShape, PrimType};

use std::collections::HashMap;

/// Linksets may carry at most this many child prims.
pub const MAX_LINKSET_CHILDREN: usize = 255;

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// An avatar body. Appearance and session state live in the user session;
/// this is only what the world itself needs.
#[derive(Debug, Clone)]
pub struct Avatar {
    /// Contact plane last computed by physics: (nx, ny, nz, -n·p).
    pub footfall: Vec4,
    /// Attachment slots indexed by attach point; 31..38 are HUD points.
    pub attachments: [Option<Uuid>; NUM_ATTACH_POINTS],
    /// Prim this avatar is sitting on (not necessarily the linkset root).
    pub sitting_on: Option<Uuid>,
}

impl Default for Avatar {
    fn default() -> Self {
        Self {
            footfall: Vec4::new(0.0, 0.0, 1.0, 0.0),
            attachments: [None; NUM_ATTACH_POINTS],
            sitting_on: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ObjectBody {
    Prim(Prim),
    Avatar(Avatar),
}

#[derive(Debug, Clone)]
pub struct WorldObject {
    pub id: Uuid,
    pub local_id: LocalId,
    /// Position relative to the parent frame; equals `world_pos` for roots.
    pub local_pos: Vec3,
    pub world_pos: Vec3,
    pub scale: Vec3,
    pub velocity: Vec3,
    pub rot: Quat,
    pub parent: Option<Uuid>,
    /// Body key in the physics bridge, when tracked.
    pub phys: Option<LocalId>,
    /// Chat listeners installed on this object (listen roots only).
    pub chat_channels: Vec<(i32, ChatTarget)>,
    pub body: ObjectBody,
}

impl WorldObject {
    pub fn new_prim(prim: Prim, pos: Vec3) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_id: 0,
            local_pos: pos,
            world_pos: pos,
            scale: Vec3::ONE,
            velocity: Vec3::ZERO,
            rot: Quat::IDENTITY,
            parent: None,
            phys: None,
            chat_channels: Vec::new(),
            body: ObjectBody::Prim(prim),
        }
    }

    pub fn new_avatar(id: Uuid, pos: Vec3) -> Self {
        Self {
            id,
            local_id: 0,
            local_pos: pos,
            world_pos: pos,
            scale: Vec3::new(1.0, 1.0, 1.9),
            velocity: Vec3::ZERO,
            rot: Quat::IDENTITY,
            parent: None,
            phys: None,
            chat_channels: Vec::new(),
            body: ObjectBody::Avatar(Avatar::default()),
        }
    }

    pub fn as_prim(&self) -> Option<&Prim> {
        match &self.body {
            ObjectBody::Prim(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_prim_mut(&mut self) -> Option<&mut Prim> {
        match &mut self.body {
            ObjectBody::Prim(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_avatar(&self) -> Option<&Avatar> {
        match &self.body {
            ObjectBody::Avatar(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_avatar_mut(&mut self) -> Option<&mut Avatar> {
        match &mut self.body {
            ObjectBody::Avatar(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_prim(&self) -> bool {
        matches!(self.body, ObjectBody::Prim(_))
    }

    pub fn is_avatar(&self) -> bool {
        matches!(self.body, ObjectBody::Avatar(_))
    }
}

// ---------------------------------------------------------------------------
// Events & errors
// ---------------------------------------------------------------------------

/// State changes produced by world mutations, drained by the region each
/// tick to drive client updates and the physics bridge.
#[derive(Debug)]
pub enum WorldEvent {
    /// Property change; the region forwards it to sessions *and* physics.
    Updated {
        id: Uuid,
        local_id: LocalId,
        flags: ObjUpd,
    },
    /// Pose readback applied from the physics thread; sessions only, so the
    /// edit does not echo back into the engine.
    MovedFromPhys { id: Uuid, local_id: LocalId },
    Deleted { id: Uuid, local_id: LocalId },
    /// A deleted prim carried this live script; the region must kill it.
    KillScript(ScriptHandle),
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("no such object")]
    NoSuchObject,
    #[error("object is not a prim")]
    NotAPrim,
    #[error("linkset would exceed {MAX_LINKSET_CHILDREN} children")]
    LinksetTooLarge,
    #[error("object already has a parent")]
    AlreadyParented,
    #[error("invalid parameter: {0}")]
    BadParam(&'static str),
}

/// Where an avatar should sit, as resolved by [`World::begin_sit`].
#[derive(Debug, Clone, Copy)]
pub struct SitInfo {
    pub target: Uuid,
    pub offset: Vec3,
    pub rot: Quat,
}

/// One chat delivery resolved by [`World::send_chat`].
#[derive(Debug, Clone, Copy)]
pub struct ChatDelivery {
    pub target: ChatTarget,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

pub struct World {
    objects: HashMap<Uuid, WorldObject>,
    local_ids: HashMap<LocalId, Uuid>,
    octree: Octree,
    events: Vec<WorldEvent>,
}

impl World {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            local_ids: HashMap::new(),
            octree: Octree::new(),
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> Option<&WorldObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut WorldObject> {
        self.objects.get_mut(&id)
    }

    pub fn by_local_id(&self, local_id: LocalId) -> Option<&WorldObject> {
        self.local_ids.get(&local_id).and_then(|id| self.objects.get(id))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorldObject> {
        self.objects.values()
    }

    /// Root of a prim's linkset (stops before avatar parents).
    pub fn root_prim_of(&self, mut id: Uuid) -> Uuid {
        while let Some(obj) = self.objects.get(&id) {
            match obj.parent {
                Some(p) if self.objects.get(&p).map(|o| o.is_prim()).unwrap_or(false) => id = p,
                _ => break,
            }
        }
        id
    }

    /// Link-number addressing: 1 is the root, 2.. are children in order.
    pub fn prim_by_link_id(&self, root: Uuid, link_num: i32) -> Option<Uuid> {
        if link_num <= 1 {
            return Some(root);
        }
        let prim = self.get(root)?.as_prim()?;
        prim.children.get(link_num as usize - 2).copied()
    }

    /// The object whose leaf carries this prim's listeners: the linkset
    /// root, or the avatar for attachments.
    pub fn listen_root_of(&self, mut id: Uuid) -> Uuid {
        while let Some(obj) = self.objects.get(&id) {
            match obj.parent {
                Some(p) if !obj.is_avatar() => id = p,
                _ => break,
            }
        }
        id
    }

    // -----------------------------------------------------------------------
    // Insertion & removal
    // -----------------------------------------------------------------------

    fn fresh_local_id(&self) -> LocalId {
        loop {
            let id: LocalId = rand::random();
            if id != 0 && !self.local_ids.contains_key(&id) {
                return id;
            }
        }
    }

    fn compute_world_pos(&self, obj: &WorldObject) -> Vec3 {
        match obj.parent.and_then(|p| self.objects.get(&p)) {
            None => obj.local_pos,
            Some(parent) if parent.is_prim() => {
                parent.world_pos + from_parent_frame(parent.rot, obj.local_pos)
            }
            // attachment: tracks the avatar position exactly
            Some(parent) => parent.world_pos,
        }
    }

    /// Insert one object. Parents must already be present; callers insert
    /// roots before children. The local id is always regenerated.
    pub fn insert(&mut self, mut obj: WorldObject) -> Uuid {
        let id = obj.id;
        obj.local_id = self.fresh_local_id();
        obj.world_pos = self.compute_world_pos(&obj);

        let is_attachment = obj
            .parent
            .and_then(|p| self.objects.get(&p))
            .map(|p| p.is_avatar())
            .unwrap_or(false);

        self.local_ids.insert(obj.local_id, id);
        if !is_attachment {
            self.octree.insert_object(obj.world_pos, id);
        }
        let local_id = obj.local_id;
        self.objects.insert(id, obj);
        self.push_update(id, local_id, ObjUpd::CREATED);
        id
    }

    /// Attach a not-yet-inserted prim tree root to an avatar slot. Any prim
    /// already in the slot is deleted first. Returns the prim id.
    pub fn add_attachment(
        &mut self,
        avatar_id: Uuid,
        mut root: WorldObject,
        attach_point: u8,
    ) -> Result<Uuid, WorldError> {
        let point = if attach_point == ATTACH_TO_LAST {
            let recorded = root.as_prim().map(|p| p.attach_point).unwrap_or(0);
            if recorded == 0 {
                crate::types::ATTACH_R_HAND
            } else {
                recorded
            }
        } else {
            attach_point
        };
        if point as usize >= NUM_ATTACH_POINTS {
            return Err(WorldError::BadParam("attach point out of range"));
        }

        let old = {
            let av_obj = self.objects.get(&avatar_id).ok_or(WorldError::NoSuchObject)?;
            let av = av_obj.as_avatar().ok_or(WorldError::NotAPrim)?;
            av.attachments[point as usize]
        };
        if let Some(old_prim) = old {
            self.delete_prim(old_prim);
        }

        root.parent = Some(avatar_id);
        if let Some(prim) = root.as_prim_mut() {
            prim.attach_point = point;
        }
        let prim_id = self.insert(root);

        let av_local = {
            let av_obj = self.objects.get_mut(&avatar_id).ok_or(WorldError::NoSuchObject)?;
            if let Some(av) = av_obj.as_avatar_mut() {
                av.attachments[point as usize] = Some(prim_id);
            }
            av_obj.local_id
        };
        self.push_update(avatar_id, av_local, ObjUpd::CHILDREN);
        Ok(prim_id)
    }

    /// Remove an object from the spatial structures (octree, local ids,
    /// listeners) and emit its deletion. The arena entry survives until the
    /// caller takes it.
    fn detach_from_world(&mut self, id: Uuid) {
        if let Some(obj) = self.objects.get_mut(&id) {
            let pos = obj.world_pos;
            let local_id = obj.local_id;
            let listeners: Vec<(i32, ChatTarget)> = std::mem::take(&mut obj.chat_channels);
            for (channel, target) in listeners {
                self.octree
                    .remove_listener(pos, channel, ChatListener { obj: id, target });
            }
            self.octree.remove_object(pos, id);
            self.local_ids.remove(&local_id);
            self.events.push(WorldEvent::Deleted { id, local_id });
        }
    }

    /// Recursively delete a prim: unsit avatars, delete children in reverse
    /// order, detach from the parent, kill its scripts.
    pub fn delete_prim(&mut self, id: Uuid) {
        // unsit everything on this prim first
        let (sitting, seated) = match self.objects.get(&id).and_then(|o| o.as_prim()) {
            Some(prim) => (prim.sitting_avatars.clone(), prim.seated_avatar),
            None => return,
        };
        for av in sitting {
            self.unsit_avatar(av);
        }
        if let Some(av) = seated {
            self.unsit_avatar(av);
        }

        self.detach_from_world(id);

        let children = self
            .objects
            .get(&id)
            .and_then(|o| o.as_prim())
            .map(|p| p.children.clone())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            self.delete_prim(child);
        }

        // compact out of the parent's child array / attachment slot
        let parent = self.objects.get(&id).and_then(|o| o.parent);
        if let Some(parent_id) = parent {
            let attach_point = self.objects.get(&id).and_then(|o| o.as_prim()).map(|p| p.attach_point);
            if let Some(pobj) = self.objects.get_mut(&parent_id) {
                match &mut pobj.body {
                    ObjectBody::Prim(pp) => pp.children.retain(|c| *c != id),
                    ObjectBody::Avatar(av) => {
                        if let Some(point) = attach_point {
                            if av.attachments[point as usize] == Some(id) {
                                av.attachments[point as usize] = None;
                            }
                        }
                    }
                }
            }
        }

        if let Some(obj) = self.objects.remove(&id) {
            if let ObjectBody::Prim(prim) = obj.body {
                for item in prim.inv.items {
                    if let Some(script) = item.script {
                        self.events.push(WorldEvent::KillScript(script));
                    }
                }
            }
        }
    }

    /// Delete an avatar body and all its attachments.
    pub fn delete_avatar(&mut self, id: Uuid) {
        if self.objects.get(&id).map(|o| o.parent.is_some()).unwrap_or(false) {
            self.unsit_avatar(id);
        }
        self.detach_from_world(id);
        let attachments = self
            .objects
            .get(&id)
            .and_then(|o| o.as_avatar())
            .map(|a| a.attachments)
            .unwrap_or([None; NUM_ATTACH_POINTS]);
        for slot in attachments.into_iter().flatten() {
            self.delete_prim(slot);
        }
        self.objects.remove(&id);
    }

    // -----------------------------------------------------------------------
    // Motion
    // -----------------------------------------------------------------------

    /// Move a root object to a new world position.
    pub fn move_root(&mut self, id: Uuid, new_pos: Vec3) {
        let Some(obj) = self.objects.get(&id) else { return };
        if obj.parent.is_some() {
            warn!("move_root on parented object {}", id);
            return;
        }
        let old_pos = obj.world_pos;
        self.octree.move_object(old_pos, new_pos, id);
        let obj = self.objects.get_mut(&id).expect("checked above");
        obj.local_pos = new_pos;
        obj.world_pos = new_pos;
        let local_id = obj.local_id;
        self.refresh_descendants(id);
        self.push_update(id, local_id, ObjUpd::POSROT);
    }

    /// Re-derive `world_pos` from the parent chain after a local move.
    pub fn update_global_pos(&mut self, id: Uuid) {
        let Some(obj) = self.objects.get(&id) else { return };
        let new_pos = self.compute_world_pos(obj);
        let old_pos = obj.world_pos;
        if old_pos != new_pos {
            self.octree.move_object(old_pos, new_pos, id);
            if let Some(obj) = self.objects.get_mut(&id) {
                obj.world_pos = new_pos;
            }
        }
    }

    /// Recompute world positions for every descendant (children and
    /// sitting avatars) after a root moved or rotated.
    fn refresh_descendants(&mut self, id: Uuid) {
        let (children, avatars) = match self.objects.get(&id).and_then(|o| o.as_prim()) {
            Some(prim) => (prim.children.clone(), prim.sitting_avatars.clone()),
            None => return,
        };
        for child in children {
            self.update_global_pos(child);
            self.refresh_descendants(child);
        }
        for av in avatars {
            self.update_global_pos(av);
        }
    }

    /// Pose readback from the physics thread. Updates spatial state and
    /// marks POSROT for clients without echoing back into the engine.
    pub fn move_obj_from_phys(&mut self, id: Uuid, new_pos: Vec3, rot: Quat, velocity: Vec3) {
        let Some(obj) = self.objects.get(&id) else { return };
        let old_pos = obj.world_pos;
        self.octree.move_object(old_pos, new_pos, id);
        let obj = self.objects.get_mut(&id).expect("checked above");
        obj.world_pos = new_pos;
        if obj.parent.is_none() {
            obj.local_pos = new_pos;
        }
        obj.rot = rot;
        obj.velocity = velocity;
        let local_id = obj.local_id;
        self.refresh_descendants(id);
        self.events.push(WorldEvent::MovedFromPhys { id, local_id });
    }

    // -----------------------------------------------------------------------
    // Linking
    // -----------------------------------------------------------------------

    /// Link `child` under `root`. Both must currently be unparented roots;
    /// the child must have no children of its own (merge the linksets one
    /// prim at a time, as the interactive link tool does).
    pub fn link_prim(&mut self, root_id: Uuid, child_id: Uuid) -> Result<(), WorldError> {
        if root_id == child_id {
            return Err(WorldError::BadParam("cannot link a prim to itself"));
        }
        {
            let root = self.objects.get(&root_id).ok_or(WorldError::NoSuchObject)?;
            let child = self.objects.get(&child_id).ok_or(WorldError::NoSuchObject)?;
            let root_prim = root.as_prim().ok_or(WorldError::NotAPrim)?;
            let child_prim = child.as_prim().ok_or(WorldError::NotAPrim)?;
            if root.parent.is_some() || child.parent.is_some() {
                return Err(WorldError::AlreadyParented);
            }
            if !child_prim.children.is_empty() {
                return Err(WorldError::BadParam("child still has its own linkset"));
            }
            if root_prim.children.len() >= MAX_LINKSET_CHILDREN {
                return Err(WorldError::LinksetTooLarge);
            }
        }

        // avatars must never have a child prim as their parent object
        let sitting = self
            .objects
            .get(&child_id)
            .and_then(|o| o.as_prim())
            .map(|p| (p.sitting_avatars.clone(), p.seated_avatar))
            .unwrap_or_default();
        for av in sitting.0 {
            self.unsit_avatar(av);
        }
        if let Some(av) = sitting.1 {
            self.unsit_avatar(av);
        }

        // listeners must migrate to the new listen root
        let moved_listeners = self.take_listeners(child_id);

        let (root_pos, root_rot, root_local) = {
            let root = self.objects.get(&root_id).expect("checked above");
            (root.world_pos, root.rot, root.local_id)
        };
        let child_local = {
            let child = self.objects.get_mut(&child_id).expect("checked above");
            child.parent = Some(root_id);
            // express the child in the root's frame
            child.local_pos = to_parent_frame(root_rot, child.world_pos - root_pos);
            child.rot = root_rot.inverse() * child.rot;
            child.local_id
        };
        if let Some(prim) = self.objects.get_mut(&root_id).and_then(|o| o.as_prim_mut()) {
            prim.children.push(child_id);
        }
        self.update_global_pos(child_id);
        self.restore_listeners(root_id, moved_listeners);

        // the mutation API owns the ordering: child first, then CHILDREN
        self.push_update(child_id, child_local, ObjUpd::PARENT | ObjUpd::POSROT);
        self.push_update(root_id, root_local, ObjUpd::CHILDREN);
        Ok(())
    }

    fn take_listeners(&mut self, id: Uuid) -> Vec<(i32, ChatTarget)> {
        let Some(obj) = self.objects.get_mut(&id) else {
            return Vec::new();
        };
        let pos = obj.world_pos;
        let taken = std::mem::take(&mut obj.chat_channels);
        for (channel, target) in &taken {
            self.octree
                .remove_listener(pos, *channel, ChatListener { obj: id, target: *target });
        }
        taken
    }

    fn restore_listeners(&mut self, new_root: Uuid, listeners: Vec<(i32, ChatTarget)>) {
        let Some(obj) = self.objects.get_mut(&new_root) else { return };
        let pos = obj.world_pos;
        for (channel, target) in listeners {
            obj.chat_channels.push((channel, target));
            self.octree.add_listener(
                pos,
                channel,
                ChatListener { obj: new_root, target },
            );
        }
    }

    // -----------------------------------------------------------------------
    // Sitting
    // -----------------------------------------------------------------------

    /// Resolve which prim of the seat's linkset the avatar should sit on.
    /// Follows sit targets when present; if any prim of the linkset has a
    /// sit target, only untaken sit targets are valid.
    pub fn begin_sit(&self, avatar_id: Uuid, seat_id: Uuid) -> Option<SitInfo> {
        let av = self.objects.get(&avatar_id)?;
        if !av.is_avatar() || av.parent.is_some() {
            return None;
        }
        let root_id = self.root_prim_of(seat_id);
        let root = self.objects.get(&root_id)?.as_prim()?;

        let mut has_sit_target = false;
        let mut try_prim = |id: Uuid, prim: &Prim| -> Option<SitInfo> {
            if prim.has_sit_target() {
                has_sit_target = true;
                if prim.seated_avatar.is_none() {
                    return Some(SitInfo {
                        target: id,
                        offset: prim.sit_target,
                        rot: prim.sit_rot,
                    });
                }
            }
            None
        };

        if let Some(info) = try_prim(root_id, root) {
            return Some(info);
        }
        for child_id in &root.children {
            if let Some(prim) = self.objects.get(child_id).and_then(|o| o.as_prim()) {
                if let Some(info) = try_prim(*child_id, prim) {
                    return Some(info);
                }
            }
        }
        if has_sit_target {
            return None;
        }

        // no sit targets anywhere: sit on the chosen prim directly; the
        // caller fills in a better offset from the click position
        Some(SitInfo {
            target: seat_id,
            offset: Vec3::new(0.0, 0.0, 0.5),
            rot: Quat::IDENTITY,
        })
    }

    /// Parent the avatar onto the resolved seat.
    pub fn complete_sit(&mut self, avatar_id: Uuid, info: &SitInfo) -> bool {
        let Some(av) = self.objects.get(&avatar_id) else { return false };
        if !av.is_avatar() || av.parent.is_some() {
            return false;
        }
        let Some(seat) = self.objects.get(&info.target) else { return false };
        if !seat.is_prim() {
            return false;
        }
        let seat_pos = seat.world_pos;
        let root_id = self.root_prim_of(info.target);
        let root_pos = match self.objects.get(&root_id) {
            Some(r) => r.world_pos,
            None => return false,
        };

        match self.objects.get_mut(&info.target).and_then(|o| o.as_prim_mut()) {
            Some(prim) if prim.seated_avatar.is_none() => prim.seated_avatar = Some(avatar_id),
            _ => return false,
        }
        if let Some(root_prim) = self.objects.get_mut(&root_id).and_then(|o| o.as_prim_mut()) {
            root_prim.sitting_avatars.push(avatar_id);
        }

        let (av_local, seat_local, root_local) = {
            let av_local = {
                let av = self.objects.get_mut(&avatar_id).expect("checked above");
                av.parent = Some(root_id);
                av.local_pos = info.offset + (seat_pos - root_pos);
                av.rot = info.rot;
                if let Some(a) = av.as_avatar_mut() {
                    a.sitting_on = Some(info.target);
                }
                av.local_id
            };
            let seat_local = self.objects.get(&info.target).map(|o| o.local_id).unwrap_or(0);
            let root_local = self.objects.get(&root_id).map(|o| o.local_id).unwrap_or(0);
            (av_local, seat_local, root_local)
        };
        self.update_global_pos(avatar_id);

        self.push_update(root_id, root_local, ObjUpd::AVATARS);
        self.push_update(avatar_id, av_local, ObjUpd::PARENT | ObjUpd::POSROT);
        self.push_update(info.target, seat_local, ObjUpd::AV_ON_SEAT);
        true
    }

    /// Stand the avatar up immediately.
    pub fn unsit_avatar(&mut self, avatar_id: Uuid) {
        let Some(av) = self.objects.get(&avatar_id) else { return };
        if av.parent.is_none() {
            return;
        }
        let seat_id = match av.as_avatar().and_then(|a| a.sitting_on) {
            Some(s) => s,
            None => return,
        };
        let root_id = self.root_prim_of(seat_id);
        let new_pos = self.compute_world_pos(av) + Vec3::new(0.0, 0.0, 0.5);

        if let Some(seat) = self.objects.get_mut(&seat_id).and_then(|o| o.as_prim_mut()) {
            seat.seated_avatar = None;
        }
        if let Some(root) = self.objects.get_mut(&root_id).and_then(|o| o.as_prim_mut()) {
            root.sitting_avatars.retain(|a| *a != avatar_id);
        }
        let av_local = {
            let av = self.objects.get_mut(&avatar_id).expect("checked above");
            av.parent = None;
            if let Some(a) = av.as_avatar_mut() {
                a.sitting_on = None;
            }
            av.local_id
        };
        self.move_root(avatar_id, new_pos);

        let seat_local = self.objects.get(&seat_id).map(|o| o.local_id).unwrap_or(0);
        let root_local = self.objects.get(&root_id).map(|o| o.local_id).unwrap_or(0);
        self.push_update(avatar_id, av_local, ObjUpd::PARENT);
        self.push_update(root_id, root_local, ObjUpd::AVATARS);
        self.push_update(seat_id, seat_local, ObjUpd::AV_ON_SEAT);
    }

    /// Script-initiated unsit: only allowed from the avatar's own seat
    /// linkset.
    pub fn unsit_avatar_via_script(&mut self, src_prim: Uuid, avatar_id: Uuid) -> bool {
        let root = self.root_prim_of(src_prim);
        let seated_on_root = self
            .objects
            .get(&avatar_id)
            .map(|av| av.is_avatar() && av.parent == Some(root))
            .unwrap_or(false);
        if !seated_on_root {
            return false;
        }
        self.unsit_avatar(avatar_id);
        true
    }

    // -----------------------------------------------------------------------
    // Multi-update (viewer object manipulation)
    // -----------------------------------------------------------------------

    /// Apply a viewer edit: any combination of position, rotation and scale,
    /// optionally linkset-wide.
    pub fn multi_update(
        &mut self,
        id: Uuid,
        pos: Option<Vec3>,
        rot: Option<Quat>,
        scale: Option<Vec3>,
        whole_linkset: bool,
    ) {
        let Some(obj) = self.objects.get(&id) else { return };
        let obj_is_prim = obj.is_prim();
        let children = obj.as_prim().map(|p| p.children.clone()).unwrap_or_default();

        if let Some(new_pos) = pos {
            if !whole_linkset && obj_is_prim {
                // the root moves alone: compensate children so they stay put
                let (old_local, inv_rot) = {
                    let o = self.objects.get(&id).expect("checked above");
                    (o.local_pos, o.rot.inverse())
                };
                let delta = inv_rot * (old_local - new_pos);
                for child in &children {
                    if let Some(c) = self.objects.get_mut(child) {
                        c.local_pos += delta;
                        let local = c.local_id;
                        self.push_update(*child, local, ObjUpd::POSROT);
                    }
                }
            }
            if let Some(o) = self.objects.get_mut(&id) {
                o.local_pos = new_pos;
            }
            self.update_global_pos(id);
        }

        if let Some(new_rot) = rot {
            if !whole_linkset && obj_is_prim {
                let inv_rot = self.objects.get(&id).expect("checked above").rot.inverse();
                for child in &children {
                    if let Some(c) = self.objects.get_mut(child) {
                        c.local_pos = new_rot * (inv_rot * c.local_pos);
                        c.rot = new_rot * (inv_rot * c.rot);
                        let local = c.local_id;
                        self.push_update(*child, local, ObjUpd::POSROT);
                    }
                }
            }
            if let Some(o) = self.objects.get_mut(&id) {
                o.rot = new_rot;
            }
        }

        if let Some(new_scale) = scale {
            if let Some(o) = self.objects.get_mut(&id) {
                o.scale = new_scale;
            }
        }

        self.refresh_descendants(id);

        let mut flags = ObjUpd::empty();
        if scale.is_some() {
            flags |= ObjUpd::SCALE;
        }
        if pos.is_some() || rot.is_some() {
            flags |= ObjUpd::POSROT;
        }
        let local = self.objects.get(&id).map(|o| o.local_id).unwrap_or(0);
        self.push_update(id, local, flags);
    }

    // -----------------------------------------------------------------------
    // Prim property setters
    // -----------------------------------------------------------------------

    pub fn set_hover_text(&mut self, id: Uuid, text: &str, color: [u8; 4]) {
        let Some(obj) = self.objects.get_mut(&id) else { return };
        let local = obj.local_id;
        if let Some(prim) = obj.as_prim_mut() {
            let mut text = text.to_string();
            text.truncate(254);
            prim.hover_text = text;
            prim.text_color = color;
            self.push_update(id, local, ObjUpd::TEXT);
        }
    }

    /// Recompute the prim's touch flag from the union of its scripts' event
    /// masks (as reported through EVMASK messages).
    pub fn set_script_evmask(&mut self, id: Uuid, prim_evmask: u32) {
        use crate::scripting::{EVMASK_TOUCH, EVMASK_TOUCH_CONT};
        let Some(obj) = self.objects.get_mut(&id) else { return };
        let local = obj.local_id;
        if let Some(prim) = obj.as_prim_mut() {
            let mut flags = prim.flags;
            flags.set(
                crate::types::PrimFlags::TOUCH,
                prim_evmask & (EVMASK_TOUCH | EVMASK_TOUCH_CONT) != 0,
            );
            if flags != prim.flags {
                prim.flags = flags;
                self.push_update(id, local, ObjUpd::FLAGS);
            }
        }
    }

    /// Open a batching context for `llSetPrimitiveParams`-style edits.
    pub fn prim_params(&mut self, id: Uuid) -> Option<PrimParamsCtx<'_>> {
        if !self.objects.get(&id).map(|o| o.is_prim()).unwrap_or(false) {
            return None;
        }
        Some(PrimParamsCtx {
            world: self,
            id,
            flags: ObjUpd::empty(),
        })
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Install a chat listener for `target` on the listen root of `obj_id`.
    pub fn add_listen(&mut self, obj_id: Uuid, channel: i32, target: ChatTarget) {
        let root = self.listen_root_of(obj_id);
        let Some(obj) = self.objects.get_mut(&root) else { return };
        let pos = obj.world_pos;
        obj.chat_channels.push((channel, target));
        self.octree
            .add_listener(pos, channel, ChatListener { obj: root, target });
    }

    pub fn remove_listen(&mut self, obj_id: Uuid, channel: i32, target: ChatTarget) {
        let root = self.listen_root_of(obj_id);
        let Some(obj) = self.objects.get_mut(&root) else { return };
        let pos = obj.world_pos;
        obj.chat_channels
            .retain(|(ch, t)| !(*ch == channel && *t == target));
        self.octree
            .remove_listener(pos, channel, ChatListener { obj: root, target });
    }

    /// Spatial chat dispatch: octree descent pruned by channel masks, then a
    /// range check per listener. OWNER_SAY never comes through here.
    pub fn send_chat(&self, msg: &ChatMessage) -> Vec<ChatDelivery> {
        debug!(
            "chat from {} on {} ({:?}): {:?}",
            msg.name, msg.channel, msg.chat_type, msg.msg
        );
        let range = msg.chat_type.range();
        self.octree
            .listeners_on(msg.channel)
            .into_iter()
            .filter(|listener| match range {
                None => true,
                Some(r) => self
                    .objects
                    .get(&listener.obj)
                    .map(|o| o.world_pos.distance(msg.pos) < r)
                    .unwrap_or(false),
            })
            .map(|listener| ChatDelivery {
                target: listener.target,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Flag a property change initiated outside the world's own mutators.
    pub fn mark_updated(&mut self, id: Uuid, flags: ObjUpd) {
        if let Some(obj) = self.objects.get(&id) {
            let local_id = obj.local_id;
            self.push_update(id, local_id, flags);
        }
    }

    fn push_update(&mut self, id: Uuid, local_id: LocalId, flags: ObjUpd) {
        if flags.is_empty() {
            return;
        }
        self.events.push(WorldEvent::Updated { id, local_id, flags });
    }

    pub fn take_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    /// Octree consistency hooks for tests.
    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn octree_mut(&mut self) -> &mut Octree {
        &mut self.octree
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// llSetPrimitiveParams batching context
// ---------------------------------------------------------------------------

/// Batches shape edits and emits exactly one composite update when dropped.
/// Each setter validates and quantizes its arguments; a failed rule leaves
/// the prim untouched and should abort the caller's rule loop.
pub struct PrimParamsCtx<'a> {
    world: &'a mut World,
    id: Uuid,
    flags: ObjUpd,
}

impl PrimParamsCtx<'_> {
    fn prim_mut(&mut self) -> &mut Prim {
        self.world
            .objects
            .get_mut(&self.id)
            .and_then(|o| o.as_prim_mut())
            .expect("existence checked at context creation")
    }

    pub fn set_shape(&mut self, shape: PrimType, hollow_shape: u8) -> Result<(), WorldError> {
        use prim::*;
        let hollow = hollow_shape & PROFILE_HOLLOW_MASK;
        let prim = self.prim_mut();
        let (profile, path) = match shape {
            PrimType::Box => (PROFILE_SHAPE_SQUARE, PATH_CURVE_STRAIGHT),
            PrimType::Cylinder => (PROFILE_SHAPE_CIRCLE, PATH_CURVE_STRAIGHT),
            PrimType::Prism => (PROFILE_SHAPE_EQUIL_TRI, PATH_CURVE_STRAIGHT),
            PrimType::Sphere => (PROFILE_SHAPE_SEMICIRC, PATH_CURVE_CIRCLE),
            PrimType::Torus => (PROFILE_SHAPE_CIRCLE, PATH_CURVE_CIRCLE),
            PrimType::Tube => (PROFILE_SHAPE_SQUARE, PATH_CURVE_CIRCLE),
            PrimType::Ring => (PROFILE_SHAPE_EQUIL_TRI, PATH_CURVE_CIRCLE),
            PrimType::Sculpt => return Err(WorldError::BadParam("sculpt shapes not settable here")),
        };
        prim.shape.profile_curve = profile | hollow;
        prim.shape.path_curve = path;
        self.flags |= ObjUpd::SHAPE;
        Ok(())
    }

    pub fn set_profile_cut(&mut self, begin: f32, end: f32) -> Result<(), WorldError> {
        let begin = if begin.is_finite() { begin.clamp(0.0, 0.95) } else { 0.0 };
        let mut end = if end.is_finite() { end } else { 1.0 };
        end = end.clamp(begin + 0.05, 1.0);
        let prim = self.prim_mut();
        prim.shape.profile_begin = (50000.0 * begin) as u16;
        prim.shape.profile_end = (50000.0 * (1.0 - end)) as u16;
        self.flags |= ObjUpd::SHAPE;
        Ok(())
    }

    pub fn set_hollow(&mut self, hollow: f32) -> Result<(), WorldError> {
        let hollow = if hollow.is_finite() { hollow.clamp(0.0, 0.95) } else { 0.0 };
        self.prim_mut().shape.profile_hollow = (50000.0 * hollow) as u16;
        self.flags |= ObjUpd::SHAPE;
        Ok(())
    }

    pub fn set_twist(&mut self, begin: f32, end: f32) -> Result<(), WorldError> {
        let begin = if begin.is_finite() { begin.clamp(-1.0, 1.0) } else { 0.0 };
        let end = if end.is_finite() { end.clamp(-1.0, 1.0) } else { 0.0 };
        let prim = self.prim_mut();
        prim.shape.path_twist_begin = (begin * 100.0) as i8;
        prim.shape.path_twist = (end * 100.0) as i8;
        self.flags |= ObjUpd::SHAPE;
        Ok(())
    }

    pub fn set_taper(
        &mut self,
        top_size_x: f32,
        top_size_y: f32,
        top_shear_x: f32,
        top_shear_y: f32,
    ) -> Result<(), WorldError> {
        let sx = if top_shear_x.is_finite() { top_shear_x.clamp(-0.5, 0.5) } else { 0.0 };
        let sy = if top_shear_y.is_finite() { top_shear_y.clamp(-0.5, 0.5) } else { 0.0 };
        let tx = if top_size_x.is_finite() { top_size_x.clamp(0.0, 2.0) } else { 1.0 };
        let ty = if top_size_y.is_finite() { top_size_y.clamp(0.0, 2.0) } else { 1.0 };
        let prim = self.prim_mut();
        prim.shape.path_shear_x = (100.0 * sx) as i8;
        prim.shape.path_shear_y = (100.0 * sy) as i8;
        // the path scale encodes 2.0 - size
        prim.shape.path_scale_x = (100.0 * (2.0 - tx)) as u8;
        prim.shape.path_scale_y = (100.0 * (2.0 - ty)) as u8;
        self.flags |= ObjUpd::SHAPE;
        Ok(())
    }

    pub fn set_point_light(
        &mut self,
        color: Vec3,
        intensity: f32,
        radius: f32,
        falloff: f32,
    ) -> Result<(), WorldError> {
        fn channel(v: f32) -> u8 {
            (v.clamp(0.0, 1.0) * 255.0) as u8
        }
        let mut payload = [0u8; 16];
        payload[0] = channel(color.x);
        payload[1] = channel(color.y);
        payload[2] = channel(color.z);
        payload[3] = channel(intensity);
        payload[4..8].copy_from_slice(&radius.to_le_bytes());
        payload[8..12].copy_from_slice(&0.0f32.to_le_bytes());
        payload[12..16].copy_from_slice(&falloff.to_le_bytes());
        if !self.prim_mut().extra_params.set(prim::EXTRA_PARAM_LIGHT, &payload) {
            return Err(WorldError::BadParam("extra params full"));
        }
        self.flags |= ObjUpd::EXTRA_PARAMS;
        Ok(())
    }

    pub fn remove_light(&mut self) -> Result<(), WorldError> {
        self.prim_mut().extra_params.delete(prim::EXTRA_PARAM_LIGHT);
        self.flags |= ObjUpd::EXTRA_PARAMS;
        Ok(())
    }

    pub fn set_material(&mut self, material: u8) -> Result<(), WorldError> {
        self.prim_mut().material = material;
        self.flags |= ObjUpd::MATERIAL;
        Ok(())
    }

    pub fn set_text(&mut self, text: &str, color: [u8; 4]) -> Result<(), WorldError> {
        let prim = self.prim_mut();
        let mut text = text.to_string();
        text.truncate(254);
        prim.hover_text = text;
        prim.text_color = color;
        self.flags |= ObjUpd::TEXT;
        Ok(())
    }
}

impl Drop for PrimParamsCtx<'_> {
    fn drop(&mut self) {
        let local = self.world.objects.get(&self.id).map(|o| o.local_id).unwrap_or(0);
        let flags = self.flags;
        self.world.push_update(self.id, local, flags);
    }
}
