//! User sessions: identity, lifecycle flags, throttles, wearables,
//! animations and per-client object-update bookkeeping.
//!
//! Sessions are owned by their region and addressed through generational
//! [`SessionHandle`]s. Long-running work (grid callbacks, script RPCs,
//! teleports) holds a handle, never a reference; removal bumps the
//! generation so every later resolution observes the session is gone.

use std::collections::{HashMap, HashSet, VecDeque};

use glam::Vec3;
use log::{debug, warn};
use uuid::Uuid;

use crate::evqueue::EventQueue;
use crate::protocol::ClientHooks;
use crate::teleport::Teleport;
use crate::terrain::TERRAIN_PATCHES;
use crate::types::{
    AgentFlags, LocalId, ObjUpd, Wearable, NUM_THROTTLES, NUM_WEARABLES,
};

/// Seconds without traffic before a session is considered dead.
pub const CONNECTION_TIMEOUT: f64 = 15.0;
/// Paused viewers (e.g. minimized) get a longer leash.
pub const CONNECTION_TIMEOUT_PAUSED: f64 = 90.0;

/// Ticks of grace while draining traffic after a teleport.
pub const SLOW_REMOVAL_TICKS: i32 = 3;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Generation-checked session reference. Resolving a stale handle yields
/// nothing, which replaces the original's nulled self-pointer discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub agent_id: Uuid,
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// Throttles
// ---------------------------------------------------------------------------

/// One leaky-bucket rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    /// Current reservoir level in bytes.
    pub level: f32,
    /// Flow rate in bytes/second.
    pub rate: f32,
    /// When the reservoir was last refilled.
    pub time: f64,
}

impl Throttle {
    /// Refill the reservoir; the level is capped at 0.3 s worth of data.
    pub fn update(&mut self, now: f64) {
        self.level += self.rate * (now - self.time) as f32;
        if self.level > self.rate * 0.3 {
            self.level = self.rate * 0.3;
        }
        self.time = now;
    }

    /// Try to consume `bytes` from the reservoir.
    pub fn consume(&mut self, bytes: usize) -> bool {
        if self.level >= bytes as f32 {
            self.level -= bytes as f32;
            true
        } else {
            false
        }
    }
}

pub const THROTTLE_INIT_RATE: f32 = 64000.0;

// ---------------------------------------------------------------------------
// Animations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimKind {
    Normal,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct AnimationDesc {
    pub anim: Uuid,
    pub obj: Uuid,
    pub sequence: i32,
    pub kind: AnimKind,
}

/// Built-in avatar animations; the viewer has these ids hardcoded, so they
/// must never change. Overrides are layered on top, never substituted.
pub mod anims {
    use uuid::{uuid, Uuid};

    pub const STAND: Uuid = uuid!("2408fe9e-df1d-1d7d-f4ff-1384fa7b350f");
    pub const WALK: Uuid = uuid!("6ed24bd8-91aa-4b12-ccc7-c97c857ab4e0");
    pub const HOVER: Uuid = uuid!("4ae8016b-31b9-03bb-c401-b1ea941db41d");
    pub const FLY: Uuid = uuid!("aec4610c-757f-bc4e-c092-c6e9caf18daf");
    pub const HOVER_DOWN: Uuid = uuid!("20f063ea-8306-2562-0b07-5c853b37b31e");
    pub const HOVER_UP: Uuid = uuid!("62c5de58-cb33-5743-3d07-9e4cd4352864");
    pub const LAND: Uuid = uuid!("7a17b059-12b2-41b1-570a-186368b6aa6f");
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct UserSession {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub generation: u64,
    pub circuit_code: u32,
    pub first_name: String,
    pub last_name: String,
    pub group_title: String,
    pub flags: AgentFlags,
    pub draw_dist: f32,
    pub last_activity: f64,
    /// World object id of the avatar body, once a full agent.
    pub avatar: Option<Uuid>,
    pub throttles: [Throttle; NUM_THROTTLES],
    pub wearables: [Wearable; NUM_WEARABLES],
    pub wearable_serial: u32,
    pub texture_entry: Vec<u8>,
    pub visual_params: Vec<u8>,
    pub default_anim: AnimationDesc,
    pub anims: Vec<AnimationDesc>,
    pub anim_seq: i32,
    /// Dirty flags per object, flushed once per tick.
    pub obj_updates: HashMap<LocalId, ObjUpd>,
    /// Objects deleted since the last flush; drained before any update.
    pub deleted_objs: VecDeque<LocalId>,
    pub evqueue: EventQueue,
    /// Capability name → token, plus the seed everything hangs off.
    pub named_caps: HashMap<String, String>,
    pub seed_cap: Option<String>,
    pub start_pos: Vec3,
    pub start_look_at: Vec3,
    /// Countdown for slow removal after a teleport.
    pub shutdown_ctr: i32,
    /// Terrain patches still owed to this client, one bit row per patch row.
    pub dirty_terrain: [u16; TERRAIN_PATCHES],
    /// Seen use-circuit-code sequence numbers (duplicate suppression).
    pub circuit_seqnos: HashSet<u32>,
    /// In-flight teleport, at most one.
    pub teleport: Option<Teleport>,
    pub hooks: Option<Box<dyn ClientHooks>>,
}

/// Everything the grid tells us about an expected user: identity, start
/// position, and the appearance state carried over from their last region.
#[derive(Debug, Clone, Default)]
pub struct NewUserInfo {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
    pub first_name: String,
    pub last_name: String,
    pub is_child: bool,
    pub start_pos: Vec3,
    pub start_look_at: Vec3,
    pub seed_cap: Option<String>,
    pub wearables: [Wearable; NUM_WEARABLES],
    pub texture_entry: Vec<u8>,
    pub visual_params: Vec<u8>,
}

impl UserSession {
    pub fn new(info: &NewUserInfo, generation: u64, now: f64) -> Self {
        let flags = if info.is_child {
            AgentFlags::CHILD
        } else {
            AgentFlags::INCOMING
        };
        Self {
            user_id: info.user_id,
            session_id: info.session_id,
            secure_session_id: info.secure_session_id,
            generation,
            circuit_code: info.circuit_code,
            first_name: info.first_name.clone(),
            last_name: info.last_name.clone(),
            group_title: String::new(),
            flags,
            draw_dist: 0.0,
            last_activity: now,
            avatar: None,
            // fresh sessions start with a full reservoir so the initial
            // burst of full updates is not held back
            throttles: [Throttle {
                level: THROTTLE_INIT_RATE * 0.3,
                rate: THROTTLE_INIT_RATE,
                time: now,
            }; NUM_THROTTLES],
            wearables: info.wearables,
            wearable_serial: 0,
            texture_entry: info.texture_entry.clone(),
            visual_params: info.visual_params.clone(),
            default_anim: AnimationDesc {
                anim: anims::STAND,
                obj: Uuid::nil(),
                sequence: 1,
                kind: AnimKind::Default,
            },
            anims: Vec::new(),
            anim_seq: 2,
            obj_updates: HashMap::new(),
            deleted_objs: VecDeque::new(),
            evqueue: EventQueue::new(),
            named_caps: HashMap::new(),
            seed_cap: info.seed_cap.clone(),
            start_pos: info.start_pos,
            start_look_at: info.start_look_at,
            shutdown_ctr: 0,
            dirty_terrain: [0xffff; TERRAIN_PATCHES],
            circuit_seqnos: HashSet::new(),
            teleport: None,
            hooks: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            agent_id: self.user_id,
            generation: self.generation,
        }
    }

    pub fn name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn check_session(&self, agent_id: Uuid, session_id: Uuid) -> bool {
        self.user_id == agent_id && self.session_id == session_id
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    pub fn reset_timeout(&mut self, now: f64) {
        self.last_activity = now;
    }

    pub fn timed_out(&self, now: f64) -> bool {
        let limit = if self.flags.contains(AgentFlags::PAUSED) {
            CONNECTION_TIMEOUT_PAUSED
        } else {
            CONNECTION_TIMEOUT
        };
        now - self.last_activity > limit
    }

    /// Duplicate use-circuit-code suppression, per sequence number.
    pub fn note_circuit_seqno(&mut self, seqno: u32) -> bool {
        self.circuit_seqnos.insert(seqno)
    }

    // -----------------------------------------------------------------------
    // Throttles
    // -----------------------------------------------------------------------

    pub fn update_throttles(&mut self, now: f64) {
        for throttle in &mut self.throttles {
            throttle.update(now);
        }
    }

    pub fn set_throttles(&mut self, rates: [f32; NUM_THROTTLES], now: f64) {
        for (throttle, rate) in self.throttles.iter_mut().zip(rates) {
            throttle.time = now;
            throttle.level = 0.0;
            throttle.rate = rate;
        }
    }

    /// Apply the 28-byte little-endian float block from agent-throttle.
    /// Values arrive in bits/second.
    pub fn set_throttles_block(&mut self, data: &[u8], now: f64) {
        if data.len() < NUM_THROTTLES * 4 {
            warn!("agent-throttle block too short ({} bytes)", data.len());
            return;
        }
        let mut rates = [0.0f32; NUM_THROTTLES];
        for (i, rate) in rates.iter_mut().enumerate() {
            let b = &data[i * 4..i * 4 + 4];
            *rate = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) / 8.0;
        }
        debug!("throttles for {}: {:?}", self.name(), rates);
        self.set_throttles(rates, now);
    }

    pub fn throttles_block(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NUM_THROTTLES * 4);
        for throttle in &self.throttles {
            out.extend_from_slice(&(throttle.rate * 8.0).to_le_bytes());
        }
        out
    }

    // -----------------------------------------------------------------------
    // Animations
    // -----------------------------------------------------------------------

    pub fn next_anim_seq(&mut self) -> i32 {
        self.anim_seq += 1;
        self.anim_seq
    }

    /// Add an animation; with `replace`, an existing animation of the same
    /// id or kind is overwritten instead of stacked.
    pub fn add_animation(&mut self, anim: AnimationDesc, replace: bool) {
        if replace {
            if let Some(existing) = self
                .anims
                .iter_mut()
                .find(|a| a.anim == anim.anim || a.kind == anim.kind)
            {
                if existing.anim != anim.anim || existing.kind != anim.kind {
                    *existing = anim;
                    self.flags |= AgentFlags::ANIM_UPDATE;
                }
                return;
            }
        } else if let Some(existing) = self.anims.iter_mut().find(|a| a.anim == anim.anim) {
            existing.kind = anim.kind;
            return;
        }
        self.anims.push(anim);
        self.flags |= AgentFlags::ANIM_UPDATE;
    }

    pub fn clear_animation_by_kind(&mut self, kind: AnimKind) {
        let before = self.anims.len();
        self.anims.retain(|a| a.kind != kind);
        if self.anims.len() != before {
            self.flags |= AgentFlags::ANIM_UPDATE;
        }
    }

    pub fn clear_animation_by_id(&mut self, anim: Uuid) {
        let before = self.anims.len();
        self.anims.retain(|a| a.anim != anim);
        if self.anims.len() != before {
            self.flags |= AgentFlags::ANIM_UPDATE;
        }
    }

    // -----------------------------------------------------------------------
    // Wearables & appearance
    // -----------------------------------------------------------------------

    pub fn set_wearable(&mut self, slot: usize, item_id: Uuid, asset_id: Uuid) {
        let Some(wearable) = self.wearables.get_mut(slot) else {
            warn!("wearable slot {} out of range", slot);
            return;
        };
        *wearable = Wearable { item_id, asset_id };
    }

    pub fn set_wearable_item_id(&mut self, slot: usize, item_id: Uuid) {
        if let Some(wearable) = self.wearables.get_mut(slot) {
            wearable.item_id = item_id;
        }
    }

    pub fn set_texture_entry(&mut self, data: Vec<u8>) {
        self.texture_entry = data;
        self.flags |= AgentFlags::APPEARANCE_UPD;
    }

    pub fn set_visual_params(&mut self, data: Vec<u8>) {
        self.visual_params = data;
        self.flags |= AgentFlags::APPEARANCE_UPD;
    }

    // -----------------------------------------------------------------------
    // Object-update bookkeeping
    // -----------------------------------------------------------------------

    pub fn mark_update(&mut self, local_id: LocalId, flags: ObjUpd) {
        *self.obj_updates.entry(local_id).or_insert(ObjUpd::empty()) |= flags;
    }

    pub fn mark_deleted(&mut self, local_id: LocalId) {
        self.obj_updates.remove(&local_id);
        self.deleted_objs.push_back(local_id);
    }

    /// Drain the pending deletions (sent before any create/update).
    pub fn take_deletions(&mut self) -> Vec<LocalId> {
        self.deleted_objs.drain(..).collect()
    }

    /// Drain pending updates: freshly-created objects first, then the rest.
    pub fn take_updates(&mut self) -> Vec<(LocalId, ObjUpd)> {
        let mut updates: Vec<(LocalId, ObjUpd)> = self.obj_updates.drain().collect();
        updates.sort_by_key(|(id, flags)| (!flags.contains(ObjUpd::CREATED), *id));
        updates
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_child(&self) -> bool {
        self.flags.contains(AgentFlags::CHILD)
    }

    /// Transition Child → Full on complete-agent-movement. The caller
    /// creates the avatar body; this only flips the flags.
    pub fn begin_full_agent(&mut self) -> bool {
        if !self.flags.contains(AgentFlags::INCOMING) {
            warn!("unexpected complete-agent-movement for {}", self.name());
            return false;
        }
        self.flags.remove(AgentFlags::CHILD);
        self.flags |= AgentFlags::ENTERED
            | AgentFlags::APPEARANCE_UPD
            | AgentFlags::ANIM_UPDATE
            | AgentFlags::AV_FULL_UPD;
        true
    }

    /// Begin leaving. With `slowly`, a short countdown lets in-flight
    /// traffic drain (teleports); otherwise the session is purged at the
    /// next sweep.
    pub fn begin_close(&mut self, slowly: bool) {
        if slowly {
            self.flags |= AgentFlags::IN_SLOW_REMOVAL;
            self.shutdown_ctr = SLOW_REMOVAL_TICKS;
        } else {
            self.flags |= AgentFlags::PURGE;
        }
    }

    /// One tick of the slow-removal countdown; true when due for purge.
    pub fn tick_slow_removal(&mut self) -> bool {
        if !self.flags.contains(AgentFlags::IN_SLOW_REMOVAL) {
            return false;
        }
        self.shutdown_ctr -= 1;
        if self.shutdown_ctr <= 0 {
            self.flags |= AgentFlags::PURGE;
            true
        } else {
            false
        }
    }
}
