//! Core value types shared across all modules.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// World dimensions
// ---------------------------------------------------------------------------

/// Side length of a region's ground plane in metres.
pub const REGION_SIZE: f32 = 256.0;

/// Vertical extent of the simulated volume in metres.
pub const WORLD_HEIGHT: f32 = 4096.0;

/// Samples per side of the region heightfield.
pub const TERRAIN_GRID: usize = 256;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Ephemeral per-region object identifier, regenerated on insert.
pub type LocalId = u32;

/// A region's position on the grid, packed as `x << 32 | y` with x and y
/// being region corner coordinates in metres (always multiples of 256).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RegionHandle(pub u64);

impl RegionHandle {
    pub fn from_grid(grid_x: u32, grid_y: u32) -> Self {
        Self(((grid_x as u64 * 256) << 32) | (grid_y as u64 * 256))
    }

    pub fn grid_x(&self) -> u32 {
        ((self.0 >> 32) / 256) as u32
    }

    pub fn grid_y(&self) -> u32 {
        ((self.0 & 0xffff_ffff) / 256) as u32
    }
}

impl std::fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.grid_x(), self.grid_y())
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

pub const PERM_TRANSFER: u32 = 1 << 13;
pub const PERM_MODIFY: u32 = 1 << 14;
pub const PERM_COPY: u32 = 1 << 15;
pub const PERM_MOVE: u32 = 1 << 19;
pub const PERM_DAMAGE: u32 = 1 << 20;
pub const PERM_FULL: u32 = 0x7fff_ffff;

/// The five permission words carried by every item and prim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    pub base: u32,
    pub current: u32,
    pub group: u32,
    pub everyone: u32,
    pub next: u32,
}

impl Perms {
    pub fn full() -> Self {
        Self {
            base: PERM_FULL,
            current: PERM_FULL,
            group: 0,
            everyone: 0,
            next: PERM_FULL,
        }
    }

    /// Force every other permission word to be a subset of `base`.
    pub fn sanitise(&mut self) {
        self.current &= self.base;
        self.group &= self.base;
        self.everyone &= self.base;
        self.next &= self.base;
    }
}

impl Default for Perms {
    fn default() -> Self {
        Self::full()
    }
}

// ---------------------------------------------------------------------------
// Flag words
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Viewer-visible prim flags (the ObjectUpdate flag word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrimFlags: u32 {
        const PHYSICAL        = 0x1;
        const CREATE_SELECTED = 0x2;
        const CAN_MODIFY      = 0x4;
        const CAN_COPY        = 0x8;
        const ANY_OWNER       = 0x10;
        const YOU_OWNER       = 0x20;
        const SCRIPTED        = 0x40;
        const TOUCH           = 0x80;
        const CAN_MOVE        = 0x100;
        const TAKES_PAYMENT   = 0x200;
        const PHANTOM         = 0x400;
        const INVENTORY_EMPTY = 0x800;
        const ALLOW_INV_DROP  = 0x10000;
        const CAN_TRANSFER    = 0x20000;
        const GROUP_OWNER     = 0x40000;
        const CAMERA_DECOUPLED = 0x100000;
        const ANIM_SOURCE     = 0x200000;
        const CAMERA_SOURCE   = 0x400000;
        const CAST_SHADOWS    = 0x800000;
        const OWNER_MODIFY    = 0x10000000;
        const TEMP_ON_REZ     = 0x20000000;
        const TEMPORARY       = 0x40000000;
    }
}

bitflags::bitflags! {
    /// Per-session lifecycle and bookkeeping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AgentFlags: u32 {
        /// Got the region-handshake reply.
        const RHR               = 0x1;
        /// Expecting this agent to enter the region.
        const INCOMING          = 0x2;
        /// Session is being purged.
        const PURGE             = 0x4;
        const IN_LOGOUT         = 0x8;
        const CHILD             = 0x10;
        /// Got complete-agent-movement.
        const ENTERED           = 0x20;
        /// Need to send appearance to other agents.
        const APPEARANCE_UPD    = 0x40;
        /// Need appearance of other avatars sent to us.
        const NEED_OTHER_AVS    = 0x80;
        const ANIM_UPDATE       = 0x100;
        const AV_FULL_UPD       = 0x200;
        const TELEPORT_COMPLETE = 0x400;
        const IN_SLOW_REMOVAL   = 0x800;
        const PAUSED            = 0x1000;
        const ALWAYS_RUN        = 0x2000;
    }
}

bitflags::bitflags! {
    /// Per-object dirty bits driving client object updates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjUpd: u32 {
        const POSROT       = 0x1;
        /// Newly-created object; forces a full update.
        const CREATED      = 0x2;
        const SCALE        = 0x4;
        const SHAPE        = 0x8;
        const TEXTURE      = 0x10;
        const FLAGS        = 0x20;
        const MATERIAL     = 0x40;
        const TEXT         = 0x80;
        /// Object reparented.
        const PARENT       = 0x100;
        /// Child list changed.
        const CHILDREN     = 0x200;
        const EXTRA_PARAMS = 0x400;
        const AV_ON_SEAT   = 0x800;
        const AVATARS      = 0x1000;
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Script debug output channel.
pub const DEBUG_CHANNEL: i32 = 2147483647;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Whisper,
    Normal,
    Shout,
    StartTyping,
    StopTyping,
    Debug,
    OwnerSay,
    RegionSay,
}

impl ChatType {
    /// Audible range in metres; `None` means no spatial cutoff.
    pub fn range(&self) -> Option<f32> {
        match self {
            ChatType::Whisper => Some(10.0),
            ChatType::Normal | ChatType::StartTyping | ChatType::StopTyping => Some(20.0),
            ChatType::Shout | ChatType::Debug => Some(100.0),
            ChatType::OwnerSay | ChatType::RegionSay => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSource {
    System,
    Avatar,
    Object,
}

/// A chat message in flight through the world.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: i32,
    pub pos: Vec3,
    pub source: Uuid,
    pub owner: Uuid,
    pub source_type: ChatSource,
    pub chat_type: ChatType,
    pub name: String,
    pub msg: String,
}

// ---------------------------------------------------------------------------
// Materials
// ---------------------------------------------------------------------------

pub const MATERIAL_STONE: u8 = 0;
pub const MATERIAL_METAL: u8 = 1;
pub const MATERIAL_GLASS: u8 = 2;
pub const MATERIAL_WOOD: u8 = 3;
pub const MATERIAL_FLESH: u8 = 4;
pub const MATERIAL_PLASTIC: u8 = 5;
pub const MATERIAL_RUBBER: u8 = 6;

// ---------------------------------------------------------------------------
// Attachment points
// ---------------------------------------------------------------------------

/// Attach to the prim's previously-recorded point.
pub const ATTACH_TO_LAST: u8 = 0;
pub const ATTACH_CHEST: u8 = 1;
pub const ATTACH_HEAD: u8 = 2;
pub const ATTACH_L_HAND: u8 = 5;
pub const ATTACH_R_HAND: u8 = 6;
pub const FIRST_HUD_ATTACH_POINT: u8 = 31;
pub const NUM_ATTACH_POINTS: usize = 39;

// ---------------------------------------------------------------------------
// Asset / inventory type tags
// ---------------------------------------------------------------------------

pub const ASSET_TEXTURE: i8 = 0;
pub const ASSET_SOUND: i8 = 1;
pub const ASSET_LANDMARK: i8 = 3;
pub const ASSET_CLOTHING: i8 = 5;
pub const ASSET_OBJECT: i8 = 6;
pub const ASSET_NOTECARD: i8 = 7;
pub const ASSET_CATEGORY: i8 = 8;
pub const ASSET_ROOT: i8 = 9;
pub const ASSET_LSL_TEXT: i8 = 10;
pub const ASSET_LSL_BYTECODE: i8 = 11;
pub const ASSET_BODY_PART: i8 = 13;
pub const ASSET_ANIMATION: i8 = 20;

pub const INV_TYPE_TEXTURE: i8 = 0;
pub const INV_TYPE_OBJECT: i8 = 6;
pub const INV_TYPE_NOTECARD: i8 = 7;
pub const INV_TYPE_CATEGORY: i8 = 8;
pub const INV_TYPE_ROOT: i8 = 9;
pub const INV_TYPE_LSL: i8 = 10;
pub const INV_TYPE_WEARABLE: i8 = 18;
pub const INV_TYPE_ANIMATION: i8 = 19;

// ---------------------------------------------------------------------------
// Throttles
// ---------------------------------------------------------------------------

pub const NUM_THROTTLES: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ThrottleId {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    /// Object updates.
    Task = 4,
    Texture = 5,
    Asset = 6,
}

pub const THROTTLE_NAMES: [&str; NUM_THROTTLES] =
    ["resend", "land", "wind", "cloud", "task", "texture", "asset"];

// ---------------------------------------------------------------------------
// Wearables
// ---------------------------------------------------------------------------

pub const NUM_WEARABLES: usize = 15;

pub const WEARABLE_NAMES: [&str; NUM_WEARABLES] = [
    "body", "skin", "hair", "eyes", "shirt", "pants", "shoes", "socks", "jacket", "gloves",
    "undershirt", "underpants", "skirt", "alpha", "tattoo",
];

/// One wearable slot: the inventory item worn and the asset backing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wearable {
    pub item_id: Uuid,
    pub asset_id: Uuid,
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// Express `world_dir` in the frame of a parent with rotation `parent_rot`.
pub fn to_parent_frame(parent_rot: Quat, world_dir: Vec3) -> Vec3 {
    parent_rot.inverse() * world_dir
}

/// Inverse of [`to_parent_frame`].
pub fn from_parent_frame(parent_rot: Quat, local_dir: Vec3) -> Vec3 {
    parent_rot * local_dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_handle_round_trips_grid_coords() {
        let h = RegionHandle::from_grid(1000, 1001);
        assert_eq!(h.grid_x(), 1000);
        assert_eq!(h.grid_y(), 1001);
    }

    #[test]
    fn sanitise_clamps_to_base() {
        let mut p = Perms {
            base: PERM_COPY | PERM_MODIFY,
            current: PERM_FULL,
            group: PERM_TRANSFER,
            everyone: PERM_COPY,
            next: PERM_FULL,
        };
        p.sanitise();
        assert_eq!(p.current, PERM_COPY | PERM_MODIFY);
        assert_eq!(p.group, 0);
        assert_eq!(p.everyone, PERM_COPY);
        assert_eq!(p.next, PERM_COPY | PERM_MODIFY);
    }

    #[test]
    fn chat_ranges_match_constants() {
        assert_eq!(ChatType::Whisper.range(), Some(10.0));
        assert_eq!(ChatType::Normal.range(), Some(20.0));
        assert_eq!(ChatType::Shout.range(), Some(100.0));
        assert_eq!(ChatType::RegionSay.range(), None);
    }

    #[test]
    fn parent_frame_round_trip() {
        let rot = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let v = Vec3::new(1.0, 2.0, 3.0);
        let back = from_parent_frame(rot, to_parent_frame(rot, v));
        assert!((back - v).length() < 1e-5);
    }
}
