//! Prim data: shape parameters, extra-params TLV blob, inventory container.

use glam::{Quat, Vec3};
use uuid::Uuid;

use crate::inventory::InventoryItem;
use crate::types::{Perms, PrimFlags};

// ---------------------------------------------------------------------------
// Shape parameter constants
// ---------------------------------------------------------------------------

pub const PROFILE_SHAPE_CIRCLE: u8 = 0;
pub const PROFILE_SHAPE_SQUARE: u8 = 1;
pub const PROFILE_SHAPE_ISO_TRI: u8 = 2;
pub const PROFILE_SHAPE_EQUIL_TRI: u8 = 3;
pub const PROFILE_SHAPE_RIGHT_TRI: u8 = 4;
pub const PROFILE_SHAPE_SEMICIRC: u8 = 5;

pub const PROFILE_SHAPE_MASK: u8 = 0x0f;
pub const PROFILE_HOLLOW_MASK: u8 = 0xf0;

pub const PATH_CURVE_STRAIGHT: u8 = 0x10;
pub const PATH_CURVE_CIRCLE: u8 = 0x20;
pub const PATH_CURVE_MASK: u8 = 0xf0;

/// Extra-params entry type for point lights.
pub const EXTRA_PARAM_LIGHT: u16 = 0x23;
/// Extra-params entry type for flexible paths.
pub const EXTRA_PARAM_FLEXI: u16 = 0x10;

/// The `llSetPrimitiveParams` shape selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimType {
    Box = 0,
    Cylinder = 1,
    Prism = 2,
    Sphere = 3,
    Torus = 4,
    Tube = 5,
    Ring = 6,
    Sculpt = 7,
}

impl PrimType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Box),
            1 => Some(Self::Cylinder),
            2 => Some(Self::Prism),
            3 => Some(Self::Sphere),
            4 => Some(Self::Torus),
            5 => Some(Self::Tube),
            6 => Some(Self::Ring),
            7 => Some(Self::Sculpt),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shape parameters
// ---------------------------------------------------------------------------

/// Quantized shape parameters, stored exactly as they travel on the wire.
///
/// Quantization: twist/taper/shear are ×100 into i8 range; hollow and
/// profile begin/end are ×50000 into u16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimShape {
    pub profile_curve: u8,
    pub path_curve: u8,
    pub path_begin: u16,
    pub path_end: u16,
    pub path_scale_x: u8,
    pub path_scale_y: u8,
    pub path_shear_x: i8,
    pub path_shear_y: i8,
    pub path_twist: i8,
    pub path_twist_begin: i8,
    pub path_radius_offset: i8,
    pub path_taper_x: i8,
    pub path_taper_y: i8,
    pub path_revolutions: u8,
    pub path_skew: i8,
    pub profile_begin: u16,
    pub profile_end: u16,
    pub profile_hollow: u16,
}

impl Default for PrimShape {
    /// The default freshly-rezzed cube.
    fn default() -> Self {
        Self {
            profile_curve: PROFILE_SHAPE_SQUARE,
            path_curve: PATH_CURVE_STRAIGHT,
            path_begin: 0,
            path_end: 0,
            path_scale_x: 100,
            path_scale_y: 100,
            path_shear_x: 0,
            path_shear_y: 0,
            path_twist: 0,
            path_twist_begin: 0,
            path_radius_offset: 0,
            path_taper_x: 0,
            path_taper_y: 0,
            path_revolutions: 0,
            path_skew: 0,
            profile_begin: 0,
            profile_end: 0,
            profile_hollow: 0,
        }
    }
}

impl PrimShape {
    pub fn profile_shape(&self) -> u8 {
        self.profile_curve & PROFILE_SHAPE_MASK
    }

    /// True when the profile is whole: no twist, hollow or profile cut.
    /// Such shapes can become explicit convex hulls in the physics engine.
    pub fn is_solid_profile(&self) -> bool {
        self.path_twist == 0
            && self.path_twist_begin == 0
            && self.profile_hollow == 0
            && self.profile_begin == 0
            && self.profile_end == 0
    }
}

// ---------------------------------------------------------------------------
// Extra params (framed TLV)
// ---------------------------------------------------------------------------

pub const MAX_EXTRA_PARAMS_LEN: usize = 4096;

/// The extra-parameters blob: a leading count byte, then per entry a 2-byte
/// LE type, 4-byte LE length and the payload. Kept in wire form because
/// that is how it persists and travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraParams(Vec<u8>);

impl Default for ExtraParams {
    fn default() -> Self {
        // the single count byte, zero entries
        Self(vec![0u8])
    }
}

impl ExtraParams {
    /// Adopt a raw blob; anything out of spec collapses to the empty blob.
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.is_empty() || data.len() > MAX_EXTRA_PARAMS_LEN {
            Self::default()
        } else {
            Self(data.to_vec())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn count(&self) -> usize {
        self.0[0] as usize
    }

    fn entries(&self) -> ExtraParamIter<'_> {
        ExtraParamIter {
            data: &self.0,
            remaining: self.0[0] as usize,
            offset: 1,
        }
    }

    pub fn get(&self, param_type: u16) -> Option<&[u8]> {
        self.entries()
            .find(|(ty, _)| *ty == param_type)
            .map(|(_, payload)| payload)
    }

    /// Insert or replace one entry. Fails (leaving the blob untouched) if
    /// the result would exceed 255 entries or `MAX_EXTRA_PARAMS_LEN` bytes.
    pub fn set(&mut self, param_type: u16, payload: &[u8]) -> bool {
        if payload.len() > MAX_EXTRA_PARAMS_LEN {
            return false;
        }
        let mut rebuilt = self.rebuild_without(param_type);
        rebuilt.1.extend_from_slice(&param_type.to_le_bytes());
        rebuilt
            .1
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        rebuilt.1.extend_from_slice(payload);
        if rebuilt.1.len() > MAX_EXTRA_PARAMS_LEN || rebuilt.0 == 255 {
            return false;
        }
        rebuilt.1[0] = rebuilt.0 + 1;
        self.0 = rebuilt.1;
        true
    }

    pub fn delete(&mut self, param_type: u16) {
        let (count, mut data) = self.rebuild_without(param_type);
        data[0] = count;
        self.0 = data;
    }

    /// Copy every entry except `param_type` into a fresh blob, returning the
    /// surviving entry count and buffer (count byte left unset).
    fn rebuild_without(&self, param_type: u16) -> (u8, Vec<u8>) {
        let mut out = vec![0u8];
        let mut count = 0u8;
        for (ty, payload) in self.entries() {
            if ty == param_type {
                continue;
            }
            out.extend_from_slice(&ty.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
            count += 1;
        }
        (count, out)
    }
}

struct ExtraParamIter<'a> {
    data: &'a [u8],
    remaining: usize,
    offset: usize,
}

impl<'a> Iterator for ExtraParamIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.data.len() - self.offset < 6 {
            return None;
        }
        let ty = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        let len = u32::from_le_bytes([
            self.data[self.offset + 2],
            self.data[self.offset + 3],
            self.data[self.offset + 4],
            self.data[self.offset + 5],
        ]) as usize;
        if len > self.data.len() - self.offset - 6 {
            // truncated entry: stop rather than read garbage
            self.remaining = 0;
            return None;
        }
        let payload = &self.data[self.offset + 6..self.offset + 6 + len];
        self.offset += 6 + len;
        self.remaining -= 1;
        Some((ty, payload))
    }
}

// ---------------------------------------------------------------------------
// Prim inventory container
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PrimInventory {
    pub items: Vec<InventoryItem>,
    /// Bumped on every inventory change; the viewer uses it for caching.
    pub serial: u32,
}

impl PrimInventory {
    pub fn find(&self, item_id: Uuid) -> Option<&InventoryItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn find_mut(&mut self, item_id: Uuid) -> Option<&mut InventoryItem> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }

    pub fn add(&mut self, item: InventoryItem) {
        self.items.push(item);
        self.serial = self.serial.wrapping_add(1);
    }

    pub fn remove(&mut self, item_id: Uuid) -> Option<InventoryItem> {
        let idx = self.items.iter().position(|i| i.item_id == item_id)?;
        self.serial = self.serial.wrapping_add(1);
        Some(self.items.remove(idx))
    }

    pub fn mark_updated(&mut self) {
        self.serial = self.serial.wrapping_add(1);
    }
}

// ---------------------------------------------------------------------------
// Prim
// ---------------------------------------------------------------------------

/// A geometric primitive. Positional state lives in the owning
/// [`super::WorldObject`]; this is everything else.
#[derive(Debug, Clone)]
pub struct Prim {
    pub name: String,
    pub description: String,
    pub shape: PrimShape,
    pub material: u8,
    pub tex_entry: Vec<u8>,
    pub extra_params: ExtraParams,
    pub hover_text: String,
    pub text_color: [u8; 4],
    pub creator: Uuid,
    pub owner: Uuid,
    /// Inventory item this prim was rezzed from, if any.
    pub inv_item_id: Uuid,
    pub perms: Perms,
    pub flags: PrimFlags,
    pub sale_type: u8,
    pub sale_price: i32,
    pub creation_date: i32,
    pub attach_point: u8,
    pub sit_target: Vec3,
    pub sit_rot: Quat,
    pub sit_name: String,
    pub touch_name: String,
    /// Ordered child prims (linkset), at most 255.
    pub children: Vec<Uuid>,
    /// Avatar sitting directly on this prim.
    pub seated_avatar: Option<Uuid>,
    /// Avatars parented to this prim (root prims only).
    pub sitting_avatars: Vec<Uuid>,
    pub inv: PrimInventory,
    pub crc_counter: u32,
}

impl Default for Prim {
    fn default() -> Self {
        Self {
            name: "Object".to_string(),
            description: String::new(),
            shape: PrimShape::default(),
            material: crate::types::MATERIAL_WOOD,
            tex_entry: Vec::new(),
            extra_params: ExtraParams::default(),
            hover_text: String::new(),
            text_color: [0; 4],
            creator: Uuid::nil(),
            owner: Uuid::nil(),
            inv_item_id: Uuid::nil(),
            perms: Perms::full(),
            flags: PrimFlags::empty(),
            sale_type: 0,
            sale_price: 0,
            creation_date: 0,
            attach_point: 0,
            sit_target: Vec3::ZERO,
            sit_rot: Quat::IDENTITY,
            sit_name: String::new(),
            touch_name: String::new(),
            children: Vec::new(),
            seated_avatar: None,
            sitting_avatars: Vec::new(),
            inv: PrimInventory::default(),
            crc_counter: 0,
        }
    }
}

impl Prim {
    pub fn has_sit_target(&self) -> bool {
        self.sit_target != Vec3::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_params_worked_example() {
        // {0x00} + light(16 bytes) -> 23-byte buffer with the documented frame
        let mut ep = ExtraParams::default();
        assert_eq!(ep.as_bytes(), &[0x00]);

        let payload = [0u8; 16];
        assert!(ep.set(EXTRA_PARAM_LIGHT, &payload));
        let bytes = ep.as_bytes();
        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[..7], &[0x01, 0x23, 0x00, 0x10, 0x00, 0x00, 0x00]);

        ep.delete(EXTRA_PARAM_LIGHT);
        assert_eq!(ep.as_bytes(), &[0x00]);
    }

    #[test]
    fn set_replaces_existing_entry() {
        let mut ep = ExtraParams::default();
        assert!(ep.set(EXTRA_PARAM_LIGHT, &[1, 2, 3]));
        assert!(ep.set(EXTRA_PARAM_LIGHT, &[9, 9]));
        assert_eq!(ep.count(), 1);
        assert_eq!(ep.get(EXTRA_PARAM_LIGHT), Some(&[9u8, 9][..]));
    }

    #[test]
    fn oversized_set_leaves_blob_untouched() {
        let mut ep = ExtraParams::default();
        assert!(ep.set(EXTRA_PARAM_FLEXI, &[7; 8]));
        let before = ep.as_bytes().to_vec();
        assert!(!ep.set(EXTRA_PARAM_LIGHT, &[0; MAX_EXTRA_PARAMS_LEN]));
        assert_eq!(ep.as_bytes(), &before[..]);
    }
}
