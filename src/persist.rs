//! Persisted region state: a length-delimited stream of tagged records,
//! one file per region.
//!
//! Every multi-byte integer is big-endian; floats are written as the
//! big-endian form of their bit pattern. Prim records carry their inventory
//! items inline (each optionally with one nested asset record and a zero
//! terminator), then their child prims recursively. Writes go to
//! `simstate-<short>.dat.new` followed by an atomic rename.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use glam::{Quat, Vec3};
use log::{info, warn};
use uuid::Uuid;

use crate::assets::SimpleAsset;
use crate::inventory::InventoryItem;
use crate::types::{Perms, PrimFlags};
use crate::world::prim::{ExtraParams, Prim, PrimShape};
use crate::world::{ObjectBody, World, WorldObject};

pub const PRIM_MAGIC_V1: u32 = 0x7385ad01;
pub const PRIM_MAGIC_V2: u32 = 0x7385ad02;
pub const PRIM_MAGIC_V3: u32 = 0x7385ad03;
pub const INV_MAGIC_V1: u32 = 0x45892401;
pub const ASSET_MAGIC_V1: u32 = 0x2e3b6501;

/// Guard against absurd string/blob lengths in corrupt files.
const MAX_BLOB: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad record magic {0:#010x}")]
    BadMagic(u32),
    #[error("string field is not UTF-8")]
    BadString,
    #[error("blob length {0} over limit")]
    BlobTooLong(u32),
}

// ---------------------------------------------------------------------------
// Primitive slot codecs
// ---------------------------------------------------------------------------

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> Result<String, PersistError> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| PersistError::BadString)
}

fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, PersistError> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_BLOB {
        return Err(PersistError::BlobTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_vec3<W: Write>(w: &mut W, v: Vec3) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(v.x.to_bits())?;
    w.write_u32::<BigEndian>(v.y.to_bits())?;
    w.write_u32::<BigEndian>(v.z.to_bits())?;
    Ok(())
}

fn read_vec3<R: Read>(r: &mut R) -> Result<Vec3, PersistError> {
    Ok(Vec3::new(
        f32::from_bits(r.read_u32::<BigEndian>()?),
        f32::from_bits(r.read_u32::<BigEndian>()?),
        f32::from_bits(r.read_u32::<BigEndian>()?),
    ))
}

fn write_quat<W: Write>(w: &mut W, q: Quat) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(q.x.to_bits())?;
    w.write_u32::<BigEndian>(q.y.to_bits())?;
    w.write_u32::<BigEndian>(q.z.to_bits())?;
    w.write_u32::<BigEndian>(q.w.to_bits())?;
    Ok(())
}

fn read_quat<R: Read>(r: &mut R) -> Result<Quat, PersistError> {
    let x = f32::from_bits(r.read_u32::<BigEndian>()?);
    let y = f32::from_bits(r.read_u32::<BigEndian>()?);
    let z = f32::from_bits(r.read_u32::<BigEndian>()?);
    let w = f32::from_bits(r.read_u32::<BigEndian>()?);
    Ok(Quat::from_xyzw(x, y, z, w))
}

fn write_uuid<W: Write>(w: &mut W, u: Uuid) -> Result<(), PersistError> {
    w.write_all(u.as_bytes())?;
    Ok(())
}

fn read_uuid<R: Read>(r: &mut R) -> Result<Uuid, PersistError> {
    let mut buf = [0u8; 16];
    r.read_exact(&mut buf)?;
    Ok(Uuid::from_bytes(buf))
}

// ---------------------------------------------------------------------------
// Asset records
// ---------------------------------------------------------------------------

fn write_asset<W: Write>(w: &mut W, asset: &SimpleAsset) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(ASSET_MAGIC_V1)?;
    write_str(w, &asset.name)?;
    write_str(w, &asset.description)?;
    w.write_u8(asset.asset_type as u8)?;
    write_uuid(w, asset.id)?;
    write_bytes(w, &asset.data)?;
    Ok(())
}

fn read_asset<R: Read>(r: &mut R) -> Result<SimpleAsset, PersistError> {
    Ok(SimpleAsset {
        name: read_str(r)?,
        description: read_str(r)?,
        asset_type: r.read_u8()? as i8,
        id: read_uuid(r)?,
        data: read_bytes(r)?,
    })
}

// ---------------------------------------------------------------------------
// Inventory records
// ---------------------------------------------------------------------------

fn write_inventory_item<W: Write>(w: &mut W, item: &InventoryItem) -> Result<(), PersistError> {
    w.write_u32::<BigEndian>(INV_MAGIC_V1)?;
    write_str(w, &item.name)?;
    write_uuid(w, item.item_id)?;
    write_uuid(w, item.folder_id)?;
    write_uuid(w, item.owner_id)?;
    write_str(w, &item.creator_id)?;
    write_uuid(w, item.creator_as_uuid)?;
    write_str(w, &item.description)?;
    w.write_u32::<BigEndian>(item.perms.next)?;
    w.write_u32::<BigEndian>(item.perms.current)?;
    w.write_u32::<BigEndian>(item.perms.base)?;
    w.write_u32::<BigEndian>(item.perms.everyone)?;
    w.write_u32::<BigEndian>(item.perms.group)?;
    w.write_u8(item.inv_type as u8)?;
    w.write_u8(item.asset_type as u8)?;
    w.write_u8(item.sale_type)?;
    w.write_u8(item.group_owned as u8)?;
    write_uuid(w, item.asset_id)?;
    write_uuid(w, item.group_id)?;
    w.write_u32::<BigEndian>(item.flags)?;
    w.write_u32::<BigEndian>(item.sale_price as u32)?;
    w.write_u32::<BigEndian>(item.creation_date as u32)?;

    if let Some(asset) = &item.embedded_asset {
        write_asset(w, asset)?;
    }
    // terminating zero for this item's record chain
    w.write_u32::<BigEndian>(0)?;
    Ok(())
}

fn read_inventory_item<R: Read>(r: &mut R) -> Result<InventoryItem, PersistError> {
    let mut item = InventoryItem {
        name: read_str(r)?,
        item_id: read_uuid(r)?,
        folder_id: read_uuid(r)?,
        owner_id: read_uuid(r)?,
        creator_id: read_str(r)?,
        creator_as_uuid: read_uuid(r)?,
        description: read_str(r)?,
        ..InventoryItem::default()
    };
    item.perms.next = r.read_u32::<BigEndian>()?;
    item.perms.current = r.read_u32::<BigEndian>()?;
    item.perms.base = r.read_u32::<BigEndian>()?;
    item.perms.everyone = r.read_u32::<BigEndian>()?;
    item.perms.group = r.read_u32::<BigEndian>()?;
    item.inv_type = r.read_u8()? as i8;
    item.asset_type = r.read_u8()? as i8;
    item.sale_type = r.read_u8()?;
    item.group_owned = r.read_u8()? != 0;
    item.asset_id = read_uuid(r)?;
    item.group_id = read_uuid(r)?;
    item.flags = r.read_u32::<BigEndian>()?;
    item.sale_price = r.read_u32::<BigEndian>()? as i32;
    item.creation_date = r.read_u32::<BigEndian>()? as i32;

    // trailing records: at most one nested asset, then the terminator
    loop {
        match r.read_u32::<BigEndian>()? {
            0 => break,
            ASSET_MAGIC_V1 => item.embedded_asset = Some(read_asset(r)?),
            other => return Err(PersistError::BadMagic(other)),
        }
    }
    Ok(item)
}

// ---------------------------------------------------------------------------
// Prim records
// ---------------------------------------------------------------------------

fn write_prim<W: Write>(w: &mut W, world: &World, obj: &WorldObject) -> Result<(), PersistError> {
    let Some(prim) = obj.as_prim() else { return Ok(()) };

    w.write_u32::<BigEndian>(PRIM_MAGIC_V3)?;
    write_vec3(w, obj.local_pos)?;
    write_vec3(w, obj.scale)?;
    write_vec3(w, obj.velocity)?;
    write_quat(w, obj.rot)?;
    write_uuid(w, obj.id)?;
    w.write_u8(prim.sale_type)?;
    w.write_u8(prim.material)?;
    w.write_u8(prim.shape.path_curve)?;
    w.write_u8(prim.shape.profile_curve)?;
    w.write_u16::<BigEndian>(prim.shape.path_begin)?;
    w.write_u16::<BigEndian>(prim.shape.path_end)?;
    w.write_u8(prim.shape.path_scale_x)?;
    w.write_u8(prim.shape.path_scale_y)?;
    w.write_u8(prim.shape.path_shear_x as u8)?;
    w.write_u8(prim.shape.path_shear_y as u8)?;
    w.write_u8(prim.shape.path_twist as u8)?;
    w.write_u8(prim.shape.path_twist_begin as u8)?;
    w.write_u8(prim.shape.path_radius_offset as u8)?;
    w.write_u8(prim.shape.path_taper_x as u8)?;
    w.write_u8(prim.shape.path_taper_y as u8)?;
    w.write_u8(prim.shape.path_revolutions)?;
    w.write_u8(prim.shape.path_skew as u8)?;
    w.write_u16::<BigEndian>(prim.shape.profile_begin)?;
    w.write_u16::<BigEndian>(prim.shape.profile_end)?;
    w.write_u16::<BigEndian>(prim.shape.profile_hollow)?;
    write_uuid(w, prim.creator)?;
    write_uuid(w, prim.owner)?;
    w.write_u32::<BigEndian>(prim.perms.base)?;
    w.write_u32::<BigEndian>(prim.perms.current)?;
    w.write_u32::<BigEndian>(prim.perms.group)?;
    w.write_u32::<BigEndian>(prim.perms.everyone)?;
    w.write_u32::<BigEndian>(prim.perms.next)?;
    w.write_u32::<BigEndian>(prim.sale_price as u32)?;
    write_str(w, &prim.name)?;
    write_str(w, &prim.description)?;
    write_bytes(w, &prim.tex_entry)?;
    w.write_u32::<BigEndian>(prim.flags.bits())?;
    write_str(w, &prim.hover_text)?;
    for c in prim.text_color {
        w.write_u8(c)?;
    }
    w.write_u32::<BigEndian>(prim.inv.serial)?;
    w.write_u32::<BigEndian>(prim.inv.items.len() as u32)?;
    write_str(w, &prim.sit_name)?;
    write_str(w, &prim.touch_name)?;
    w.write_u32::<BigEndian>(prim.creation_date as u32)?;
    write_bytes(w, prim.extra_params.as_bytes())?;
    w.write_i32::<BigEndian>(prim.children.len() as i32)?;
    w.write_u32::<BigEndian>(0)?; // reserved flags word

    for item in &prim.inv.items {
        write_inventory_item(w, item)?;
    }
    for child_id in &prim.children {
        if let Some(child) = world.get(*child_id) {
            write_prim(w, world, child)?;
        }
    }
    Ok(())
}

/// Read one prim record (magic already consumed) and its nested inventory
/// and children. Objects come back parent-first, ready for insertion.
fn read_prim_body<R: Read>(
    r: &mut R,
    version: u32,
    out: &mut Vec<WorldObject>,
) -> Result<usize, PersistError> {
    let local_pos = read_vec3(r)?;
    let scale = read_vec3(r)?;
    let velocity = read_vec3(r)?;
    let rot = read_quat(r)?;
    let id = read_uuid(r)?;

    let mut prim = Prim {
        sale_type: r.read_u8()?,
        material: r.read_u8()?,
        ..Prim::default()
    };
    let mut shape = PrimShape {
        path_curve: r.read_u8()?,
        profile_curve: r.read_u8()?,
        ..PrimShape::default()
    };
    shape.path_begin = r.read_u16::<BigEndian>()?;
    shape.path_end = r.read_u16::<BigEndian>()?;
    shape.path_scale_x = r.read_u8()?;
    shape.path_scale_y = r.read_u8()?;
    shape.path_shear_x = r.read_u8()? as i8;
    shape.path_shear_y = r.read_u8()? as i8;
    shape.path_twist = r.read_u8()? as i8;
    shape.path_twist_begin = r.read_u8()? as i8;
    shape.path_radius_offset = r.read_u8()? as i8;
    shape.path_taper_x = r.read_u8()? as i8;
    shape.path_taper_y = r.read_u8()? as i8;
    shape.path_revolutions = r.read_u8()?;
    shape.path_skew = r.read_u8()? as i8;
    shape.profile_begin = r.read_u16::<BigEndian>()?;
    shape.profile_end = r.read_u16::<BigEndian>()?;
    shape.profile_hollow = r.read_u16::<BigEndian>()?;
    prim.shape = shape;
    prim.creator = read_uuid(r)?;
    prim.owner = read_uuid(r)?;
    prim.perms = Perms {
        base: r.read_u32::<BigEndian>()?,
        current: r.read_u32::<BigEndian>()?,
        group: r.read_u32::<BigEndian>()?,
        everyone: r.read_u32::<BigEndian>()?,
        next: r.read_u32::<BigEndian>()?,
    };
    prim.sale_price = r.read_u32::<BigEndian>()? as i32;
    prim.name = read_str(r)?;
    prim.description = read_str(r)?;
    prim.tex_entry = read_bytes(r)?;

    let mut num_items = 0u32;
    let mut num_children = 0i32;
    if version >= 2 {
        prim.flags = PrimFlags::from_bits_truncate(r.read_u32::<BigEndian>()?);
        prim.hover_text = read_str(r)?;
        for c in &mut prim.text_color {
            *c = r.read_u8()?;
        }
        prim.inv.serial = r.read_u32::<BigEndian>()?;
        num_items = r.read_u32::<BigEndian>()?;
    }
    if version >= 3 {
        prim.sit_name = read_str(r)?;
        prim.touch_name = read_str(r)?;
        prim.creation_date = r.read_u32::<BigEndian>()? as i32;
        prim.extra_params = ExtraParams::from_bytes(&read_bytes(r)?);
        num_children = r.read_i32::<BigEndian>()?;
        let _reserved = r.read_u32::<BigEndian>()?;
    }

    for _ in 0..num_items {
        match r.read_u32::<BigEndian>()? {
            INV_MAGIC_V1 => prim.inv.items.push(read_inventory_item(r)?),
            other => return Err(PersistError::BadMagic(other)),
        }
    }

    let my_index = out.len();
    let mut obj = WorldObject::new_prim(prim, local_pos);
    obj.id = id;
    obj.scale = scale;
    obj.velocity = velocity;
    obj.rot = rot;
    out.push(obj);

    for _ in 0..num_children {
        let magic = r.read_u32::<BigEndian>()?;
        let child_version = match magic {
            PRIM_MAGIC_V1 => 1,
            PRIM_MAGIC_V2 => 2,
            PRIM_MAGIC_V3 => 3,
            other => return Err(PersistError::BadMagic(other)),
        };
        let child_index = read_prim_body(r, child_version, out)?;
        let child_id = out[child_index].id;
        out[child_index].parent = Some(id);
        if let ObjectBody::Prim(p) = &mut out[my_index].body {
            p.children.push(child_id);
        }
    }
    Ok(my_index)
}

// ---------------------------------------------------------------------------
// Whole-region save/load
// ---------------------------------------------------------------------------

fn state_path(dir: &Path, shortname: &str) -> PathBuf {
    dir.join(format!("simstate-{}.dat", shortname))
}

/// Dump every root prim (and, recursively, its children) to the region
/// state file. The write lands in a `.new` file first, then renames over
/// the old state so a crash never leaves a torn file.
pub fn dump_world(world: &World, dir: &Path, shortname: &str) -> Result<(), PersistError> {
    let final_path = state_path(dir, shortname);
    let tmp_path = final_path.with_extension("dat.new");

    {
        let mut w = BufWriter::new(File::create(&tmp_path)?);
        let mut count = 0usize;
        for obj in world.iter() {
            if obj.is_prim() && obj.parent.is_none() {
                write_prim(&mut w, world, obj)?;
                count += 1;
            }
        }
        w.flush()?;
        info!("dumped {} root prims to {}", count, tmp_path.display());
    }

    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Load a region state file, inserting every prim into the world (parents
/// before children). A missing file is an empty region, not an error.
pub fn load_world(world: &mut World, dir: &Path, shortname: &str) -> Result<usize, PersistError> {
    let path = state_path(dir, shortname);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no saved state at {}", path.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    let mut r = BufReader::new(file);

    let mut objects = Vec::new();
    loop {
        let magic = match r.read_u32::<BigEndian>() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let version = match magic {
            PRIM_MAGIC_V1 => 1,
            PRIM_MAGIC_V2 => 2,
            PRIM_MAGIC_V3 => 3,
            other => {
                warn!("unknown record magic {:#010x}, stopping load", other);
                return Err(PersistError::BadMagic(other));
            }
        };
        read_prim_body(&mut r, version, &mut objects)?;
    }

    let count = objects.len();
    for obj in objects {
        world.insert(obj);
    }
    info!("loaded {} prims from {}", count, path.display());
    Ok(count)
}
