//! Inventory data model: items, folders, and the temporary folder-contents
//! descriptions built while serving fetch requests.

use uuid::Uuid;

use crate::assets::SimpleAsset;
use crate::scripting::ScriptHandle;
use crate::types::Perms;

/// Hard cap on entries in a single folder description. Anything bigger is
/// refused outright rather than truncated.
pub const MAX_INVENTORY_DESC: usize = 65535;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InventoryItem {
    pub name: String,
    pub description: String,
    pub item_id: Uuid,
    pub folder_id: Uuid,
    pub owner_id: Uuid,
    /// Creator in its textual form (federation backends send strings).
    pub creator_id: String,
    pub creator_as_uuid: Uuid,
    pub perms: Perms,
    pub inv_type: i8,
    pub asset_type: i8,
    pub sale_type: u8,
    pub group_owned: bool,
    pub asset_id: Uuid,
    pub group_id: Uuid,
    pub flags: u32,
    pub sale_price: i32,
    pub creation_date: i32,
    /// Embedded asset, for items whose payload never went through the asset
    /// service (freshly-saved prim-inventory scripts, mostly).
    pub embedded_asset: Option<SimpleAsset>,
    /// Live script state, for in-prim script items.
    pub script: Option<ScriptHandle>,
}

/// The additive checksum the viewer uses to validate cached items.
pub fn inventory_crc(item: &InventoryItem) -> u32 {
    fn uuid_sum(u: &Uuid) -> u32 {
        let b = u.as_bytes();
        let mut sum = 0u32;
        for chunk in b.chunks_exact(4) {
            sum = sum.wrapping_add(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        sum
    }

    let mut crc = 0u32;
    crc = crc.wrapping_add(item.creation_date as u32);
    crc = crc.wrapping_add(uuid_sum(&item.asset_id));
    crc = crc.wrapping_add(uuid_sum(&item.folder_id));
    crc = crc.wrapping_add(uuid_sum(&item.item_id));
    crc = crc.wrapping_add(uuid_sum(&item.creator_as_uuid));
    crc = crc.wrapping_add(uuid_sum(&item.owner_id));
    crc = crc.wrapping_add(uuid_sum(&item.group_id));
    crc = crc.wrapping_add(item.perms.base);
    crc = crc.wrapping_add(item.perms.current);
    crc = crc.wrapping_add(item.perms.group);
    crc = crc.wrapping_add(item.perms.everyone);
    crc = crc.wrapping_add(item.perms.next);
    crc = crc.wrapping_add(item.flags);
    crc = crc.wrapping_add(item.inv_type as u32);
    crc = crc.wrapping_add(item.asset_type as u32);
    crc = crc.wrapping_add(item.sale_price as u32);
    crc = crc.wrapping_add(item.sale_type as u32);
    crc
}

// ---------------------------------------------------------------------------
// Folder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InventoryFolder {
    pub name: String,
    pub folder_id: Uuid,
    pub owner_id: Uuid,
    pub parent_id: Uuid,
    /// Preferred asset type, or -1 for plain folders.
    pub asset_type: i8,
}

/// Contents of one folder, as retrieved on demand from the backend.
#[derive(Debug, Clone)]
pub struct InventoryContents {
    pub folder_id: Uuid,
    pub version: i32,
    pub descendents: i32,
    pub subfolders: Vec<InventoryFolder>,
    pub items: Vec<InventoryItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("folder description over {MAX_INVENTORY_DESC} entries")]
    TooManyEntries,
}

impl InventoryContents {
    pub fn new(folder_id: Uuid) -> Self {
        Self {
            folder_id,
            version: 1,
            descendents: 0,
            subfolders: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn add_folder(&mut self, folder: InventoryFolder) -> Result<(), InventoryError> {
        if self.subfolders.len() >= MAX_INVENTORY_DESC {
            return Err(InventoryError::TooManyEntries);
        }
        self.subfolders.push(folder);
        Ok(())
    }

    pub fn add_item(&mut self, item: InventoryItem) -> Result<(), InventoryError> {
        if self.items.len() >= MAX_INVENTORY_DESC {
            return Err(InventoryError::TooManyEntries);
        }
        self.items.push(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_is_stable_and_tracks_field_changes() {
        let mut item = InventoryItem {
            name: "thing".to_string(),
            item_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            creation_date: 1234,
            ..InventoryItem::default()
        };
        let a = inventory_crc(&item);
        assert_eq!(a, inventory_crc(&item));

        item.asset_id = Uuid::new_v4();
        assert_ne!(a, inventory_crc(&item));
    }
}
