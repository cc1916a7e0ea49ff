//! Process-wide asset and texture caches.
//!
//! The cache itself is a passive store; [`crate::region::RegionGroup`] wires
//! it to the grid backend and invokes waiters, so completion callbacks can
//! reach the whole group without re-borrowing the cache.

use std::collections::HashMap;

use log::{debug, warn};
use uuid::Uuid;

use crate::region::RegionGroup;

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

/// An asset as exchanged with the grid: metadata plus the raw payload.
#[derive(Debug, Clone, Default)]
pub struct SimpleAsset {
    pub name: String,
    pub description: String,
    pub asset_type: i8,
    pub id: Uuid,
    pub data: Vec<u8>,
}

pub type AssetWaiter = Box<dyn FnOnce(&mut RegionGroup, Option<&SimpleAsset>)>;

enum AssetState {
    /// Fetch in flight; callbacks queued for completion.
    Pending(Vec<AssetWaiter>),
    Ready(SimpleAsset),
    Missing,
}

#[derive(Default)]
pub struct AssetCache {
    assets: HashMap<Uuid, AssetState>,
}

/// What [`AssetCache::lookup`] tells the group to do next. Hit and miss
/// hand the waiter straight back for a synchronous invocation.
pub enum AssetLookup {
    /// Entry ready; run the waiter now.
    Ready(AssetWaiter),
    /// Known missing; run the waiter now with nothing.
    Missing(AssetWaiter),
    /// Waiter queued behind an in-flight fetch.
    Waiting,
    /// New Pending entry created; the group must start a grid fetch.
    FetchNeeded,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an asset.
    pub fn lookup(&mut self, id: Uuid, waiter: AssetWaiter) -> AssetLookup {
        match self.assets.get_mut(&id) {
            Some(AssetState::Ready(_)) => AssetLookup::Ready(waiter),
            Some(AssetState::Missing) => AssetLookup::Missing(waiter),
            Some(AssetState::Pending(waiters)) => {
                waiters.push(waiter);
                AssetLookup::Waiting
            }
            None => {
                self.assets.insert(id, AssetState::Pending(vec![waiter]));
                AssetLookup::FetchNeeded
            }
        }
    }

    pub fn peek(&self, id: Uuid) -> Option<&SimpleAsset> {
        match self.assets.get(&id) {
            Some(AssetState::Ready(asset)) => Some(asset),
            _ => None,
        }
    }

    /// Store a locally-produced asset directly (uploads, saved scripts).
    pub fn put_local(&mut self, asset: SimpleAsset) {
        self.assets.insert(asset.id, AssetState::Ready(asset));
    }

    /// Complete an in-flight fetch, returning the waiters to be invoked.
    pub fn complete(&mut self, id: Uuid, asset: Option<SimpleAsset>) -> Vec<AssetWaiter> {
        let prior = match asset {
            Some(asset) => self.assets.insert(id, AssetState::Ready(asset)),
            None => {
                debug!("asset {} reported missing by grid", id);
                self.assets.insert(id, AssetState::Missing)
            }
        };
        match prior {
            Some(AssetState::Pending(waiters)) => waiters,
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Textures
// ---------------------------------------------------------------------------

/// Decoded JPEG-2000 header facts. Extraction itself is external; the cache
/// only consumes the result through an injected hook.
#[derive(Debug, Clone)]
pub struct TextureMeta {
    pub width: u32,
    pub height: u32,
    /// Byte offset at which each discard level becomes reconstructable,
    /// coarsest last; entry 0 covers the full asset length.
    pub discard_levels: Vec<usize>,
}

pub type TextureMetadataFn = fn(&[u8]) -> Option<TextureMeta>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextureFlags: u32 {
        /// Uploaded locally; never goes back to the asset service.
        const LOCAL   = 0x1;
        const PENDING = 0x2;
        const MISSING = 0x4;
    }
}

#[derive(Debug)]
pub struct TextureDesc {
    pub asset_id: Uuid,
    pub flags: TextureFlags,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub discard_levels: Vec<usize>,
}

pub struct TextureCache {
    textures: HashMap<Uuid, TextureDesc>,
    metadata_fn: Option<TextureMetadataFn>,
}

impl TextureCache {
    pub fn new(metadata_fn: Option<TextureMetadataFn>) -> Self {
        Self {
            textures: HashMap::new(),
            metadata_fn,
        }
    }

    pub fn get(&self, asset_id: Uuid) -> Option<&TextureDesc> {
        self.textures.get(&asset_id)
    }

    /// Ensure a descriptor exists; returns true if a grid fetch is needed.
    pub fn request(&mut self, asset_id: Uuid) -> bool {
        if self.textures.contains_key(&asset_id) {
            return false;
        }
        self.textures.insert(
            asset_id,
            TextureDesc {
                asset_id,
                flags: TextureFlags::PENDING,
                data: Vec::new(),
                width: 0,
                height: 0,
                discard_levels: Vec::new(),
            },
        );
        true
    }

    /// Install texture bytes (local upload or completed grid fetch).
    pub fn add(&mut self, asset_id: Uuid, data: Vec<u8>, local: bool) {
        let meta = self.metadata_fn.and_then(|f| f(&data));
        let (width, height, discard_levels) = match meta {
            Some(m) => (m.width, m.height, m.discard_levels),
            None => {
                // metadata parse failed: single level covering everything
                warn!("texture {}: no codestream metadata, using whole-asset discard table", asset_id);
                (0, 0, vec![data.len()])
            }
        };
        let mut flags = TextureFlags::empty();
        if local {
            flags |= TextureFlags::LOCAL;
        }
        self.textures.insert(
            asset_id,
            TextureDesc {
                asset_id,
                flags,
                data,
                width,
                height,
                discard_levels,
            },
        );
    }

    pub fn mark_missing(&mut self, asset_id: Uuid) {
        if let Some(desc) = self.textures.get_mut(&asset_id) {
            desc.flags = TextureFlags::MISSING;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_discard_table_covers_whole_asset() {
        let mut cache = TextureCache::new(None);
        let id = Uuid::new_v4();
        cache.add(id, vec![0u8; 1000], false);
        let desc = cache.get(id).unwrap();
        assert_eq!(desc.discard_levels, vec![1000]);
    }

    #[test]
    fn metadata_hook_feeds_discard_table() {
        fn meta(_data: &[u8]) -> Option<TextureMeta> {
            Some(TextureMeta {
                width: 256,
                height: 128,
                discard_levels: vec![1000, 500, 120],
            })
        }
        let mut cache = TextureCache::new(Some(meta));
        let id = Uuid::new_v4();
        cache.add(id, vec![0u8; 1000], true);
        let desc = cache.get(id).unwrap();
        assert_eq!(desc.width, 256);
        assert_eq!(desc.discard_levels.len(), 3);
        assert!(desc.flags.contains(TextureFlags::LOCAL));
    }
}
