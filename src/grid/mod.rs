//! Grid federation glue: the pluggable backend contract.
//!
//! The core never talks to grid services directly; it calls a
//! [`GridBackend`], and every asynchronous completion re-enters the main
//! loop as a queued task against the region group. Backends classify their
//! failures so callers can tell a retryable network hiccup from a rejection.

pub mod intersim;
pub mod standalone;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assets::SimpleAsset;
use crate::inventory::{InventoryContents, InventoryItem};
use crate::region::RegionGroup;
use crate::types::{RegionHandle, Wearable, NUM_WEARABLES};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Network-level failure; worth retrying (with rediscovery).
    #[error("transient grid failure: {0}")]
    Transient(String),
    /// The request was understood and refused.
    #[error("grid request rejected: {0}")]
    Validation(String),
    #[error("grid authorization failure: {0}")]
    Authorization(String),
    #[error("not found")]
    NotFound,
}

pub type GridResult<T> = Result<T, GridError>;

/// Completion callback, run on the main thread against the whole group.
pub type Reply<T> = Box<dyn FnOnce(&mut RegionGroup, GridResult<T>) + Send>;

// ---------------------------------------------------------------------------
// Region map data
// ---------------------------------------------------------------------------

/// One region as the map/grid services describe it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapBlock {
    pub x: u32,
    pub y: u32,
    pub name: String,
    pub access: u8,
    pub water_height: u8,
    pub num_agents: u8,
    pub flags: u32,
    pub map_image: Uuid,
    // endpoint details, absent in pure map answers
    pub sim_ip: String,
    pub sim_port: u16,
    pub http_port: u16,
    pub region_id: Uuid,
}

impl MapBlock {
    pub fn handle(&self) -> RegionHandle {
        RegionHandle::from_grid(self.x, self.y)
    }
}

/// What a region registers about itself at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_id: Uuid,
    pub handle: RegionHandle,
    pub name: String,
    pub ip_addr: String,
    pub udp_port: u16,
    pub http_port: u16,
}

// ---------------------------------------------------------------------------
// Inter-region agent handoff DTOs
// ---------------------------------------------------------------------------

/// Body of `POST /agent/<uuid>`: create (or update) a child agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildAgentRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
    pub first_name: String,
    pub last_name: String,
    pub child_seed_cap: String,
    pub destination_pos: Vec3,
    pub start_pos: Vec3,
}

/// Body of `PUT /agent/<uuid>/<region_handle>`: upgrade to a full agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullAgentRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    pub throttles: Vec<u8>,
    pub texture_entry: Vec<u8>,
    pub visual_params: Vec<u8>,
    pub wearables: [Wearable; NUM_WEARABLES],
    pub always_run: bool,
    /// The origin URL the destination DELETEs once the avatar is released.
    pub callback_url: String,
}

// ---------------------------------------------------------------------------
// The backend contract
// ---------------------------------------------------------------------------

/// Everything the core asks of its grid. Synchronous-looking, asynchronous
/// underneath: each call may complete its reply immediately or after I/O,
/// but always through the group task queue, never reentrantly.
pub trait GridBackend {
    /// Announce a region to the grid at startup.
    fn register_region(&self, info: &RegionInfo);

    // presence
    fn user_entered(&self, region: RegionHandle, user_id: Uuid, session_id: Uuid);
    fn user_logoff(&self, user_id: Uuid, session_id: Uuid, pos: Vec3, look_at: Vec3);

    // assets
    fn fetch_asset(&self, id: Uuid, reply: Reply<SimpleAsset>);
    fn put_asset(&self, asset: SimpleAsset, reply: Reply<Uuid>);
    fn fetch_texture(&self, id: Uuid, reply: Reply<SimpleAsset>);

    // region map
    fn map_block_request(
        &self,
        min_x: u32,
        max_x: u32,
        min_y: u32,
        max_y: u32,
        reply: Reply<Vec<MapBlock>>,
    );
    fn region_by_name(&self, name: &str, reply: Reply<MapBlock>);
    fn region_by_handle(&self, handle: RegionHandle, reply: Reply<MapBlock>);

    // inventory
    fn fetch_inventory_folder(&self, owner: Uuid, folder: Uuid, reply: Reply<InventoryContents>);
    fn fetch_inventory_item(&self, owner: Uuid, item: Uuid, reply: Reply<InventoryItem>);
    fn add_inventory_item(&self, item: InventoryItem, reply: Reply<Uuid>);

    // identity
    fn uuid_to_name(&self, id: Uuid, reply: Reply<(String, String)>);

    // agent handoff (teleports and child agents)
    fn send_child_agent(&self, dest: &MapBlock, req: ChildAgentRequest, reply: Reply<()>);
    fn upgrade_agent(&self, dest: &MapBlock, handle: RegionHandle, req: FullAgentRequest, reply: Reply<()>);
    fn release_agent(&self, dest: &MapBlock, agent_id: Uuid, handle: RegionHandle, reply: Reply<()>);
}
