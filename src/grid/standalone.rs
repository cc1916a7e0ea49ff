//! Standalone grid backend: the whole grid in one process.
//!
//! Serves asset, inventory, map and presence requests from in-memory
//! tables, and loops agent handoffs straight back into the local group, so
//! a single process can run logins and inter-region teleports with no grid
//! services at all. Every completion still goes through the group task
//! queue, keeping the call-ordering identical to a networked backend.

use std::cell::RefCell;
use std::collections::HashMap;

use glam::Vec3;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{
    ChildAgentRequest, FullAgentRequest, GridBackend, GridError, GridResult, MapBlock, RegionInfo,
    Reply,
};
use crate::assets::SimpleAsset;
use crate::grid::intersim;
use crate::inventory::{InventoryContents, InventoryItem};
use crate::region::{RegionGroup, TaskQueue};
use crate::session::NewUserInfo;
use crate::types::RegionHandle;

#[derive(Default)]
struct StandaloneState {
    regions: HashMap<RegionHandle, MapBlock>,
    assets: HashMap<Uuid, SimpleAsset>,
    /// Flat per-owner item lists; folder structure is the owner's problem.
    inventory: HashMap<Uuid, Vec<InventoryItem>>,
    users: HashMap<Uuid, (String, String)>,
    presence: HashMap<Uuid, RegionHandle>,
}

pub struct StandaloneGrid {
    tasks: TaskQueue,
    state: RefCell<StandaloneState>,
}

/// What login hands back to the login front-end.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
    pub region_handle: RegionHandle,
    pub seed_cap: Option<String>,
}

impl StandaloneGrid {
    pub fn new(tasks: TaskQueue) -> Self {
        Self {
            tasks,
            state: RefCell::new(StandaloneState::default()),
        }
    }

    fn complete<T: Send + 'static>(&self, reply: Reply<T>, result: GridResult<T>) {
        self.tasks.post(Box::new(move |group| reply(group, result)));
    }

    /// Seed the asset table (library content, test fixtures).
    pub fn preload_asset(&self, asset: SimpleAsset) {
        self.state.borrow_mut().assets.insert(asset.id, asset);
    }

    /// The standalone side of `login_to_simulator`: invent the session
    /// identity, remember the user, and expect them into their region.
    pub fn login_to_simulator(
        &self,
        group: &mut RegionGroup,
        first: &str,
        last: &str,
        start_pos: Vec3,
    ) -> Option<LoginResult> {
        let handle = group.regions.first()?.handle;
        let user_id = Uuid::new_v4();
        let info = NewUserInfo {
            user_id,
            session_id: Uuid::new_v4(),
            secure_session_id: Uuid::new_v4(),
            circuit_code: rand::random(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            is_child: false,
            start_pos,
            start_look_at: Vec3::X,
            ..Default::default()
        };
        self.state
            .borrow_mut()
            .users
            .insert(user_id, (first.to_string(), last.to_string()));

        group.expect_user(handle, info.clone())?;
        let seed_cap = group
            .session_mut(user_id)
            .and_then(|(_, s)| s.seed_cap.clone());
        info!("standalone login for {} {} -> {}", first, last, handle);
        Some(LoginResult {
            user_id,
            session_id: info.session_id,
            secure_session_id: info.secure_session_id,
            circuit_code: info.circuit_code,
            region_handle: handle,
            seed_cap,
        })
    }
}

impl GridBackend for StandaloneGrid {
    fn register_region(&self, info: &RegionInfo) {
        let block = MapBlock {
            x: info.handle.grid_x(),
            y: info.handle.grid_y(),
            name: info.name.clone(),
            access: 0,
            water_height: 20,
            num_agents: 0,
            flags: 0,
            map_image: Uuid::nil(),
            sim_ip: info.ip_addr.clone(),
            sim_port: info.udp_port,
            http_port: info.http_port,
            region_id: info.region_id,
        };
        debug!("standalone grid registering {}", info.name);
        self.state.borrow_mut().regions.insert(info.handle, block);
    }

    fn user_entered(&self, region: RegionHandle, user_id: Uuid, _session_id: Uuid) {
        self.state.borrow_mut().presence.insert(user_id, region);
    }

    fn user_logoff(&self, user_id: Uuid, _session_id: Uuid, _pos: Vec3, _look_at: Vec3) {
        self.state.borrow_mut().presence.remove(&user_id);
    }

    fn fetch_asset(&self, id: Uuid, reply: Reply<SimpleAsset>) {
        let result = self
            .state
            .borrow()
            .assets
            .get(&id)
            .cloned()
            .ok_or(GridError::NotFound);
        self.complete(reply, result);
    }

    fn put_asset(&self, asset: SimpleAsset, reply: Reply<Uuid>) {
        let id = asset.id;
        self.state.borrow_mut().assets.insert(id, asset);
        self.complete(reply, Ok(id));
    }

    fn fetch_texture(&self, id: Uuid, reply: Reply<SimpleAsset>) {
        self.fetch_asset(id, reply);
    }

    fn map_block_request(
        &self,
        min_x: u32,
        max_x: u32,
        min_y: u32,
        max_y: u32,
        reply: Reply<Vec<MapBlock>>,
    ) {
        let blocks: Vec<MapBlock> = self
            .state
            .borrow()
            .regions
            .values()
            .filter(|b| b.x >= min_x && b.x <= max_x && b.y >= min_y && b.y <= max_y)
            .cloned()
            .collect();
        self.complete(reply, Ok(blocks));
    }

    fn region_by_name(&self, name: &str, reply: Reply<MapBlock>) {
        let result = self
            .state
            .borrow()
            .regions
            .values()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or(GridError::NotFound);
        self.complete(reply, result);
    }

    fn region_by_handle(&self, handle: RegionHandle, reply: Reply<MapBlock>) {
        let result = self
            .state
            .borrow()
            .regions
            .get(&handle)
            .cloned()
            .ok_or(GridError::NotFound);
        self.complete(reply, result);
    }

    fn fetch_inventory_folder(&self, owner: Uuid, folder: Uuid, reply: Reply<InventoryContents>) {
        let items: Vec<InventoryItem> = self
            .state
            .borrow()
            .inventory
            .get(&owner)
            .map(|v| v.iter().filter(|i| i.folder_id == folder).cloned().collect())
            .unwrap_or_default();
        let mut contents = InventoryContents::new(folder);
        for item in items {
            if contents.add_item(item).is_err() {
                warn!("folder {} over the size cap, refusing", folder);
                self.complete(
                    reply,
                    Err(GridError::Validation("folder too large".to_string())),
                );
                return;
            }
        }
        self.complete(reply, Ok(contents));
    }

    fn fetch_inventory_item(&self, owner: Uuid, item: Uuid, reply: Reply<InventoryItem>) {
        let result = self
            .state
            .borrow()
            .inventory
            .get(&owner)
            .and_then(|items| items.iter().find(|i| i.item_id == item))
            .cloned()
            .ok_or(GridError::NotFound);
        self.complete(reply, result);
    }

    fn add_inventory_item(&self, mut item: InventoryItem, reply: Reply<Uuid>) {
        if item.item_id.is_nil() {
            item.item_id = Uuid::new_v4();
        }
        let item_id = item.item_id;
        self.state
            .borrow_mut()
            .inventory
            .entry(item.owner_id)
            .or_default()
            .push(item);
        self.complete(reply, Ok(item_id));
    }

    fn uuid_to_name(&self, id: Uuid, reply: Reply<(String, String)>) {
        let result = self
            .state
            .borrow()
            .users
            .get(&id)
            .cloned()
            .ok_or(GridError::NotFound);
        self.complete(reply, result);
    }

    /// Loopback handoff: the "destination" is another region in this very
    /// process, so the child-agent POST becomes a direct call.
    fn send_child_agent(&self, dest: &MapBlock, req: ChildAgentRequest, reply: Reply<()>) {
        let handle = dest.handle();
        self.tasks.post(Box::new(move |group| {
            let ok = intersim::handle_agent_post(group, handle, &req);
            reply(
                group,
                if ok {
                    Ok(())
                } else {
                    Err(GridError::Validation("destination refused agent".to_string()))
                },
            );
        }));
    }

    fn upgrade_agent(
        &self,
        dest: &MapBlock,
        handle: RegionHandle,
        req: FullAgentRequest,
        reply: Reply<()>,
    ) {
        let _ = dest;
        self.tasks.post(Box::new(move |group| {
            let agent_id = req.agent_id;
            let ok = intersim::handle_agent_put(group, handle, &req);
            reply(
                group,
                if ok {
                    Ok(())
                } else {
                    Err(GridError::Validation("destination refused upgrade".to_string()))
                },
            );
            if ok {
                // the destination releases the origin as soon as it is ready
                intersim::handle_agent_release(group, agent_id, handle);
            }
        }));
    }

    fn release_agent(
        &self,
        _dest: &MapBlock,
        agent_id: Uuid,
        handle: RegionHandle,
        reply: Reply<()>,
    ) {
        self.tasks.post(Box::new(move |group| {
            intersim::handle_agent_release(group, agent_id, handle);
            reply(group, Ok(()));
        }));
    }
}
