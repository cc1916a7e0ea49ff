//! Region and region-group contexts: the main-thread glue tying the world
//! model, user sessions, script host, physics bridge, capability router and
//! grid backend together.
//!
//! The main thread never blocks. UDP packets and HTTP callbacks arrive as
//! direct calls; worker threads and grid backends re-enter through the
//! group task queue; the periodic `tick`/`slow_tick` pumps drain everything
//! in between. Long-poll HTTP requests are represented by [`PollId`]s, and
//! any completion for a parked poll lands in the group outbox for the
//! transport to collect.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use glam::{Quat, Vec3};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::assets::{AssetCache, AssetLookup, SimpleAsset, TextureCache};
use crate::caps::{token_from_path, CapHandler, CapRouter, NAMED_CAPS};
use crate::config::RegionConfig;
use crate::evqueue::{PollAction, PollId, PollOutcome};
use crate::grid::{
    ChildAgentRequest, FullAgentRequest, GridBackend, GridError, MapBlock, RegionInfo,
};
use crate::inventory::InventoryItem;
use crate::llsd::Llsd;
use crate::persist::{self, PersistError};
use crate::physics::{CollisionPair, PhysicsBridge};
use crate::protocol::{
    AgentMovementComplete, AgentUpdate, ChatFromSimulator, ChatFromViewer, ClientHooks,
    CompleteAgentMovement, ControlFlags, KillObject, LogoutRequest, ObjectUpdate, RegionHandshake,
    TeleportFailed, TeleportFinish, TeleportProgress, UseCircuitCode,
};
use crate::scripting::{
    DetectedInfo, NativeCall, NativeRet, PrimParamRule, ScriptEvent, ScriptHandle, ScriptHost,
    ScriptHostEvent, VmFactory, COLLISION_CONT, COLLISION_END, COLLISION_START, EVMASK_COLLISION,
    EVMASK_COLLISION_CONT, EVMASK_LINK_MESSAGE, EVMASK_TOUCH, EVMASK_TOUCH_CONT, LINK_ALL_CHILDREN,
    LINK_ALL_OTHERS, LINK_SET, LINK_THIS,
};
use crate::session::{
    anims, AnimKind, AnimationDesc, NewUserInfo, SessionHandle, UserSession,
};
use crate::teleport::{Teleport, TeleportStage, TELEPORT_TO_LANDMARK, TELEPORT_TO_LOCATION};
use crate::terrain::Terrain;
use crate::types::{
    AgentFlags, ChatMessage, ChatSource, ChatType, ObjUpd, PrimFlags, RegionHandle, ThrottleId,
    ASSET_LSL_BYTECODE, ASSET_LSL_TEXT, DEBUG_CHANNEL, INV_TYPE_LSL, PERM_COPY, PERM_MODIFY,
    PERM_MOVE, PERM_TRANSFER,
};
use crate::world::{ChatTarget, Prim, PrimType, World, WorldEvent, WorldObject};

// ---------------------------------------------------------------------------
// Tasks and poll completions
// ---------------------------------------------------------------------------

/// Deferred work executed on the main thread against the whole group. Grid
/// backends and other asynchronous completions use this to re-enter.
pub type GroupTask = Box<dyn FnOnce(&mut RegionGroup) + Send>;

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<GroupTask>,
}

impl TaskQueue {
    pub fn post(&self, task: GroupTask) {
        let _ = self.tx.send(task);
    }
}

/// Response to a capability request. `Deferred` parks the request; its
/// completion arrives later through [`RegionGroup::take_poll_completions`].
#[derive(Debug)]
pub enum CapsResponse {
    Llsd(Llsd),
    Text(String),
    Status(u16),
    Deferred,
}

/// Request body as the external HTTP layer hands it over.
pub enum CapsBody<'a> {
    Llsd(&'a Llsd),
    Bytes(&'a [u8]),
    Empty,
}

// ---------------------------------------------------------------------------
// Region group
// ---------------------------------------------------------------------------

pub struct RegionGroup {
    pub config: RegionConfig,
    pub assets: AssetCache,
    pub textures: TextureCache,
    pub caps: CapRouter,
    pub release_notes: String,
    pub regions: Vec<Region>,
    backend: Option<Rc<dyn GridBackend>>,
    tasks: TaskQueue,
    tasks_rx: mpsc::Receiver<GroupTask>,
    poll_completions: Vec<(PollId, CapsResponse)>,
    started: Instant,
}

impl RegionGroup {
    pub fn new(config: RegionConfig) -> Self {
        let (tx, tasks_rx) = mpsc::channel();
        let release_notes = config
            .release_notes
            .clone()
            .unwrap_or_else(|| "Veldt region server".to_string());
        Self {
            config,
            assets: AssetCache::new(),
            textures: TextureCache::new(None),
            caps: CapRouter::new(),
            release_notes,
            regions: Vec::new(),
            backend: None,
            tasks: TaskQueue { tx },
            tasks_rx,
            poll_completions: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn task_queue(&self) -> TaskQueue {
        self.tasks.clone()
    }

    /// Seconds since group startup; the shared monotonic clock.
    pub fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn set_backend(&mut self, backend: Rc<dyn GridBackend>) {
        self.backend = Some(backend);
    }

    /// Panics when no backend has been wired; the process cannot run without one.
    pub fn backend(&self) -> Rc<dyn GridBackend> {
        Rc::clone(self.backend.as_ref().expect("grid backend not wired"))
    }

    /// Add a region and announce it to the grid.
    pub fn add_region(&mut self, region: Region) {
        let info = RegionInfo {
            region_id: region.region_id,
            handle: region.handle,
            name: region.name.clone(),
            ip_addr: self.config.region.ip_addr.clone(),
            udp_port: self.config.region.udp_port,
            http_port: self.config.region.http_port,
        };
        self.regions.push(region);
        self.backend().register_region(&info);
    }

    pub fn region_by_handle(&mut self, handle: RegionHandle) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.handle == handle)
    }

    fn region_index_for_agent(&self, agent_id: Uuid) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.sessions.contains_key(&agent_id))
    }

    /// Resolve a generational handle; stale generations observe nothing.
    pub fn resolve(&mut self, handle: SessionHandle) -> Option<(usize, &mut UserSession)> {
        let idx = self.region_index_for_agent(handle.agent_id)?;
        let session = self.regions[idx].sessions.get_mut(&handle.agent_id)?;
        if session.generation != handle.generation {
            return None;
        }
        Some((idx, session))
    }

    pub fn session_mut(&mut self, agent_id: Uuid) -> Option<(usize, &mut UserSession)> {
        let idx = self.region_index_for_agent(agent_id)?;
        Some((idx, self.regions[idx].sessions.get_mut(&agent_id)?))
    }

    /// The session driving an in-flight teleport. Distinct from
    /// [`Self::session_mut`] because during a handoff the same agent also
    /// has a child session on the destination region.
    fn teleporting_session_mut(&mut self, agent_id: Uuid) -> Option<&mut UserSession> {
        self.regions
            .iter_mut()
            .filter_map(|r| r.sessions.get_mut(&agent_id))
            .find(|s| s.teleport.is_some())
    }

    /// Completions for parked HTTP requests, drained by the transport.
    pub fn take_poll_completions(&mut self) -> Vec<(PollId, CapsResponse)> {
        std::mem::take(&mut self.poll_completions)
    }

    /// Complete a parked request from outside the tick pumps.
    pub fn complete_poll(&mut self, poll: PollId, response: CapsResponse) {
        self.poll_completions.push((poll, response));
    }

    pub fn run_tasks(&mut self) {
        loop {
            let task = match self.tasks_rx.try_recv() {
                Ok(task) => task,
                Err(_) => break,
            };
            task(self);
        }
    }

    fn cap_url(&self, token: &str) -> String {
        format!(
            "http://{}:{}/CAPS/{}/",
            self.config.region.ip_addr, self.config.region.http_port, token
        )
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    /// The fast pump, run at frame rate.
    pub fn tick(&mut self) {
        self.run_tasks();
        let now = self.now();
        let backend = self.backend();
        let tasks = self.tasks.clone();
        let Self {
            regions,
            caps,
            poll_completions,
            ..
        } = self;
        for region in regions.iter_mut() {
            region.tick(now, caps, &backend, &tasks, poll_completions);
        }
    }

    /// The slow pump (~1 Hz): liveness, slow removal, poll timeouts.
    pub fn slow_tick(&mut self) {
        self.run_tasks();
        let now = self.now();
        let backend = self.backend();
        let Self {
            regions,
            caps,
            poll_completions,
            ..
        } = self;
        for region in regions.iter_mut() {
            region.slow_tick(now, caps, &backend, poll_completions);
        }
    }

    // -----------------------------------------------------------------------
    // Assets through the cache
    // -----------------------------------------------------------------------

    /// Fetch an asset; `done` runs exactly once on the main thread.
    pub fn get_asset(
        &mut self,
        id: Uuid,
        done: Box<dyn FnOnce(&mut RegionGroup, Option<&SimpleAsset>)>,
    ) {
        match self.assets.lookup(id, done) {
            AssetLookup::Ready(waiter) => {
                let asset = self.assets.peek(id).cloned();
                waiter(self, asset.as_ref());
            }
            AssetLookup::Missing(waiter) => waiter(self, None),
            AssetLookup::Waiting => {}
            AssetLookup::FetchNeeded => {
                self.backend().fetch_asset(
                    id,
                    Box::new(move |group, result| {
                        let waiters = group.assets.complete(id, result.ok());
                        let asset = group.assets.peek(id).cloned();
                        for waiter in waiters {
                            waiter(group, asset.as_ref());
                        }
                    }),
                );
            }
        }
    }

    pub fn put_asset(&mut self, asset: SimpleAsset, done: crate::grid::Reply<Uuid>) {
        self.assets.put_local(asset.clone());
        self.backend().put_asset(asset, done);
    }

    // -----------------------------------------------------------------------
    // Session lifecycle (grid side)
    // -----------------------------------------------------------------------

    /// Grid "expect user": create the session in the given region, mint its
    /// seed capability and the named capability set.
    pub fn expect_user(&mut self, handle: RegionHandle, info: NewUserInfo) -> Option<SessionHandle> {
        let now = self.now();
        let region = self.regions.iter_mut().find(|r| r.handle == handle)?;
        if let Some(existing) = region.sessions.get_mut(&info.user_id) {
            // same agent announced again: update in place, never duplicate
            debug!("expect_user for existing agent {}", info.user_id);
            existing.circuit_code = info.circuit_code;
            existing.start_pos = info.start_pos;
            existing.start_look_at = info.start_look_at;
            existing.flags |= AgentFlags::INCOMING;
            return Some(existing.handle());
        }

        let generation = region.next_generation;
        region.next_generation += 1;
        let mut session = UserSession::new(&info, generation, now);
        let sh = session.handle();

        // seed + named caps
        let seed = self.caps.register(CapHandler::Seed(sh));
        session.seed_cap = Some(seed);
        for name in NAMED_CAPS {
            let handler = match name {
                "EventQueueGet" => CapHandler::EventQueueGet(sh),
                "ServerReleaseNotes" => CapHandler::ServerReleaseNotes,
                "UpdateScriptTask" => CapHandler::UpdateScriptTask(sh),
                "UpdateScriptAgent" => CapHandler::UpdateScriptAgent(sh),
                _ => CapHandler::NewFileAgentInventory(sh),
            };
            let token = self.caps.register(handler);
            session.named_caps.insert(name.to_string(), token);
        }

        info!(
            "expecting {} {} ({}) in {}",
            session.first_name, session.last_name, info.user_id, handle
        );
        let region = self.regions.iter_mut().find(|r| r.handle == handle)?;
        region.sessions.insert(info.user_id, session);
        Some(sh)
    }

    /// Close a session; `slowly` leaves a drain window (teleports).
    pub fn close_session(&mut self, agent_id: Uuid, slowly: bool) {
        if let Some((_, session)) = self.session_mut(agent_id) {
            session.begin_close(slowly);
        }
    }

    // -----------------------------------------------------------------------
    // Viewer messages (parsed by the external UDP codec)
    // -----------------------------------------------------------------------

    /// Bind a circuit to its session and attach the delivery hooks.
    /// Duplicate packets (same sequence number) are ignored.
    pub fn use_circuit_code(&mut self, msg: &UseCircuitCode, hooks: Box<dyn ClientHooks>) -> bool {
        let now = self.now();
        let water_height = self.config.region.water_height;
        let Some(idx) = self.region_index_for_agent(msg.agent_id) else {
            warn!("use-circuit-code for unknown agent {}", msg.agent_id);
            return false;
        };
        let region = &mut self.regions[idx];
        let (name, region_id) = (region.name.clone(), region.region_id);
        let Some(session) = region.sessions.get_mut(&msg.agent_id) else {
            return false;
        };
        if !session.check_session(msg.agent_id, msg.session_id)
            || session.circuit_code != msg.circuit_code
        {
            warn!("use-circuit-code credential mismatch for {}", msg.agent_id);
            return false;
        }
        if !session.note_circuit_seqno(msg.seqno) {
            debug!("duplicate use-circuit-code seqno {} ignored", msg.seqno);
            return true;
        }
        session.reset_timeout(now);
        let mut hooks = hooks;
        hooks.send_region_handshake(&RegionHandshake {
            region_name: name,
            region_id,
            region_flags: 0,
            sim_access: 0,
            water_height,
        });
        session.hooks = Some(hooks);
        true
    }

    /// Child → Full: allocate the avatar body and enter the world.
    pub fn complete_agent_movement(&mut self, msg: &CompleteAgentMovement) -> bool {
        let now = self.now();
        let backend = self.backend();
        let Some(idx) = self.region_index_for_agent(msg.agent_id) else {
            return false;
        };
        let region = &mut self.regions[idx];
        let region_handle = region.handle;
        let welcome = region.welcome_message.clone();
        let Some(session) = region.sessions.get_mut(&msg.agent_id) else {
            return false;
        };
        if !session.check_session(msg.agent_id, msg.session_id)
            || session.circuit_code != msg.circuit_code
        {
            warn!("complete-agent-movement credential mismatch for {}", msg.agent_id);
            return false;
        }
        if !session.begin_full_agent() {
            return false;
        }
        session.reset_timeout(now);

        if session.avatar.is_none() {
            let av = WorldObject::new_avatar(msg.agent_id, session.start_pos);
            let av_id = region.world.insert(av);
            region.world.add_listen(av_id, 0, ChatTarget::Session(msg.agent_id));
            region
                .world
                .add_listen(av_id, DEBUG_CHANNEL, ChatTarget::Session(msg.agent_id));
            let session = region.sessions.get_mut(&msg.agent_id).expect("present");
            session.avatar = Some(av_id);
            backend.user_entered(region_handle, msg.agent_id, msg.session_id);
        }

        let session = region.sessions.get_mut(&msg.agent_id).expect("present");
        let (start_pos, look_at) = (session.start_pos, session.start_look_at);
        if let Some(hooks) = session.hooks.as_mut() {
            hooks.movement_complete(&AgentMovementComplete {
                agent_id: msg.agent_id,
                session_id: msg.session_id,
                position: start_pos,
                look_at,
                region_handle,
                timestamp: now as u32,
            });
            if !welcome.is_empty() {
                hooks.chat(&ChatFromSimulator {
                    from_name: "Region".to_string(),
                    source_id: Uuid::nil(),
                    owner_id: Uuid::nil(),
                    source_type: ChatSource::System,
                    chat_type: ChatType::Normal,
                    audible: 1,
                    position: start_pos,
                    message: welcome,
                });
            }
        }
        true
    }

    /// Per-frame avatar control input: locomotion and animation state.
    pub fn agent_update(&mut self, msg: &AgentUpdate) {
        let now = self.now();
        let Some(idx) = self.region_index_for_agent(msg.agent_id) else { return };
        let region = &mut self.regions[idx];
        let Some(session) = region.sessions.get_mut(&msg.agent_id) else { return };
        if session.session_id != msg.session_id {
            return;
        }
        session.reset_timeout(now);
        session.draw_dist = msg.far;
        let Some(av_id) = session.avatar else { return };

        let flying = msg.control_flags.contains(ControlFlags::FLY);
        let run_scale = if session.flags.contains(AgentFlags::ALWAYS_RUN) {
            2.0
        } else {
            1.0
        };
        let mut dir = Vec3::ZERO;
        if msg.control_flags.contains(ControlFlags::AT_POS) {
            dir += Vec3::X;
        }
        if msg.control_flags.contains(ControlFlags::AT_NEG) {
            dir -= Vec3::X;
        }
        if msg.control_flags.contains(ControlFlags::LEFT_POS) {
            dir += Vec3::Y;
        }
        if msg.control_flags.contains(ControlFlags::LEFT_NEG) {
            dir -= Vec3::Y;
        }
        if msg.control_flags.contains(ControlFlags::UP_POS) {
            dir += Vec3::Z;
        }
        if msg.control_flags.contains(ControlFlags::UP_NEG) {
            dir -= Vec3::Z;
        }
        let speed = if flying { 8.0 } else { 3.0 * run_scale };
        let target = msg.body_rotation * (dir * speed);

        let (av_local, grounded) = {
            let Some(av) = region.world.get_mut(av_id) else { return };
            av.rot = msg.body_rotation;
            (av.local_id, region.physics.grounded_ticks(av.local_id) > 0)
        };
        region.physics.set_avatar_flying(av_local, flying);
        region.physics.set_target_velocity(av_local, target);

        // default animation follows movement state
        let anim = if flying {
            if dir == Vec3::ZERO {
                anims::HOVER
            } else {
                anims::FLY
            }
        } else if dir == Vec3::ZERO || !grounded {
            anims::STAND
        } else {
            anims::WALK
        };
        let session = region.sessions.get_mut(&msg.agent_id).expect("present");
        if session.default_anim.anim != anim {
            let seq = session.next_anim_seq();
            session.default_anim = AnimationDesc {
                anim,
                obj: Uuid::nil(),
                sequence: seq,
                kind: AnimKind::Default,
            };
            session.flags |= AgentFlags::ANIM_UPDATE;
        }
    }

    pub fn chat_from_viewer(&mut self, msg: &ChatFromViewer) {
        let Some(idx) = self.region_index_for_agent(msg.agent_id) else { return };
        let region = &mut self.regions[idx];
        let Some(session) = region.sessions.get(&msg.agent_id) else { return };
        if session.session_id != msg.session_id {
            return;
        }
        let Some(av_id) = session.avatar else { return };
        let Some(av) = region.world.get(av_id) else { return };
        let name = session.name();
        if !matches!(
            msg.chat_type,
            ChatType::Whisper | ChatType::Normal | ChatType::Shout
        ) {
            return;
        }
        let chat = ChatMessage {
            channel: msg.channel,
            pos: av.world_pos,
            source: msg.agent_id,
            owner: msg.agent_id,
            source_type: ChatSource::Avatar,
            chat_type: msg.chat_type,
            name,
            msg: msg.message.clone(),
        };
        region.deliver_chat(&chat);
    }

    pub fn agent_throttle(&mut self, agent_id: Uuid, session_id: Uuid, block: &[u8]) {
        let now = self.now();
        if let Some((_, session)) = self.session_mut(agent_id) {
            if session.session_id == session_id {
                session.set_throttles_block(block, now);
            }
        }
    }

    pub fn logout_request(&mut self, msg: &LogoutRequest) {
        if let Some((_, session)) = self.session_mut(msg.agent_id) {
            if session.session_id != msg.session_id {
                return;
            }
            session.flags |= AgentFlags::IN_LOGOUT;
            if let Some(hooks) = session.hooks.as_mut() {
                hooks.logout_reply();
            }
            session.begin_close(false);
        }
    }

    // -----------------------------------------------------------------------
    // Capability surface
    // -----------------------------------------------------------------------

    /// Dispatch `/CAPS/<token>/...`; unknown tokens 404.
    pub fn handle_caps_path(
        &mut self,
        path: &str,
        method: &str,
        body: CapsBody<'_>,
        poll: PollId,
    ) -> CapsResponse {
        match token_from_path(path) {
            Some(token) => self.handle_caps_request(&token.to_string(), method, body, poll),
            None => CapsResponse::Status(404),
        }
    }

    pub fn handle_caps_request(
        &mut self,
        token: &str,
        method: &str,
        body: CapsBody<'_>,
        poll: PollId,
    ) -> CapsResponse {
        let Some(handler) = self.caps.take_for_dispatch(token) else {
            return CapsResponse::Status(404);
        };
        match handler {
            CapHandler::ServerReleaseNotes => CapsResponse::Text(self.release_notes.clone()),
            CapHandler::Seed(session) => self.handle_seed_request(session, body),
            CapHandler::EventQueueGet(session) => {
                if method != "POST" {
                    return CapsResponse::Status(501);
                }
                self.handle_event_queue_get(session, body, poll)
            }
            CapHandler::UpdateScriptTask(session) => self.begin_script_task_update(session, body),
            CapHandler::ScriptTaskUploader {
                session,
                task_id,
                item_id,
                script_running,
            } => self.finish_script_task_update(session, task_id, item_id, script_running, body, poll),
            CapHandler::UpdateScriptAgent(session) => self.begin_agent_script_update(session, body),
            CapHandler::AgentScriptUploader { session, item_id } => {
                self.finish_agent_script_update(session, item_id, body)
            }
            CapHandler::NewFileAgentInventory(session) => {
                self.begin_file_upload(session, body)
            }
            CapHandler::FileUploader {
                session,
                folder_id,
                asset_type,
                inv_type,
                name,
                description,
            } => self.finish_file_upload(
                session,
                folder_id,
                asset_type,
                inv_type,
                name,
                description,
                body,
                poll,
            ),
        }
    }

    fn handle_seed_request(&mut self, session: SessionHandle, body: CapsBody<'_>) -> CapsResponse {
        let CapsBody::Llsd(Llsd::Array(wanted)) = body else {
            return CapsResponse::Status(400);
        };
        let wanted: Vec<String> = wanted
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let Some((_, sess)) = self.resolve(session) else {
            return CapsResponse::Status(404);
        };
        let named: Vec<(String, String)> = wanted
            .iter()
            .filter_map(|name| sess.named_caps.get(name).map(|t| (name.clone(), t.clone())))
            .collect();
        let mut resp = Llsd::map();
        for (name, token) in named {
            let url = self.cap_url(&token);
            resp.insert(&name, Llsd::Uri(url));
        }
        CapsResponse::Llsd(resp)
    }

    fn handle_event_queue_get(
        &mut self,
        session: SessionHandle,
        body: CapsBody<'_>,
        poll: PollId,
    ) -> CapsResponse {
        let now = self.now();
        let ack = match body {
            CapsBody::Llsd(llsd) => match llsd.get("ack") {
                Some(Llsd::Int(i)) => Some(*i),
                Some(Llsd::Undef) | None => None,
                Some(_) => return CapsResponse::Status(400),
            },
            _ => return CapsResponse::Status(400),
        };
        let Some((_, sess)) = self.resolve(session) else {
            return CapsResponse::Status(404);
        };
        let PollAction { outcome, cancel } = sess.evqueue.poll_request(ack, poll, now);
        if let Some(old) = cancel {
            self.poll_completions.push((old, CapsResponse::Status(502)));
        }
        match outcome {
            PollOutcome::Respond(llsd) | PollOutcome::Resend(llsd) => CapsResponse::Llsd(llsd),
            PollOutcome::Deferred => CapsResponse::Deferred,
            PollOutcome::BadRequest => CapsResponse::Status(400),
        }
    }

    /// Stage one of UpdateScriptTask: reply with a one-shot uploader URL.
    fn begin_script_task_update(
        &mut self,
        session: SessionHandle,
        body: CapsBody<'_>,
    ) -> CapsResponse {
        let CapsBody::Llsd(llsd) = body else {
            return CapsResponse::Status(400);
        };
        let (Some(item_id), Some(task_id)) = (
            llsd.get("item_id").and_then(|v| v.as_uuid()),
            llsd.get("task_id").and_then(|v| v.as_uuid()),
        ) else {
            return CapsResponse::Status(400);
        };
        let script_running = llsd
            .get("is_script_running")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        // permission gate before handing out an uploader
        let agent = session.agent_id;
        let Some((idx, _)) = self.resolve(session) else {
            return CapsResponse::Status(404);
        };
        let region = &self.regions[idx];
        let Some(prim) = region.world.get(task_id).and_then(|o| o.as_prim()) else {
            return CapsResponse::Status(404);
        };
        if user_prim_perms(agent, prim) & PERM_MODIFY == 0 {
            warn!("UpdateScriptTask without modify permission on {}", task_id);
            return CapsResponse::Status(403);
        }

        let token = self.caps.register(CapHandler::ScriptTaskUploader {
            session,
            task_id,
            item_id,
            script_running,
        });
        let mut resp = Llsd::map();
        resp.insert("state", Llsd::String("upload".to_string()));
        resp.insert("uploader", Llsd::Uri(self.cap_url(&token)));
        CapsResponse::Llsd(resp)
    }

    /// Stage two: the raw script source arrives; compile and reply with the
    /// result once the script host reports in.
    #[allow(clippy::too_many_arguments)]
    fn finish_script_task_update(
        &mut self,
        session: SessionHandle,
        task_id: Uuid,
        item_id: Uuid,
        script_running: bool,
        body: CapsBody<'_>,
        poll: PollId,
    ) -> CapsResponse {
        let CapsBody::Bytes(script_text) = body else {
            return CapsResponse::Status(400);
        };
        let script_text = script_text.to_vec();
        let Some((idx, _)) = self.resolve(session) else {
            return CapsResponse::Status(404);
        };
        let region = &mut self.regions[idx];

        let asset = SimpleAsset {
            name: "Updated script".to_string(),
            description: String::new(),
            asset_type: ASSET_LSL_TEXT,
            id: Uuid::new_v4(),
            data: script_text.clone(),
        };
        let asset_id = asset.id;

        // swap the item's asset and restart its script
        let Some(old_script) = region.update_script_item(task_id, item_id, asset) else {
            return CapsResponse::Status(404);
        };
        if let Some(old) = old_script {
            region.scripts.kill_script(old);
        }
        if script_running {
            let handle = region.scripts.add_script(task_id, item_id, script_text);
            if let Some(item) = region
                .world
                .get_mut(task_id)
                .and_then(|o| o.as_prim_mut())
                .and_then(|p| p.inv.find_mut(item_id))
            {
                item.script = Some(handle);
            }
            region.pending_compiles.insert(handle, (poll, asset_id));
            CapsResponse::Deferred
        } else {
            let mut resp = Llsd::map();
            resp.insert("state", Llsd::String("complete".to_string()));
            resp.insert("new_asset", Llsd::Uuid(asset_id));
            resp.insert("compiled", Llsd::Bool(true));
            resp.insert("errors", Llsd::array());
            CapsResponse::Llsd(resp)
        }
    }

    fn begin_agent_script_update(
        &mut self,
        session: SessionHandle,
        body: CapsBody<'_>,
    ) -> CapsResponse {
        let CapsBody::Llsd(llsd) = body else {
            return CapsResponse::Status(400);
        };
        let Some(item_id) = llsd.get("item_id").and_then(|v| v.as_uuid()) else {
            return CapsResponse::Status(400);
        };
        let token = self
            .caps
            .register(CapHandler::AgentScriptUploader { session, item_id });
        let mut resp = Llsd::map();
        resp.insert("state", Llsd::String("upload".to_string()));
        resp.insert("uploader", Llsd::Uri(self.cap_url(&token)));
        CapsResponse::Llsd(resp)
    }

    fn finish_agent_script_update(
        &mut self,
        session: SessionHandle,
        _item_id: Uuid,
        body: CapsBody<'_>,
    ) -> CapsResponse {
        let CapsBody::Bytes(script_text) = body else {
            return CapsResponse::Status(400);
        };
        if self.resolve(session).is_none() {
            return CapsResponse::Status(404);
        }
        // user-inventory scripts never execute here; store the asset and
        // report success, leaving syntax checking to the region that rezzes
        let asset = SimpleAsset {
            name: "Updated agent script".to_string(),
            description: String::new(),
            asset_type: ASSET_LSL_TEXT,
            id: Uuid::new_v4(),
            data: script_text.to_vec(),
        };
        let asset_id = asset.id;
        self.put_asset(asset, Box::new(|_, _| {}));
        let mut resp = Llsd::map();
        resp.insert("state", Llsd::String("complete".to_string()));
        resp.insert("new_asset", Llsd::Uuid(asset_id));
        resp.insert("compiled", Llsd::Bool(true));
        resp.insert("errors", Llsd::array());
        CapsResponse::Llsd(resp)
    }

    fn begin_file_upload(&mut self, session: SessionHandle, body: CapsBody<'_>) -> CapsResponse {
        let CapsBody::Llsd(llsd) = body else {
            return CapsResponse::Status(400);
        };
        let folder_id = llsd.get("folder_id").and_then(|v| v.as_uuid()).unwrap_or_default();
        let name = llsd.get("name").and_then(|v| v.as_str()).unwrap_or("New upload");
        let description = llsd.get("description").and_then(|v| v.as_str()).unwrap_or("");
        let asset_type = asset_type_from_name(
            llsd.get("asset_type").and_then(|v| v.as_str()).unwrap_or("texture"),
        );
        let inv_type = inv_type_from_name(
            llsd.get("inventory_type").and_then(|v| v.as_str()).unwrap_or("texture"),
        );
        let token = self.caps.register(CapHandler::FileUploader {
            session,
            folder_id,
            asset_type,
            inv_type,
            name: name.to_string(),
            description: description.to_string(),
        });
        let mut resp = Llsd::map();
        resp.insert("state", Llsd::String("upload".to_string()));
        resp.insert("uploader", Llsd::Uri(self.cap_url(&token)));
        CapsResponse::Llsd(resp)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_file_upload(
        &mut self,
        session: SessionHandle,
        folder_id: Uuid,
        asset_type: i8,
        inv_type: i8,
        name: String,
        description: String,
        body: CapsBody<'_>,
        poll: PollId,
    ) -> CapsResponse {
        let CapsBody::Bytes(data) = body else {
            return CapsResponse::Status(400);
        };
        let Some((_, sess)) = self.resolve(session) else {
            return CapsResponse::Status(404);
        };
        let owner_id = sess.user_id;

        let asset = SimpleAsset {
            name: name.clone(),
            description: description.clone(),
            asset_type,
            id: Uuid::new_v4(),
            data: data.to_vec(),
        };
        if asset_type == crate::types::ASSET_TEXTURE {
            self.textures.add(asset.id, asset.data.clone(), false);
        }

        // the grid may reassign the asset id; only then do we create the item
        self.put_asset(
            asset,
            Box::new(move |group, result| {
                let final_id = match result {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("file upload asset store failed: {}", e);
                        group
                            .poll_completions
                            .push((poll, CapsResponse::Status(500)));
                        return;
                    }
                };
                let item = InventoryItem {
                    name,
                    description,
                    item_id: Uuid::new_v4(),
                    folder_id,
                    owner_id,
                    asset_id: final_id,
                    asset_type,
                    inv_type,
                    creation_date: 0,
                    ..InventoryItem::default()
                };
                group.backend().add_inventory_item(
                    item,
                    Box::new(move |group, result| {
                        let resp = match result {
                            Ok(item_id) => {
                                let mut resp = Llsd::map();
                                resp.insert("state", Llsd::String("complete".to_string()));
                                resp.insert("new_asset", Llsd::Uuid(final_id));
                                resp.insert("new_inventory_item", Llsd::Uuid(item_id));
                                CapsResponse::Llsd(resp)
                            }
                            Err(e) => {
                                warn!("file upload item creation failed: {}", e);
                                CapsResponse::Status(500)
                            }
                        };
                        group.poll_completions.push((poll, resp));
                    }),
                );
            }),
        );
        CapsResponse::Deferred
    }

    // -----------------------------------------------------------------------
    // Teleports
    // -----------------------------------------------------------------------

    pub fn teleport_to_location(
        &mut self,
        agent_id: Uuid,
        handle: RegionHandle,
        pos: Vec3,
        look_at: Vec3,
    ) {
        self.teleport_begin(agent_id, Teleport::new(handle, pos, look_at, TELEPORT_TO_LOCATION));
    }

    pub fn teleport_by_region_name(&mut self, agent_id: Uuid, name: &str, pos: Vec3, look_at: Vec3) {
        let name = name.to_string();
        let backend = self.backend();
        if self.session_mut(agent_id).is_none() {
            return;
        }
        backend.region_by_name(
            &name,
            Box::new(move |group, result| match result {
                Ok(block) => {
                    group.teleport_to_location(agent_id, block.handle(), pos, look_at)
                }
                Err(_) => {
                    // no descriptor exists yet; report directly
                    if let Some((_, session)) = group.session_mut(agent_id) {
                        if let Some(hooks) = session.hooks.as_mut() {
                            hooks.teleport_failed(&TeleportFailed {
                                reason: "no such region".to_string(),
                            });
                        }
                    }
                }
            }),
        );
    }

    /// Teleport to a landmark asset: fetch it, parse the destination.
    pub fn teleport_to_landmark(&mut self, agent_id: Uuid, landmark: Uuid) {
        self.get_asset(
            landmark,
            Box::new(move |group, asset| {
                let dest = asset.and_then(|a| parse_landmark(&a.data));
                match dest {
                    Some((handle, pos)) => {
                        let tp = Teleport::new(handle, pos, Vec3::X, TELEPORT_TO_LANDMARK);
                        group.teleport_begin(agent_id, tp);
                    }
                    None => {
                        if let Some((_, session)) = group.session_mut(agent_id) {
                            if let Some(hooks) = session.hooks.as_mut() {
                                hooks.teleport_failed(&TeleportFailed {
                                    reason: "invalid landmark".to_string(),
                                });
                            }
                        }
                    }
                }
            }),
        );
    }

    fn teleport_begin(&mut self, agent_id: Uuid, tp: Teleport) {
        let handle = tp.region_handle;
        {
            let Some((_, session)) = self.session_mut(agent_id) else { return };
            if session.teleport.is_some() {
                // one at a time; a second request is rejected outright
                if let Some(hooks) = session.hooks.as_mut() {
                    hooks.teleport_failed(&TeleportFailed {
                        reason: "a teleport is already in progress".to_string(),
                    });
                }
                return;
            }
            session.teleport = Some(tp);
        }
        self.teleport_progress_msg(agent_id, "resolving");
        self.teleport_resolve(agent_id, handle);
    }

    fn teleport_resolve(&mut self, agent_id: Uuid, handle: RegionHandle) {
        self.backend().region_by_handle(
            handle,
            Box::new(move |group, result| group.teleport_dest_resolved(agent_id, result)),
        );
    }

    fn teleport_dest_resolved(&mut self, agent_id: Uuid, result: Result<MapBlock, GridError>) {
        if self.teleport_check_cancelled(agent_id) {
            return;
        }
        let block = match result {
            Ok(block) => block,
            Err(GridError::Transient(e)) => {
                let retry = {
                    let Some(session) = self.teleporting_session_mut(agent_id) else { return };
                    session
                        .teleport
                        .as_mut()
                        .map(|tp| (tp.can_retry(), tp.region_handle))
                };
                match retry {
                    Some((true, handle)) => {
                        debug!("teleport resolve retry after transient failure: {}", e);
                        self.teleport_resolve(agent_id, handle);
                    }
                    _ => self.teleport_failed(agent_id, "destination unreachable"),
                }
                return;
            }
            Err(_) => {
                self.teleport_failed(agent_id, "no such region");
                return;
            }
        };

        // destination endpoint resolved
        let req = {
            let Some(session) = self.teleporting_session_mut(agent_id) else { return };
            let Some(tp) = session.teleport.as_mut() else { return };
            tp.stage = TeleportStage::SendingDest;
            tp.sim_ip = Some(ipv4_to_u32(&block.sim_ip));
            tp.sim_port = Some(block.sim_port);
            let dest_pos = tp.pos;
            ChildAgentRequest {
                agent_id,
                session_id: session.session_id,
                secure_session_id: session.secure_session_id,
                circuit_code: session.circuit_code,
                first_name: session.first_name.clone(),
                last_name: session.last_name.clone(),
                child_seed_cap: Uuid::new_v4().simple().to_string(),
                destination_pos: dest_pos,
                start_pos: session.start_pos,
            }
        };
        self.teleport_progress_msg(agent_id, "sending_dest");

        let dest = block.clone();
        self.backend().send_child_agent(
            &block,
            req,
            Box::new(move |group, result| group.teleport_child_created(agent_id, dest, result)),
        );
    }

    fn teleport_child_created(
        &mut self,
        agent_id: Uuid,
        dest: MapBlock,
        result: Result<(), GridError>,
    ) {
        if self.teleport_check_cancelled(agent_id) {
            // a child agent may exist on the destination; tell it to go away
            let handle = dest.handle();
            self.backend()
                .release_agent(&dest, agent_id, handle, Box::new(|_, _| {}));
            return;
        }
        if let Err(e) = result {
            warn!("child agent creation failed: {}", e);
            self.teleport_failed(agent_id, "destination refused the agent");
            return;
        }

        let req = {
            let Some(session) = self.teleporting_session_mut(agent_id) else { return };
            let Some(tp) = session.teleport.as_mut() else { return };
            tp.stage = TeleportStage::CreatingChild;
            FullAgentRequest {
                agent_id,
                session_id: session.session_id,
                position: tp.pos,
                look_at: tp.look_at,
                throttles: session.throttles_block(),
                texture_entry: session.texture_entry.clone(),
                visual_params: session.visual_params.clone(),
                wearables: session.wearables,
                always_run: session.flags.contains(AgentFlags::ALWAYS_RUN),
                callback_url: format!("/agent/{}/{}/release", agent_id, dest.handle().0),
            }
        };

        let handle = dest.handle();
        let dest_for_callback = dest.clone();
        self.backend().upgrade_agent(
            &dest,
            handle,
            req,
            Box::new(move |group, result| {
                group.teleport_upgraded(agent_id, dest_for_callback, result)
            }),
        );
    }

    fn teleport_upgraded(
        &mut self,
        agent_id: Uuid,
        dest: MapBlock,
        result: Result<(), GridError>,
    ) {
        if self.teleport_check_cancelled(agent_id) {
            let handle = dest.handle();
            self.backend()
                .release_agent(&dest, agent_id, handle, Box::new(|_, _| {}));
            return;
        }
        if let Err(e) = result {
            warn!("agent upgrade failed: {}", e);
            self.teleport_failed(agent_id, "destination failed to accept the agent");
            return;
        }
        if let Some(session) = self.teleporting_session_mut(agent_id) {
            if let Some(tp) = session.teleport.as_mut() {
                tp.stage = TeleportStage::AwaitingRelease;
                tp.dest_seed_cap = Some(format!(
                    "http://{}:{}/CAPS/{}/",
                    dest.sim_ip,
                    dest.http_port,
                    Uuid::new_v4().simple()
                ));
            }
        }
    }

    /// Destination-side release callback (`DELETE .../release` received):
    /// the avatar is established over there, finish on this side.
    pub fn agent_release_callback(&mut self, agent_id: Uuid) {
        // the origin is the region where this agent has a teleport in flight
        let Some(idx) = self.regions.iter().position(|r| {
            r.sessions
                .get(&agent_id)
                .map(|s| s.teleport.is_some())
                .unwrap_or(false)
        }) else {
            return;
        };
        let finish = {
            let Some(session) = self.regions[idx].sessions.get_mut(&agent_id) else { return };
            let Some(tp) = session.teleport.as_mut() else { return };
            if tp.cancelled {
                return;
            }
            tp.stage = TeleportStage::Complete;
            session.flags |= AgentFlags::TELEPORT_COMPLETE;
            TeleportFinish {
                region_handle: tp.region_handle,
                sim_ip: tp.sim_ip.unwrap_or(0),
                sim_port: tp.sim_port.unwrap_or(0),
                seed_capability: tp.dest_seed_cap.clone().unwrap_or_default(),
                flags: tp.flags,
            }
        };
        if let Some(session) = self.regions[idx].sessions.get_mut(&agent_id) {
            if let Some(hooks) = session.hooks.as_mut() {
                hooks.teleport_finish(&finish);
            }
            session.teleport = None;
            session.begin_close(true);
        }
        info!("teleport complete for {}", agent_id);
    }

    /// Viewer-initiated cancel. The descriptor is marked; whichever async
    /// step observes the mark reports exactly one "cancelled".
    pub fn cancel_teleport(&mut self, agent_id: Uuid) {
        if let Some(session) = self.teleporting_session_mut(agent_id) {
            if let Some(tp) = session.teleport.as_mut() {
                if !tp.cancel() {
                    debug!("teleport for {} not cancellable", agent_id);
                }
            }
        }
    }

    /// If cancelled, consume the descriptor and report once.
    fn teleport_check_cancelled(&mut self, agent_id: Uuid) -> bool {
        let cancelled = self
            .teleporting_session_mut(agent_id)
            .and_then(|s| s.teleport.as_ref().map(|tp| tp.cancelled))
            .unwrap_or(false);
        if cancelled {
            if let Some(session) = self.teleporting_session_mut(agent_id) {
                session.teleport = None;
            }
            self.teleport_progress_msg(agent_id, "cancelled");
        }
        cancelled
    }

    fn teleport_progress_msg(&mut self, agent_id: Uuid, msg: &str) {
        // the progress goes to whichever of the agent's sessions has a live
        // circuit (the origin; destination children have no hooks yet)
        let session = self
            .regions
            .iter_mut()
            .filter_map(|r| r.sessions.get_mut(&agent_id))
            .find(|s| s.hooks.is_some());
        if let Some(session) = session {
            let flags = session.teleport.as_ref().map(|tp| tp.flags).unwrap_or(0);
            if let Some(hooks) = session.hooks.as_mut() {
                hooks.teleport_progress(&TeleportProgress {
                    message: msg.to_string(),
                    flags,
                });
            }
        }
    }

    /// Terminal failure: exactly one callback, descriptor freed.
    pub fn teleport_failed(&mut self, agent_id: Uuid, reason: &str) {
        if let Some(session) = self.teleporting_session_mut(agent_id) {
            if session.teleport.take().is_some() {
                if let Some(hooks) = session.hooks.as_mut() {
                    hooks.teleport_failed(&TeleportFailed {
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }
}

fn ipv4_to_u32(addr: &str) -> u32 {
    addr.parse::<std::net::Ipv4Addr>()
        .map(u32::from)
        .unwrap_or(0)
}

/// Parse a landmark asset body: `Landmark version 2` with `region_handle`
/// and `local_pos` lines.
fn parse_landmark(data: &[u8]) -> Option<(RegionHandle, Vec3)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut handle = None;
    let mut pos = None;
    for line in text.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("region_handle") => {
                handle = words.next().and_then(|w| w.parse::<u64>().ok()).map(RegionHandle);
            }
            Some("local_pos") => {
                let x: f32 = words.next()?.parse().ok()?;
                let y: f32 = words.next()?.parse().ok()?;
                let z: f32 = words.next()?.parse().ok()?;
                pos = Some(Vec3::new(x, y, z));
            }
            _ => {}
        }
    }
    Some((handle?, pos?))
}

fn asset_type_from_name(name: &str) -> i8 {
    match name {
        "sound" => crate::types::ASSET_SOUND,
        "animation" => crate::types::ASSET_ANIMATION,
        "lsltext" => ASSET_LSL_TEXT,
        _ => crate::types::ASSET_TEXTURE,
    }
}

fn inv_type_from_name(name: &str) -> i8 {
    match name {
        "sound" => 1,
        "animation" => crate::types::INV_TYPE_ANIMATION,
        "script" => INV_TYPE_LSL,
        _ => crate::types::INV_TYPE_TEXTURE,
    }
}

/// Viewer-visible permission word for one prim as seen by one user.
pub fn user_prim_perms(user: Uuid, prim: &Prim) -> u32 {
    let mut perms = prim.perms.everyone;
    if user == prim.owner {
        perms |= prim.perms.current;
    }
    perms & prim.perms.base
}

/// Derive the ObjectUpdate flag word from permissions and ownership.
pub fn user_prim_flags(user: Uuid, prim: &Prim) -> PrimFlags {
    let mut flags = prim.flags;
    let perms = user_prim_perms(user, prim);
    if user == prim.owner {
        flags |= PrimFlags::YOU_OWNER | PrimFlags::OWNER_MODIFY;
    }
    if !prim.owner.is_nil() {
        flags |= PrimFlags::ANY_OWNER;
    }
    if perms & PERM_MODIFY != 0 {
        flags |= PrimFlags::CAN_MODIFY;
    }
    if perms & PERM_COPY != 0 {
        flags |= PrimFlags::CAN_COPY;
    }
    if perms & PERM_TRANSFER != 0 {
        flags |= PrimFlags::CAN_TRANSFER;
    }
    if perms & PERM_MOVE != 0 {
        flags |= PrimFlags::CAN_MOVE;
    }
    if prim.inv.items.is_empty() {
        flags |= PrimFlags::INVENTORY_EMPTY;
    }
    flags
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

pub struct Region {
    pub handle: RegionHandle,
    pub name: String,
    pub shortname: String,
    pub region_id: Uuid,
    pub owner_id: Uuid,
    pub welcome_message: String,
    pub water_height: f32,
    pub terrain: Terrain,
    pub world: World,
    pub sessions: HashMap<Uuid, UserSession>,
    pub(crate) next_generation: u64,
    pub scripts: ScriptHost,
    pub physics: PhysicsBridge,
    /// Live prim/prim contacts, diffed per tick into start/cont/end events.
    collision_state: HashSet<CollisionPair>,
    /// Script loads awaiting a compile reply to an uploader request.
    pending_compiles: HashMap<ScriptHandle, (PollId, Uuid)>,
}

impl Region {
    pub fn new(config: &RegionConfig, vm_factory: Arc<dyn VmFactory>) -> Self {
        let terrain = Terrain::flat(config.region.water_height + 1.0);
        let physics = PhysicsBridge::spawn(&terrain);
        let scripts = ScriptHost::spawn(vm_factory);
        let name = config.region.name.clone();
        let shortname: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        Self {
            handle: RegionHandle::from_grid(config.region.grid_x, config.region.grid_y),
            name,
            shortname,
            region_id: config.region.region_id.unwrap_or_else(Uuid::new_v4),
            owner_id: config.region.owner_id.unwrap_or_else(Uuid::nil),
            welcome_message: config.region.welcome_message.clone(),
            water_height: config.region.water_height,
            terrain,
            world: World::new(),
            sessions: HashMap::new(),
            next_generation: 1,
            scripts,
            physics,
            collision_state: HashSet::new(),
            pending_compiles: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Spatial dispatch plus fan-out to sessions and scripts.
    pub fn deliver_chat(&mut self, chat: &ChatMessage) {
        for delivery in self.world.send_chat(chat) {
            match delivery.target {
                ChatTarget::Session(agent_id) => {
                    if chat.source == agent_id && chat.source_type == ChatSource::Avatar {
                        continue; // no echo of one's own chat
                    }
                    if let Some(session) = self.sessions.get_mut(&agent_id) {
                        if let Some(hooks) = session.hooks.as_mut() {
                            hooks.chat(&chat_to_sim_msg(chat));
                        }
                    }
                }
                ChatTarget::Script(raw) => {
                    self.scripts.post_event(
                        ScriptHandle(raw),
                        ScriptEvent::Listen {
                            channel: chat.channel,
                            name: chat.name.clone(),
                            id: chat.source,
                            msg: chat.msg.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Chat originating from a prim. OWNER_SAY bypasses the octree and goes
    /// to the owner's session only.
    pub fn chat_from_prim(&mut self, prim_id: Uuid, channel: i32, msg: &str, chat_type: ChatType) {
        let Some(obj) = self.world.get(prim_id) else { return };
        let Some(prim) = obj.as_prim() else { return };
        let chat = ChatMessage {
            channel,
            pos: obj.world_pos,
            source: prim_id,
            owner: prim.owner,
            source_type: ChatSource::Object,
            chat_type,
            name: prim.name.clone(),
            msg: msg.to_string(),
        };
        if chat_type == ChatType::OwnerSay {
            let owner = prim.owner;
            if let Some(session) = self.sessions.get_mut(&owner) {
                if let Some(hooks) = session.hooks.as_mut() {
                    hooks.chat(&chat_to_sim_msg(&chat));
                }
            } else {
                debug!("discarding owner-say for absent user");
            }
            return;
        }
        self.deliver_chat(&chat);
    }

    /// System chat straight to one session (no spatial dispatch).
    pub fn system_message(&mut self, agent_id: Uuid, msg: &str) {
        if let Some(session) = self.sessions.get_mut(&agent_id) {
            if let Some(hooks) = session.hooks.as_mut() {
                hooks.chat(&ChatFromSimulator {
                    from_name: "Region".to_string(),
                    source_id: Uuid::nil(),
                    owner_id: Uuid::nil(),
                    source_type: ChatSource::System,
                    chat_type: ChatType::Normal,
                    audible: 1,
                    position: Vec3::ZERO,
                    message: msg.to_string(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scripts in prims
    // -----------------------------------------------------------------------

    /// Rez a fresh default script into a prim (the build-tool "new script"
    /// path).
    pub fn rez_script(&mut self, owner: Uuid, prim_id: Uuid, name: &str) -> Option<ScriptHandle> {
        let default_source = b"on state_entry\n  say 0 Script running\n".to_vec();
        let item_id = Uuid::new_v4();
        let asset = SimpleAsset {
            name: name.to_string(),
            description: String::new(),
            asset_type: ASSET_LSL_TEXT,
            id: Uuid::new_v4(),
            data: default_source.clone(),
        };
        let handle = self.scripts.add_script(prim_id, item_id, default_source);

        let obj = self.world.get_mut(prim_id)?;
        let prim = obj.as_prim_mut()?;
        prim.inv.add(InventoryItem {
            name: name.to_string(),
            item_id,
            owner_id: owner,
            creator_as_uuid: owner,
            creator_id: owner.to_string(),
            asset_id: asset.id,
            asset_type: ASSET_LSL_TEXT,
            inv_type: INV_TYPE_LSL,
            embedded_asset: Some(asset),
            script: Some(handle),
            ..InventoryItem::default()
        });
        prim.flags |= PrimFlags::SCRIPTED;
        self.world.mark_updated(prim_id, ObjUpd::FLAGS);
        Some(handle)
    }

    /// Replace a prim script item's backing asset; returns the old script
    /// handle (caller kills it). None when prim or item is missing.
    fn update_script_item(
        &mut self,
        prim_id: Uuid,
        item_id: Uuid,
        asset: SimpleAsset,
    ) -> Option<Option<ScriptHandle>> {
        let prim = self.world.get_mut(prim_id)?.as_prim_mut()?;
        let item = prim.inv.find_mut(item_id)?;
        let old = item.script.take();
        item.asset_id = asset.id;
        item.embedded_asset = Some(asset);
        prim.inv.mark_updated();
        Some(old)
    }

    /// Touch input from a viewer, routed to the prim's scripts.
    pub fn prim_touch(&mut self, agent_id: Uuid, prim_id: Uuid, phase: u8) {
        let Some(session) = self.sessions.get(&agent_id) else { return };
        let detected = DetectedInfo {
            key: agent_id,
            owner: agent_id,
            name: session.name(),
            pos: session
                .avatar
                .and_then(|av| self.world.get(av))
                .map(|o| o.world_pos)
                .unwrap_or(Vec3::ZERO),
            ..DetectedInfo::default()
        };
        let targets = self.scripts_on_prim(prim_id, EVMASK_TOUCH | EVMASK_TOUCH_CONT);
        for handle in targets {
            self.scripts
                .post_event(handle, ScriptEvent::Touch { phase, detected: detected.clone() });
        }
    }

    /// Script handles on one prim whose event mask intersects `mask`.
    fn scripts_on_prim(&self, prim_id: Uuid, mask: u32) -> Vec<ScriptHandle> {
        let Some(prim) = self.world.get(prim_id).and_then(|o| o.as_prim()) else {
            return Vec::new();
        };
        prim.inv
            .items
            .iter()
            .filter_map(|item| item.script)
            .filter(|handle| self.scripts.evmask_of(*handle) & mask != 0)
            .collect()
    }

    /// Link-message fan-out across a linkset.
    pub fn script_link_message(
        &mut self,
        src_prim: Uuid,
        link_num: i32,
        num: i32,
        msg: &str,
        id: &str,
    ) {
        let root = self.world.root_prim_of(src_prim);
        let children = self
            .world
            .get(root)
            .and_then(|o| o.as_prim())
            .map(|p| p.children.clone())
            .unwrap_or_default();

        let mut targets: Vec<Uuid> = Vec::new();
        match link_num {
            LINK_SET => {
                targets.push(root);
                targets.extend(&children);
            }
            LINK_ALL_OTHERS => {
                targets.push(root);
                targets.extend(&children);
                targets.retain(|t| *t != src_prim);
            }
            LINK_ALL_CHILDREN => targets.extend(&children),
            LINK_THIS => targets.push(src_prim),
            n if n >= 1 => {
                if let Some(t) = self.world.prim_by_link_id(root, n) {
                    targets.push(t);
                }
            }
            _ => {}
        }

        // sender's own link number
        let sender_num = if src_prim == root {
            1
        } else {
            children.iter().position(|c| *c == src_prim).map(|i| i as i32 + 2).unwrap_or(1)
        };

        for target in targets {
            for handle in self.scripts_on_prim(target, EVMASK_LINK_MESSAGE) {
                self.scripts.post_event(
                    handle,
                    ScriptEvent::LinkMessage {
                        sender_num,
                        num,
                        str: msg.to_string(),
                        id: id.to_string(),
                    },
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // The per-frame pump
    // -----------------------------------------------------------------------

    pub fn tick(
        &mut self,
        now: f64,
        caps: &mut CapRouter,
        backend: &Rc<dyn GridBackend>,
        tasks: &TaskQueue,
        outbox: &mut Vec<(PollId, CapsResponse)>,
    ) {
        self.pump_script_host(tasks, outbox);
        self.pump_physics();
        self.pump_world_events();
        self.pump_terrain_dirty();
        self.flush_object_updates(now);
        self.purge_sessions(caps, backend, outbox);
    }

    /// Slow housekeeping: liveness, slow-removal countdowns, long-poll
    /// timeouts.
    pub fn slow_tick(
        &mut self,
        now: f64,
        caps: &mut CapRouter,
        backend: &Rc<dyn GridBackend>,
        outbox: &mut Vec<(PollId, CapsResponse)>,
    ) {
        let mut timed_out = Vec::new();
        for (agent_id, session) in self.sessions.iter_mut() {
            if let Some(poll) = session.evqueue.check_timeout(now) {
                outbox.push((poll, CapsResponse::Status(502)));
            }
            session.tick_slow_removal();
            if session.timed_out(now) && !session.flags.contains(AgentFlags::PURGE) {
                timed_out.push(*agent_id);
            }
        }
        for agent_id in timed_out {
            info!("session {} timed out", agent_id);
            if let Some(session) = self.sessions.get_mut(&agent_id) {
                session.begin_close(false);
            }
        }
        self.purge_sessions(caps, backend, outbox);
    }

    /// Fan world mutations out to per-session dirty state and physics.
    fn pump_world_events(&mut self) {
        for event in self.world.take_events() {
            match event {
                WorldEvent::Updated { id, local_id, flags } => {
                    if let Some(obj) = self.world.get(id) {
                        self.physics.upd_object(&self.world, obj, flags);
                    }
                    for session in self.sessions.values_mut() {
                        session.mark_update(local_id, flags);
                    }
                }
                WorldEvent::MovedFromPhys { id: _, local_id } => {
                    for session in self.sessions.values_mut() {
                        session.mark_update(local_id, ObjUpd::POSROT);
                    }
                }
                WorldEvent::Deleted { id: _, local_id } => {
                    self.physics.del_object(local_id);
                    for session in self.sessions.values_mut() {
                        session.mark_deleted(local_id);
                    }
                }
                WorldEvent::KillScript(handle) => {
                    self.scripts.kill_script(handle);
                }
            }
        }
    }

    /// Drain script-host messages: chat, RPCs, event masks, kill acks.
    fn pump_script_host(&mut self, tasks: &TaskQueue, outbox: &mut Vec<(PollId, CapsResponse)>) {
        for event in self.scripts.poll() {
            match event {
                ScriptHostEvent::Chat { prim, channel, msg, chat_type, .. } => {
                    self.chat_from_prim(prim, channel, &msg, chat_type);
                }
                ScriptHostEvent::Rpc { handle, prim, call } => {
                    let ret = self.handle_native_call(handle, prim, call, tasks, outbox);
                    self.scripts.rpc_return(handle, ret);
                }
                ScriptHostEvent::EvMask { prim, mask, .. } => {
                    let prim_mask: u32 = self
                        .world
                        .get(prim)
                        .and_then(|o| o.as_prim())
                        .map(|p| {
                            p.inv
                                .items
                                .iter()
                                .filter_map(|i| i.script)
                                .map(|h| self.scripts.evmask_of(h))
                                .fold(mask, |acc, m| acc | m)
                        })
                        .unwrap_or(mask);
                    self.world.set_script_evmask(prim, prim_mask);
                }
                ScriptHostEvent::Loaded { handle, prim, result } => {
                    if let Some((poll, asset_id)) = self.pending_compiles.remove(&handle) {
                        let mut resp = Llsd::map();
                        resp.insert("state", Llsd::String("complete".to_string()));
                        resp.insert("new_asset", Llsd::Uuid(asset_id));
                        resp.insert("compiled", Llsd::Bool(result.is_ok()));
                        let mut errors = Llsd::array();
                        if let Err(ref e) = result {
                            for line in e.lines() {
                                errors.push(Llsd::String(line.to_string()));
                            }
                        }
                        resp.insert("errors", errors);
                        outbox.push((poll, CapsResponse::Llsd(resp)));
                    }
                    if let Err(e) = result {
                        // failed-but-present: the author gets the diagnostic
                        self.chat_from_prim(
                            prim,
                            DEBUG_CHANNEL,
                            &format!("script load failed: {}", e),
                            ChatType::OwnerSay,
                        );
                    }
                }
                ScriptHostEvent::Killed { handle, prim } => {
                    // clear the dangling item link, if the prim still exists
                    if let Some(p) = self.world.get_mut(prim).and_then(|o| o.as_prim_mut()) {
                        for item in p.inv.items.iter_mut() {
                            if item.script == Some(handle) {
                                item.script = None;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Apply physics readbacks and turn collision batches into script
    /// events (start / continuing / end, diffed against the last tick).
    fn pump_physics(&mut self) {
        let batches = self.physics.pump(&mut self.world);

        // footfall planes were written into avatar bodies by pump()
        for batch in batches {
            let current: HashSet<CollisionPair> = batch.into_iter().collect();
            let started: Vec<_> = current.difference(&self.collision_state).copied().collect();
            let ended: Vec<_> = self.collision_state.difference(&current).copied().collect();
            let continuing: Vec<_> = current.intersection(&self.collision_state).copied().collect();

            for (pairs, phase, mask) in [
                (&started, COLLISION_START, EVMASK_COLLISION),
                (&continuing, COLLISION_CONT, EVMASK_COLLISION_CONT),
                (&ended, COLLISION_END, EVMASK_COLLISION),
            ] {
                for pair in pairs.iter() {
                    let Some(obj) = self.world.by_local_id(pair.collidee) else { continue };
                    let prim_id = obj.id;
                    let detected = self
                        .world
                        .by_local_id(pair.collider)
                        .map(|other| DetectedInfo {
                            key: other.id,
                            owner: other.as_prim().map(|p| p.owner).unwrap_or(other.id),
                            name: other
                                .as_prim()
                                .map(|p| p.name.clone())
                                .unwrap_or_default(),
                            pos: other.world_pos,
                            vel: other.velocity,
                            rot: other.rot,
                            det_type: 0,
                        })
                        .unwrap_or_default();
                    for handle in self.scripts_on_prim(prim_id, mask) {
                        self.scripts.post_event(
                            handle,
                            ScriptEvent::Collision { phase, detected: detected.clone() },
                        );
                    }
                }
            }
            self.collision_state = current;
        }
    }

    /// Move terrain edits into every session's resend mask.
    fn pump_terrain_dirty(&mut self) {
        let dirty = self.terrain.take_dirty();
        if dirty.iter().all(|row| *row == 0) {
            return;
        }
        for session in self.sessions.values_mut() {
            for (dst, src) in session.dirty_terrain.iter_mut().zip(dirty.iter()) {
                *dst |= *src;
            }
        }
    }

    /// Deliver pending object state to each client: deletions first, then
    /// creates, then property updates, all under the task throttle.
    fn flush_object_updates(&mut self, now: f64) {
        let world = &self.world;
        for session in self.sessions.values_mut() {
            if session.hooks.is_none() {
                continue;
            }
            session.update_throttles(now);

            let deletions = session.take_deletions();
            if !deletions.is_empty() {
                let bytes = 16 * deletions.len();
                if session.throttles[ThrottleId::Task as usize].consume(bytes) {
                    if let Some(hooks) = session.hooks.as_mut() {
                        hooks.kill_objects(&KillObject { local_ids: deletions });
                    }
                } else {
                    for local_id in deletions {
                        session.deleted_objs.push_back(local_id);
                    }
                    continue;
                }
            }

            let user_id = session.user_id;
            for (local_id, flags) in session.take_updates() {
                let Some(obj) = world.by_local_id(local_id) else { continue };
                let update = build_object_update(world, user_id, obj, flags);
                let cost = if update.is_full { 200 } else { 60 };
                if session.throttles[ThrottleId::Task as usize].consume(cost) {
                    if let Some(hooks) = session.hooks.as_mut() {
                        hooks.object_update(&update);
                    }
                } else {
                    // out of budget: put the dirty bits back for next tick
                    session.mark_update(local_id, flags);
                }
            }
        }
    }

    /// Remove sessions flagged for purge: grid logoff, avatar teardown,
    /// capability sweep, event-queue close.
    fn purge_sessions(
        &mut self,
        caps: &mut CapRouter,
        backend: &Rc<dyn GridBackend>,
        outbox: &mut Vec<(PollId, CapsResponse)>,
    ) {
        let doomed: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.flags.contains(AgentFlags::PURGE))
            .map(|(id, _)| *id)
            .collect();
        for agent_id in doomed {
            let Some(mut session) = self.sessions.remove(&agent_id) else { continue };
            info!("removing session {} ({})", session.name(), agent_id);

            if let Some(av_id) = session.avatar.take() {
                let pos = self
                    .world
                    .get(av_id)
                    .map(|o| o.world_pos)
                    .unwrap_or(Vec3::ZERO);
                self.world.delete_avatar(av_id);
                if !session
                    .flags
                    .intersects(AgentFlags::CHILD | AgentFlags::TELEPORT_COMPLETE)
                {
                    backend.user_logoff(agent_id, session.session_id, pos, pos);
                }
            }
            if let Some(poll) = session.evqueue.close() {
                outbox.push((poll, CapsResponse::Status(502)));
            }
            caps.deregister_session(session.handle());
            if let Some(hooks) = session.hooks.as_mut() {
                hooks.disconnect();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Script natives needing the world (RPCs)
    // -----------------------------------------------------------------------

    fn handle_native_call(
        &mut self,
        handle: ScriptHandle,
        prim_id: Uuid,
        call: NativeCall,
        tasks: &TaskQueue,
        outbox: &mut Vec<(PollId, CapsResponse)>,
    ) -> NativeRet {
        match call {
            NativeCall::SetText { text, color } => {
                self.world.set_hover_text(prim_id, &text, color);
                NativeRet::None
            }
            NativeCall::SetPos { pos } => {
                self.script_set_pos(prim_id, pos);
                NativeRet::None
            }
            NativeCall::SetRot { rot } => {
                self.world.multi_update(prim_id, None, Some(rot), None, false);
                NativeRet::None
            }
            NativeCall::GetPos => NativeRet::Vect(
                self.world.get(prim_id).map(|o| o.world_pos).unwrap_or(Vec3::ZERO),
            ),
            NativeCall::GetRot => NativeRet::Rot(
                self.world.get(prim_id).map(|o| o.rot).unwrap_or(Quat::IDENTITY),
            ),
            NativeCall::GetLocalPos => NativeRet::Vect(
                self.world.get(prim_id).map(|o| o.local_pos).unwrap_or(Vec3::ZERO),
            ),
            NativeCall::GetRootPos => {
                let root = self.world.root_prim_of(prim_id);
                NativeRet::Vect(self.world.get(root).map(|o| o.world_pos).unwrap_or(Vec3::ZERO))
            }
            NativeCall::GetObjectName => NativeRet::Str(
                self.world
                    .get(prim_id)
                    .and_then(|o| o.as_prim())
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
            ),
            NativeCall::GetRegionName => NativeRet::Str(self.name.clone()),
            NativeCall::GetRegionCorner => NativeRet::Vect(Vec3::new(
                (self.handle.grid_x() * 256) as f32,
                (self.handle.grid_y() * 256) as f32,
                0.0,
            )),
            NativeCall::ApplyImpulse { impulse, local } => {
                let root = self.world.root_prim_of(prim_id);
                if let Some(local_id) = self.world.get(root).map(|o| o.local_id) {
                    self.physics.apply_impulse(local_id, impulse, local);
                }
                NativeRet::None
            }
            NativeCall::SetPrimParams { rules } => {
                self.script_set_prim_params(prim_id, &rules);
                NativeRet::None
            }
            NativeCall::MessageLinked { link_num, num, str, id } => {
                self.script_link_message(prim_id, link_num, num, &str, &id);
                NativeRet::None
            }
            NativeCall::Listen { channel } => {
                self.world.add_listen(prim_id, channel, ChatTarget::Script(handle.0));
                NativeRet::Int(channel)
            }
            NativeCall::ListenRemove { channel } => {
                self.world
                    .remove_listen(prim_id, channel, ChatTarget::Script(handle.0));
                NativeRet::None
            }
            NativeCall::UnsitAvatar { avatar } => {
                NativeRet::Int(self.world.unsit_avatar_via_script(prim_id, avatar) as i32)
            }
            NativeCall::Dialog { avatar, msg, buttons, channel } => {
                if buttons.len() > 12 {
                    self.chat_from_prim(
                        prim_id,
                        DEBUG_CHANNEL,
                        "llDialog cannot have more than 12 buttons",
                        ChatType::Shout,
                    );
                    return NativeRet::None;
                }
                let mut body = Llsd::map();
                body.insert("object_id", Llsd::Uuid(prim_id));
                body.insert("message", Llsd::String(msg));
                body.insert("channel", Llsd::Int(channel));
                let mut blist = Llsd::array();
                for b in buttons {
                    blist.push(Llsd::String(b));
                }
                body.insert("buttons", blist);
                if let Some(session) = self.sessions.get_mut(&avatar) {
                    if let Some((poll, resp)) = session.evqueue.send("ScriptDialog", body) {
                        outbox.push((poll, CapsResponse::Llsd(resp)));
                    }
                }
                NativeRet::None
            }
            NativeCall::TeleportAgent { avatar, region, pos, look_at } => {
                let region_name = region;
                tasks.post(Box::new(move |group| {
                    group.teleport_by_region_name(avatar, &region_name, pos, look_at);
                }));
                NativeRet::None
            }
        }
    }

    /// `llSetPos` semantics: a root prim moves in region space, a child in
    /// its parent frame.
    fn script_set_pos(&mut self, prim_id: Uuid, pos: Vec3) {
        let is_root = self
            .world
            .get(prim_id)
            .map(|o| o.parent.is_none())
            .unwrap_or(false);
        if is_root {
            self.world.move_root(prim_id, pos);
        } else {
            self.world.multi_update(prim_id, Some(pos), None, None, false);
        }
    }

    /// Apply a typed `llSetPrimitiveParams` rule list: abort at the first
    /// malformed rule, reporting it on the owner's debug channel.
    fn script_set_prim_params(&mut self, prim_id: Uuid, rules: &[PrimParamRule]) {
        let failure: Option<(usize, String)> = {
            let Some(mut ctx) = self.world.prim_params(prim_id) else { return };
            let mut failed = None;
            for (index, rule) in rules.iter().enumerate() {
                let result = match rule {
                    PrimParamRule::Shape { prim_type, hollow_shape } => {
                        match PrimType::from_i32(*prim_type) {
                            Some(shape) => ctx.set_shape(shape, *hollow_shape as u8),
                            None => Err(crate::world::WorldError::BadParam("unknown prim type")),
                        }
                    }
                    PrimParamRule::ProfileCut { begin, end } => ctx.set_profile_cut(*begin, *end),
                    PrimParamRule::Hollow { amount } => ctx.set_hollow(*amount),
                    PrimParamRule::Twist { begin, end } => ctx.set_twist(*begin, *end),
                    PrimParamRule::Taper { size_x, size_y, shear_x, shear_y } => {
                        ctx.set_taper(*size_x, *size_y, *shear_x, *shear_y)
                    }
                    PrimParamRule::Material { material } => ctx.set_material(*material as u8),
                    PrimParamRule::Text { text, color, alpha } => {
                        let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;
                        ctx.set_text(
                            text,
                            [to_byte(color.x), to_byte(color.y), to_byte(color.z), to_byte(*alpha)],
                        )
                    }
                    PrimParamRule::PointLight { on, color, intensity, radius, falloff } => {
                        if *on {
                            ctx.set_point_light(*color, *intensity, *radius, *falloff)
                        } else {
                            ctx.remove_light()
                        }
                    }
                };
                if let Err(e) = result {
                    failed = Some((index, e.to_string()));
                    break;
                }
            }
            failed
        };
        if let Some((index, error)) = failure {
            self.chat_from_prim(
                prim_id,
                DEBUG_CHANNEL,
                &format!("llSetPrimitiveParams: rule {} rejected: {}", index + 1, error),
                ChatType::OwnerSay,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialize script VM state into each script item, then dump every
    /// prim to the region state file.
    pub fn save_state(&mut self, dir: &Path) -> Result<(), PersistError> {
        let scripted: Vec<(Uuid, Uuid, ScriptHandle)> = self
            .world
            .iter()
            .filter_map(|obj| obj.as_prim().map(|p| (obj.id, p)))
            .flat_map(|(id, prim)| {
                prim.inv
                    .items
                    .iter()
                    .filter_map(move |item| item.script.map(|h| (id, item.item_id, h)))
            })
            .collect();
        for (prim_id, item_id, handle) in scripted {
            if let Some(state) = self.scripts.save_script(handle) {
                if let Some(item) = self
                    .world
                    .get_mut(prim_id)
                    .and_then(|o| o.as_prim_mut())
                    .and_then(|p| p.inv.find_mut(item_id))
                {
                    item.embedded_asset = Some(SimpleAsset {
                        name: item.name.clone(),
                        description: String::new(),
                        asset_type: ASSET_LSL_BYTECODE,
                        id: item.asset_id,
                        data: state,
                    });
                }
            }
        }
        persist::dump_world(&self.world, dir, &self.shortname)
    }

    /// Load persisted prims and revive their scripts, each with an implicit
    /// `changed(REGION_START)` pending.
    pub fn load_state(&mut self, dir: &Path) -> Result<usize, PersistError> {
        let count = persist::load_world(&mut self.world, dir, &self.shortname)?;

        let scripted: Vec<(Uuid, Uuid, Vec<u8>, bool)> = self
            .world
            .iter()
            .filter_map(|obj| obj.as_prim().map(|p| (obj.id, p)))
            .flat_map(|(id, prim)| {
                prim.inv.items.iter().filter_map(move |item| {
                    if item.inv_type != INV_TYPE_LSL {
                        return None;
                    }
                    let asset = item.embedded_asset.as_ref()?;
                    Some((
                        id,
                        item.item_id,
                        asset.data.clone(),
                        asset.asset_type == ASSET_LSL_BYTECODE,
                    ))
                })
            })
            .collect();
        for (prim_id, item_id, data, is_state) in scripted {
            let handle = if is_state {
                self.scripts.restore_script(prim_id, item_id, data)
            } else {
                self.scripts.add_script(prim_id, item_id, data)
            };
            if let Some(item) = self
                .world
                .get_mut(prim_id)
                .and_then(|o| o.as_prim_mut())
                .and_then(|p| p.inv.find_mut(item_id))
            {
                item.script = Some(handle);
            }
        }
        Ok(count)
    }

    pub fn shutdown(&mut self) {
        self.scripts.shutdown();
        self.physics.shutdown();
    }
}

fn chat_to_sim_msg(chat: &ChatMessage) -> ChatFromSimulator {
    ChatFromSimulator {
        from_name: chat.name.clone(),
        source_id: chat.source,
        owner_id: chat.owner,
        source_type: chat.source_type,
        chat_type: chat.chat_type,
        audible: 1,
        position: chat.pos,
        message: chat.msg.clone(),
    }
}

/// Build the composite update for one object as seen by one user.
fn build_object_update(world: &World, user: Uuid, obj: &WorldObject, flags: ObjUpd) -> ObjectUpdate {
    let is_full = flags.intersects(
        ObjUpd::CREATED
            | ObjUpd::SHAPE
            | ObjUpd::TEXTURE
            | ObjUpd::FLAGS
            | ObjUpd::MATERIAL
            | ObjUpd::TEXT
            | ObjUpd::PARENT
            | ObjUpd::CHILDREN
            | ObjUpd::EXTRA_PARAMS,
    );
    let parent_id = obj
        .parent
        .and_then(|p| world.get(p))
        .map(|p| p.local_id)
        .unwrap_or(0);
    let prim = obj.as_prim();
    ObjectUpdate {
        local_id: obj.local_id,
        full_id: obj.id,
        parent_id,
        crc: prim.map(|p| p.crc_counter).unwrap_or(0),
        is_full,
        is_avatar: obj.is_avatar(),
        material: prim.map(|p| p.material).unwrap_or(0),
        position: obj.local_pos,
        velocity: obj.velocity,
        rotation: obj.rot,
        scale: obj.scale,
        update_flags: prim.map(|p| user_prim_flags(user, p).bits()).unwrap_or(0),
        attach_point: prim.map(|p| p.attach_point).unwrap_or(0),
        texture_entry: prim.map(|p| p.tex_entry.clone()).unwrap_or_default(),
        extra_params: prim
            .map(|p| p.extra_params.as_bytes().to_vec())
            .unwrap_or_default(),
        text: prim.map(|p| p.hover_text.clone()).unwrap_or_default(),
        text_color: prim.map(|p| p.text_color).unwrap_or([0; 4]),
    }
}
