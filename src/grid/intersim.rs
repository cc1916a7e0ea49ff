//! Core-side handlers for the federation surface.
//!
//! The external HTTP layer parses XML-RPC (`expect_user`, `logoff_user`,
//! `grid_instant_message`) and the REST agent endpoints
//! (`POST|PUT|DELETE /agent/<uuid>[/<handle>[/release]]`) into the structs
//! here and calls straight through; replies are plain booleans or DTOs the
//! layer re-encodes.

use glam::Vec3;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChildAgentRequest, FullAgentRequest};
use crate::llsd::Llsd;
use crate::region::RegionGroup;
use crate::session::NewUserInfo;
use crate::types::{AgentFlags, RegionHandle};

// ---------------------------------------------------------------------------
// XML-RPC method DTOs
// ---------------------------------------------------------------------------

/// `expect_user`: the grid announces an incoming login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectUserRequest {
    pub region_handle: RegionHandle,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
    pub first_name: String,
    pub last_name: String,
    pub start_pos: Vec3,
    pub seed_cap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoffUserRequest {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Opaque forwarding only; the core does not interpret IM dialogs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridInstantMessage {
    pub from_agent: Uuid,
    pub to_agent: Uuid,
    pub from_name: String,
    pub message: String,
    pub dialog: u8,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn handle_expect_user(group: &mut RegionGroup, req: &ExpectUserRequest) -> bool {
    let info = NewUserInfo {
        user_id: req.user_id,
        session_id: req.session_id,
        secure_session_id: req.secure_session_id,
        circuit_code: req.circuit_code,
        first_name: req.first_name.clone(),
        last_name: req.last_name.clone(),
        is_child: false,
        start_pos: req.start_pos,
        start_look_at: Vec3::X,
        seed_cap: req.seed_cap.clone(),
        ..Default::default()
    };
    group.expect_user(req.region_handle, info).is_some()
}

pub fn handle_logoff_user(group: &mut RegionGroup, req: &LogoffUserRequest) -> bool {
    let known = group
        .session_mut(req.user_id)
        .map(|(_, s)| s.session_id == req.session_id)
        .unwrap_or(false);
    if known {
        info!("grid-initiated logoff for {}", req.user_id);
        group.close_session(req.user_id, false);
    } else {
        warn!("logoff_user for unknown session {}", req.user_id);
    }
    known
}

/// Forward an instant message to the target session's event queue.
pub fn handle_grid_instant_message(group: &mut RegionGroup, im: &GridInstantMessage) -> bool {
    let Some((_, session)) = group.session_mut(im.to_agent) else {
        return false;
    };
    let mut body = Llsd::map();
    body.insert("from_agent_id", Llsd::Uuid(im.from_agent));
    body.insert("from_agent_name", Llsd::String(im.from_name.clone()));
    body.insert("message", Llsd::String(im.message.clone()));
    body.insert("dialog", Llsd::Int(im.dialog as i32));
    if let Some((poll, resp)) = session.evqueue.send("InstantMessage", body) {
        group.complete_poll(poll, crate::region::CapsResponse::Llsd(resp));
    }
    true
}

/// `POST /agent/<uuid>`: create a child agent. Idempotent: a repeat POST
/// for an existing session updates it rather than duplicating.
pub fn handle_agent_post(
    group: &mut RegionGroup,
    handle: RegionHandle,
    req: &ChildAgentRequest,
) -> bool {
    let info = NewUserInfo {
        user_id: req.agent_id,
        session_id: req.session_id,
        secure_session_id: req.secure_session_id,
        circuit_code: req.circuit_code,
        first_name: req.first_name.clone(),
        last_name: req.last_name.clone(),
        is_child: true,
        start_pos: req.start_pos,
        start_look_at: Vec3::X,
        seed_cap: Some(req.child_seed_cap.clone()),
        ..Default::default()
    };
    group.expect_user(handle, info).is_some()
}

/// `PUT /agent/<uuid>/<handle>`: upgrade the child agent to an incoming
/// full agent, carrying appearance and throttles across.
pub fn handle_agent_put(
    group: &mut RegionGroup,
    handle: RegionHandle,
    req: &FullAgentRequest,
) -> bool {
    let now = group.now();
    let Some(region) = group.region_by_handle(handle) else {
        return false;
    };
    let Some(session) = region.sessions.get_mut(&req.agent_id) else {
        warn!("agent PUT for unknown session {}", req.agent_id);
        return false;
    };
    if session.session_id != req.session_id {
        warn!("agent PUT session mismatch for {}", req.agent_id);
        return false;
    }
    session.flags.remove(AgentFlags::CHILD);
    session.flags |= AgentFlags::INCOMING;
    session.flags.set(AgentFlags::ALWAYS_RUN, req.always_run);
    session.start_pos = req.position;
    session.start_look_at = req.look_at;
    session.set_throttles_block(&req.throttles, now);
    session.set_texture_entry(req.texture_entry.clone());
    session.set_visual_params(req.visual_params.clone());
    session.wearables = req.wearables;
    debug!("upgraded child agent {} in {}", req.agent_id, handle);
    true
}

/// `DELETE /agent/<uuid>/<handle>/release`.
///
/// Seen by a teleport origin this is the destination's callback: the
/// avatar is established over there, finish the teleport. Seen by a
/// destination it is the origin asking for a half-made child agent to be
/// discarded (cancel cleanup).
pub fn handle_agent_release(group: &mut RegionGroup, agent_id: Uuid, handle: RegionHandle) -> bool {
    let origin_side = group
        .regions
        .iter()
        .any(|r| {
            r.sessions
                .get(&agent_id)
                .map(|s| s.teleport.is_some())
                .unwrap_or(false)
        });
    if origin_side {
        group.agent_release_callback(agent_id);
        return true;
    }

    // destination-side cleanup of an unclaimed child agent
    if let Some(region) = group.region_by_handle(handle) {
        if let Some(session) = region.sessions.get_mut(&agent_id) {
            if session.is_child() || !session.flags.contains(AgentFlags::ENTERED) {
                debug!("discarding unclaimed child agent {}", agent_id);
                session.begin_close(false);
                return true;
            }
        }
    }
    false
}
