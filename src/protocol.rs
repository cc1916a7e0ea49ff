//! Viewer-facing message contract.
//!
//! This module owns **every message that crosses the UDP boundary** between
//! the core and the wire codec. The codec parses packets into these structs
//! and encodes them back out; fragmentation, sequencing, reliability and
//! compression are entirely its business.
//!
//! | Direction         | Messages                                          |
//! |-------------------|---------------------------------------------------|
//! | viewer → core     | use-circuit-code, complete-agent-movement,        |
//! |                   | agent-update, chat-from-viewer, agent-throttle,   |
//! |                   | start-ping, logout-request                        |
//! | core → viewer     | region-handshake, agent-movement-complete,        |
//! |                   | chat-from-simulator, object-update, kill-object,  |
//! |                   | teleport-progress/finish/failed, logout-reply,    |
//! |                   | complete-ping                                     |
//!
//! Outbound traffic goes through [`ClientHooks`], the per-session trait the
//! UDP subsystem implements; the core never sees a socket.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChatSource, ChatType, LocalId, RegionHandle};

// ---------------------------------------------------------------------------
// Inbound (viewer → core)
// ---------------------------------------------------------------------------

/// First packet of a circuit; binds the UDP endpoint to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseCircuitCode {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
    /// Packet sequence number, for the per-session duplicate filter.
    pub seqno: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

bitflags::bitflags! {
    /// Viewer control flags carried by agent-update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u32 {
        const AT_POS   = 0x1;
        const AT_NEG   = 0x2;
        const LEFT_POS = 0x4;
        const LEFT_NEG = 0x8;
        const UP_POS   = 0x10;
        const UP_NEG   = 0x20;
        const FLY      = 0x2000;
    }
}

// flag words travel as their raw bits
impl Serialize for ControlFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ControlFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_truncate(u32::deserialize(deserializer)?))
    }
}

/// Per-frame avatar control input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub body_rotation: Quat,
    pub head_rotation: Quat,
    pub control_flags: ControlFlags,
    pub far: f32,
    pub state: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFromViewer {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub chat_type: ChatType,
    pub channel: i32,
}

/// The raw 7×4-byte little-endian float block resetting all throttles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThrottle {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
    pub throttles: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartPingCheck {
    pub ping_id: u8,
    pub oldest_unacked: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

// ---------------------------------------------------------------------------
// Outbound (core → viewer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionHandshake {
    pub region_name: String,
    pub region_id: Uuid,
    pub region_flags: u32,
    pub sim_access: u8,
    pub water_height: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMovementComplete {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    pub region_handle: RegionHandle,
    pub timestamp: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFromSimulator {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: ChatSource,
    pub chat_type: ChatType,
    /// 1 fully audible, 0 barely, -1 not audible.
    pub audible: i8,
    pub position: Vec3,
    pub message: String,
}

/// One object in an object-update message. Which fields the codec encodes
/// depends on `is_full` (full vs terse update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub local_id: LocalId,
    pub full_id: Uuid,
    pub parent_id: LocalId,
    pub crc: u32,
    pub is_full: bool,
    pub is_avatar: bool,
    pub material: u8,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// Viewer-visible flag word, already permission-filtered per recipient.
    pub update_flags: u32,
    pub attach_point: u8,
    pub texture_entry: Vec<u8>,
    pub extra_params: Vec<u8>,
    pub text: String,
    pub text_color: [u8; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillObject {
    pub local_ids: Vec<LocalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeleportProgress {
    pub message: String,
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeleportFinish {
    pub region_handle: RegionHandle,
    pub sim_ip: u32,
    pub sim_port: u16,
    pub seed_capability: String,
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeleportFailed {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Client hooks
// ---------------------------------------------------------------------------

/// Per-session delivery surface, implemented by the UDP subsystem (and by a
/// recording stub in the tests). Calls are fire-and-forget; reliability is
/// the transport's concern.
pub trait ClientHooks {
    fn chat(&mut self, msg: &ChatFromSimulator);
    fn send_region_handshake(&mut self, msg: &RegionHandshake);
    fn movement_complete(&mut self, msg: &AgentMovementComplete);
    fn object_update(&mut self, msg: &ObjectUpdate);
    fn kill_objects(&mut self, msg: &KillObject);
    fn teleport_progress(&mut self, msg: &TeleportProgress);
    fn teleport_finish(&mut self, msg: &TeleportFinish);
    fn teleport_failed(&mut self, msg: &TeleportFailed);
    fn logout_reply(&mut self);
    fn alert_message(&mut self, msg: &str, is_modal: bool);
    /// The session is gone; drop the circuit.
    fn disconnect(&mut self);
}
