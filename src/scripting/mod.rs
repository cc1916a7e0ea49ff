//! Concurrent script host.
//!
//! Scripts run on a dedicated worker thread. The main thread and the worker
//! exchange typed messages over two bounded queues; the VM table itself sits
//! behind one mutex, which the worker holds across each scheduling pass and
//! the main thread takes only for save/restore and RPC completion.
//!
//! ## Kill handshake
//!
//! `KILL_SCRIPT` is answered by exactly one `SCRIPT_KILLED`. After sending
//! the kill, the main thread sends nothing further for that script and drops
//! any of its in-flight messages; the record is freed exactly once, when
//! `SCRIPT_KILLED` arrives.

pub mod stubvm;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use glam::{Quat, Vec3};
use log::{debug, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::ChatType;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Event-mask bits reported through EVMASK messages.
pub const EVMASK_TOUCH: u32 = 0x1;
pub const EVMASK_TOUCH_CONT: u32 = 0x2;
pub const EVMASK_COLLISION: u32 = 0x4;
pub const EVMASK_COLLISION_CONT: u32 = 0x8;
pub const EVMASK_LINK_MESSAGE: u32 = 0x10;

/// `changed()` event bits.
pub const CHANGED_INVENTORY: u32 = 0x1;
pub const CHANGED_COLOR: u32 = 0x2;
pub const CHANGED_SHAPE: u32 = 0x4;
pub const CHANGED_SCALE: u32 = 0x8;
pub const CHANGED_TEXTURE: u32 = 0x10;
pub const CHANGED_LINK: u32 = 0x20;
pub const CHANGED_OWNER: u32 = 0x80;
pub const CHANGED_REGION: u32 = 0x100;
pub const CHANGED_TELEPORT: u32 = 0x200;
pub const CHANGED_REGION_START: u32 = 0x400;

/// Link-number constants used by link messages.
pub const LINK_ROOT: i32 = 1;
pub const LINK_SET: i32 = -1;
pub const LINK_ALL_OTHERS: i32 = -2;
pub const LINK_ALL_CHILDREN: i32 = -3;
pub const LINK_THIS: i32 = -4;

pub const COLLISION_START: u8 = 0;
pub const COLLISION_CONT: u8 = 1;
pub const COLLISION_END: u8 = 2;

pub const TOUCH_START: u8 = 0;
pub const TOUCH_CONT: u8 = 1;
pub const TOUCH_END: u8 = 2;

/// Cap on queued events per script; the oldest event drops on overflow.
pub const MAX_QUEUED_EVENTS: usize = 32;

/// VM instructions executed per scheduling slice.
pub const INSN_SLICE: u32 = 100;

/// Runnable scripts dispatched per scheduling pass.
pub const DISPATCH_BATCH: usize = 20;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identifier for a hosted script, valid on both threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHandle(pub u32);

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "script#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Events delivered to scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateEntry,
    TouchStart,
    Touch,
    TouchEnd,
    Timer,
    Changed,
    CollisionStart,
    Collision,
    CollisionEnd,
    LinkMessage,
    Listen,
}

/// Payload for touch/collision events; readable through the llDetected*
/// family while the event handler runs.
#[derive(Debug, Clone)]
pub struct DetectedInfo {
    pub key: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub pos: Vec3,
    pub vel: Vec3,
    pub rot: Quat,
    pub det_type: i32,
}

impl Default for DetectedInfo {
    fn default() -> Self {
        Self {
            key: Uuid::nil(),
            owner: Uuid::nil(),
            name: String::new(),
            pos: Vec3::ZERO,
            vel: Vec3::ZERO,
            rot: Quat::IDENTITY,
            det_type: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptEvent {
    Touch { phase: u8, detected: DetectedInfo },
    Collision { phase: u8, detected: DetectedInfo },
    LinkMessage { sender_num: i32, num: i32, str: String, id: String },
    Listen { channel: i32, name: String, id: Uuid, msg: String },
}

impl ScriptEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ScriptEvent::Touch { phase, .. } => match *phase {
                TOUCH_START => EventKind::TouchStart,
                TOUCH_END => EventKind::TouchEnd,
                _ => EventKind::Touch,
            },
            ScriptEvent::Collision { phase, .. } => match *phase {
                COLLISION_START => EventKind::CollisionStart,
                COLLISION_END => EventKind::CollisionEnd,
                _ => EventKind::Collision,
            },
            ScriptEvent::LinkMessage { .. } => EventKind::LinkMessage,
            ScriptEvent::Listen { .. } => EventKind::Listen,
        }
    }
}

// ---------------------------------------------------------------------------
// Native calls (RPCs to the main thread)
// ---------------------------------------------------------------------------

/// World-mutating natives. The VM extracts the typed arguments on the script
/// thread; the main thread executes the call against the world and returns a
/// [`NativeRet`].
#[derive(Debug, Clone)]
pub enum NativeCall {
    SetText { text: String, color: [u8; 4] },
    SetPos { pos: Vec3 },
    SetRot { rot: Quat },
    GetPos,
    GetRot,
    GetLocalPos,
    GetRootPos,
    GetObjectName,
    GetRegionName,
    GetRegionCorner,
    ApplyImpulse { impulse: Vec3, local: bool },
    SetPrimParams { rules: Vec<PrimParamRule> },
    MessageLinked { link_num: i32, num: i32, str: String, id: String },
    Listen { channel: i32 },
    ListenRemove { channel: i32 },
    UnsitAvatar { avatar: Uuid },
    Dialog { avatar: Uuid, msg: String, buttons: Vec<String>, channel: i32 },
    TeleportAgent { avatar: Uuid, region: String, pos: Vec3, look_at: Vec3 },
}

/// One `llSetPrimitiveParams` rule, already typed.
#[derive(Debug, Clone)]
pub enum PrimParamRule {
    Shape { prim_type: i32, hollow_shape: i32 },
    ProfileCut { begin: f32, end: f32 },
    Hollow { amount: f32 },
    Twist { begin: f32, end: f32 },
    Taper { size_x: f32, size_y: f32, shear_x: f32, shear_y: f32 },
    Material { material: i32 },
    Text { text: String, color: Vec3, alpha: f32 },
    PointLight { on: bool, color: Vec3, intensity: f32, radius: f32, falloff: f32 },
}

#[derive(Debug, Clone)]
pub enum NativeRet {
    None,
    Int(i32),
    Str(String),
    Vect(Vec3),
    Rot(Quat),
    Key(Uuid),
}

/// Post-call delay applied before the script becomes runnable again. The
/// delay is charged when the RPC is dispatched, so the script resumes only
/// after both the call completes and the delay elapses.
pub fn rpc_delay(call: &NativeCall) -> f64 {
    match call {
        NativeCall::SetPos { .. } | NativeCall::SetRot { .. } => 0.2,
        NativeCall::SetPrimParams { .. } => 0.2,
        NativeCall::Dialog { .. } => 1.0,
        NativeCall::TeleportAgent { .. } => 5.0,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// The VM abstraction
// ---------------------------------------------------------------------------

/// Outcome of one execution slice.
#[derive(Debug)]
pub enum VmStep {
    /// Budget consumed, more work pending.
    Busy,
    /// Handler finished; waiting for the next event.
    Idle,
    /// Hit a world-mutating native; the script must yield until RPC_RETURN.
    Native(NativeCall),
    /// `llSleep` and friends.
    Sleep(f64),
    /// Direct chat send, no yield required.
    Say { channel: i32, msg: String, chat_type: ChatType },
    /// `llSetTimerEvent`; zero clears the timer.
    SetTimer(f64),
    /// Runtime failure: reported to the owner, script halts but stays.
    Failed(String),
}

/// A compiled-script virtual machine. The bytecode format is the compiler's
/// business; the host only drives execution and persistence.
pub trait ScriptVm: Send {
    /// No handler on the stack and nothing half-executed.
    fn is_idle(&self) -> bool;
    /// Ready to consume an execution slice.
    fn is_runnable(&self) -> bool;
    fn has_failed(&self) -> Option<String>;
    fn has_handler(&self, event: EventKind) -> bool;
    /// Begin executing the handler for `event`.
    fn call_event(&mut self, event: &ScriptEvent);
    /// Begin the built-in events that carry no payload.
    fn call_state_entry(&mut self);
    fn call_changed(&mut self, changed: u32);
    fn call_timer(&mut self);
    /// Execute up to `budget` instructions.
    fn run(&mut self, budget: u32) -> VmStep;
    /// Complete the outstanding native call.
    fn complete_native(&mut self, ret: NativeRet);
    /// Serialize the full VM state.
    fn save(&self) -> Vec<u8>;
}

/// Creates VMs from compiled bytecode or serialized state.
pub trait VmFactory: Send + Sync {
    fn load(&self, bytecode: &[u8]) -> Result<Box<dyn ScriptVm>, String>;
    fn restore(&self, state: &[u8]) -> Result<Box<dyn ScriptVm>, String>;
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub(crate) enum ToScript {
    Shutdown,
    AddScript { handle: ScriptHandle, bytecode: Vec<u8> },
    RestoreScript { handle: ScriptHandle, state: Vec<u8> },
    KillScript { handle: ScriptHandle },
    RpcReturn { handle: ScriptHandle, ret: NativeRet },
    Event { handle: ScriptHandle, event: ScriptEvent },
}

pub(crate) enum ToMain {
    Loaded { handle: ScriptHandle, result: Result<(), String> },
    Say { handle: ScriptHandle, channel: i32, msg: String, chat_type: ChatType },
    Rpc { handle: ScriptHandle, call: NativeCall },
    EvMask { handle: ScriptHandle, mask: u32 },
    ScriptKilled { handle: ScriptHandle },
}

// ---------------------------------------------------------------------------
// Shared VM table
// ---------------------------------------------------------------------------

/// Per-script state, owned by the script thread except under the table
/// mutex (main-thread save/restore and RPC completion).
pub(crate) struct VmSlot {
    pub vm: Option<Box<dyn ScriptVm>>,
    pub in_rpc: bool,
    pub state_entry: bool,
    pub changed: u32,
    pub timer_fired: bool,
    pub timer_interval: f64,
    /// Zero means no timer armed.
    pub next_timer: f64,
    pub delay_until: f64,
    pub pending: VecDeque<ScriptEvent>,
    pub detected: Option<DetectedInfo>,
}

impl VmSlot {
    fn new() -> Self {
        Self {
            vm: None,
            in_rpc: false,
            state_entry: true,
            changed: 0,
            timer_fired: false,
            timer_interval: 0.0,
            next_timer: 0.0,
            delay_until: 0.0,
            pending: VecDeque::new(),
            detected: None,
        }
    }
}

pub(crate) type VmTable = HashMap<ScriptHandle, VmSlot>;

// ---------------------------------------------------------------------------
// Main-thread host
// ---------------------------------------------------------------------------

/// Main-thread view of a script's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Compiling,
    CompileError,
    Running,
    Paused,
    Killing,
}

struct ScriptRecord {
    prim: Uuid,
    item: Uuid,
    state: ScriptState,
    evmask: u32,
}

/// What [`ScriptHost::poll`] hands the region each tick.
#[derive(Debug)]
pub enum ScriptHostEvent {
    /// Load/compile finished (ok or with a diagnostic).
    Loaded { handle: ScriptHandle, prim: Uuid, result: Result<(), String> },
    Chat { handle: ScriptHandle, prim: Uuid, channel: i32, msg: String, chat_type: ChatType },
    Rpc { handle: ScriptHandle, prim: Uuid, call: NativeCall },
    EvMask { handle: ScriptHandle, prim: Uuid, mask: u32 },
    /// Record freed; the handle is dead.
    Killed { handle: ScriptHandle, prim: Uuid },
}

pub struct ScriptHost {
    to_worker: Sender<ToScript>,
    from_worker: Receiver<ToMain>,
    vms: Arc<Mutex<VmTable>>,
    records: HashMap<ScriptHandle, ScriptRecord>,
    next_id: u32,
    worker: Option<JoinHandle<()>>,
}

impl ScriptHost {
    /// Spawn the worker thread. Fatal if the thread cannot be created.
    pub fn spawn(factory: Arc<dyn VmFactory>) -> Self {
        let (to_worker, worker_rx) = bounded::<ToScript>(1024);
        let (worker_tx, from_worker) = bounded::<ToMain>(1024);
        let vms: Arc<Mutex<VmTable>> = Arc::new(Mutex::new(HashMap::new()));
        let vms_worker = Arc::clone(&vms);
        let worker = std::thread::Builder::new()
            .name("script-worker".into())
            .spawn(move || worker::run(worker_rx, worker_tx, vms_worker, factory))
            .expect("cannot create script worker thread");
        Self {
            to_worker,
            from_worker,
            vms,
            records: HashMap::new(),
            next_id: 1,
            worker: Some(worker),
        }
    }

    fn fresh_handle(&mut self) -> ScriptHandle {
        let handle = ScriptHandle(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        handle
    }

    /// Load compiled bytecode into a fresh script bound to a prim item.
    pub fn add_script(&mut self, prim: Uuid, item: Uuid, bytecode: Vec<u8>) -> ScriptHandle {
        let handle = self.fresh_handle();
        self.records.insert(
            handle,
            ScriptRecord { prim, item, state: ScriptState::Compiling, evmask: 0 },
        );
        self.vms.lock().insert(handle, VmSlot::new());
        let _ = self.to_worker.send(ToScript::AddScript { handle, bytecode });
        handle
    }

    /// Recreate a script from serialized VM state, with an implicit
    /// `changed(REGION_START)` pending.
    pub fn restore_script(&mut self, prim: Uuid, item: Uuid, state: Vec<u8>) -> ScriptHandle {
        let handle = self.fresh_handle();
        self.records.insert(
            handle,
            ScriptRecord { prim, item, state: ScriptState::Running, evmask: 0 },
        );
        let mut slot = VmSlot::new();
        slot.state_entry = false;
        slot.changed = CHANGED_REGION_START;
        self.vms.lock().insert(handle, slot);
        let _ = self.to_worker.send(ToScript::RestoreScript { handle, state });
        handle
    }

    /// Begin the kill handshake. The record stays until SCRIPT_KILLED.
    pub fn kill_script(&mut self, handle: ScriptHandle) {
        let Some(rec) = self.records.get_mut(&handle) else { return };
        if rec.state == ScriptState::Killing {
            warn!("duplicate kill for {}", handle);
            return;
        }
        rec.state = ScriptState::Killing;
        let _ = self.to_worker.send(ToScript::KillScript { handle });
    }

    /// Post a touch/collision/link-message/listen event.
    pub fn post_event(&self, handle: ScriptHandle, event: ScriptEvent) {
        match self.records.get(&handle) {
            Some(rec) if rec.state != ScriptState::Killing => {
                let _ = self.to_worker.send(ToScript::Event { handle, event });
            }
            _ => {}
        }
    }

    /// Complete an outstanding RPC, applying its return value to the VM and
    /// re-queueing the script.
    pub fn rpc_return(&mut self, handle: ScriptHandle, ret: NativeRet) {
        match self.records.get(&handle) {
            Some(rec) if rec.state != ScriptState::Killing => {
                let _ = self.to_worker.send(ToScript::RpcReturn { handle, ret });
            }
            _ => {}
        }
    }

    /// Serialize a script's VM in place, under the table mutex.
    pub fn save_script(&self, handle: ScriptHandle) -> Option<Vec<u8>> {
        let table = self.vms.lock();
        table.get(&handle)?.vm.as_ref().map(|vm| vm.save())
    }

    pub fn state_of(&self, handle: ScriptHandle) -> Option<ScriptState> {
        self.records.get(&handle).map(|r| r.state)
    }

    pub fn evmask_of(&self, handle: ScriptHandle) -> u32 {
        self.records.get(&handle).map(|r| r.evmask).unwrap_or(0)
    }

    pub fn prim_of(&self, handle: ScriptHandle) -> Option<Uuid> {
        self.records.get(&handle).map(|r| r.prim)
    }

    pub fn item_of(&self, handle: ScriptHandle) -> Option<Uuid> {
        self.records.get(&handle).map(|r| r.item)
    }

    /// Drain worker messages. Messages for scripts in the killing state are
    /// dropped, except the SCRIPT_KILLED acknowledgement which frees the
    /// record.
    pub fn poll(&mut self) -> Vec<ScriptHostEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = self.from_worker.try_recv() {
            match msg {
                ToMain::ScriptKilled { handle } => {
                    self.vms.lock().remove(&handle);
                    if let Some(rec) = self.records.remove(&handle) {
                        debug!("{} killed and freed", handle);
                        out.push(ScriptHostEvent::Killed { handle, prim: rec.prim });
                    }
                }
                ToMain::Loaded { handle, result } => {
                    let Some(rec) = self.records.get_mut(&handle) else { continue };
                    if rec.state == ScriptState::Killing {
                        continue;
                    }
                    rec.state = if result.is_ok() {
                        ScriptState::Running
                    } else {
                        ScriptState::CompileError
                    };
                    out.push(ScriptHostEvent::Loaded { handle, prim: rec.prim, result });
                }
                ToMain::Say { handle, channel, msg, chat_type } => {
                    let Some(rec) = self.records.get(&handle) else { continue };
                    if rec.state == ScriptState::Killing {
                        continue;
                    }
                    out.push(ScriptHostEvent::Chat {
                        handle,
                        prim: rec.prim,
                        channel,
                        msg,
                        chat_type,
                    });
                }
                ToMain::Rpc { handle, call } => {
                    let Some(rec) = self.records.get(&handle) else { continue };
                    if rec.state == ScriptState::Killing {
                        // the script yielded into an RPC that will never
                        // complete; the kill already in flight supersedes it
                        continue;
                    }
                    out.push(ScriptHostEvent::Rpc { handle, prim: rec.prim, call });
                }
                ToMain::EvMask { handle, mask } => {
                    let Some(rec) = self.records.get_mut(&handle) else { continue };
                    if rec.state == ScriptState::Killing {
                        continue;
                    }
                    rec.evmask = mask;
                    out.push(ScriptHostEvent::EvMask { handle, prim: rec.prim, mask });
                }
            }
        }
        out
    }

    pub fn shutdown(&mut self) {
        let _ = self.to_worker.send(ToScript::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}
