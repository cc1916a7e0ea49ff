//! A small deterministic script VM.
//!
//! The real compiled-script runtime is pluggable behind [`super::ScriptVm`];
//! this implementation interprets a plain-text event/instruction program and
//! exists so the host, scheduler and RPC machinery can run (and be tested)
//! without a compiler toolchain. The "bytecode" is the program text itself:
//!
//! ```text
//! on state_entry
//!   say 0 Script running
//! on touch_start
//!   setpos 10.0 20.0 30.0
//! ```

use glam::Vec3;
use uuid::Uuid;

use super::{
    EventKind, NativeCall, NativeRet, ScriptEvent, ScriptVm, VmFactory, VmStep,
};
use crate::types::ChatType;

// ---------------------------------------------------------------------------
// Program representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Instr {
    Say { channel: i32, msg: String, chat_type: ChatType },
    Sleep(f64),
    Timer(f64),
    SetPos(Vec3),
    SetText(String),
    GetPos,
    Impulse(Vec3),
    LinkMsg { link_num: i32, num: i32, msg: String },
    Listen(i32),
    Work(u32),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Block {
    trigger: EventKind,
    instrs: Vec<Instr>,
}

fn parse_event(name: &str) -> Option<EventKind> {
    Some(match name {
        "state_entry" => EventKind::StateEntry,
        "touch_start" => EventKind::TouchStart,
        "touch" => EventKind::Touch,
        "touch_end" => EventKind::TouchEnd,
        "timer" => EventKind::Timer,
        "changed" => EventKind::Changed,
        "collision_start" => EventKind::CollisionStart,
        "collision" => EventKind::Collision,
        "collision_end" => EventKind::CollisionEnd,
        "link_message" => EventKind::LinkMessage,
        "listen" => EventKind::Listen,
        _ => return None,
    })
}

fn parse_program(text: &str) -> Result<Vec<Block>, String> {
    let mut blocks: Vec<Block> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let op = words.next().unwrap_or_default();
        let rest = |n: usize| -> String {
            line.split_whitespace().skip(n).collect::<Vec<_>>().join(" ")
        };

        if op == "on" {
            let name = words.next().ok_or_else(|| format!("line {}: missing event", lineno + 1))?;
            let trigger =
                parse_event(name).ok_or_else(|| format!("line {}: unknown event {}", lineno + 1, name))?;
            blocks.push(Block { trigger, instrs: Vec::new() });
            continue;
        }

        let block = blocks
            .last_mut()
            .ok_or_else(|| format!("line {}: instruction before any 'on' block", lineno + 1))?;

        let num = |w: Option<&str>| -> Result<f64, String> {
            w.and_then(|s| s.parse().ok())
                .ok_or_else(|| format!("line {}: bad number", lineno + 1))
        };

        let instr = match op {
            "say" | "shout" | "whisper" => {
                let channel = num(words.next())? as i32;
                let chat_type = match op {
                    "shout" => ChatType::Shout,
                    "whisper" => ChatType::Whisper,
                    _ => ChatType::Normal,
                };
                Instr::Say { channel, msg: rest(2), chat_type }
            }
            "sleep" => Instr::Sleep(num(words.next())?),
            "timer" => Instr::Timer(num(words.next())?),
            "setpos" => {
                let x = num(words.next())?;
                let y = num(words.next())?;
                let z = num(words.next())?;
                Instr::SetPos(Vec3::new(x as f32, y as f32, z as f32))
            }
            "settext" => Instr::SetText(rest(1)),
            "getpos" => Instr::GetPos,
            "impulse" => {
                let x = num(words.next())?;
                let y = num(words.next())?;
                let z = num(words.next())?;
                Instr::Impulse(Vec3::new(x as f32, y as f32, z as f32))
            }
            "linkmsg" => {
                let link_num = num(words.next())? as i32;
                let n = num(words.next())? as i32;
                Instr::LinkMsg { link_num, num: n, msg: rest(3) }
            }
            "listen" => Instr::Listen(num(words.next())? as i32),
            "work" => Instr::Work(num(words.next())? as u32),
            "fail" => Instr::Fail(rest(1)),
            other => return Err(format!("line {}: unknown op {}", lineno + 1, other)),
        };
        block.instrs.push(instr);
    }
    Ok(blocks)
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

pub struct StubVm {
    source: String,
    blocks: Vec<Block>,
    /// Currently-executing block and program counter, if any.
    frame: Option<(usize, usize)>,
    /// Remaining busy-work units for the current Work instruction.
    work_left: u32,
    awaiting_native: bool,
    failed: Option<String>,
    pub last_ret: Option<NativeRet>,
}

impl StubVm {
    fn new(source: String) -> Result<Self, String> {
        let blocks = parse_program(&source)?;
        Ok(Self {
            source,
            blocks,
            frame: None,
            work_left: 0,
            awaiting_native: false,
            failed: None,
            last_ret: None,
        })
    }

    fn start_block(&mut self, kind: EventKind) {
        if let Some(idx) = self.blocks.iter().position(|b| b.trigger == kind) {
            self.frame = Some((idx, 0));
        }
    }
}

impl ScriptVm for StubVm {
    fn is_idle(&self) -> bool {
        self.frame.is_none() && self.failed.is_none() && !self.awaiting_native
    }

    fn is_runnable(&self) -> bool {
        self.frame.is_some() && !self.awaiting_native && self.failed.is_none()
    }

    fn has_failed(&self) -> Option<String> {
        self.failed.clone()
    }

    fn has_handler(&self, event: EventKind) -> bool {
        self.blocks.iter().any(|b| b.trigger == event)
    }

    fn call_event(&mut self, event: &ScriptEvent) {
        self.start_block(event.kind());
    }

    fn call_state_entry(&mut self) {
        self.start_block(EventKind::StateEntry);
    }

    fn call_changed(&mut self, _changed: u32) {
        self.start_block(EventKind::Changed);
    }

    fn call_timer(&mut self) {
        self.start_block(EventKind::Timer);
    }

    fn run(&mut self, _budget: u32) -> VmStep {
        let Some((block_idx, pc)) = self.frame else {
            return VmStep::Idle;
        };
        let Some(instr) = self.blocks[block_idx].instrs.get(pc).cloned() else {
            self.frame = None;
            return VmStep::Idle;
        };

        // busy-work consumes whole slices without advancing
        if let Instr::Work(n) = instr {
            if self.work_left == 0 {
                self.work_left = n;
            }
            self.work_left = self.work_left.saturating_sub(1);
            if self.work_left > 0 {
                return VmStep::Busy;
            }
            self.frame = Some((block_idx, pc + 1));
            return VmStep::Busy;
        }

        self.frame = Some((block_idx, pc + 1));
        match instr {
            Instr::Say { channel, msg, chat_type } => VmStep::Say { channel, msg, chat_type },
            Instr::Sleep(secs) => VmStep::Sleep(secs),
            Instr::Timer(secs) => VmStep::SetTimer(secs),
            Instr::SetPos(pos) => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::SetPos { pos })
            }
            Instr::SetText(text) => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::SetText { text, color: [255, 255, 255, 255] })
            }
            Instr::GetPos => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::GetPos)
            }
            Instr::Impulse(impulse) => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::ApplyImpulse { impulse, local: false })
            }
            Instr::LinkMsg { link_num, num, msg } => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::MessageLinked {
                    link_num,
                    num,
                    str: msg,
                    id: Uuid::nil().to_string(),
                })
            }
            Instr::Listen(channel) => {
                self.awaiting_native = true;
                VmStep::Native(NativeCall::Listen { channel })
            }
            Instr::Fail(msg) => {
                self.failed = Some(msg.clone());
                self.frame = None;
                VmStep::Failed(msg)
            }
            Instr::Work(_) => unreachable!("handled above"),
        }
    }

    fn complete_native(&mut self, ret: NativeRet) {
        self.awaiting_native = false;
        self.last_ret = Some(ret);
    }

    fn save(&self) -> Vec<u8> {
        // state header, then the program text
        let (block, pc) = self.frame.unwrap_or((usize::MAX, 0));
        format!("#frame {} {}\n{}", block, pc, self.source).into_bytes()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub struct StubVmFactory;

impl VmFactory for StubVmFactory {
    fn load(&self, bytecode: &[u8]) -> Result<Box<dyn ScriptVm>, String> {
        let text = std::str::from_utf8(bytecode).map_err(|_| "script is not UTF-8".to_string())?;
        Ok(Box::new(StubVm::new(text.to_string())?))
    }

    fn restore(&self, state: &[u8]) -> Result<Box<dyn ScriptVm>, String> {
        let text = std::str::from_utf8(state).map_err(|_| "state is not UTF-8".to_string())?;
        let (header, body) = match text.split_once('\n') {
            Some((h, b)) if h.starts_with("#frame ") => (h, b),
            _ => return Err("bad saved state header".to_string()),
        };
        let mut vm = StubVm::new(body.to_string())?;
        let mut parts = header.split_whitespace().skip(1);
        let block: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(usize::MAX);
        let pc: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        if block != usize::MAX && block < vm.blocks.len() {
            vm.frame = Some((block, pc.min(vm.blocks[block].instrs.len())));
        }
        Ok(Box::new(vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blocks_and_reports_handlers() {
        let vm = StubVm::new(
            "on state_entry\n  say 0 hello\non touch_start\n  setpos 1 2 3\n".to_string(),
        )
        .unwrap();
        assert!(vm.has_handler(EventKind::StateEntry));
        assert!(vm.has_handler(EventKind::TouchStart));
        assert!(!vm.has_handler(EventKind::Timer));
    }

    #[test]
    fn state_entry_runs_to_idle() {
        let mut vm = StubVm::new("on state_entry\n  say 0 hi\n".to_string()).unwrap();
        assert!(vm.is_idle());
        vm.call_state_entry();
        assert!(vm.is_runnable());
        match vm.run(100) {
            VmStep::Say { channel, msg, .. } => {
                assert_eq!(channel, 0);
                assert_eq!(msg, "hi");
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(vm.run(100), VmStep::Idle));
        assert!(vm.is_idle());
    }

    #[test]
    fn native_call_blocks_until_completion() {
        let mut vm = StubVm::new("on state_entry\n  setpos 1 2 3\n".to_string()).unwrap();
        vm.call_state_entry();
        assert!(matches!(vm.run(100), VmStep::Native(NativeCall::SetPos { .. })));
        assert!(!vm.is_runnable());
        vm.complete_native(NativeRet::None);
        assert!(vm.is_runnable());
        assert!(matches!(vm.run(100), VmStep::Idle));
    }

    #[test]
    fn save_restore_round_trips_mid_block() {
        let mut vm = StubVm::new("on state_entry\n  say 0 a\n  say 0 b\n".to_string()).unwrap();
        vm.call_state_entry();
        let _ = vm.run(100);
        let saved = vm.save();
        let restored = StubVmFactory.restore(&saved).unwrap();
        assert!(restored.is_runnable());
    }
}
