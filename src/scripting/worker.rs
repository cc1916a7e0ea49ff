//! The script worker thread: timer/delay bookkeeping and the cooperative
//! scheduler driving VM execution slices.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use super::{
    rpc_delay, ScriptHandle, ToMain, ToScript, VmFactory, VmStep, VmTable, DISPATCH_BATCH,
    INSN_SLICE, MAX_QUEUED_EVENTS,
};
use crate::types::{ChatType, DEBUG_CHANNEL};

/// Longest single queue wait; chunked so the deadline math never overflows
/// narrow timeval representations.
const MAX_WAIT_SECS: f64 = 600.0;

/// Timer and delay deadlines, ordered by time then handle. Zero times never
/// enter the set.
type Deadlines = BTreeSet<(u64, ScriptHandle)>;

fn to_micros(t: f64) -> u64 {
    (t * 1e6) as u64
}

pub(crate) fn run(
    rx: Receiver<ToScript>,
    tx: Sender<ToMain>,
    vms: Arc<Mutex<VmTable>>,
    factory: Arc<dyn VmFactory>,
) {
    let start = Instant::now();
    let mut running: VecDeque<ScriptHandle> = VecDeque::new();
    let mut timers: Deadlines = BTreeSet::new();
    let mut delayed: Deadlines = BTreeSet::new();

    loop {
        {
            let mut table = vms.lock();
            let now = start.elapsed().as_secs_f64();

            // wake expired timers, re-arming each at its next interval
            while let Some(&(deadline, handle)) = timers.iter().next() {
                if deadline as f64 / 1e6 >= now {
                    break;
                }
                timers.remove(&(deadline, handle));
                if let Some(slot) = table.get_mut(&handle) {
                    slot.timer_fired = true;
                    slot.next_timer = now + slot.timer_interval;
                    timers.insert((to_micros(slot.next_timer), handle));
                    awaken(&mut running, handle);
                }
            }

            // wake expired delays
            while let Some(&(deadline, handle)) = delayed.iter().next() {
                if deadline as f64 / 1e6 >= now {
                    break;
                }
                delayed.remove(&(deadline, handle));
                awaken(&mut running, handle);
            }

            // dispatch a bounded batch of runnable scripts
            for _ in 0..DISPATCH_BATCH {
                let Some(&handle) = running.front() else { break };
                let Some(slot) = table.get_mut(&handle) else {
                    running.pop_front();
                    continue;
                };

                if slot.in_rpc {
                    // the main thread owns this VM until RPC_RETURN
                    running.pop_front();
                    continue;
                }
                if slot.delay_until > now {
                    delayed.insert((to_micros(slot.delay_until), handle));
                    running.pop_front();
                    continue;
                }

                let Some(vm) = slot.vm.as_mut() else {
                    running.pop_front();
                    continue;
                };

                if vm.is_idle() {
                    slot.detected = None;
                    if slot.state_entry {
                        slot.state_entry = false;
                        vm.call_state_entry();
                    } else if slot.changed != 0 {
                        let changed = slot.changed;
                        slot.changed = 0;
                        vm.call_changed(changed);
                    } else if slot.timer_fired {
                        slot.timer_fired = false;
                        vm.call_timer();
                    } else if let Some(event) = slot.pending.pop_front() {
                        if let super::ScriptEvent::Touch { detected, .. }
                        | super::ScriptEvent::Collision { detected, .. } = &event
                        {
                            slot.detected = Some(detected.clone());
                        }
                        vm.call_event(&event);
                    }
                }

                if vm.is_runnable() {
                    match vm.run(INSN_SLICE) {
                        VmStep::Busy => {}
                        VmStep::Idle => {}
                        VmStep::Native(call) => {
                            let delay = rpc_delay(&call);
                            if delay > 0.0 {
                                slot.delay_until = now + delay;
                            }
                            slot.in_rpc = true;
                            let _ = tx.send(ToMain::Rpc { handle, call });
                        }
                        VmStep::Sleep(secs) => {
                            slot.delay_until = now + secs.max(0.0);
                        }
                        VmStep::Say { channel, msg, chat_type } => {
                            let _ = tx.send(ToMain::Say { handle, channel, msg, chat_type });
                        }
                        VmStep::SetTimer(interval) => {
                            if slot.next_timer != 0.0 {
                                timers.remove(&(to_micros(slot.next_timer), handle));
                                slot.next_timer = 0.0;
                            }
                            slot.timer_interval = interval;
                            if interval > 0.0 {
                                slot.next_timer = now + interval;
                                timers.insert((to_micros(slot.next_timer), handle));
                            }
                        }
                        VmStep::Failed(err) => {
                            let _ = tx.send(ToMain::Say {
                                handle,
                                channel: DEBUG_CHANNEL,
                                msg: err,
                                chat_type: ChatType::Normal,
                            });
                            running.pop_front();
                        }
                    }
                } else {
                    if let Some(err) = vm.has_failed() {
                        let _ = tx.send(ToMain::Say {
                            handle,
                            channel: DEBUG_CHANNEL,
                            msg: err,
                            chat_type: ChatType::Normal,
                        });
                    }
                    running.pop_front();
                }
            }
        } // table unlocked

        // block on the incoming queue until the next deadline
        loop {
            let next_deadline = [timers.iter().next(), delayed.iter().next()]
                .into_iter()
                .flatten()
                .map(|(t, _)| *t as f64 / 1e6)
                .fold(f64::INFINITY, f64::min);

            let msg = if !running.is_empty() {
                match rx.try_recv() {
                    Ok(m) => Some(m),
                    Err(_) => None,
                }
            } else if next_deadline.is_infinite() {
                match rx.recv() {
                    Ok(m) => Some(m),
                    Err(_) => return, // host dropped
                }
            } else {
                let wait = (next_deadline - start.elapsed().as_secs_f64()).min(MAX_WAIT_SECS);
                if wait <= 0.0 {
                    match rx.try_recv() {
                        Ok(m) => Some(m),
                        Err(_) => None,
                    }
                } else {
                    match rx.recv_timeout(Duration::from_secs_f64(wait)) {
                        Ok(m) => Some(m),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            };

            let Some(msg) = msg else { break };
            match msg {
                ToScript::Shutdown => {
                    debug!("script worker shutting down");
                    return;
                }
                ToScript::AddScript { handle, bytecode } => {
                    let result = factory.load(&bytecode);
                    let mut table = vms.lock();
                    match result {
                        Ok(vm) => {
                            if let Some(slot) = table.get_mut(&handle) {
                                slot.vm = Some(vm);
                                running.push_back(handle);
                                send_evmask(&tx, &table, handle);
                                let _ = tx.send(ToMain::Loaded { handle, result: Ok(()) });
                            }
                        }
                        Err(err) => {
                            warn!("script load failed for {}: {}", handle, err);
                            let _ = tx.send(ToMain::Loaded { handle, result: Err(err) });
                        }
                    }
                }
                ToScript::RestoreScript { handle, state } => {
                    let result = factory.restore(&state);
                    let mut table = vms.lock();
                    match result {
                        Ok(vm) => {
                            if let Some(slot) = table.get_mut(&handle) {
                                slot.vm = Some(vm);
                                running.push_back(handle);
                                send_evmask(&tx, &table, handle);
                                let _ = tx.send(ToMain::Loaded { handle, result: Ok(()) });
                            }
                        }
                        Err(err) => {
                            warn!("script restore failed for {}: {}", handle, err);
                            let _ = tx.send(ToMain::Loaded { handle, result: Err(err) });
                        }
                    }
                }
                ToScript::KillScript { handle } => {
                    running.retain(|h| *h != handle);
                    let mut table = vms.lock();
                    if let Some(slot) = table.get_mut(&handle) {
                        if slot.next_timer != 0.0 {
                            timers.remove(&(to_micros(slot.next_timer), handle));
                        }
                        delayed.retain(|(_, h)| *h != handle);
                        slot.vm = None;
                        slot.detected = None;
                        slot.pending.clear();
                    }
                    // this acknowledgement is the last traffic for the script
                    let _ = tx.send(ToMain::ScriptKilled { handle });
                }
                ToScript::RpcReturn { handle, ret } => {
                    let mut table = vms.lock();
                    if let Some(slot) = table.get_mut(&handle) {
                        if !slot.in_rpc {
                            warn!("RPC_RETURN for {} with no RPC outstanding", handle);
                        }
                        slot.in_rpc = false;
                        if let Some(vm) = slot.vm.as_mut() {
                            vm.complete_native(ret);
                        }
                        awaken(&mut running, handle);
                    }
                }
                ToScript::Event { handle, event } => {
                    let mut table = vms.lock();
                    if let Some(slot) = table.get_mut(&handle) {
                        slot.pending.push_back(event);
                        if slot.pending.len() > MAX_QUEUED_EVENTS {
                            debug!("{} event queue full, dropping oldest", handle);
                            slot.pending.pop_front();
                        }
                        awaken(&mut running, handle);
                    }
                }
            }
        }
    }
}

fn awaken(running: &mut VecDeque<ScriptHandle>, handle: ScriptHandle) {
    if !running.contains(&handle) {
        running.push_front(handle);
    }
}

fn send_evmask(tx: &Sender<ToMain>, table: &VmTable, handle: ScriptHandle) {
    use super::{
        EventKind, EVMASK_COLLISION, EVMASK_COLLISION_CONT, EVMASK_LINK_MESSAGE, EVMASK_TOUCH,
        EVMASK_TOUCH_CONT,
    };
    let Some(vm) = table.get(&handle).and_then(|s| s.vm.as_ref()) else { return };
    let mut mask = 0;
    if vm.has_handler(EventKind::TouchStart) || vm.has_handler(EventKind::TouchEnd) {
        mask |= EVMASK_TOUCH;
    }
    if vm.has_handler(EventKind::Touch) {
        mask |= EVMASK_TOUCH_CONT;
    }
    if vm.has_handler(EventKind::CollisionStart) || vm.has_handler(EventKind::CollisionEnd) {
        mask |= EVMASK_COLLISION;
    }
    if vm.has_handler(EventKind::Collision) {
        mask |= EVMASK_COLLISION_CONT;
    }
    if vm.has_handler(EventKind::LinkMessage) {
        mask |= EVMASK_LINK_MESSAGE;
    }
    let _ = tx.send(ToMain::EvMask { handle, mask });
}
