//! Script host tests: the worker thread, RPC discipline, the kill
//! handshake, timers and failure reporting.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use uuid::Uuid;
    use veldt_region::scripting::stubvm::StubVmFactory;
    use veldt_region::scripting::{
        NativeCall, NativeRet, ScriptEvent, ScriptHost, ScriptHostEvent, ScriptState,
        EVMASK_TOUCH, TOUCH_START,
    };
    use veldt_region::types::DEBUG_CHANNEL;

    fn make_host() -> ScriptHost {
        ScriptHost::spawn(Arc::new(StubVmFactory))
    }

    /// Poll the host until `want` picks an event out, or time out.
    fn wait_for<T>(
        host: &mut ScriptHost,
        timeout: Duration,
        mut want: impl FnMut(ScriptHostEvent) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for event in host.poll() {
                if let Some(out) = want(event) {
                    return Some(out);
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    // -----------------------------------------------------------------------
    // Load and run
    // -----------------------------------------------------------------------

    #[test]
    fn state_entry_runs_and_chats() {
        let mut host = make_host();
        let prim = Uuid::new_v4();
        let handle = host.add_script(
            prim,
            Uuid::new_v4(),
            b"on state_entry\n  say 0 Script running\n".to_vec(),
        );
        assert_eq!(host.state_of(handle), Some(ScriptState::Compiling));

        let said = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Chat { channel: 0, msg, .. } => Some(msg),
            _ => None,
        });
        assert_eq!(said.as_deref(), Some("Script running"));
        assert_eq!(host.state_of(handle), Some(ScriptState::Running));
        host.shutdown();
    }

    #[test]
    fn bad_bytecode_reports_compile_error() {
        let mut host = make_host();
        let handle = host.add_script(Uuid::new_v4(), Uuid::new_v4(), b"gibberish here\n".to_vec());
        let result = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Loaded { result, .. } => Some(result),
            _ => None,
        });
        assert!(result.expect("load reply arrives").is_err());
        assert_eq!(host.state_of(handle), Some(ScriptState::CompileError));
        host.shutdown();
    }

    // -----------------------------------------------------------------------
    // RPC discipline and post-call delays
    // -----------------------------------------------------------------------

    #[test]
    fn set_pos_rpc_round_trip_with_delay() {
        let mut host = make_host();
        let prim = Uuid::new_v4();
        let handle = host.add_script(
            prim,
            Uuid::new_v4(),
            b"on state_entry\n  setpos 10 20 30\n  setpos 11 20 30\n".to_vec(),
        );

        let first = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Rpc { handle: h, call: NativeCall::SetPos { pos }, .. } if h == handle => {
                Some(pos)
            }
            _ => None,
        })
        .expect("first RPC");
        assert_eq!(first.x, 10.0);

        let completed = Instant::now();
        host.rpc_return(handle, NativeRet::None);

        let second_at = wait_for(&mut host, Duration::from_secs(3), |ev| match ev {
            ScriptHostEvent::Rpc { call: NativeCall::SetPos { pos }, .. } if pos.x == 11.0 => {
                Some(Instant::now())
            }
            _ => None,
        })
        .expect("second RPC");
        // the implicit llSetPos delay holds the script back ≥0.2 s
        let gap = second_at.duration_since(completed);
        assert!(gap >= Duration::from_millis(150), "delay too short: {:?}", gap);
        host.rpc_return(handle, NativeRet::None);
        host.shutdown();
    }

    // -----------------------------------------------------------------------
    // Kill handshake
    // -----------------------------------------------------------------------

    #[test]
    fn kill_is_acknowledged_exactly_once_and_silences_the_script() {
        let mut host = make_host();
        let prim = Uuid::new_v4();
        let handle = host.add_script(
            prim,
            Uuid::new_v4(),
            b"on state_entry\n  timer 0.01\non timer\n  say 0 tick\n".to_vec(),
        );

        // wait until it is alive and ticking
        wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Chat { .. } => Some(()),
            _ => None,
        })
        .expect("script ticked");

        host.kill_script(handle);
        assert_eq!(host.state_of(handle), Some(ScriptState::Killing));
        // a duplicate kill must be a no-op, not a second handshake
        host.kill_script(handle);

        let mut killed = 0;
        let mut late_traffic = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            for ev in host.poll() {
                match ev {
                    ScriptHostEvent::Killed { handle: h, .. } if h == handle => killed += 1,
                    ScriptHostEvent::Chat { handle: h, .. } if h == handle => late_traffic += 1,
                    _ => {}
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(killed, 1, "SCRIPT_KILLED must arrive exactly once");
        assert_eq!(late_traffic, 0, "no traffic after the kill is drained");
        // the record is gone; further sends are dropped on the floor
        assert_eq!(host.state_of(handle), None);
        host.post_event(
            handle,
            ScriptEvent::Touch { phase: TOUCH_START, detected: Default::default() },
        );
        host.shutdown();
    }

    // -----------------------------------------------------------------------
    // Events and masks
    // -----------------------------------------------------------------------

    #[test]
    fn touch_handler_reports_mask_and_fires() {
        let mut host = make_host();
        let prim = Uuid::new_v4();
        let handle = host.add_script(
            prim,
            Uuid::new_v4(),
            b"on touch_start\n  say 0 touched\n".to_vec(),
        );

        let mask = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::EvMask { mask, .. } => Some(mask),
            _ => None,
        })
        .expect("evmask reported");
        assert!(mask & EVMASK_TOUCH != 0);

        host.post_event(
            handle,
            ScriptEvent::Touch { phase: TOUCH_START, detected: Default::default() },
        );
        let said = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Chat { msg, .. } => Some(msg),
            _ => None,
        });
        assert_eq!(said.as_deref(), Some("touched"));
        host.shutdown();
    }

    #[test]
    fn timer_fires_repeatedly() {
        let mut host = make_host();
        let handle = host.add_script(
            Uuid::new_v4(),
            Uuid::new_v4(),
            b"on state_entry\n  timer 0.05\non timer\n  say 0 tick\n".to_vec(),
        );
        let mut ticks = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && ticks < 3 {
            for ev in host.poll() {
                if let ScriptHostEvent::Chat { handle: h, msg, .. } = ev {
                    if h == handle && msg == "tick" {
                        ticks += 1;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ticks >= 3, "expected repeated timer events, got {}", ticks);
        host.shutdown();
    }

    // -----------------------------------------------------------------------
    // Failure reporting
    // -----------------------------------------------------------------------

    #[test]
    fn runtime_failure_lands_on_the_debug_channel() {
        let mut host = make_host();
        let handle = host.add_script(
            Uuid::new_v4(),
            Uuid::new_v4(),
            b"on state_entry\n  fail something broke\n".to_vec(),
        );
        let (channel, msg) = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Chat { channel, msg, .. } => Some((channel, msg)),
            _ => None,
        })
        .expect("failure chat");
        assert_eq!(channel, DEBUG_CHANNEL);
        assert_eq!(msg, "something broke");
        // failed-but-present: the record survives for diagnosis
        assert_eq!(host.state_of(handle), Some(ScriptState::Running));
        host.shutdown();
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn save_and_restore_keep_the_script_alive() {
        let mut host = make_host();
        let prim = Uuid::new_v4();
        let item = Uuid::new_v4();
        let handle = host.add_script(
            prim,
            item,
            b"on touch_start\n  say 0 still here\n".to_vec(),
        );
        wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Loaded { result, .. } => Some(result),
            _ => None,
        })
        .expect("loaded")
        .expect("load ok");

        let blob = host.save_script(handle).expect("saved state");
        let restored = host.restore_script(prim, item, blob);
        wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Loaded { handle: h, result, .. } if h == restored => Some(result),
            _ => None,
        })
        .expect("restore reply")
        .expect("restore ok");

        host.post_event(
            restored,
            ScriptEvent::Touch { phase: TOUCH_START, detected: Default::default() },
        );
        let said = wait_for(&mut host, Duration::from_secs(2), |ev| match ev {
            ScriptHostEvent::Chat { handle: h, msg, .. } if h == restored => Some(msg),
            _ => None,
        });
        assert_eq!(said.as_deref(), Some("still here"));
        host.shutdown();
    }
}
