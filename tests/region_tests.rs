//! Region integration tests: standalone logins, circuits, chat fan-out,
//! the capability surface and inter-region teleports, all in one process.

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use glam::Vec3;
    use uuid::Uuid;
    use veldt_region::config::RegionConfig;
    use veldt_region::evqueue::PollId;
    use veldt_region::grid::intersim;
    use veldt_region::grid::standalone::{LoginResult, StandaloneGrid};
    use veldt_region::grid::ChildAgentRequest;
    use veldt_region::llsd::Llsd;
    use veldt_region::protocol::*;
    use veldt_region::region::{CapsBody, CapsResponse, Region, RegionGroup};
    use veldt_region::scripting::stubvm::StubVmFactory;
    use veldt_region::session::SLOW_REMOVAL_TICKS;
    use veldt_region::types::{AgentFlags, RegionHandle};

    // -----------------------------------------------------------------------
    // Recording client hooks
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Rec {
        Chat(String),
        Handshake,
        MovementComplete,
        ObjectUpdate(u32, bool),
        Kill(Vec<u32>),
        TeleportProgress(String),
        TeleportFinish,
        TeleportFailed(String),
        LogoutReply,
        Alert(String),
        Disconnect,
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Rec>>>);

    impl Recorder {
        fn events(&self) -> Vec<Rec> {
            self.0.borrow().clone()
        }

        fn count(&self, f: impl Fn(&Rec) -> bool) -> usize {
            self.0.borrow().iter().filter(|r| f(r)).count()
        }
    }

    impl ClientHooks for Recorder {
        fn chat(&mut self, msg: &ChatFromSimulator) {
            self.0.borrow_mut().push(Rec::Chat(msg.message.clone()));
        }
        fn send_region_handshake(&mut self, _msg: &RegionHandshake) {
            self.0.borrow_mut().push(Rec::Handshake);
        }
        fn movement_complete(&mut self, _msg: &AgentMovementComplete) {
            self.0.borrow_mut().push(Rec::MovementComplete);
        }
        fn object_update(&mut self, msg: &ObjectUpdate) {
            self.0.borrow_mut().push(Rec::ObjectUpdate(msg.local_id, msg.is_full));
        }
        fn kill_objects(&mut self, msg: &KillObject) {
            self.0.borrow_mut().push(Rec::Kill(msg.local_ids.clone()));
        }
        fn teleport_progress(&mut self, msg: &TeleportProgress) {
            self.0.borrow_mut().push(Rec::TeleportProgress(msg.message.clone()));
        }
        fn teleport_finish(&mut self, _msg: &TeleportFinish) {
            self.0.borrow_mut().push(Rec::TeleportFinish);
        }
        fn teleport_failed(&mut self, msg: &TeleportFailed) {
            self.0.borrow_mut().push(Rec::TeleportFailed(msg.reason.clone()));
        }
        fn logout_reply(&mut self) {
            self.0.borrow_mut().push(Rec::LogoutReply);
        }
        fn alert_message(&mut self, msg: &str, _is_modal: bool) {
            self.0.borrow_mut().push(Rec::Alert(msg.to_string()));
        }
        fn disconnect(&mut self) {
            self.0.borrow_mut().push(Rec::Disconnect);
        }
    }

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        group: RegionGroup,
        backend: Rc<StandaloneGrid>,
    }

    fn region_config(name: &str, grid_x: u32) -> RegionConfig {
        let mut config = RegionConfig::default();
        config.region.name = name.to_string();
        config.region.grid_x = grid_x;
        config
    }

    fn make_harness() -> Harness {
        let config = region_config("Veldt One", 1000);
        let mut group = RegionGroup::new(config.clone());
        let backend = Rc::new(StandaloneGrid::new(group.task_queue()));
        group.set_backend(backend.clone());
        group.add_region(Region::new(&config, Arc::new(StubVmFactory)));
        Harness { group, backend }
    }

    fn add_second_region(h: &mut Harness) -> RegionHandle {
        let config = region_config("Veldt Two", 1001);
        h.group.add_region(Region::new(&config, Arc::new(StubVmFactory)));
        RegionHandle::from_grid(1001, 1000)
    }

    /// Login + circuit + complete movement; returns the login and recorder.
    fn connect_user(h: &mut Harness, first: &str, pos: Vec3) -> (LoginResult, Recorder) {
        let login = h
            .backend
            .login_to_simulator(&mut h.group, first, "Tester", pos)
            .expect("login succeeds");
        let recorder = Recorder::default();
        assert!(h.group.use_circuit_code(
            &UseCircuitCode {
                agent_id: login.user_id,
                session_id: login.session_id,
                circuit_code: login.circuit_code,
                seqno: 1,
            },
            Box::new(recorder.clone()),
        ));
        assert!(h.group.complete_agent_movement(&CompleteAgentMovement {
            agent_id: login.user_id,
            session_id: login.session_id,
            circuit_code: login.circuit_code,
        }));
        h.group.tick();
        (login, recorder)
    }

    // -----------------------------------------------------------------------
    // Login & enter
    // -----------------------------------------------------------------------

    #[test]
    fn login_circuit_and_entry() {
        let mut h = make_harness();
        let (login, rec) = connect_user(&mut h, "Ada", Vec3::new(128.0, 128.0, 30.0));

        let events = rec.events();
        assert!(events.contains(&Rec::Handshake));
        assert!(events.contains(&Rec::MovementComplete));
        // welcome message arrives as system chat
        assert!(rec.count(|r| matches!(r, Rec::Chat(m) if m.contains("Welcome"))) == 1);

        // the avatar body exists in the world under the agent id
        let region = &h.group.regions[0];
        let av = region.world.get(login.user_id).expect("avatar in world");
        assert!(av.is_avatar());
        assert!((av.world_pos - Vec3::new(128.0, 128.0, 30.0)).length() < 1e-4);

        // the avatar's own creation flows back as an object update
        assert!(rec.count(|r| matches!(r, Rec::ObjectUpdate(_, true))) >= 1);
    }

    #[test]
    fn duplicate_use_circuit_code_is_ignored() {
        let mut h = make_harness();
        let (login, rec) = connect_user(&mut h, "Bob", Vec3::new(10.0, 10.0, 30.0));

        // same packet again (same seqno): accepted but not re-processed
        assert!(h.group.use_circuit_code(
            &UseCircuitCode {
                agent_id: login.user_id,
                session_id: login.session_id,
                circuit_code: login.circuit_code,
                seqno: 1,
            },
            Box::new(Recorder::default()),
        ));
        assert_eq!(rec.count(|r| matches!(r, Rec::Handshake)), 1);
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    #[test]
    fn avatars_hear_each_other_within_range() {
        let mut h = make_harness();
        let (ada, ada_rec) = connect_user(&mut h, "Ada", Vec3::new(128.0, 128.0, 30.0));
        let (_bob, bob_rec) = connect_user(&mut h, "Bob", Vec3::new(133.0, 128.0, 30.0));

        h.group.chat_from_viewer(&ChatFromViewer {
            agent_id: ada.user_id,
            session_id: ada.session_id,
            message: "hello there".to_string(),
            chat_type: veldt_region::types::ChatType::Normal,
            channel: 0,
        });

        assert_eq!(bob_rec.count(|r| matches!(r, Rec::Chat(m) if m == "hello there")), 1);
        // the speaker does not hear an echo
        assert_eq!(ada_rec.count(|r| matches!(r, Rec::Chat(m) if m == "hello there")), 0);
    }

    // -----------------------------------------------------------------------
    // Capability surface
    // -----------------------------------------------------------------------

    #[test]
    fn seed_cap_lists_named_caps_and_unknown_tokens_404() {
        let mut h = make_harness();
        let (login, _rec) = connect_user(&mut h, "Cap", Vec3::new(50.0, 50.0, 30.0));

        let seed = h
            .group
            .session_mut(login.user_id)
            .and_then(|(_, s)| s.seed_cap.clone())
            .expect("seed cap minted");

        let mut wanted = Llsd::array();
        wanted.push(Llsd::String("EventQueueGet".to_string()));
        wanted.push(Llsd::String("ServerReleaseNotes".to_string()));
        let resp = h.group.handle_caps_request(
            &seed,
            "POST",
            CapsBody::Llsd(&wanted),
            PollId(1),
        );
        match resp {
            CapsResponse::Llsd(map) => {
                let url = map.get("EventQueueGet").expect("EventQueueGet granted");
                assert!(matches!(url, Llsd::Uri(u) if u.contains("/CAPS/")));
                assert!(map.get("ServerReleaseNotes").is_some());
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert!(matches!(
            h.group
                .handle_caps_path("/CAPS/doesnotexist/", "POST", CapsBody::Empty, PollId(2)),
            CapsResponse::Status(404)
        ));
    }

    #[test]
    fn event_queue_defers_then_resumes_and_replays_on_stale_ack() {
        let mut h = make_harness();
        let (login, _rec) = connect_user(&mut h, "Eve", Vec3::new(60.0, 60.0, 30.0));
        let eq_token = h
            .group
            .session_mut(login.user_id)
            .map(|(_, s)| s.named_caps["EventQueueGet"].clone())
            .unwrap();

        // empty queue: the poll parks
        let ack_body = Llsd::map();
        let resp = h
            .group
            .handle_caps_request(&eq_token, "POST", CapsBody::Llsd(&ack_body), PollId(7));
        assert!(matches!(resp, CapsResponse::Deferred));

        // an instant message resumes it
        assert!(intersim::handle_grid_instant_message(
            &mut h.group,
            &intersim::GridInstantMessage {
                from_agent: Uuid::new_v4(),
                to_agent: login.user_id,
                from_name: "Grid".to_string(),
                message: "psst".to_string(),
                dialog: 0,
            }
        ));
        let completions = h.group.take_poll_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, PollId(7));
        let first_body = match &completions[0].1 {
            CapsResponse::Llsd(llsd) => llsd.clone(),
            other => panic!("unexpected completion {:?}", other),
        };
        let id = first_body.get("id").and_then(|v| v.as_int()).unwrap();

        // a stale ack replays the same response verbatim
        let mut stale = Llsd::map();
        stale.insert("ack", Llsd::Int(id - 1));
        let resp = h
            .group
            .handle_caps_request(&eq_token, "POST", CapsBody::Llsd(&stale), PollId(8));
        match resp {
            CapsResponse::Llsd(replay) => assert_eq!(replay, first_body),
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn script_upload_handshake_compiles_and_reports() {
        let mut h = make_harness();
        let (login, _rec) = connect_user(&mut h, "Scripter", Vec3::new(70.0, 70.0, 30.0));

        // rez a prim and a script item to update
        let prim_id = {
            let region = &mut h.group.regions[0];
            let prim_id = region.world.insert(
                veldt_region::world::WorldObject::new_prim(
                    veldt_region::world::Prim {
                        owner: login.user_id,
                        ..Default::default()
                    },
                    Vec3::new(71.0, 70.0, 30.0),
                ),
            );
            region.rez_script(login.user_id, prim_id, "thing").unwrap();
            prim_id
        };
        h.group.tick();
        let item_id = h.group.regions[0]
            .world
            .get(prim_id)
            .unwrap()
            .as_prim()
            .unwrap()
            .inv
            .items[0]
            .item_id;

        let token = h
            .group
            .session_mut(login.user_id)
            .map(|(_, s)| s.named_caps["UpdateScriptTask"].clone())
            .unwrap();

        let mut req = Llsd::map();
        req.insert("item_id", Llsd::Uuid(item_id));
        req.insert("task_id", Llsd::Uuid(prim_id));
        req.insert("is_script_running", Llsd::Bool(true));
        let uploader_url = match h
            .group
            .handle_caps_request(&token, "POST", CapsBody::Llsd(&req), PollId(10))
        {
            CapsResponse::Llsd(resp) => match resp.get("uploader") {
                Some(Llsd::Uri(u)) => u.clone(),
                other => panic!("no uploader in {:?}", other),
            },
            other => panic!("unexpected stage-1 response {:?}", other),
        };

        // stage two: post the script source at the uploader
        let source = b"on touch_start\n  say 0 updated\n".to_vec();
        let resp = h.group.handle_caps_path(
            &uploader_url[uploader_url.find("/CAPS/").unwrap()..],
            "POST",
            CapsBody::Bytes(&source),
            PollId(11),
        );
        assert!(matches!(resp, CapsResponse::Deferred));

        // pump until the compile reply lands in the outbox
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut done = None;
        while std::time::Instant::now() < deadline && done.is_none() {
            std::thread::sleep(std::time::Duration::from_millis(10));
            h.group.tick();
            for (poll, resp) in h.group.take_poll_completions() {
                if poll == PollId(11) {
                    done = Some(resp);
                }
            }
        }
        match done.expect("compile reply arrived") {
            CapsResponse::Llsd(resp) => {
                assert_eq!(resp.get("state").and_then(|v| v.as_str()), Some("complete"));
                assert_eq!(resp.get("compiled").and_then(|v| v.as_bool()), Some(true));
            }
            other => panic!("unexpected compile reply {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Federation idempotence
    // -----------------------------------------------------------------------

    #[test]
    fn repeated_agent_post_updates_rather_than_duplicates() {
        let mut h = make_harness();
        let handle = RegionHandle::from_grid(1000, 1000);
        let req = ChildAgentRequest {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            secure_session_id: Uuid::new_v4(),
            circuit_code: 777,
            first_name: "Remote".to_string(),
            last_name: "Agent".to_string(),
            child_seed_cap: "seedcap".to_string(),
            destination_pos: Vec3::new(10.0, 10.0, 30.0),
            start_pos: Vec3::new(10.0, 10.0, 30.0),
        };
        assert!(intersim::handle_agent_post(&mut h.group, handle, &req));
        assert!(intersim::handle_agent_post(&mut h.group, handle, &req));
        assert_eq!(h.group.regions[0].sessions.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Teleports
    // -----------------------------------------------------------------------

    #[test]
    fn teleport_completes_between_local_regions() {
        let mut h = make_harness();
        let dest = add_second_region(&mut h);
        let (login, rec) = connect_user(&mut h, "Hopper", Vec3::new(128.0, 128.0, 30.0));

        h.group
            .teleport_to_location(login.user_id, dest, Vec3::new(60.0, 60.0, 30.0), Vec3::X);
        for _ in 0..8 {
            h.group.tick();
        }

        assert_eq!(rec.count(|r| matches!(r, Rec::TeleportFinish)), 1);
        assert!(rec.count(|r| matches!(r, Rec::TeleportProgress(_))) >= 2);

        // the destination now holds the incoming session
        let dest_region = h.group.regions.iter_mut().find(|r| r.handle == dest).unwrap();
        let dest_session = dest_region.sessions.get(&login.user_id).expect("child agent");
        assert!(dest_session.flags.contains(AgentFlags::INCOMING));

        // the origin session drains away via slow removal
        for _ in 0..(SLOW_REMOVAL_TICKS + 1) {
            h.group.slow_tick();
        }
        h.group.tick();
        assert!(h.group.regions[0].sessions.get(&login.user_id).is_none());
        assert_eq!(rec.count(|r| matches!(r, Rec::Disconnect)), 1);
    }

    #[test]
    fn cancel_between_post_and_put_reports_once_and_leaves_no_child() {
        let mut h = make_harness();
        let dest = add_second_region(&mut h);
        let (login, rec) = connect_user(&mut h, "Waverer", Vec3::new(128.0, 128.0, 30.0));

        h.group
            .teleport_to_location(login.user_id, dest, Vec3::new(60.0, 60.0, 30.0), Vec3::X);
        // resolve the destination (one task), which sends the child POST
        h.group.run_tasks();
        // cancel lands between the POST and the PUT
        h.group.cancel_teleport(login.user_id);
        for _ in 0..6 {
            h.group.tick();
        }

        assert_eq!(
            rec.count(|r| matches!(r, Rec::TeleportProgress(m) if m == "cancelled")),
            1,
            "exactly one cancelled progress: {:?}",
            rec.events()
        );
        assert_eq!(rec.count(|r| matches!(r, Rec::TeleportFinish)), 0);

        // no child agent survives on the destination
        let dest_region = h.group.regions.iter_mut().find(|r| r.handle == dest).unwrap();
        assert!(dest_region.sessions.get(&login.user_id).is_none());

        // the origin session is intact and can try again later
        assert!(h.group.regions[0].sessions.get(&login.user_id).is_some());
    }

    #[test]
    fn teleport_to_unknown_region_fails_cleanly() {
        let mut h = make_harness();
        let (login, rec) = connect_user(&mut h, "Lost", Vec3::new(128.0, 128.0, 30.0));

        h.group.teleport_to_location(
            login.user_id,
            RegionHandle::from_grid(4000, 4000),
            Vec3::ZERO,
            Vec3::X,
        );
        for _ in 0..4 {
            h.group.tick();
        }
        assert_eq!(rec.count(|r| matches!(r, Rec::TeleportFailed(_))), 1);
        // descriptor freed: a new attempt is allowed
        assert!(h
            .group
            .session_mut(login.user_id)
            .map(|(_, s)| s.teleport.is_none())
            .unwrap());
    }

    // -----------------------------------------------------------------------
    // Logout
    // -----------------------------------------------------------------------

    #[test]
    fn logout_removes_avatar_and_disconnects() {
        let mut h = make_harness();
        let (login, rec) = connect_user(&mut h, "Leaver", Vec3::new(128.0, 128.0, 30.0));

        h.group.logout_request(&LogoutRequest {
            agent_id: login.user_id,
            session_id: login.session_id,
        });
        h.group.tick();
        h.group.tick();

        assert_eq!(rec.count(|r| matches!(r, Rec::LogoutReply)), 1);
        assert_eq!(rec.count(|r| matches!(r, Rec::Disconnect)), 1);
        assert!(h.group.regions[0].world.get(login.user_id).is_none());
        assert!(h.group.regions[0].sessions.get(&login.user_id).is_none());
    }
}
