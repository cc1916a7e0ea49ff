//! Session tests: throttles, animations, lifecycle flags, update
//! bookkeeping.

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use uuid::Uuid;
    use veldt_region::session::{
        anims, AnimKind, AnimationDesc, NewUserInfo, UserSession, THROTTLE_INIT_RATE,
    };
    use veldt_region::types::{AgentFlags, ObjUpd, NUM_THROTTLES};

    fn make_session() -> UserSession {
        let info = NewUserInfo {
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            secure_session_id: Uuid::new_v4(),
            circuit_code: 12345,
            first_name: "Test".to_string(),
            last_name: "Agent".to_string(),
            is_child: false,
            start_pos: Vec3::new(128.0, 128.0, 30.0),
            start_look_at: Vec3::X,
            ..Default::default()
        };
        UserSession::new(&info, 1, 0.0)
    }

    // -----------------------------------------------------------------------
    // Throttles
    // -----------------------------------------------------------------------

    #[test]
    fn throttle_levels_cap_at_point_three_seconds() {
        let mut s = make_session();
        // ten seconds of refill cannot exceed 0.3s worth of rate
        s.update_throttles(10.0);
        for throttle in &s.throttles {
            assert!((throttle.level - THROTTLE_INIT_RATE * 0.3).abs() < 1e-3);
        }
    }

    #[test]
    fn consume_debits_the_reservoir() {
        let mut s = make_session();
        s.update_throttles(10.0);
        let t = &mut s.throttles[4];
        let level = t.level;
        assert!(t.consume(1000));
        assert!((t.level - (level - 1000.0)).abs() < 1e-3);
        // draining below zero is refused
        assert!(!t.consume(usize::MAX));
    }

    #[test]
    fn throttle_block_round_trips_and_scales_by_8() {
        let mut s = make_session();
        let mut block = Vec::new();
        for i in 0..NUM_THROTTLES {
            block.extend_from_slice(&(8000.0f32 * (i as f32 + 1.0)).to_le_bytes());
        }
        s.set_throttles_block(&block, 1.0);
        assert!((s.throttles[0].rate - 1000.0).abs() < 1e-3);
        assert!((s.throttles[6].rate - 7000.0).abs() < 1e-3);

        let out = s.throttles_block();
        assert_eq!(out.len(), NUM_THROTTLES * 4);
        let first = f32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert!((first - 8000.0).abs() < 1e-3);
    }

    #[test]
    fn short_throttle_block_is_ignored() {
        let mut s = make_session();
        let before = s.throttles[0].rate;
        s.set_throttles_block(&[0u8; 10], 1.0);
        assert_eq!(s.throttles[0].rate, before);
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    #[test]
    fn liveness_window_is_15s_or_90s_paused() {
        let mut s = make_session();
        s.reset_timeout(100.0);
        assert!(!s.timed_out(114.0));
        assert!(s.timed_out(116.0));
        s.flags |= AgentFlags::PAUSED;
        assert!(!s.timed_out(116.0));
        assert!(s.timed_out(191.0));
    }

    #[test]
    fn circuit_seqno_dedup() {
        let mut s = make_session();
        assert!(s.note_circuit_seqno(1));
        assert!(!s.note_circuit_seqno(1));
        assert!(s.note_circuit_seqno(2));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn full_agent_transition_requires_incoming() {
        let mut s = make_session();
        assert!(s.flags.contains(AgentFlags::INCOMING));
        assert!(s.begin_full_agent());
        assert!(s.flags.contains(AgentFlags::ENTERED));
        assert!(!s.is_child());

        let mut not_incoming = make_session();
        not_incoming.flags.remove(AgentFlags::INCOMING);
        assert!(!not_incoming.begin_full_agent());
    }

    #[test]
    fn slow_removal_counts_down_to_purge() {
        let mut s = make_session();
        s.begin_close(true);
        assert!(s.flags.contains(AgentFlags::IN_SLOW_REMOVAL));
        assert!(!s.flags.contains(AgentFlags::PURGE));
        let mut ticks = 0;
        while !s.tick_slow_removal() {
            ticks += 1;
            assert!(ticks < 10, "countdown never finished");
        }
        assert!(s.flags.contains(AgentFlags::PURGE));
    }

    // -----------------------------------------------------------------------
    // Animations
    // -----------------------------------------------------------------------

    #[test]
    fn animations_stack_and_clear() {
        let mut s = make_session();
        let walk = AnimationDesc {
            anim: anims::WALK,
            obj: Uuid::nil(),
            sequence: s.next_anim_seq(),
            kind: AnimKind::Normal,
        };
        s.add_animation(walk, false);
        assert_eq!(s.anims.len(), 1);
        assert!(s.flags.contains(AgentFlags::ANIM_UPDATE));

        // duplicates merge rather than stack
        s.add_animation(walk, false);
        assert_eq!(s.anims.len(), 1);

        s.clear_animation_by_id(anims::WALK);
        assert!(s.anims.is_empty());
    }

    // -----------------------------------------------------------------------
    // Object-update bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn deleted_objects_drop_pending_updates() {
        let mut s = make_session();
        s.mark_update(42, ObjUpd::POSROT);
        s.mark_update(43, ObjUpd::CREATED);
        s.mark_deleted(42);

        let deletions = s.take_deletions();
        assert_eq!(deletions, vec![42]);
        let updates = s.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 43);
    }

    #[test]
    fn creates_sort_before_plain_updates() {
        let mut s = make_session();
        s.mark_update(1, ObjUpd::POSROT);
        s.mark_update(2, ObjUpd::CREATED);
        s.mark_update(3, ObjUpd::SCALE);
        let updates = s.take_updates();
        assert!(updates[0].1.contains(ObjUpd::CREATED));
    }
}
