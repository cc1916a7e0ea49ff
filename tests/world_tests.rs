//! World model tests: octree placement, chat ranges, linking, deletion,
//! sitting.

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};
    use uuid::Uuid;
    use veldt_region::types::{ChatMessage, ChatSource, ChatType};
    use veldt_region::world::{ChatTarget, Prim, World, WorldError, WorldObject};

    fn make_world() -> World {
        World::new()
    }

    fn add_prim(world: &mut World, pos: Vec3) -> Uuid {
        world.insert(WorldObject::new_prim(Prim::default(), pos))
    }

    fn add_listener_prim(world: &mut World, pos: Vec3, channel: i32) -> Uuid {
        let id = add_prim(world, pos);
        world.add_listen(id, channel, ChatTarget::Script(id.as_u128() as u32));
        id
    }

    fn chat(pos: Vec3, chat_type: ChatType, channel: i32) -> ChatMessage {
        ChatMessage {
            channel,
            pos,
            source: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            source_type: ChatSource::Object,
            chat_type,
            name: "speaker".to_string(),
            msg: "hi".to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Octree placement
    // -----------------------------------------------------------------------

    #[test]
    fn insert_places_object_in_matching_leaf() {
        let mut world = make_world();
        let id = add_prim(&mut world, Vec3::new(33.0, 77.0, 130.0));
        let pos = world.get(id).unwrap().world_pos;
        assert!(world.octree_mut().leaf_contains(pos, id));
    }

    #[test]
    fn move_root_relocates_octree_entry() {
        let mut world = make_world();
        let id = add_prim(&mut world, Vec3::new(10.0, 10.0, 30.0));
        world.move_root(id, Vec3::new(200.0, 200.0, 30.0));
        assert!(world
            .octree_mut()
            .leaf_contains(Vec3::new(200.0, 200.0, 30.0), id));
        assert!(!world
            .octree_mut()
            .leaf_contains(Vec3::new(10.0, 10.0, 30.0), id));
    }

    #[test]
    fn local_id_lookup_round_trips() {
        let mut world = make_world();
        let id = add_prim(&mut world, Vec3::new(1.0, 2.0, 3.0));
        let local = world.get(id).unwrap().local_id;
        assert_ne!(local, 0);
        assert_eq!(world.by_local_id(local).unwrap().id, id);
    }

    // -----------------------------------------------------------------------
    // Chat ranges (shout 100 m, whisper 10 m)
    // -----------------------------------------------------------------------

    #[test]
    fn shout_reaches_100m_but_not_110m() {
        let mut world = make_world();
        let near = add_listener_prim(&mut world, Vec3::new(128.0, 128.0, 100.0), 0);
        let far = add_listener_prim(&mut world, Vec3::new(128.0, 128.0, 140.0), 0);

        let heard = world.send_chat(&chat(Vec3::new(128.0, 128.0, 30.0), ChatType::Shout, 0));
        let targets: Vec<ChatTarget> = heard.iter().map(|d| d.target).collect();
        assert!(targets.contains(&ChatTarget::Script(near.as_u128() as u32)));
        assert!(!targets.contains(&ChatTarget::Script(far.as_u128() as u32)));
    }

    #[test]
    fn whisper_is_10m() {
        let mut world = make_world();
        let at_9m = add_listener_prim(&mut world, Vec3::new(128.0, 137.0, 30.0), 0);
        let at_11m = add_listener_prim(&mut world, Vec3::new(128.0, 139.0, 30.0), 0);

        let heard = world.send_chat(&chat(Vec3::new(128.0, 128.0, 30.0), ChatType::Whisper, 0));
        let targets: Vec<ChatTarget> = heard.iter().map(|d| d.target).collect();
        assert!(targets.contains(&ChatTarget::Script(at_9m.as_u128() as u32)));
        assert!(!targets.contains(&ChatTarget::Script(at_11m.as_u128() as u32)));
    }

    #[test]
    fn channel_mask_prunes_other_channels() {
        let mut world = make_world();
        add_listener_prim(&mut world, Vec3::new(128.0, 128.0, 30.0), 42);
        let heard = world.send_chat(&chat(Vec3::new(128.0, 128.0, 30.0), ChatType::Normal, 0));
        assert!(heard.is_empty());
        assert!(world.octree().masks_consistent());
    }

    #[test]
    fn removing_listener_rebuilds_masks() {
        let mut world = make_world();
        let id = add_listener_prim(&mut world, Vec3::new(60.0, 60.0, 30.0), 7);
        world.remove_listen(id, 7, ChatTarget::Script(id.as_u128() as u32));
        assert!(world.octree().listeners_on(7).is_empty());
        assert!(world.octree().masks_consistent());
    }

    // -----------------------------------------------------------------------
    // Linking
    // -----------------------------------------------------------------------

    #[test]
    fn link_expresses_child_in_root_frame() {
        let mut world = make_world();
        let root = add_prim(&mut world, Vec3::new(100.0, 100.0, 30.0));
        let child = add_prim(&mut world, Vec3::new(102.0, 100.0, 30.0));

        // rotate the root 90° about Z first so the frame change is visible
        world.multi_update(root, None, Some(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2)), None, false);
        world.link_prim(root, child).unwrap();

        let child_obj = world.get(child).unwrap();
        assert_eq!(child_obj.parent, Some(root));
        // world position is preserved by the link
        assert!((child_obj.world_pos - Vec3::new(102.0, 100.0, 30.0)).length() < 1e-4);
        // and the local offset is the world offset rotated into the frame
        assert!((child_obj.local_pos - Vec3::new(0.0, -2.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn link_rejects_already_parented_child() {
        let mut world = make_world();
        let a = add_prim(&mut world, Vec3::new(10.0, 10.0, 30.0));
        let b = add_prim(&mut world, Vec3::new(12.0, 10.0, 30.0));
        let c = add_prim(&mut world, Vec3::new(14.0, 10.0, 30.0));
        world.link_prim(a, b).unwrap();
        assert!(matches!(
            world.link_prim(c, b),
            Err(WorldError::AlreadyParented)
        ));
    }

    #[test]
    fn link_numbers_address_root_and_children() {
        let mut world = make_world();
        let root = add_prim(&mut world, Vec3::new(10.0, 10.0, 30.0));
        let c1 = add_prim(&mut world, Vec3::new(11.0, 10.0, 30.0));
        let c2 = add_prim(&mut world, Vec3::new(12.0, 10.0, 30.0));
        world.link_prim(root, c1).unwrap();
        world.link_prim(root, c2).unwrap();

        assert_eq!(world.prim_by_link_id(root, 1), Some(root));
        assert_eq!(world.prim_by_link_id(root, 2), Some(c1));
        assert_eq!(world.prim_by_link_id(root, 3), Some(c2));
        assert_eq!(world.prim_by_link_id(root, 4), None);
        assert_eq!(world.root_prim_of(c2), root);
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    #[test]
    fn delete_prim_removes_whole_linkset() {
        let mut world = make_world();
        let root = add_prim(&mut world, Vec3::new(50.0, 50.0, 30.0));
        let child = add_prim(&mut world, Vec3::new(51.0, 50.0, 30.0));
        world.link_prim(root, child).unwrap();
        let child_local = world.get(child).unwrap().local_id;

        world.delete_prim(root);
        assert!(world.get(root).is_none());
        assert!(world.get(child).is_none());
        assert!(world.by_local_id(child_local).is_none());
    }

    // -----------------------------------------------------------------------
    // Sitting
    // -----------------------------------------------------------------------

    #[test]
    fn sit_targets_resolve_and_unsit_restores_root() {
        let mut world = make_world();
        let seat = add_prim(&mut world, Vec3::new(100.0, 100.0, 30.0));
        if let Some(prim) = world.get_mut(seat).and_then(|o| o.as_prim_mut()) {
            prim.sit_target = Vec3::new(0.0, 0.0, 1.0);
        }
        let av_uuid = Uuid::new_v4();
        let av = world.insert(WorldObject::new_avatar(av_uuid, Vec3::new(90.0, 90.0, 30.0)));

        let info = world.begin_sit(av, seat).expect("sit target resolves");
        assert_eq!(info.target, seat);
        assert!(world.complete_sit(av, &info));

        let seated = world.get(av).unwrap();
        assert_eq!(seated.parent, Some(seat));
        assert_eq!(
            world.get(seat).unwrap().as_prim().unwrap().seated_avatar,
            Some(av)
        );

        // a second avatar cannot take the same sit target
        let other = world.insert(WorldObject::new_avatar(Uuid::new_v4(), Vec3::new(91.0, 90.0, 30.0)));
        assert!(world.begin_sit(other, seat).is_none());

        world.unsit_avatar(av);
        let stood = world.get(av).unwrap();
        assert_eq!(stood.parent, None);
        assert!(world.get(seat).unwrap().as_prim().unwrap().seated_avatar.is_none());
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    #[test]
    fn attachment_occupies_slot_and_tracks_avatar() {
        let mut world = make_world();
        let av = world.insert(WorldObject::new_avatar(Uuid::new_v4(), Vec3::new(50.0, 50.0, 30.0)));

        let hat = WorldObject::new_prim(Prim::default(), Vec3::ZERO);
        let hat_id = world
            .add_attachment(av, hat, veldt_region::types::ATTACH_HEAD)
            .unwrap();

        let attached = world.get(hat_id).unwrap();
        assert_eq!(attached.parent, Some(av));
        assert_eq!(attached.as_prim().unwrap().attach_point, veldt_region::types::ATTACH_HEAD);
        // attachments sit at the avatar's position
        assert_eq!(attached.world_pos, Vec3::new(50.0, 50.0, 30.0));

        // replacing the slot deletes the old attachment
        let hat2 = WorldObject::new_prim(Prim::default(), Vec3::ZERO);
        let hat2_id = world
            .add_attachment(av, hat2, veldt_region::types::ATTACH_HEAD)
            .unwrap();
        assert!(world.get(hat_id).is_none());
        let slots = world.get(av).unwrap().as_avatar().unwrap().attachments;
        assert_eq!(slots[veldt_region::types::ATTACH_HEAD as usize], Some(hat2_id));
    }
}
