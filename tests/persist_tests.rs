//! Persisted-state round trips through the v3 record schema.

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};
    use uuid::Uuid;
    use veldt_region::inventory::InventoryItem;
    use veldt_region::persist::{dump_world, load_world};
    use veldt_region::types::{Perms, PrimFlags, ASSET_NOTECARD, INV_TYPE_NOTECARD};
    use veldt_region::world::{Prim, World, WorldObject};

    fn elaborate_prim() -> Prim {
        let mut prim = Prim {
            name: "Test chair".to_string(),
            description: "four legs, one seat".to_string(),
            material: veldt_region::types::MATERIAL_METAL,
            hover_text: "sit here".to_string(),
            text_color: [10, 20, 30, 255],
            sale_price: 42,
            sale_type: 1,
            creation_date: 1234567890,
            creator: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            sit_name: "Sit".to_string(),
            touch_name: "Poke".to_string(),
            tex_entry: vec![1, 2, 3, 4, 5],
            flags: PrimFlags::PHYSICAL | PrimFlags::TOUCH,
            perms: Perms {
                base: 0x7fffffff,
                current: 0x0008c000,
                group: 0,
                everyone: 0x8000,
                next: 0x0008e000,
            },
            ..Prim::default()
        };
        prim.shape.path_twist = -42;
        prim.shape.path_scale_x = 150;
        prim.shape.profile_hollow = 25000;
        assert!(prim.extra_params.set(0x23, &[7u8; 16]));
        prim
    }

    fn notecard_item(owner: Uuid) -> InventoryItem {
        InventoryItem {
            name: "Readme".to_string(),
            description: "hello".to_string(),
            item_id: Uuid::new_v4(),
            folder_id: Uuid::new_v4(),
            owner_id: owner,
            creator_id: owner.to_string(),
            creator_as_uuid: owner,
            asset_id: Uuid::new_v4(),
            asset_type: ASSET_NOTECARD,
            inv_type: INV_TYPE_NOTECARD,
            sale_price: 5,
            creation_date: 1234500000,
            flags: 0x10,
            embedded_asset: Some(veldt_region::assets::SimpleAsset {
                name: "Readme".to_string(),
                description: String::new(),
                asset_type: ASSET_NOTECARD,
                id: Uuid::new_v4(),
                data: b"note body".to_vec(),
            }),
            ..InventoryItem::default()
        }
    }

    // -----------------------------------------------------------------------
    // Round trip
    // -----------------------------------------------------------------------

    #[test]
    fn linkset_with_inventory_round_trips() {
        let dir = tempfile::tempdir().unwrap();

        let mut world = World::new();
        let mut prim = elaborate_prim();
        let owner = prim.owner;
        prim.inv.items.push(notecard_item(owner));
        prim.inv.serial = 7;

        let mut root = WorldObject::new_prim(prim, Vec3::new(100.0, 90.0, 31.0));
        root.scale = Vec3::new(2.0, 3.0, 0.5);
        root.velocity = Vec3::new(0.0, 0.0, -1.0);
        root.rot = Quat::from_rotation_z(0.5).normalize();
        let root_id = world.insert(root);

        let child = WorldObject::new_prim(
            Prim {
                name: "Leg".to_string(),
                ..Prim::default()
            },
            Vec3::new(101.0, 90.0, 31.0),
        );
        let child_id = world.insert(child);
        world.link_prim(root_id, child_id).unwrap();

        dump_world(&world, dir.path(), "test").unwrap();

        let mut reloaded = World::new();
        let count = load_world(&mut reloaded, dir.path(), "test").unwrap();
        assert_eq!(count, 2);

        let root_back = reloaded.get(root_id).expect("root survives by id");
        let prim_back = root_back.as_prim().unwrap();
        assert_eq!(prim_back.name, "Test chair");
        assert_eq!(prim_back.description, "four legs, one seat");
        assert_eq!(prim_back.hover_text, "sit here");
        assert_eq!(prim_back.text_color, [10, 20, 30, 255]);
        assert_eq!(prim_back.sale_price, 42);
        assert_eq!(prim_back.creation_date, 1234567890);
        assert_eq!(prim_back.sit_name, "Sit");
        assert_eq!(prim_back.touch_name, "Poke");
        assert_eq!(prim_back.tex_entry, vec![1, 2, 3, 4, 5]);
        assert_eq!(prim_back.flags, PrimFlags::PHYSICAL | PrimFlags::TOUCH);
        assert_eq!(prim_back.perms.current, 0x0008c000);
        assert_eq!(prim_back.perms.next, 0x0008e000);
        assert_eq!(prim_back.shape.path_twist, -42);
        assert_eq!(prim_back.shape.path_scale_x, 150);
        assert_eq!(prim_back.shape.profile_hollow, 25000);
        assert_eq!(prim_back.extra_params.get(0x23), Some(&[7u8; 16][..]));
        assert_eq!(prim_back.inv.serial, 7);
        assert_eq!(prim_back.children, vec![child_id]);

        let obj = reloaded.get(root_id).unwrap();
        assert!((obj.local_pos - Vec3::new(100.0, 90.0, 31.0)).length() < 1e-6);
        assert_eq!(obj.scale, Vec3::new(2.0, 3.0, 0.5));
        assert_eq!(obj.velocity, Vec3::new(0.0, 0.0, -1.0));

        let item = &prim_back.inv.items[0];
        assert_eq!(item.name, "Readme");
        assert_eq!(item.sale_price, 5);
        assert_eq!(item.flags, 0x10);
        let asset = item.embedded_asset.as_ref().expect("nested asset survives");
        assert_eq!(asset.data, b"note body");
        assert_eq!(asset.asset_type, ASSET_NOTECARD);

        let child_back = reloaded.get(child_id).expect("child survives");
        assert_eq!(child_back.parent, Some(root_id));
        assert_eq!(child_back.as_prim().unwrap().name, "Leg");
    }

    #[test]
    fn missing_state_file_is_an_empty_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new();
        assert_eq!(load_world(&mut world, dir.path(), "nothing").unwrap(), 0);
        assert_eq!(world.object_count(), 0);
    }

    #[test]
    fn garbage_file_is_rejected_loudly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("simstate-bad.dat"), b"this is not a state file").unwrap();
        let mut world = World::new();
        assert!(load_world(&mut world, dir.path(), "bad").is_err());
    }

    #[test]
    fn dump_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new();
        world.insert(WorldObject::new_prim(Prim::default(), Vec3::new(1.0, 2.0, 3.0)));
        dump_world(&world, dir.path(), "atomic").unwrap();
        dump_world(&world, dir.path(), "atomic").unwrap();
        // no stale .new file left behind
        assert!(!dir.path().join("simstate-atomic.dat.new").exists());
        assert!(dir.path().join("simstate-atomic.dat").exists());
    }
}
