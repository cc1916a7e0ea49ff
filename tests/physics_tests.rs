//! Physics bridge tests: gravity, categories, collisions, avatar
//! grounding. These drive the real worker thread in short real-time runs.

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use glam::Vec3;
    use uuid::Uuid;
    use veldt_region::physics::PhysicsBridge;
    use veldt_region::terrain::Terrain;
    use veldt_region::types::{ObjUpd, PrimFlags};
    use veldt_region::world::{Prim, World, WorldObject};

    fn physical_prim() -> Prim {
        Prim {
            flags: PrimFlags::PHYSICAL,
            ..Prim::default()
        }
    }

    fn track_new_object(bridge: &mut PhysicsBridge, world: &World, id: Uuid) {
        let obj = world.get(id).expect("object exists");
        bridge.upd_object(world, obj, ObjUpd::CREATED);
    }

    // -----------------------------------------------------------------------
    // Free fall
    // -----------------------------------------------------------------------

    #[test]
    fn dropped_cube_tracks_ballistic_height() {
        let terrain = Terrain::flat(0.0);
        let mut bridge = PhysicsBridge::spawn(&terrain);
        let mut world = World::new();

        let id = world.insert(WorldObject::new_prim(
            physical_prim(),
            Vec3::new(128.0, 128.0, 50.0),
        ));
        world.take_events();
        let started = Instant::now();
        track_new_object(&mut bridge, &world, id);

        std::thread::sleep(Duration::from_secs(1));
        bridge.pump(&mut world);
        let elapsed = started.elapsed().as_secs_f32();
        let z = world.get(id).unwrap().world_pos.z;

        let expected = 50.0 - 0.5 * 9.8 * elapsed * elapsed;
        let tolerance = 0.05 * 50.0;
        assert!(
            (z - expected).abs() < tolerance,
            "after {:.2}s expected z≈{:.2}, got {:.2}",
            elapsed,
            expected,
            z
        );
        bridge.shutdown();
    }

    #[test]
    fn static_prim_does_not_fall() {
        let terrain = Terrain::flat(0.0);
        let mut bridge = PhysicsBridge::spawn(&terrain);
        let mut world = World::new();

        let id = world.insert(WorldObject::new_prim(Prim::default(), Vec3::new(50.0, 50.0, 30.0)));
        world.take_events();
        track_new_object(&mut bridge, &world, id);

        std::thread::sleep(Duration::from_millis(500));
        bridge.pump(&mut world);
        assert_eq!(world.get(id).unwrap().world_pos.z, 30.0);
        bridge.shutdown();
    }

    // -----------------------------------------------------------------------
    // Collisions
    // -----------------------------------------------------------------------

    #[test]
    fn falling_cube_collides_with_static_support() {
        let terrain = Terrain::flat(0.0);
        let mut bridge = PhysicsBridge::spawn(&terrain);
        let mut world = World::new();

        let mut support = WorldObject::new_prim(Prim::default(), Vec3::new(128.0, 128.0, 2.0));
        support.scale = Vec3::new(10.0, 10.0, 2.0);
        let support_id = world.insert(support);

        let cube_id = world.insert(WorldObject::new_prim(
            physical_prim(),
            Vec3::new(128.0, 128.0, 6.0),
        ));
        world.take_events();
        track_new_object(&mut bridge, &world, support_id);
        track_new_object(&mut bridge, &world, cube_id);

        let support_local = world.get(support_id).unwrap().local_id;
        let cube_local = world.get(cube_id).unwrap().local_id;

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut saw_contact = false;
        while Instant::now() < deadline && !saw_contact {
            std::thread::sleep(Duration::from_millis(50));
            for batch in bridge.pump(&mut world) {
                if batch.iter().any(|pair| {
                    (pair.collidee == cube_local && pair.collider == support_local)
                        || (pair.collidee == support_local && pair.collider == cube_local)
                }) {
                    saw_contact = true;
                }
            }
        }
        assert!(saw_contact, "cube never contacted its support");

        // and the cube rests on top instead of tunnelling through
        let z = world.get(cube_id).unwrap().world_pos.z;
        assert!(z > 2.0, "cube fell through the support, z={}", z);
        bridge.shutdown();
    }

    // -----------------------------------------------------------------------
    // Avatars
    // -----------------------------------------------------------------------

    #[test]
    fn avatar_lands_and_reports_grounding() {
        let terrain = Terrain::flat(10.0);
        let mut bridge = PhysicsBridge::spawn(&terrain);
        let mut world = World::new();

        let av_id = world.insert(WorldObject::new_avatar(
            Uuid::new_v4(),
            Vec3::new(128.0, 128.0, 13.0),
        ));
        world.take_events();
        track_new_object(&mut bridge, &world, av_id);
        let av_local = world.get(av_id).unwrap().local_id;

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut grounded = false;
        while Instant::now() < deadline && !grounded {
            std::thread::sleep(Duration::from_millis(50));
            bridge.pump(&mut world);
            grounded = bridge.grounded_ticks(av_local) > 0;
        }
        assert!(grounded, "avatar never grounded");

        // footfall plane is roughly horizontal at terrain height
        let av = world.get(av_id).unwrap().as_avatar().unwrap();
        assert!(av.footfall.z > 0.9, "footfall normal {:?}", av.footfall);
        bridge.shutdown();
    }

    #[test]
    fn flying_avatar_ignores_gravity() {
        let terrain = Terrain::flat(0.0);
        let mut bridge = PhysicsBridge::spawn(&terrain);
        let mut world = World::new();

        let av_id = world.insert(WorldObject::new_avatar(
            Uuid::new_v4(),
            Vec3::new(128.0, 128.0, 40.0),
        ));
        world.take_events();
        track_new_object(&mut bridge, &world, av_id);
        let av_local = world.get(av_id).unwrap().local_id;
        bridge.set_avatar_flying(av_local, true);

        std::thread::sleep(Duration::from_millis(700));
        bridge.pump(&mut world);
        let z = world.get(av_id).unwrap().world_pos.z;
        assert!(
            (z - 40.0).abs() < 2.0,
            "flying avatar should hold altitude, z={}",
            z
        );
        bridge.shutdown();
    }
}
