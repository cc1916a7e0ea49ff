//! Prim shape-parameter batching: validation, quantization and the
//! one-composite-update rule.

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use veldt_region::types::ObjUpd;
    use veldt_region::world::{Prim, PrimType, World, WorldEvent, WorldObject};

    fn world_with_prim() -> (World, uuid::Uuid) {
        let mut world = World::new();
        let id = world.insert(WorldObject::new_prim(Prim::default(), Vec3::new(10.0, 10.0, 30.0)));
        world.take_events(); // drop the creation event
        (world, id)
    }

    // -----------------------------------------------------------------------
    // Quantization
    // -----------------------------------------------------------------------

    #[test]
    fn twist_quantizes_to_hundredths() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_twist(-1.0, 0.5).unwrap();
        }
        let shape = &world.get(id).unwrap().as_prim().unwrap().shape;
        assert_eq!(shape.path_twist_begin, -100);
        assert_eq!(shape.path_twist, 50);
    }

    #[test]
    fn twist_clamps_out_of_range_input() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_twist(5.0, f32::NAN).unwrap();
        }
        let shape = &world.get(id).unwrap().as_prim().unwrap().shape;
        assert_eq!(shape.path_twist_begin, 100);
        assert_eq!(shape.path_twist, 0);
    }

    #[test]
    fn hollow_and_profile_cut_scale_by_50000() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_hollow(0.5).unwrap();
            ctx.set_profile_cut(0.25, 0.75).unwrap();
        }
        let shape = &world.get(id).unwrap().as_prim().unwrap().shape;
        assert_eq!(shape.profile_hollow, 25000);
        assert_eq!(shape.profile_begin, 12500);
        // end stores the complement
        assert_eq!(shape.profile_end, 12500);
    }

    #[test]
    fn taper_encodes_two_minus_size() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_taper(0.5, 2.0, 0.25, -0.5).unwrap();
        }
        let shape = &world.get(id).unwrap().as_prim().unwrap().shape;
        assert_eq!(shape.path_scale_x, 150);
        assert_eq!(shape.path_scale_y, 0);
        assert_eq!(shape.path_shear_x, 25);
        assert_eq!(shape.path_shear_y, -50);
    }

    // -----------------------------------------------------------------------
    // Composite update emission
    // -----------------------------------------------------------------------

    #[test]
    fn batched_edits_emit_exactly_one_update() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_shape(PrimType::Cylinder, 0).unwrap();
            ctx.set_twist(0.1, 0.1).unwrap();
            ctx.set_hollow(0.2).unwrap();
            ctx.set_material(veldt_region::types::MATERIAL_GLASS).unwrap();
        }
        let events = world.take_events();
        assert_eq!(events.len(), 1, "expected one composite update");
        match &events[0] {
            WorldEvent::Updated { flags, .. } => {
                assert!(flags.contains(ObjUpd::SHAPE));
                assert!(flags.contains(ObjUpd::MATERIAL));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn light_params_land_in_extra_params() {
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_point_light(Vec3::new(1.0, 0.5, 0.0), 1.0, 10.0, 0.75)
                .unwrap();
        }
        let prim = world.get(id).unwrap().as_prim().unwrap();
        let payload = prim
            .extra_params
            .get(veldt_region::world::prim::EXTRA_PARAM_LIGHT)
            .expect("light entry present");
        assert_eq!(payload.len(), 16);
        assert_eq!(payload[0], 255);
        assert_eq!(payload[1], 127);
        assert_eq!(payload[2], 0);

        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.remove_light().unwrap();
        }
        let prim = world.get(id).unwrap().as_prim().unwrap();
        assert!(prim
            .extra_params
            .get(veldt_region::world::prim::EXTRA_PARAM_LIGHT)
            .is_none());
    }

    #[test]
    fn shape_selector_sets_curves() {
        use veldt_region::world::prim::{PATH_CURVE_CIRCLE, PROFILE_SHAPE_CIRCLE};
        let (mut world, id) = world_with_prim();
        {
            let mut ctx = world.prim_params(id).unwrap();
            ctx.set_shape(PrimType::Torus, 0).unwrap();
        }
        let shape = &world.get(id).unwrap().as_prim().unwrap().shape;
        assert_eq!(shape.profile_curve & 0x0f, PROFILE_SHAPE_CIRCLE);
        assert_eq!(shape.path_curve, PATH_CURVE_CIRCLE);
    }
}
