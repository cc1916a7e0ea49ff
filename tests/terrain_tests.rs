//! Terrain unit tests

#[cfg(test)]
mod tests {
    use veldt_region::terrain::{Terrain, TERRAIN_PATCHES};

    fn make_terrain() -> Terrain {
        Terrain::flat(21.0)
    }

    // -----------------------------------------------------------------------
    // Sampling
    // -----------------------------------------------------------------------

    #[test]
    fn height_is_deterministic() {
        let t = make_terrain();
        assert_eq!(t.height_at(10.0, 10.0), t.height_at(10.0, 10.0));
    }

    #[test]
    fn height_clamps_at_region_edges() {
        let t = make_terrain();
        assert_eq!(t.height_at(-5.0, 300.0), 21.0);
        assert_eq!(t.height_at(4096.0, -4096.0), 21.0);
    }

    #[test]
    fn bilinear_midpoint_between_edited_samples() {
        let mut t = Terrain::flat(0.0);
        t.set_sample(100, 100, 8.0);
        let h = t.height_at(99.5, 100.0);
        assert!((h - 4.0).abs() < 1e-5, "expected 4.0, got {}", h);
    }

    // -----------------------------------------------------------------------
    // Normals
    // -----------------------------------------------------------------------

    #[test]
    fn flat_terrain_normal_points_up() {
        let t = make_terrain();
        let n = t.normal_at(128.0, 128.0);
        assert!(n.z > 0.99, "normal should be vertical, got {:?}", n);
    }

    #[test]
    fn slope_tilts_the_normal() {
        let mut t = Terrain::flat(0.0);
        for x in 0..256usize {
            for y in 120..140usize {
                t.set_sample(x, y, y as f32);
            }
        }
        let n = t.normal_at(128.0, 130.0);
        assert!(n.y < -0.1, "normal should lean into the slope, got {:?}", n);
    }

    // -----------------------------------------------------------------------
    // Dirty patches
    // -----------------------------------------------------------------------

    #[test]
    fn edits_set_and_drain_patch_bits() {
        let mut t = Terrain::flat(0.0);
        t.set_sample(0, 0, 1.0);
        t.set_sample(255, 255, 1.0);
        let dirty = t.take_dirty();
        assert_eq!(dirty[0], 1);
        assert_eq!(dirty[TERRAIN_PATCHES - 1], 1 << (TERRAIN_PATCHES - 1));
        assert!(t.take_dirty().iter().all(|row| *row == 0));
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    #[test]
    fn from_heights_rejects_wrong_size() {
        assert!(Terrain::from_heights(vec![0.0; 100]).is_none());
        assert!(Terrain::from_heights(vec![0.0; 256 * 256]).is_some());
    }
}
