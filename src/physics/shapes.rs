//! Collision-shape construction from prim shape parameters.
//!
//! Convex shapes with no twist, hollow or profile cut become explicit convex
//! hulls: the profile polygon (square, triangle, 8-gon circle) swept from
//! bottom to top with taper, shear and path begin/end applied. Perfect
//! axis-aligned boxes, cylinders and spheres use the engine's native
//! primitives. Anything else degrades to its bounding box with a warning.

use glam::{Quat, Vec3};
use log::warn;
use rapier3d::na;
use rapier3d::prelude::*;

use crate::world::prim::{
    PrimShape, PATH_CURVE_MASK, PATH_CURVE_STRAIGHT, PROFILE_SHAPE_CIRCLE, PROFILE_SHAPE_EQUIL_TRI,
    PROFILE_SHAPE_MASK, PROFILE_SHAPE_SEMICIRC, PROFILE_SHAPE_SQUARE,
};

// ---------------------------------------------------------------------------
// Shape snapshots
// ---------------------------------------------------------------------------

/// One rigid part of a tracked object.
#[derive(Debug, Clone)]
pub enum PartShape {
    /// The avatar capsule: radius and cylindrical half-height are fixed.
    Avatar,
    Prim { shape: PrimShape, size: Vec3 },
}

#[derive(Debug, Clone)]
pub struct ChildPart {
    pub shape: PartShape,
    pub local_pos: Vec3,
    pub rot: Quat,
}

/// Snapshot of everything the worker needs to build a body's collision
/// shape: the root part plus one transformed part per linkset child.
#[derive(Debug, Clone)]
pub struct ShapeDesc {
    pub root: PartShape,
    pub children: Vec<ChildPart>,
}

impl ShapeDesc {
    pub fn avatar() -> Self {
        Self {
            root: PartShape::Avatar,
            children: Vec::new(),
        }
    }

    /// Build the engine shape. Linksets become compounds with one child
    /// transform per member prim.
    pub fn build(&self) -> SharedShape {
        let root = build_part(&self.root);
        if self.children.is_empty() {
            return root;
        }
        let mut parts = vec![(Isometry::identity(), root)];
        for child in &self.children {
            parts.push((to_iso(child.local_pos, child.rot), build_part(&child.shape)));
        }
        SharedShape::compound(parts)
    }
}

fn to_iso(pos: Vec3, rot: Quat) -> Isometry<Real> {
    Isometry::from_parts(
        na::Translation3::new(pos.x, pos.y, pos.z),
        na::UnitQuaternion::from_quaternion(na::Quaternion::new(rot.w, rot.x, rot.y, rot.z)),
    )
}

// ---------------------------------------------------------------------------
// Per-part construction
// ---------------------------------------------------------------------------

const SQUARE_PROFILE: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];
const EQUIL_TRI_PROFILE: [[f32; 2]; 3] =
    [[1.0, 0.0], [-0.732_050_8, -1.0], [-0.732_050_8, 1.0]];
const CIRCLE_PROFILE_8: [[f32; 2]; 8] = [
    [0.0, 1.0],
    [0.707_107, 0.707_107],
    [1.0, 0.0],
    [0.707_107, -0.707_107],
    [0.0, -1.0],
    [-0.707_107, -0.707_107],
    [-1.0, 0.0],
    [-0.707_107, 0.707_107],
];

fn bounding_box(size: Vec3) -> SharedShape {
    SharedShape::cuboid(size.x / 2.0, size.y / 2.0, size.z / 2.0)
}

/// Vertical cylinder; the engine's native cylinder is y-aligned, so it gets
/// a rotated compound wrapper.
fn upright_cylinder(half_height: f32, radius: f32) -> SharedShape {
    let rot = na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), std::f32::consts::FRAC_PI_2);
    SharedShape::compound(vec![(
        Isometry::from_parts(na::Translation3::identity(), rot),
        SharedShape::cylinder(half_height, radius),
    )])
}

fn build_part(part: &PartShape) -> SharedShape {
    match part {
        PartShape::Avatar => {
            SharedShape::capsule(point![0.0, 0.0, -0.625], point![0.0, 0.0, 0.625], 0.25)
        }
        PartShape::Prim { shape, size } => build_prim_shape(shape, *size),
    }
}

fn build_prim_shape(shape: &PrimShape, size: Vec3) -> SharedShape {
    let straight = shape.path_curve & PATH_CURVE_MASK == PATH_CURVE_STRAIGHT;
    let profile = shape.profile_curve & PROFILE_SHAPE_MASK;
    let plain_path = shape.path_scale_x == 100
        && shape.path_scale_y == 100
        && shape.path_shear_x == 0
        && shape.path_shear_y == 0
        && shape.path_begin == 0
        && shape.path_end == 0;

    if straight && shape.is_solid_profile() {
        if profile == PROFILE_SHAPE_SQUARE && plain_path {
            return bounding_box(size);
        }
        if profile == PROFILE_SHAPE_CIRCLE && plain_path && size.x == size.y {
            return upright_cylinder(size.z / 2.0, size.x / 2.0);
        }
        let points = match profile {
            PROFILE_SHAPE_SQUARE => &SQUARE_PROFILE[..],
            PROFILE_SHAPE_EQUIL_TRI => &EQUIL_TRI_PROFILE[..],
            PROFILE_SHAPE_CIRCLE => &CIRCLE_PROFILE_8[..],
            other => {
                warn!("unhandled profile shape {} in hull path", other);
                &SQUARE_PROFILE[..]
            }
        };
        return swept_hull(shape, size, points);
    }

    if !straight && profile == PROFILE_SHAPE_SEMICIRC && shape.is_solid_profile()
        && shape.path_begin == 0
        && shape.path_end == 0
    {
        if size.x == size.y && size.x == size.z {
            return SharedShape::ball(size.x / 2.0);
        }
        warn!("spheroidal prim approximated by its bounding box");
        return bounding_box(size);
    }

    // torus/tube/ring and anything cut or twisted
    warn!("unhandled prim shape in physics, using bounding box");
    bounding_box(size)
}

/// Sweep a profile polygon from the bottom face to the top face, applying
/// taper (path scale), top shear and path begin/end.
fn swept_hull(shape: &PrimShape, size: Vec3, profile: &[[f32; 2]]) -> SharedShape {
    let x = size.x / 2.0;
    let y = size.y / 2.0;
    let z = size.z / 2.0;
    let mut z_top = z;
    let mut z_bottom = -z;
    let (mut x_top, mut y_top, mut x_bottom, mut y_bottom) = (x, y, x, y);

    if shape.path_scale_x <= 100 {
        x_bottom *= shape.path_scale_x as f32 / 100.0;
    } else if shape.path_scale_x <= 200 {
        x_top *= (200 - shape.path_scale_x as i32) as f32 / 100.0;
    }
    if shape.path_scale_y <= 100 {
        y_bottom *= shape.path_scale_y as f32 / 100.0;
    } else if shape.path_scale_y <= 200 {
        y_top *= (200 - shape.path_scale_y as i32) as f32 / 100.0;
    }

    let x_shear = shape.path_shear_x as f32 / 50.0 * x;
    let y_shear = shape.path_shear_y as f32 / 50.0 * y;

    if shape.path_begin != 0 || shape.path_end != 0 {
        let begin = shape.path_begin as f32 / 50000.0;
        let end = shape.path_end as f32 / 50000.0;
        z_bottom += 2.0 * z * begin;
        z_top -= 2.0 * z * end;

        let new_top = x_top + (x_bottom - x_top) * end;
        let new_bottom = x_bottom + (x_top - x_bottom) * begin;
        x_top = new_top;
        x_bottom = new_bottom;

        let new_top = y_top + (y_bottom - y_top) * end;
        let new_bottom = y_bottom + (y_top - y_bottom) * begin;
        y_top = new_top;
        y_bottom = new_bottom;
    }

    let mut points = Vec::with_capacity(profile.len() * 2);
    for p in profile {
        points.push(point![p[0] * x_bottom, p[1] * y_bottom, z_bottom]);
        points.push(point![x_shear + p[0] * x_top, y_shear + p[1] * y_top, z_top]);
    }

    match SharedShape::convex_hull(&points) {
        Some(hull) => hull,
        None => {
            warn!("convex hull construction failed, using bounding box");
            bounding_box(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_cube_is_native_cuboid() {
        let desc = ShapeDesc {
            root: PartShape::Prim {
                shape: PrimShape::default(),
                size: Vec3::new(2.0, 2.0, 2.0),
            },
            children: Vec::new(),
        };
        let shape = desc.build();
        assert!(shape.as_cuboid().is_some());
    }

    #[test]
    fn tapered_box_becomes_hull() {
        let mut shape = PrimShape::default();
        shape.path_scale_x = 50;
        let desc = ShapeDesc {
            root: PartShape::Prim { shape, size: Vec3::ONE },
            children: Vec::new(),
        };
        assert!(desc.build().as_convex_polyhedron().is_some());
    }

    #[test]
    fn linkset_builds_compound() {
        let desc = ShapeDesc {
            root: PartShape::Prim {
                shape: PrimShape::default(),
                size: Vec3::ONE,
            },
            children: vec![ChildPart {
                shape: PartShape::Prim {
                    shape: PrimShape::default(),
                    size: Vec3::ONE,
                },
                local_pos: Vec3::new(0.0, 0.0, 1.0),
                rot: Quat::IDENTITY,
            }],
        };
        assert!(desc.build().as_compound().is_some());
    }
}
