use super::{
    geometric_tolerance, polygon_contains, ray_polygon, tensor_embedding_weight, ElemShape, ElemType,
};
use crate::mesh::space::{Point, V3D};

/// Bilinear quadrilateral, split into four by its edge midpoints and its center
///
/// Nodes and children are numbered by their position in the reference square
/// ```text
///     2 ------- 3
///     |         |
///     |         |
///     0 ------- 1
/// ```
/// Sides: `0: South`, `1: North`, `2: West`, `3: East`
pub struct Quad4;

const SIDES: [[usize; 2]; 4] = [[0, 1], [2, 3], [0, 2], [1, 3]];

// nodes in counter-clockwise boundary order
const POLYGON: [usize; 4] = [0, 1, 3, 2];

pub(crate) fn boundary_polygon(points: &[Point]) -> [Point; 4] {
    POLYGON.map(|i| points[i])
}

impl ElemShape for Quad4 {
    fn dim(&self) -> usize {
        2
    }

    fn n_nodes(&self) -> usize {
        4
    }

    fn n_children(&self) -> usize {
        4
    }

    fn n_sides(&self) -> usize {
        4
    }

    fn side_nodes(&self, side: usize) -> &'static [usize] {
        &SIDES[side]
    }

    fn side_type(&self) -> Option<ElemType> {
        Some(ElemType::Edge2)
    }

    fn edges(&self) -> &'static [[usize; 2]] {
        &SIDES
    }

    fn embedding_weight(&self, child: usize, child_node: usize, parent_node: usize) -> f64 {
        tensor_embedding_weight(2, child, child_node, parent_node)
    }

    fn measure(&self, points: &[Point]) -> f64 {
        let tri_area = |a: &Point, b: &Point, c: &Point| (b - a).cross(&(c - a)).norm() / 2.0;
        tri_area(&points[0], &points[1], &points[3]) + tri_area(&points[0], &points[3], &points[2])
    }

    fn contains_point(&self, points: &[Point], p: &Point, tol: f64) -> bool {
        polygon_contains(&boundary_polygon(points), p, tol)
    }

    fn ray_intersect(&self, points: &[Point], origin: &Point, dir: &V3D) -> Option<f64> {
        ray_polygon(&boundary_polygon(points), origin, dir, geometric_tolerance(points))
    }
}
