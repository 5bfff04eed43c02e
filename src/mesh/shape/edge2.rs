use super::{geometric_tolerance, ray_segment, segment_contains, ElemShape, ElemType, EDGE2_EMBEDDING};
use crate::mesh::space::{Point, V3D};

/// Line segment `[n0, n1]`, bisected into `[n0, mid]` and `[mid, n1]`
pub struct Edge2;

const SIDES: [[usize; 1]; 2] = [[0], [1]];
const EDGES: [[usize; 2]; 1] = [[0, 1]];

impl ElemShape for Edge2 {
    fn dim(&self) -> usize {
        1
    }

    fn n_nodes(&self) -> usize {
        2
    }

    fn n_children(&self) -> usize {
        2
    }

    fn n_sides(&self) -> usize {
        2
    }

    fn side_nodes(&self, side: usize) -> &'static [usize] {
        &SIDES[side]
    }

    fn side_type(&self) -> Option<ElemType> {
        None
    }

    fn edges(&self) -> &'static [[usize; 2]] {
        &EDGES
    }

    fn embedding_weight(&self, child: usize, child_node: usize, parent_node: usize) -> f64 {
        EDGE2_EMBEDDING[child][child_node][parent_node]
    }

    fn measure(&self, points: &[Point]) -> f64 {
        (points[1] - points[0]).norm()
    }

    fn contains_point(&self, points: &[Point], p: &Point, tol: f64) -> bool {
        segment_contains(&points[0], &points[1], p, tol)
    }

    fn ray_intersect(&self, points: &[Point], origin: &Point, dir: &V3D) -> Option<f64> {
        ray_segment(&points[0], &points[1], origin, dir, geometric_tolerance(points))
    }
}
