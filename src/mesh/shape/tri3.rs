use super::{geometric_tolerance, polygon_contains, ray_polygon, ElemShape, ElemType};
use crate::mesh::space::{Point, V3D};

/// Linear triangle, split into four by its edge midpoints
///
/// ```text
///     n2
///     | \
///    m20 m12
///     |    \
///     n0-m01-n1
/// ```
/// Children: `0: (n0, m01, m20)`, `1: (m01, n1, m12)`, `2: (m20, m12, n2)`, `3: (m01, m12, m20)`
pub struct Tri3;

const SIDES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];

const EMBEDDING: [[[f64; 3]; 3]; 4] = [
    [[1.0, 0.0, 0.0], [0.5, 0.5, 0.0], [0.5, 0.0, 0.5]],
    [[0.5, 0.5, 0.0], [0.0, 1.0, 0.0], [0.0, 0.5, 0.5]],
    [[0.5, 0.0, 0.5], [0.0, 0.5, 0.5], [0.0, 0.0, 1.0]],
    [[0.5, 0.5, 0.0], [0.0, 0.5, 0.5], [0.5, 0.0, 0.5]],
];

impl ElemShape for Tri3 {
    fn dim(&self) -> usize {
        2
    }

    fn n_nodes(&self) -> usize {
        3
    }

    fn n_children(&self) -> usize {
        4
    }

    fn n_sides(&self) -> usize {
        3
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
        EMBEDDING[child][child_node][parent_node]
    }

    fn measure(&self, points: &[Point]) -> f64 {
        (points[1] - points[0]).cross(&(points[2] - points[0])).norm() / 2.0
    }

    fn contains_point(&self, points: &[Point], p: &Point, tol: f64) -> bool {
        polygon_contains(&points[0..3], p, tol)
    }

    fn ray_intersect(&self, points: &[Point], origin: &Point, dir: &V3D) -> Option<f64> {
        ray_polygon(&points[0..3], origin, dir, geometric_tolerance(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> [Point; 3] {
        [
            Point::new(0.0, 0.0, 0.0),
            Point::new(2.0, 0.0, 0.0),
            Point::new(0.0, 2.0, 0.0),
        ]
    }

    #[test]
    fn geometry() {
        let pts = points();
        assert!((Tri3.measure(&pts) - 2.0).abs() < 1e-14);
        assert!(Tri3.contains_point(&pts, &Point::new(0.5, 0.5, 0.0), 1e-9));
        assert!(Tri3.contains_point(&pts, &Point::new(1.0, 1.0, 0.0), 1e-9));
        assert!(!Tri3.contains_point(&pts, &Point::new(1.1, 1.1, 0.0), 1e-9));
    }

    #[test]
    fn children_tile_the_parent() {
        let pts = points();
        let total: f64 = (0..4)
            .map(|c| {
                let child_pts: Vec<Point> = (0..3)
                    .map(|nc| {
                        Point::from((0..3).fold(V3D::zeros(), |acc, n| {
                            acc + pts[n].coords * Tri3.embedding_weight(c, nc, n)
                        }))
                    })
                    .collect();
                Tri3.measure(&child_pts)
            })
            .sum();

        assert!((total - Tri3.measure(&pts)).abs() < 1e-14);
    }

    #[test]
    fn rays() {
        let pts = points();
        let t = Tri3
            .ray_intersect(&pts, &Point::new(0.5, 0.5, 3.0), &V3D::new(0.0, 0.0, -1.0))
            .unwrap();
        assert!((t - 3.0).abs() < 1e-12);

        let t = Tri3
            .ray_intersect(&pts, &Point::new(-1.0, 0.5, 0.0), &V3D::new(1.0, 0.0, 0.0))
            .unwrap();
        assert!((t - 1.0).abs() < 1e-12);

        assert!(Tri3
            .ray_intersect(&pts, &Point::new(3.0, 3.0, 1.0), &V3D::new(0.0, 0.0, -1.0))
            .is_none());
    }
}
