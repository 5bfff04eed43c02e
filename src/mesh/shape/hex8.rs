use super::{geometric_tolerance, polygon_normal, ray_polygon, tensor_embedding_weight, ElemShape, ElemType};
use crate::mesh::space::{Point, V3D};

/// Trilinear hexahedron, split into eight octants
///
/// Nodes and children are numbered by their position in the reference cube: bit 0 is set on the upper x face, bit 1 on the upper y face and bit 2 on the upper z face.
///
/// Faces are ordered `x0, x1, y0, y1, z0, z1`; each lists its nodes as a [`Quad4`](super::quad4::Quad4).
pub struct Hex8;

const SIDES: [[usize; 4]; 6] = [
    [0, 2, 4, 6],
    [1, 3, 5, 7],
    [0, 1, 4, 5],
    [2, 3, 6, 7],
    [0, 1, 2, 3],
    [4, 5, 6, 7],
];

const EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [2, 3],
    [4, 5],
    [6, 7],
    [0, 2],
    [1, 3],
    [4, 6],
    [5, 7],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

// six tetrahedra sharing the 0-7 diagonal
const TETS: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

fn tet_volume(a: &Point, b: &Point, c: &Point, d: &Point) -> f64 {
    (b - a).cross(&(c - a)).dot(&(d - a)).abs() / 6.0
}

/// Boundary polygon of each face
fn faces(points: &[Point]) -> impl Iterator<Item = [Point; 4]> + '_ {
    SIDES
        .iter()
        .map(move |side| super::quad4::boundary_polygon(&side.map(|i| points[i])))
}

impl ElemShape for Hex8 {
    fn dim(&self) -> usize {
        3
    }

    fn n_nodes(&self) -> usize {
        8
    }

    fn n_children(&self) -> usize {
        8
    }

    fn n_sides(&self) -> usize {
        6
    }

    fn side_nodes(&self, side: usize) -> &'static [usize] {
        &SIDES[side]
    }

    fn side_type(&self) -> Option<ElemType> {
        Some(ElemType::Quad4)
    }

    fn edges(&self) -> &'static [[usize; 2]] {
        &EDGES
    }

    fn embedding_weight(&self, child: usize, child_node: usize, parent_node: usize) -> f64 {
        tensor_embedding_weight(3, child, child_node, parent_node)
    }

    fn measure(&self, points: &[Point]) -> f64 {
        TETS.iter()
            .map(|[a, b, c, d]| tet_volume(&points[*a], &points[*b], &points[*c], &points[*d]))
            .sum()
    }

    fn contains_point(&self, points: &[Point], p: &Point, tol: f64) -> bool {
        let centroid = self.centroid(points);

        faces(points).all(|face| {
            let normal = polygon_normal(&face);
            let norm = normal.norm();
            if norm == 0.0 {
                return false;
            }

            // orient outward
            let mut n_hat = normal / norm;
            if n_hat.dot(&(centroid - face[0])) > 0.0 {
                n_hat = -n_hat;
            }

            n_hat.dot(&(p - face[0])) <= tol
        })
    }

    fn ray_intersect(&self, points: &[Point], origin: &Point, dir: &V3D) -> Option<f64> {
        let tol = geometric_tolerance(points);
        if self.contains_point(points, origin, tol) {
            return Some(0.0);
        }

        faces(points)
            .filter_map(|face| ray_polygon(&face, origin, dir, tol))
            .fold(None, |nearest: Option<f64>, t| {
                Some(nearest.map_or(t, |t_near| t_near.min(t)))
            })
    }
}
