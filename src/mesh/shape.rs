/// Two-node line segment
pub mod edge2;
/// Eight-node trilinear hexahedron
pub mod hex8;
/// Four-node bilinear quadrilateral
pub mod quad4;
/// Three-node linear triangle
pub mod tri3;

use super::space::{BoundingBox, Point, V3D};
use super::TOLERANCE;
use std::fmt;

/// Geometric description of one kind of element: its topology, its refinement pattern and its exact geometric predicates
///
/// Every method that needs geometry receives the element's node positions (`points`), ordered by element-local node index.
///
/// ## Embedding
/// `embedding_weight(c, nc, n)` is the coefficient of parent node `n` in the position of node `nc` of child `c`:
/// ```text
///     x(child c, node nc) = Σ_n embedding_weight(c, nc, n) * x(parent node n)
/// ```
/// The weights of one child node sum to 1. A weight of exactly 1 means the child node *is* the parent node.
pub trait ElemShape: Send + Sync {
    /// Topological dimension (1: line, 2: surface, 3: volume)
    fn dim(&self) -> usize;

    fn n_nodes(&self) -> usize;

    /// Number of children produced by one h-refinement
    fn n_children(&self) -> usize;

    fn n_sides(&self) -> usize;

    /// Element-local indices of the nodes on a side, ordered as a `side_type()` element
    fn side_nodes(&self, side: usize) -> &'static [usize];

    /// Type of the (dim - 1) elements bounding this element. `None` for elements whose sides are points.
    fn side_type(&self) -> Option<ElemType>;

    /// Pairs of element-local node indices describing every edge
    fn edges(&self) -> &'static [[usize; 2]];

    fn embedding_weight(&self, child: usize, child_node: usize, parent_node: usize) -> f64;

    /// Length, area or volume
    fn measure(&self, points: &[Point]) -> f64;

    /// Does the element contain `p` (within an absolute distance `tol` of its boundary)
    fn contains_point(&self, points: &[Point], p: &Point, tol: f64) -> bool;

    /// Smallest `t >= 0` for which `origin + t * dir` lies in the element. `Some(0.0)` if `origin` is inside.
    fn ray_intersect(&self, points: &[Point], origin: &Point, dir: &V3D) -> Option<f64>;

    /// Length of the shortest edge
    fn hmin(&self, points: &[Point]) -> f64 {
        self.edges()
            .iter()
            .map(|[a, b]| (points[*b] - points[*a]).norm())
            .fold(f64::INFINITY, f64::min)
    }

    /// Length of the longest edge
    fn hmax(&self, points: &[Point]) -> f64 {
        self.edges()
            .iter()
            .map(|[a, b]| (points[*b] - points[*a]).norm())
            .fold(0.0, f64::max)
    }

    /// Average of the node positions
    fn centroid(&self, points: &[Point]) -> Point {
        let sum = points.iter().fold(V3D::zeros(), |acc, p| acc + p.coords);
        Point::from(sum / points.len() as f64)
    }

    fn bounding_box(&self, points: &[Point]) -> BoundingBox {
        BoundingBox::from_points(points.iter())
    }
}

/// The element types known to the Mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElemType {
    Edge2,
    Tri3,
    Quad4,
    Hex8,
}

impl ElemType {
    /// Get the [`ElemShape`] implementation describing this type
    pub fn shape(&self) -> &'static dyn ElemShape {
        match self {
            Self::Edge2 => &edge2::Edge2,
            Self::Tri3 => &tri3::Tri3,
            Self::Quad4 => &quad4::Quad4,
            Self::Hex8 => &hex8::Hex8,
        }
    }

    pub fn dim(&self) -> usize {
        self.shape().dim()
    }

    pub fn n_nodes(&self) -> usize {
        self.shape().n_nodes()
    }

    pub fn n_children(&self) -> usize {
        self.shape().n_children()
    }

    pub fn n_sides(&self) -> usize {
        self.shape().n_sides()
    }

    /// Which side of the parent (if any) contains side `child_side` of child `child`
    ///
    /// Derived from the embedding weights: every node of the child's side must be a combination of the parent side's nodes only
    pub fn parent_side_containing(&self, child: usize, child_side: usize) -> Option<usize> {
        let shape = self.shape();
        (0..shape.n_sides()).find(|parent_side| {
            let parent_side_nodes = shape.side_nodes(*parent_side);
            shape.side_nodes(child_side).iter().all(|child_node| {
                (0..shape.n_nodes())
                    .filter(|parent_node| {
                        shape.embedding_weight(child, *child_node, *parent_node) != 0.0
                    })
                    .all(|parent_node| parent_side_nodes.contains(&parent_node))
            })
        })
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Edge2 => "EDGE2",
            Self::Tri3 => "TRI3",
            Self::Quad4 => "QUAD4",
            Self::Hex8 => "HEX8",
        };
        write!(f, "{}", name)
    }
}

// ----------------------------------------------------------------------------------------------------
// Embedding tables
// ----------------------------------------------------------------------------------------------------

/// `[child][child_node][parent_node]` for a bisected line segment
pub(crate) const EDGE2_EMBEDDING: [[[f64; 2]; 2]; 2] = [
    // child 0: [n0, mid]
    [[1.0, 0.0], [0.5, 0.5]],
    // child 1: [mid, n1]
    [[0.5, 0.5], [0.0, 1.0]],
];

/// Embedding weight of a tensor-product element whose nodes, children and child nodes are numbered by coordinate bits
/// (bit `axis` of an index is set when it sits on the upper end of that axis)
pub(crate) fn tensor_embedding_weight(
    dim: usize,
    child: usize,
    child_node: usize,
    parent_node: usize,
) -> f64 {
    (0..dim)
        .map(|axis| {
            let bit = |idx: usize| (idx >> axis) & 1;
            EDGE2_EMBEDDING[bit(child)][bit(child_node)][bit(parent_node)]
        })
        .product()
}

// ----------------------------------------------------------------------------------------------------
// Geometric predicates shared between shapes
// ----------------------------------------------------------------------------------------------------

/// Is `p` within `tol` of the segment `[a, b]`
pub(crate) fn segment_contains(a: &Point, b: &Point, p: &Point, tol: f64) -> bool {
    let e = b - a;
    let len_sq = e.norm_squared();
    if len_sq == 0.0 {
        return (p - a).norm() <= tol;
    }

    let s = ((p - a).dot(&e) / len_sq).clamp(0.0, 1.0);
    (p - (a + e * s)).norm() <= tol
}

/// Intersection of the ray `origin + t * dir` with the segment `[a, b]` when both lie on a common plane
pub(crate) fn ray_segment(a: &Point, b: &Point, origin: &Point, dir: &V3D, tol: f64) -> Option<f64> {
    let e = b - a;
    let w = a - origin;
    let d_x_e = dir.cross(&e);
    let den = d_x_e.norm_squared();

    if den <= f64::EPSILON * dir.norm_squared() * e.norm_squared() {
        // parallel: only a collinear segment can be hit
        if w.cross(dir).norm() > tol * dir.norm() {
            return None;
        }
        let dir_sq = dir.norm_squared();
        let ta = w.dot(dir) / dir_sq;
        let tb = (b - origin).dot(dir) / dir_sq;
        return match (ta.min(tb), ta.max(tb)) {
            (_, t_max) if t_max < 0.0 => None,
            (t_min, _) if t_min <= 0.0 => Some(0.0),
            (t_min, _) => Some(t_min),
        };
    }

    // lines which pass each other without meeting
    if w.dot(&d_x_e).abs() / den.sqrt() > tol {
        return None;
    }

    let t = w.cross(&e).dot(&d_x_e) / den;
    let s = w.cross(dir).dot(&d_x_e) / den;
    let s_tol = tol / e.norm();

    if t >= -tol / dir.norm() && s >= -s_tol && s <= 1.0 + s_tol {
        Some(t.max(0.0))
    } else {
        None
    }
}

/// Newell normal of a planar polygon (not normalized; its length is twice the polygon's area)
pub(crate) fn polygon_normal(polygon: &[Point]) -> V3D {
    let n = polygon.len();
    (0..n).fold(V3D::zeros(), |acc, i| {
        let a = polygon[i].coords;
        let b = polygon[(i + 1) % n].coords;
        acc + a.cross(&b)
    })
}

/// Is `p` inside the convex planar polygon (vertices in boundary order) within a distance `tol`
pub(crate) fn polygon_contains(polygon: &[Point], p: &Point, tol: f64) -> bool {
    let normal = polygon_normal(polygon);
    let norm = normal.norm();
    if norm == 0.0 {
        return false;
    }
    let n_hat = normal / norm;

    if n_hat.dot(&(p - polygon[0])).abs() > tol {
        return false;
    }

    let n = polygon.len();
    (0..n).all(|i| {
        let a = &polygon[i];
        let e = polygon[(i + 1) % n] - a;
        e.cross(&(p - a)).dot(&n_hat) >= -tol * e.norm()
    })
}

/// Smallest `t >= 0` at which the ray `origin + t * dir` meets the convex planar polygon
pub(crate) fn ray_polygon(polygon: &[Point], origin: &Point, dir: &V3D, tol: f64) -> Option<f64> {
    let normal = polygon_normal(polygon);
    let norm = normal.norm();
    if norm == 0.0 {
        return None;
    }
    let n_hat = normal / norm;

    let denom = n_hat.dot(dir);
    let offset = n_hat.dot(&(polygon[0] - origin));

    if denom.abs() > f64::EPSILON.sqrt() * dir.norm() {
        let t = offset / denom;
        if t < -tol / dir.norm() {
            return None;
        }
        let t = t.max(0.0);
        return if polygon_contains(polygon, &(origin + dir * t), tol) {
            Some(t)
        } else {
            None
        };
    }

    // ray parallel to the polygon's plane
    if offset.abs() > tol {
        return None;
    }
    if polygon_contains(polygon, origin, tol) {
        return Some(0.0);
    }

    let n = polygon.len();
    (0..n)
        .filter_map(|i| ray_segment(&polygon[i], &polygon[(i + 1) % n], origin, dir, tol))
        .fold(None, |nearest: Option<f64>, t| {
            Some(nearest.map_or(t, |t_near| t_near.min(t)))
        })
}

/// Absolute geometric tolerance used by the ray predicates of an element with the given node positions
pub(crate) fn geometric_tolerance(points: &[Point]) -> f64 {
    BoundingBox::from_points(points.iter()).diagonal() * TOLERANCE
}
