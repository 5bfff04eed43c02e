use nalgebra::{Point3, Vector3};

/// A location in Real Space. 2D meshes live in the `z = 0` plane.
pub type Point = Point3<f64>;

/// 3D vector in Real Space (ray directions, offsets, normals)
pub type V3D = Vector3<f64>;

/// Axis-aligned bounding box in Real Space
///
/// An "empty" box has `min > max` on every axis; it contains nothing and is the identity for [`BoundingBox::union`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Create an empty (inverted) box
    pub fn empty() -> Self {
        Self {
            min: Point::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    /// The smallest box containing all of the `points`
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Self {
        let mut bbox = Self::empty();
        for p in points {
            bbox.expand_point(p);
        }
        bbox
    }

    pub fn expand_point(&mut self, p: &Point) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Does this box contain at least one point (`min <= max` on every axis)
    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] <= self.max[axis])
    }

    pub fn center(&self) -> Point {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn extent(&self) -> V3D {
        self.max - self.min
    }

    /// Length of the main diagonal (0.0 for an empty box)
    pub fn diagonal(&self) -> f64 {
        if self.is_valid() {
            self.extent().norm()
        } else {
            0.0
        }
    }

    /// Grow the box by `pad` in every direction
    pub fn padded(&self, pad: f64) -> Self {
        let pad = V3D::repeat(pad);
        Self {
            min: self.min - pad,
            max: self.max + pad,
        }
    }

    pub fn contains(&self, p: &Point) -> bool {
        (0..3).all(|axis| p[axis] >= self.min[axis] && p[axis] <= self.max[axis])
    }

    /// Index of the sub-box (of `2^dim`) containing `p`. Bit `axis` is set when `p` is on the upper half of that axis.
    pub fn octant_of(&self, p: &Point, dim: usize) -> usize {
        let center = self.center();
        (0..dim)
            .filter(|axis| p[*axis] >= center[*axis])
            .fold(0, |acc, axis| acc | (1 << axis))
    }

    /// The sub-box with index `octant`, splitting only the first `dim` axes
    pub fn octant(&self, octant: usize, dim: usize) -> Self {
        let center = self.center();
        let mut sub = *self;
        for axis in 0..dim {
            if octant & (1 << axis) == 0 {
                sub.max[axis] = center[axis];
            } else {
                sub.min[axis] = center[axis];
            }
        }
        sub
    }

    /// Slab test of the ray `origin + t * dir` (`t >= 0`) against this box
    ///
    /// Returns the parameter at which the ray enters the box (`0.0` if `origin` is inside)
    pub fn ray_hit(&self, origin: &Point, dir: &V3D) -> Option<f64> {
        if !self.is_valid() {
            return None;
        }

        let mut t_enter: f64 = 0.0;
        let mut t_exit = f64::INFINITY;

        for axis in 0..3 {
            if dir[axis] == 0.0 {
                if origin[axis] < self.min[axis] || origin[axis] > self.max[axis] {
                    return None;
                }
            } else {
                let t0 = (self.min[axis] - origin[axis]) / dir[axis];
                let t1 = (self.max[axis] - origin[axis]) / dir[axis];
                t_enter = t_enter.max(t0.min(t1));
                t_exit = t_exit.min(t0.max(t1));

                if t_exit < t_enter {
                    return None;
                }
            }
        }

        Some(t_enter)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}
