use super::TreeSettings;
use crate::mesh::space::{BoundingBox, Point};
use smallvec::SmallVec;
use std::ops::Range;

/// A node of the bin tree
///
/// Each bin covers a geometric region (`bounds`): the root covers the whole Mesh and each child covers one octant (quadrant, half) of its parent.
/// The `loose` box encloses everything stored in the bin's subtree, which may reach beyond `bounds` since occupants are sorted by a single representative point.
#[derive(Debug, Clone)]
pub(crate) struct Bin {
    pub bounds: BoundingBox,
    pub loose: BoundingBox,
    pub level: u8,
    /// Range of the partitioned items (occupants, or Nodes for a Node tree) in this bin's subtree
    pub items: Range<usize>,
    /// Range of this leaf's occupants in the Tree's occupant array
    pub occupants: Range<usize>,
    pub children: SmallVec<[usize; 8]>,
}

impl Bin {
    fn new(bounds: BoundingBox, level: u8, items: Range<usize>) -> Self {
        Self {
            bounds,
            loose: BoundingBox::empty(),
            level,
            occupants: items.clone(),
            items,
            children: SmallVec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Recursively partition `items` by the octant of their representative `point`, pushing the resulting bins depth-first
///
/// `items` is sorted in place so that each bin's items are contiguous; `offset` is the position of `items` in the full array.
/// Returns the index of the bin covering `items`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_bins<T, F>(
    bins: &mut Vec<Bin>,
    items: &mut [T],
    offset: usize,
    bounds: BoundingBox,
    level: u8,
    dim: usize,
    settings: &TreeSettings,
    point: &F,
) -> usize
where
    F: Fn(&T) -> Point,
{
    let bin_idx = bins.len();
    bins.push(Bin::new(bounds, level, offset..offset + items.len()));

    if items.len() <= settings.target_bin_size || level >= settings.max_level {
        return bin_idx;
    }

    // stable, so the original order survives within each octant
    items.sort_by_key(|item| bounds.octant_of(&point(item), dim));

    let mut children = SmallVec::new();
    let mut start = 0;
    for octant in 0..(1 << dim) {
        let n_in_octant = items[start..]
            .iter()
            .take_while(|item| bounds.octant_of(&point(item), dim) == octant)
            .count();
        let end = start + n_in_octant;

        children.push(build_bins(
            bins,
            &mut items[start..end],
            offset + start,
            bounds.octant(octant, dim),
            level + 1,
            dim,
            settings,
            point,
        ));
        start = end;
    }

    bins[bin_idx].children = children;
    bin_idx
}

/// Set every bin's loose box from the boxes of its leaves' occupants
///
/// Children always follow their parent in `bins`, so a reverse sweep sees every child before its parent.
pub(crate) fn compute_loose_bounds(bins: &mut [Bin], occupant_bounds: impl Fn(usize) -> BoundingBox) {
    for bin_idx in (0..bins.len()).rev() {
        let loose = if bins[bin_idx].is_leaf() {
            bins[bin_idx]
                .occupants
                .clone()
                .fold(BoundingBox::empty(), |acc, occ| acc.union(&occupant_bounds(occ)))
        } else {
            bins[bin_idx]
                .children
                .iter()
                .fold(BoundingBox::empty(), |acc, child| acc.union(&bins[*child].loose))
        };
        bins[bin_idx].loose = loose;
    }
}
