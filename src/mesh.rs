/// Flag compatibility rules applied before a batch of refinements
pub mod compatibility;
/// A hierarchical mesh primitive
pub mod elem;
/// Mesh vertices and the deduplicating Node Pool
pub mod node;
/// The refinement state machine and recoverable refinement errors
pub mod refinement;
/// Reference shapes: topology, embedding weights and geometric predicates
pub mod shape;
/// Points, vectors and bounding boxes in Real Space
pub mod space;

use elem::{Elem, ElemId, ElemUninit};
use node::{NodeId, NodePool};
use refinement::{apply_p_flag, MeshError, RefinementFlag};
use shape::ElemType;
use space::{BoundingBox, Point};

#[cfg(feature = "json_export")]
use json::{object, JsonValue};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
#[cfg(feature = "json_export")]
use std::fs::File;
#[cfg(feature = "json_export")]
use std::io::BufWriter;

/// Relative geometric tolerance. Node merging uses `hmin * TOLERANCE`; spatial queries use `diameter * TOLERANCE`.
pub const TOLERANCE: f64 = 1e-6;

/// Minimum edge length of a child Elem. h-Refinements are dropped when they would produce shorter edges.
pub const MIN_ELEM_SIZE: f64 = 1e-10;

/// The largest number of children produced by a single h-refinement. This determines the stack allocation size of some `SmallVec`s related to h-Refinement
pub const EXPECTED_NUM_CHILDREN: usize = 8;

/// Maximum polynomial level. p-Refinements will fail when an Elem's p-level exceeds this value.
pub const MAX_P_LEVEL: u8 = 20;

/// Policies applied by [`Mesh::refine_and_coarsen_elements`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementSettings {
    /// Keep the refinement levels of neighboring Elems within one of each other
    pub level_one_rule: bool,
    /// Elems at this level are never h-refined
    pub max_h_level: u8,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            level_one_rule: true,
            max_h_level: 16,
        }
    }
}

/// The hierarchy of [`Elem`]s and the [`NodePool`] they share
///
/// `Elem`s live in an arena indexed by [`ElemId`]. Deleted `Elem`s leave a vacant slot; ids are never reused.
///
/// The Mesh owns every structural mutation: refinement ([`Mesh::refine`]), coarsening ([`Mesh::coarsen`]) and contraction ([`Mesh::contract`]),
/// either invoked directly or through the batch driver [`Mesh::refine_and_coarsen_elements`].
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    elems: Vec<Option<Elem>>,
    pub nodes: NodePool,
    pub settings: RefinementSettings,
    dim: usize,
}

impl Mesh {
    /// Construct a completely empty Mesh
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: RefinementSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Construct a Mesh of `nx * ny` square `Quad4` Elems with side length `size`, with its lower-left corner at the origin
    pub fn square_grid(nx: usize, ny: usize, size: f64) -> Self {
        let mut mesh = Self::new();
        let node_ids: Vec<NodeId> = (0..=ny)
            .flat_map(|j| (0..=nx).map(move |i| (i, j)))
            .map(|(i, j)| mesh.add_node(Point::new(i as f64 * size, j as f64 * size, 0.0)))
            .collect();
        let node = |i: usize, j: usize| node_ids[j * (nx + 1) + i];

        for j in 0..ny {
            for i in 0..nx {
                mesh.add_elem(
                    ElemType::Quad4,
                    &[node(i, j), node(i + 1, j), node(i, j + 1), node(i + 1, j + 1)],
                    0,
                );
            }
        }

        mesh.prepare_for_use();
        mesh
    }

    /// Construct a Mesh of `nx * ny * nz` cubic `Hex8` Elems with side length `size`, with one corner at the origin
    pub fn cube_grid(nx: usize, ny: usize, nz: usize, size: f64) -> Self {
        let mut mesh = Self::new();
        let node_ids: Vec<NodeId> = (0..=nz)
            .flat_map(|k| (0..=ny).flat_map(move |j| (0..=nx).map(move |i| (i, j, k))))
            .map(|(i, j, k)| {
                mesh.add_node(Point::new(
                    i as f64 * size,
                    j as f64 * size,
                    k as f64 * size,
                ))
            })
            .collect();
        let node = |i: usize, j: usize, k: usize| node_ids[(k * (ny + 1) + j) * (nx + 1) + i];

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let nodes: Vec<NodeId> = (0..8)
                        .map(|n| node(i + (n & 1), j + ((n >> 1) & 1), k + ((n >> 2) & 1)))
                        .collect();
                    mesh.add_elem(ElemType::Hex8, &nodes, 0);
                }
            }
        }

        mesh.prepare_for_use();
        mesh
    }

    /// Add a Node without checking for coincident Nodes
    pub fn add_node(&mut self, coords: Point) -> NodeId {
        self.nodes.add(coords, 0)
    }

    /// Add a root-level Elem
    ///
    /// Panics if the number of Nodes does not match the [`ElemType`], if a Node does not exist, if the Elem's dimension differs from the rest of the Mesh, or if the Elem has no volume.
    pub fn add_elem(&mut self, elem_type: ElemType, nodes: &[NodeId], subdomain_id: u32) -> ElemId {
        assert!(
            self.dim == 0 || self.dim == elem_type.dim(),
            "Cannot add a {} Elem to a {}D Mesh!",
            elem_type,
            self.dim
        );

        let id = ElemId(self.elems.len());
        let elem = Elem::new(id, elem_type, nodes, subdomain_id);

        let points: SmallVec<[Point; 8]> = nodes.iter().map(|n| *self.nodes.coords(*n)).collect();
        let measure = elem_type.shape().measure(&points);
        assert!(
            measure > 0.0,
            "Elem {} ({}) is degenerate; its measure is {} (longest edge: {})!",
            id,
            elem_type,
            measure,
            elem_type.shape().hmax(&points)
        );

        self.dim = elem_type.dim();
        self.elems.push(Some(elem));
        id
    }

    /// Compute the neighbor connectivity. Must be called after Elems are added manually
    pub fn prepare_for_use(&mut self) {
        self.find_neighbors();
    }

    /// Print the mesh to a JSON file specified by path.
    #[cfg(feature = "json_export")]
    pub fn export_to_json(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        let f = File::create(path.as_ref())?;
        let mut w = BufWriter::new(&f);

        let mesh_object = object! {
            "dim": self.dim,
            "Elems": JsonValue::from(self.elems().map(|elem| elem.to_json()).collect::<Vec<_>>()),
            "Nodes": JsonValue::from(self.nodes.iter().map(|node| node.to_json()).collect::<Vec<_>>()),
        };

        mesh_object.write_pretty(&mut w, 4)?;

        Ok(())
    }

    // ----------------------------------------------------------------------------------------------------
    // General Data Retrieval
    // ----------------------------------------------------------------------------------------------------

    /// Topological dimension of the Elems in the Mesh (0 for an empty Mesh)
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of Elems (of any refinement state) in the Mesh
    pub fn n_elem(&self) -> usize {
        self.elems().count()
    }

    pub fn n_active_elem(&self) -> usize {
        self.active_elems().count()
    }

    /// Get a reference to an Elem. Panics if the Elem does not exist.
    pub fn elem(&self, elem_id: ElemId) -> &Elem {
        match self.try_elem(elem_id) {
            Some(elem) => elem,
            None => panic!("Elem {} does not exist in the Mesh!", elem_id),
        }
    }

    pub fn try_elem(&self, elem_id: ElemId) -> Option<&Elem> {
        self.elems.get(elem_id.0).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn elem_mut(&mut self, elem_id: ElemId) -> &mut Elem {
        match self.elems.get_mut(elem_id.0).and_then(|slot| slot.as_mut()) {
            Some(elem) => elem,
            None => panic!("Elem {} does not exist in the Mesh!", elem_id),
        }
    }

    /// Iterate over all Elems in order of their ids
    pub fn elems(&self) -> impl Iterator<Item = &Elem> + '_ {
        self.elems.iter().flatten()
    }

    /// Iterate over the active Elems in order of their ids
    pub fn active_elems(&self) -> impl Iterator<Item = &Elem> + '_ {
        self.elems().filter(|elem| elem.active())
    }

    pub fn node(&self, node_id: NodeId) -> &Point {
        self.nodes.coords(node_id)
    }

    fn elem_ids(&self) -> Vec<ElemId> {
        self.elems().map(|elem| elem.id).collect()
    }

    /// Get the [`Point`]s composing an [`Elem`], in element-local order
    pub fn elem_points(&self, elem_id: ElemId) -> SmallVec<[Point; 8]> {
        self.elem(elem_id)
            .nodes
            .iter()
            .map(|node_id| *self.nodes.coords(*node_id))
            .collect()
    }

    pub fn elem_centroid(&self, elem_id: ElemId) -> Point {
        let elem = self.elem(elem_id);
        elem.elem_type.shape().centroid(&self.elem_points(elem_id))
    }

    pub fn elem_bounding_box(&self, elem_id: ElemId) -> BoundingBox {
        BoundingBox::from_points(self.elem_points(elem_id).iter())
    }

    /// Length, area or volume of an Elem
    pub fn elem_measure(&self, elem_id: ElemId) -> f64 {
        let elem = self.elem(elem_id);
        elem.elem_type.shape().measure(&self.elem_points(elem_id))
    }

    /// Bounding box of the active Elems
    pub fn bounding_box(&self) -> BoundingBox {
        self.active_elems()
            .flat_map(|elem| elem.nodes.iter())
            .fold(BoundingBox::empty(), |mut bbox, node_id| {
                bbox.expand_point(self.nodes.coords(*node_id));
                bbox
            })
    }

    /// Is this Elem an interior node of the active refinement tree: inactive, with children that are active or are themselves ancestors
    pub fn is_ancestor(&self, elem_id: ElemId) -> bool {
        let elem = self.elem(elem_id);
        if elem.active() {
            return false;
        }
        match elem.child_ids().and_then(|ids| ids.first()) {
            Some(first_child) => {
                self.elem(*first_child).active() || self.is_ancestor(*first_child)
            }
            None => false,
        }
    }

    /// Is this Elem an inactive descendant of an active Elem (a child retained after coarsening)
    pub fn is_subactive(&self, elem_id: ElemId) -> bool {
        let elem = self.elem(elem_id);
        if elem.active() {
            return false;
        }

        let mut parent_id = elem.parent_id();
        while let Some(id) = parent_id {
            let parent = self.elem(id);
            if parent.active() {
                return true;
            }
            parent_id = parent.parent_id();
        }
        false
    }

    /// Get a list of an [`Elem`]s descendant's IDs
    pub fn descendant_elems(
        &self,
        elem_id: ElemId,
        include_starting_elem: bool,
    ) -> Result<Vec<ElemId>, MeshError> {
        if self.try_elem(elem_id).is_none() {
            Err(MeshError::ElemDoesntExist(elem_id))
        } else {
            let mut descendants = Vec::new();
            self.rec_descendant_elems(elem_id, include_starting_elem, &mut descendants);
            Ok(descendants)
        }
    }

    fn rec_descendant_elems(&self, elem_id: ElemId, include: bool, desc: &mut Vec<ElemId>) {
        if include {
            desc.push(elem_id);
        }
        if let Some(child_elem_ids) = self.elem(elem_id).child_ids() {
            for cei in child_elem_ids {
                self.rec_descendant_elems(*cei, true, desc);
            }
        }
    }

    /// Get a list of an [`Elem`]s ancestors's IDs
    pub fn ancestor_elems(
        &self,
        elem_id: ElemId,
        include_starting_elem: bool,
    ) -> Result<Vec<ElemId>, MeshError> {
        if self.try_elem(elem_id).is_none() {
            Err(MeshError::ElemDoesntExist(elem_id))
        } else {
            let mut ancestors = Vec::new();
            self.rec_ancestor_elems(elem_id, include_starting_elem, &mut ancestors);
            Ok(ancestors)
        }
    }

    fn rec_ancestor_elems(&self, elem_id: ElemId, include: bool, anc: &mut Vec<ElemId>) {
        if include {
            anc.push(elem_id);
        }
        if let Some(parent_elem_id) = self.elem(elem_id).parent_id() {
            self.rec_ancestor_elems(parent_elem_id, true, anc);
        }
    }

    /// Largest p-level among the active `Elem`s in the `Mesh`
    pub fn max_p_level(&self) -> u8 {
        self.active_elems().map(|elem| elem.p_level).max().unwrap_or(0)
    }

    /// Determine if this Elem can be h-refined
    /// * returns false if the Elem is not active
    /// * returns false if the Elem has reached the maximum h-level in the Mesh's [`RefinementSettings`]
    /// * returns false if the Elem's children would have edges shorter than [MIN_ELEM_SIZE]
    /// * returns an `Err` if the Mesh doesn't have `elem_id`
    pub fn elem_is_h_refineable(&self, elem_id: ElemId) -> Result<bool, MeshError> {
        match self.try_elem(elem_id) {
            None => Err(MeshError::ElemDoesntExist(elem_id)),
            Some(elem) => Ok(elem.active()
                && elem.level() < self.settings.max_h_level
                && elem.elem_type.shape().hmin(&self.elem_points(elem_id)) / 2.0 > MIN_ELEM_SIZE),
        }
    }

    /// Determine if this Elem can be p-refined (in the positive direction)
    pub fn elem_is_p_refineable(&self, elem_id: ElemId) -> Result<bool, MeshError> {
        match self.try_elem(elem_id) {
            None => Err(MeshError::ElemDoesntExist(elem_id)),
            Some(elem) => Ok(elem.active() && elem.p_level < MAX_P_LEVEL),
        }
    }

    // ----------------------------------------------------------------------------------------------------
    // Element state machine
    // ----------------------------------------------------------------------------------------------------

    /// h-Refine an active Elem flagged with [`RefinementFlag::Refine`]
    ///
    /// New children are located with the embedding weights of the Elem's type. Child Nodes which coincide with a parent Node share it;
    /// all others are requested from the [`NodePool`] with a merge tolerance of `hmin * TOLERANCE`.
    ///
    /// If the Elem still holds children from an earlier refinement (it was coarsened but not contracted), they are re-activated instead.
    ///
    /// Neighbors are recomputed afterwards; use [`Mesh::refine_and_coarsen_elements`] to refine many Elems at once.
    pub fn refine(&mut self, elem_id: ElemId) -> Result<(), MeshError> {
        self.refine_elem(elem_id)?;
        self.find_neighbors();
        Ok(())
    }

    fn refine_elem(&mut self, elem_id: ElemId) -> Result<(), MeshError> {
        let parent = self.elem(elem_id).clone();
        assert!(parent.active(), "Elem {} is not active; cannot refine!", elem_id);
        let parent_flag = parent.refinement_flag().refined(elem_id);

        match parent.child_ids() {
            Some(child_ids) => {
                for child_id in child_ids {
                    assert!(
                        self.is_subactive(*child_id),
                        "Child {} of Elem {} is not subactive; cannot re-refine!",
                        child_id,
                        elem_id
                    );
                    let child = self.elem_mut(*child_id);
                    child.set_refinement_flag(RefinementFlag::JustRefined);
                    child.p_level = parent.p_level;
                    child.set_p_refinement_flag(parent.p_refinement_flag());
                }
                log::trace!("re-activated the children of Elem {}", elem_id);
            }
            None => {
                let children = self.build_children(&parent)?;
                let child_ids = children.iter().map(|child| child.id).collect();
                self.elems.extend(children.into_iter().map(Some));
                self.elem_mut(elem_id).set_children(child_ids);
                log::trace!("refined Elem {}", elem_id);
            }
        }

        let parent = self.elem_mut(elem_id);
        parent.set_refinement_flag(parent_flag);
        parent.set_p_refinement_flag(RefinementFlag::Inactive);

        debug_assert!(self.is_ancestor(elem_id));
        Ok(())
    }

    fn build_children(&mut self, parent: &Elem) -> Result<Vec<Elem>, MeshError> {
        let shape = parent.elem_type.shape();
        let parent_points = self.elem_points(parent.id);
        let point_tol = shape.hmin(&parent_points) * TOLERANCE;
        let first_id = self.elems.len();

        (0..shape.n_children())
            .map(|c| {
                let mut child = ElemUninit::new(ElemId(first_id + c), parent);

                for nc in 0..shape.n_nodes() {
                    let weights: SmallVec<[f64; 8]> = (0..shape.n_nodes())
                        .map(|n| shape.embedding_weight(c, nc, n))
                        .collect();

                    let node_id = match weights.iter().position(|w| *w == 1.0) {
                        Some(n) => parent.nodes[n],
                        None => {
                            let position = weighted_position(&weights, &parent_points);
                            self.nodes
                                .get_or_create(position, parent.owner_id, point_tol)
                        }
                    };
                    child.set_node(nc, node_id);
                }

                child.into_elem()
            })
            .collect()
    }

    /// Coarsen a parent Elem whose children are all flagged [`RefinementFlag::Coarsen`] (the parent being marked `CoarsenInactive`)
    ///
    /// Hanging Nodes of the children are moved back onto the parent's current geometry, the children become inactive (but are retained until [`Mesh::contract`]),
    /// and the parent becomes active with the largest p-level of its children.
    ///
    /// Neighbors are recomputed afterwards.
    pub fn coarsen(&mut self, elem_id: ElemId) {
        self.coarsen_elem(elem_id);
        self.find_neighbors();
    }

    fn coarsen_elem(&mut self, elem_id: ElemId) {
        let parent = self.elem(elem_id).clone();
        assert!(!parent.active(), "Elem {} is already active; cannot coarsen!", elem_id);
        let parent_flag = parent.refinement_flag().coarsened(elem_id);

        let child_ids = match parent.child_ids() {
            Some(ids) => ids,
            None => panic!("Elem {} has no children; cannot coarsen!", elem_id),
        };

        // re-synchronize hanging Nodes with the parent's current geometry
        let shape = parent.elem_type.shape();
        let parent_points = self.elem_points(elem_id);
        for (c, child_id) in child_ids.iter().enumerate() {
            let child_nodes = self.elem(*child_id).nodes.clone();
            for (nc, node_id) in child_nodes.iter().enumerate() {
                let weights: SmallVec<[f64; 8]> = (0..shape.n_nodes())
                    .map(|n| shape.embedding_weight(c, nc, n))
                    .collect();

                if weights.iter().any(|w| *w != 0.0 && *w != 1.0) {
                    self.nodes
                        .set_coords(*node_id, weighted_position(&weights, &parent_points));
                }
            }
        }

        let mut p_level = 0;
        for child_id in child_ids {
            let child = self.elem_mut(*child_id);
            assert_eq!(
                child.refinement_flag(),
                RefinementFlag::Coarsen,
                "Child {} of Elem {} is not flagged for coarsening; cannot coarsen!",
                child_id,
                elem_id
            );
            child.set_refinement_flag(RefinementFlag::Inactive);
            p_level = p_level.max(child.p_level);
        }

        let parent = self.elem_mut(elem_id);
        parent.set_refinement_flag(parent_flag);
        parent.p_level = p_level;
        log::trace!("coarsened Elem {}", elem_id);
    }

    /// Release the children of an active Elem, deleting them from the Mesh
    ///
    /// Deletion is recursive: retained descendants of the released children (left behind by an earlier coarsening) are deleted as well,
    /// so no [`ElemId`] held by the caller for any Elem below `elem_id` remains valid.
    ///
    /// A `JustCoarsened` flag becomes `DoNothing`. Returns `true` if any children were released, in which case neighbors are recomputed.
    pub fn contract(&mut self, elem_id: ElemId) -> bool {
        let released = self.contract_elem(elem_id);
        if released {
            self.find_neighbors();
        }
        released
    }

    fn contract_elem(&mut self, elem_id: ElemId) -> bool {
        let elem = self.elem_mut(elem_id);
        assert!(elem.active(), "Elem {} is not active; cannot contract!", elem_id);

        let released = elem.take_children();
        let flag = elem.refinement_flag().contracted();
        elem.set_refinement_flag(flag);

        match released {
            Some(child_ids) => {
                for child_id in child_ids {
                    self.delete_subtree(child_id);
                }
                true
            }
            None => false,
        }
    }

    fn delete_subtree(&mut self, elem_id: ElemId) {
        let elem = match self.elems.get_mut(elem_id.0).and_then(|slot| slot.take()) {
            Some(elem) => elem,
            None => panic!("Elem {} does not exist; cannot delete it!", elem_id),
        };
        assert!(
            !elem.active(),
            "Elem {} is active; only subactive Elems can be deleted!",
            elem_id
        );

        if let Some(child_ids) = elem.child_ids() {
            for child_id in child_ids {
                self.delete_subtree(*child_id);
            }
        }
    }

    /// Contract every active Elem in the Mesh. Returns `true` if any Elems were deleted.
    ///
    /// Neighbors are recomputed once at the end if anything changed.
    pub fn contract_all(&mut self) -> bool {
        let contracted = self.contract_all_elems();
        if contracted {
            self.find_neighbors();
        }
        contracted
    }

    fn contract_all_elems(&mut self) -> bool {
        let mut contracted = false;
        for elem_id in self.elem_ids() {
            if let Some(elem) = self.try_elem(elem_id) {
                if elem.active() {
                    contracted |= self.contract_elem(elem_id);
                }
            }
        }
        contracted
    }

    /// Remove every Node that is not referenced by an Elem. Returns the number of removed Nodes.
    pub fn prune_orphaned_nodes(&mut self) -> usize {
        let mut referenced = vec![false; self.nodes.id_bound()];
        for node_id in self.elems().flat_map(|elem| elem.nodes.iter()) {
            referenced[node_id.0] = true;
        }

        let orphans: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|node| node.id)
            .filter(|id| !referenced[id.0])
            .collect();

        for id in orphans.iter() {
            self.nodes.remove(*id);
        }
        orphans.len()
    }

    /// Recompute the neighbor of every Elem across each of its sides
    ///
    /// Sides are matched between Elems of the same level by their (sorted) Node ids.
    /// A side without a match on its own level inherits the neighbor of the parent side containing it; otherwise it lies on the boundary of the domain.
    pub fn find_neighbors(&mut self) {
        let mut order: Vec<(u8, ElemId)> = self.elems().map(|elem| (elem.level(), elem.id)).collect();
        order.sort_unstable();

        let mut sides: BTreeMap<(u8, SmallVec<[NodeId; 4]>), SmallVec<[ElemId; 2]>> = BTreeMap::new();
        for (level, elem_id) in order.iter() {
            let elem = self.elem(*elem_id);
            for side in 0..elem.elem_type.n_sides() {
                sides
                    .entry((*level, side_key(elem, side)))
                    .or_default()
                    .push(*elem_id);
            }
        }

        for (level, elem_id) in order {
            let elem = self.elem(elem_id);
            let neighbors = (0..elem.elem_type.n_sides())
                .map(|side| {
                    sides
                        .get(&(level, side_key(elem, side)))
                        .and_then(|ids| ids.iter().copied().find(|id| *id != elem_id))
                        .or_else(|| self.inherited_neighbor(elem, side))
                })
                .collect();

            self.elem_mut(elem_id).neighbors = neighbors;
        }
    }

    fn inherited_neighbor(&self, elem: &Elem, side: usize) -> Option<ElemId> {
        let parent = self.elem(elem.parent_id()?);
        let parent_side = elem
            .elem_type
            .parent_side_containing(elem.child_index(parent), side)?;
        parent.neighbors[parent_side]
    }

    // ----------------------------------------------------------------------------------------------------
    // Flagging methods
    // ----------------------------------------------------------------------------------------------------

    /// Flag a list of active [Elem]s for h-refinement by their ID
    pub fn flag_elems_for_refinement(&mut self, elems: Vec<ElemId>) -> Result<(), MeshError> {
        self.set_refinement_flags(elems, RefinementFlag::Refine)
    }

    /// Flag a list of active [Elem]s for coarsening by their ID
    ///
    /// Parents whose children are now all flagged are marked `CoarsenInactive`, which makes them eligible for [`Mesh::coarsen`]
    pub fn flag_elems_for_coarsening(&mut self, elems: Vec<ElemId>) -> Result<(), MeshError> {
        self.set_refinement_flags(elems, RefinementFlag::Coarsen)?;
        self.update_parent_coarsen_flags();
        Ok(())
    }

    /// Flag a list of active [Elem]s for p-refinement (`Refine`) or p-coarsening (`Coarsen`) by their ID
    pub fn flag_elems_for_p_refinement(
        &mut self,
        elems: Vec<ElemId>,
        flag: RefinementFlag,
    ) -> Result<(), MeshError> {
        let elems = self.validate_requests(elems, flag)?;
        for elem_id in elems.iter() {
            if flag == RefinementFlag::Refine && !self.elem_is_p_refineable(*elem_id)? {
                return Err(MeshError::ExceededMaxPLevel(*elem_id));
            }
        }
        for elem_id in elems {
            self.elem_mut(elem_id).set_p_refinement_flag(flag);
        }
        Ok(())
    }

    /// Flag [Elem]s for h-refinement or coarsening according to an external filter function
    pub fn flag_with_filter<F>(&mut self, filt: F) -> Result<(), MeshError>
    where
        F: Fn(&Elem) -> Option<RefinementFlag>,
    {
        let requests: Vec<(ElemId, RefinementFlag)> = self
            .active_elems()
            .filter_map(|elem| filt(elem).map(|flag| (elem.id, flag)))
            .collect();

        for (elem_id, flag) in requests.iter() {
            if !flag.is_request() {
                return Err(MeshError::InvalidRequest {
                    elem_id: *elem_id,
                    flag: *flag,
                });
            }
        }
        for (elem_id, flag) in requests {
            self.elem_mut(elem_id).set_refinement_flag(flag);
        }

        self.update_parent_coarsen_flags();
        Ok(())
    }

    /// Flag all of the active Elems that are eligible for h-refinement
    pub fn global_h_refinement(&mut self) -> Result<(), MeshError> {
        let mut eligible = Vec::new();
        for elem in self.active_elems() {
            if self.elem_is_h_refineable(elem.id)? {
                eligible.push(elem.id);
            }
        }
        self.flag_elems_for_refinement(eligible)
    }

    /// Refine every active Elem `n` times
    pub fn uniformly_refine(&mut self, n: usize) -> Result<(), MeshError> {
        for _ in 0..n {
            self.global_h_refinement()?;
            self.refine_and_coarsen_elements()?;
        }
        Ok(())
    }

    fn set_refinement_flags(&mut self, elems: Vec<ElemId>, flag: RefinementFlag) -> Result<(), MeshError> {
        for elem_id in self.validate_requests(elems, flag)? {
            self.elem_mut(elem_id).set_refinement_flag(flag);
        }
        Ok(())
    }

    fn validate_requests(&self, elems: Vec<ElemId>, flag: RefinementFlag) -> Result<BTreeSet<ElemId>, MeshError> {
        let mut requested = BTreeSet::new();
        for elem_id in elems {
            let elem = self.try_elem(elem_id).ok_or(MeshError::ElemDoesntExist(elem_id))?;
            if !elem.active() {
                return Err(MeshError::ElemNotActive(elem_id));
            }
            if !flag.is_request() {
                return Err(MeshError::InvalidRequest { elem_id, flag });
            }
            if !requested.insert(elem_id) {
                return Err(MeshError::DoubleRefinement(elem_id));
            }
        }
        Ok(requested)
    }

    // ----------------------------------------------------------------------------------------------------
    // Batch refinement
    // ----------------------------------------------------------------------------------------------------

    /// Execute all of the flagged h- and p-refinements
    ///
    /// 1. Refine flags are dropped from Elems that cannot be refined further, and the remaining flags are made compatible (see [`compatibility`])
    /// 2. Every parent whose children are all flagged for coarsening is coarsened
    /// 3. Every active Elem flagged for refinement is refined
    /// 4. p-Refinement flags are applied to the active Elems
    /// 5. The Mesh is contracted and orphaned Nodes are removed
    /// 6. Transitional flags are reset and neighbors are recomputed
    ///
    /// Returns `true` if the Mesh changed. Any spatial index over the Mesh must be rebuilt afterwards.
    pub fn refine_and_coarsen_elements(&mut self) -> Result<bool, MeshError> {
        for elem in self.active_elems() {
            if elem.p_refinement_flag() == RefinementFlag::Refine && elem.p_level >= MAX_P_LEVEL {
                return Err(MeshError::ExceededMaxPLevel(elem.id));
            }
        }

        self.drop_unrefineable_flags()?;
        self.make_flags_compatible()?;

        let coarsened = self.coarsen_flagged_elems();
        let refined = self.refine_flagged_elems()?;
        let p_changed = self.apply_p_refinements()?;
        let contracted = self.contract_all_elems();
        let n_pruned = self.prune_orphaned_nodes();

        self.clean_refinement_flags();
        self.find_neighbors();

        log::debug!(
            "coarsened {} parents, refined {} elems, pruned {} nodes; {} active elems",
            coarsened,
            refined,
            n_pruned,
            self.n_active_elem()
        );

        Ok(coarsened + refined > 0 || p_changed || contracted)
    }

    fn drop_unrefineable_flags(&mut self) -> Result<(), MeshError> {
        for elem_id in self.elem_ids() {
            if self.elem(elem_id).refinement_flag() == RefinementFlag::Refine
                && !self.elem_is_h_refineable(elem_id)?
            {
                log::debug!(
                    "Elem {} cannot be refined further; dropping its refinement flag",
                    elem_id
                );
                self.elem_mut(elem_id).set_refinement_flag(RefinementFlag::DoNothing);
            }
        }
        Ok(())
    }

    fn coarsen_flagged_elems(&mut self) -> usize {
        let parents: Vec<ElemId> = self
            .elems()
            .filter(|elem| elem.refinement_flag() == RefinementFlag::CoarsenInactive)
            .map(|elem| elem.id)
            .collect();

        for parent_id in parents.iter() {
            self.coarsen_elem(*parent_id);
        }
        parents.len()
    }

    fn refine_flagged_elems(&mut self) -> Result<usize, MeshError> {
        let flagged: Vec<ElemId> = self
            .active_elems()
            .filter(|elem| elem.refinement_flag() == RefinementFlag::Refine)
            .map(|elem| elem.id)
            .collect();

        for elem_id in flagged.iter() {
            self.refine_elem(*elem_id)?;
        }
        Ok(flagged.len())
    }

    fn apply_p_refinements(&mut self) -> Result<bool, MeshError> {
        let mut changed = false;
        for elem_id in self.elem_ids() {
            let elem = self.elem(elem_id);
            if !elem.active() {
                continue;
            }

            let (p_level, flag) = apply_p_flag(elem_id, elem.p_level, elem.p_refinement_flag())?;
            changed |= p_level != elem.p_level;

            let elem = self.elem_mut(elem_id);
            elem.p_level = p_level;
            elem.set_p_refinement_flag(flag);
        }
        Ok(changed)
    }

    fn clean_refinement_flags(&mut self) {
        for elem in self.elems.iter_mut().flatten() {
            let flag = elem.refinement_flag().cleaned();
            elem.set_refinement_flag(flag);
            elem.set_p_refinement_flag(if elem.active() {
                RefinementFlag::DoNothing
            } else {
                RefinementFlag::Inactive
            });
        }
    }
}

// ----------------------------------------------------------------------------------------------------
// Helper Functions
// ----------------------------------------------------------------------------------------------------

fn weighted_position(weights: &[f64], points: &[Point]) -> Point {
    Point::from(
        weights
            .iter()
            .zip(points.iter())
            .filter(|(w, _)| **w != 0.0)
            .fold(space::V3D::zeros(), |acc, (w, p)| acc + p.coords * *w),
    )
}

fn side_key(elem: &Elem, side: usize) -> SmallVec<[NodeId; 4]> {
    let mut key: SmallVec<[NodeId; 4]> = elem
        .elem_type
        .shape()
        .side_nodes(side)
        .iter()
        .map(|n| elem.nodes[*n])
        .collect();
    key.sort_unstable();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(elem_type: ElemType) -> (Mesh, ElemId) {
        let mut mesh = Mesh::new();
        let points: Vec<Point> = match elem_type {
            ElemType::Edge2 => vec![Point::new(0.0, 0.0, 0.0), Point::new(1.0, 0.0, 0.0)],
            ElemType::Tri3 => vec![
                Point::new(0.0, 0.0, 0.0),
                Point::new(1.0, 0.0, 0.0),
                Point::new(0.0, 1.0, 0.0),
            ],
            ElemType::Quad4 => (0..4)
                .map(|i| Point::new((i & 1) as f64, ((i >> 1) & 1) as f64, 0.0))
                .collect(),
            ElemType::Hex8 => (0..8)
                .map(|i| Point::new((i & 1) as f64, ((i >> 1) & 1) as f64, ((i >> 2) & 1) as f64))
                .collect(),
        };
        let nodes: Vec<NodeId> = points.into_iter().map(|p| mesh.add_node(p)).collect();
        let id = mesh.add_elem(elem_type, &nodes, 0);
        mesh.prepare_for_use();
        (mesh, id)
    }

    fn refine_one(mesh: &mut Mesh, elem_id: ElemId) {
        mesh.flag_elems_for_refinement(vec![elem_id]).unwrap();
        mesh.refine(elem_id).unwrap();
    }

    fn coarsen_one(mesh: &mut Mesh, elem_id: ElemId) {
        let children = mesh.elem(elem_id).child_ids().unwrap().to_vec();
        mesh.flag_elems_for_coarsening(children).unwrap();
        mesh.coarsen(elem_id);
    }

    #[test]
    fn square_refine_coarsen_contract() {
        let (mut mesh, root) = single(ElemType::Quad4);
        let corners = mesh.elem(root).nodes.clone();

        refine_one(&mut mesh, root);
        assert!(!mesh.elem(root).active());
        assert_eq!(mesh.elem(root).refinement_flag(), RefinementFlag::Inactive);
        assert!(mesh.is_ancestor(root));
        assert_eq!(mesh.n_active_elem(), 4);
        assert_eq!(mesh.nodes.len(), 9);

        let children = mesh.elem(root).child_ids().unwrap().to_vec();
        for child_id in children.iter() {
            let child = mesh.elem(*child_id);
            assert!(child.active());
            assert_eq!(child.parent_id(), Some(root));
            assert_eq!(child.level(), 1);
            assert_eq!(child.refinement_flag(), RefinementFlag::JustRefined);
        }

        coarsen_one(&mut mesh, root);
        assert!(mesh.elem(root).active());
        assert_eq!(mesh.elem(root).refinement_flag(), RefinementFlag::JustCoarsened);
        assert_eq!(mesh.elem(root).child_ids().map(|ids| ids.len()), Some(4));
        assert_eq!(mesh.n_active_elem(), 1);
        for child_id in children.iter() {
            assert!(!mesh.elem(*child_id).active());
            assert!(mesh.is_subactive(*child_id));
        }

        assert!(mesh.contract(root));
        assert!(!mesh.elem(root).has_children());
        assert_eq!(mesh.elem(root).refinement_flag(), RefinementFlag::DoNothing);
        assert_eq!(mesh.n_elem(), 1);
        assert_eq!(mesh.elem(root).nodes, corners);

        assert_eq!(mesh.prune_orphaned_nodes(), 5);
        assert_eq!(mesh.nodes.len(), 4);
    }

    #[test]
    fn round_trip_all_shapes() {
        for elem_type in [ElemType::Edge2, ElemType::Tri3, ElemType::Quad4, ElemType::Hex8] {
            let (mut mesh, root) = single(elem_type);
            let before = mesh.elem_points(root);
            let nodes_before = mesh.elem(root).nodes.clone();

            refine_one(&mut mesh, root);
            assert_eq!(mesh.n_active_elem(), elem_type.n_children());

            let total: f64 = mesh.active_elems().map(|e| mesh.elem_measure(e.id)).sum();
            assert!((total - mesh.elem_measure(root)).abs() < 1e-12, "{}", elem_type);

            coarsen_one(&mut mesh, root);
            mesh.contract(root);

            assert_eq!(mesh.elem(root).nodes, nodes_before);
            for (a, b) in before.iter().zip(mesh.elem_points(root).iter()) {
                assert!((a - b).norm() < 1e-14);
            }
        }
    }

    #[test]
    fn shared_parent_nodes() {
        for elem_type in [ElemType::Tri3, ElemType::Quad4, ElemType::Hex8] {
            let (mut mesh, root) = single(elem_type);
            refine_one(&mut mesh, root);

            let shape = elem_type.shape();
            let parent = mesh.elem(root);
            for (c, child_id) in parent.child_ids().unwrap().iter().enumerate() {
                let child = mesh.elem(*child_id);
                for nc in 0..shape.n_nodes() {
                    for n in 0..shape.n_nodes() {
                        if shape.embedding_weight(c, nc, n) == 1.0 {
                            assert_eq!(child.nodes[nc], parent.nodes[n]);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn no_duplicate_nodes() {
        let (mut mesh, root) = single(ElemType::Hex8);
        refine_one(&mut mesh, root);
        // 3x3x3 lattice
        assert_eq!(mesh.nodes.len(), 27);

        let tol = TOLERANCE * 0.5;
        let nodes: Vec<Point> = mesh.nodes.iter().map(|n| n.coords).collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                assert!((a - b).norm() > tol);
            }
        }
    }

    #[test]
    fn neighbors_share_refined_nodes() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.flag_elems_for_refinement(vec![ElemId(0), ElemId(1)]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        // 5x3 lattice of nodes
        assert_eq!(mesh.nodes.len(), 15);
        assert_eq!(mesh.n_active_elem(), 8);
    }

    #[test]
    fn hanging_nodes_follow_the_parent() {
        let (mut mesh, root) = single(ElemType::Quad4);
        refine_one(&mut mesh, root);

        // move the north-east corner of the parent
        let ne = mesh.elem(root).nodes[3];
        mesh.nodes.set_coords(ne, Point::new(2.0, 2.0, 0.0));

        coarsen_one(&mut mesh, root);

        // child 0's north-east node is the parent's center
        let sw_child = mesh.elem(root).child_ids().unwrap()[0];
        let center = *mesh.node(mesh.elem(sw_child).nodes[3]);
        assert!((center - Point::new(0.75, 0.75, 0.0)).norm() < 1e-14);

        // child 3's north node is the midpoint of the parent's north side
        let ne_child = mesh.elem(root).child_ids().unwrap()[3];
        let north = *mesh.node(mesh.elem(ne_child).nodes[2]);
        assert!((north - Point::new(1.0, 1.5, 0.0)).norm() < 1e-14);
    }

    #[test]
    fn re_refine_retained_children() {
        let (mut mesh, root) = single(ElemType::Quad4);
        refine_one(&mut mesh, root);
        let children = mesh.elem(root).child_ids().unwrap().to_vec();
        coarsen_one(&mut mesh, root);

        mesh.elem_mut(root).p_level = 2;
        refine_one(&mut mesh, root);

        assert_eq!(mesh.elem(root).child_ids().unwrap(), children.as_slice());
        assert_eq!(mesh.n_elem(), 5);
        for child_id in children {
            let child = mesh.elem(child_id);
            assert!(child.active());
            assert_eq!(child.refinement_flag(), RefinementFlag::JustRefined);
            assert_eq!(child.p_level, 2);
        }
    }

    #[test]
    fn coarsen_takes_max_child_p_level() {
        let (mut mesh, root) = single(ElemType::Tri3);
        refine_one(&mut mesh, root);
        let children = mesh.elem(root).child_ids().unwrap().to_vec();
        mesh.elem_mut(children[2]).p_level = 4;
        mesh.elem_mut(children[1]).p_level = 1;

        coarsen_one(&mut mesh, root);
        assert_eq!(mesh.elem(root).p_level, 4);
    }

    #[test]
    fn grid_neighbors() {
        let mesh = Mesh::square_grid(2, 2, 1.0);
        // sides: South, North, West, East
        assert_eq!(mesh.elem(ElemId(0)).neighbors.as_slice(), &[None, Some(ElemId(2)), None, Some(ElemId(1))]);
        assert_eq!(mesh.elem(ElemId(3)).neighbors.as_slice(), &[Some(ElemId(1)), None, Some(ElemId(2)), None]);

        let cube = Mesh::cube_grid(2, 1, 1, 1.0);
        assert_eq!(cube.elem(ElemId(0)).neighbors[1], Some(ElemId(1)));
        assert_eq!(cube.elem(ElemId(1)).neighbors[0], Some(ElemId(0)));
        assert_eq!(cube.elem(ElemId(0)).neighbors.iter().filter(|n| n.is_none()).count(), 5);
    }

    #[test]
    fn neighbors_across_levels() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.flag_elems_for_refinement(vec![ElemId(0)]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        let children = mesh.elem(ElemId(0)).child_ids().unwrap().to_vec();
        // the eastern children see the coarse Elem
        assert_eq!(mesh.elem(children[1]).neighbors[3], Some(ElemId(1)));
        assert_eq!(mesh.elem(children[3]).neighbors[3], Some(ElemId(1)));
        // the western children lie on the boundary
        assert_eq!(mesh.elem(children[0]).neighbors[2], None);
        // siblings see each other
        assert_eq!(mesh.elem(children[0]).neighbors[3], Some(children[1]));
        assert_eq!(mesh.elem(children[0]).neighbors[1], Some(children[2]));
        // the coarse Elem sees the refined parent
        assert_eq!(mesh.elem(ElemId(1)).neighbors[2], Some(ElemId(0)));
    }

    #[test]
    fn direct_refine_updates_neighbors() {
        let mut mesh = Mesh::square_grid(1, 1, 1.0);
        refine_one(&mut mesh, ElemId(0));

        for elem in mesh.active_elems() {
            let siblings = elem.neighbors.iter().flatten().count();
            assert_eq!(siblings, 2);
            assert!(elem
                .neighbors
                .iter()
                .flatten()
                .all(|id| mesh.elem(*id).parent_id() == Some(ElemId(0))));
        }
    }

    #[test]
    fn direct_contract_leaves_no_dangling_neighbors() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.uniformly_refine(1).unwrap();
        let east_children = mesh.elem(ElemId(1)).child_ids().unwrap().to_vec();

        coarsen_one(&mut mesh, ElemId(0));
        assert!(mesh.contract(ElemId(0)));

        for elem in mesh.elems() {
            for neighbor_id in elem.neighbors.iter().flatten() {
                assert!(mesh.try_elem(*neighbor_id).is_some());
            }
        }

        // East side of the coarsened Elem, and West sides of its western neighbors
        assert_eq!(mesh.elem(ElemId(0)).neighbors[3], Some(ElemId(1)));
        assert_eq!(mesh.elem(east_children[0]).neighbors[2], Some(ElemId(0)));
        assert_eq!(mesh.elem(east_children[2]).neighbors[2], Some(ElemId(0)));
    }

    /// The Node-sharing pattern of the active Elems (each Node replaced by the order in which it is first seen), and the Node positions in that order
    fn topology(mesh: &Mesh) -> (Vec<Vec<usize>>, Vec<Point>) {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut positions = Vec::new();
        let mut structure = Vec::new();

        for elem in mesh.active_elems() {
            let mut local = Vec::new();
            for node_id in elem.nodes.iter() {
                let idx = match seen.iter().position(|id| id == node_id) {
                    Some(idx) => idx,
                    None => {
                        seen.push(*node_id);
                        positions.push(*mesh.node(*node_id));
                        seen.len() - 1
                    }
                };
                local.push(idx);
            }
            structure.push(local);
        }

        (structure, positions)
    }

    #[test]
    fn repeated_cycles_reproduce_topology() {
        let mut mesh = Mesh::square_grid(2, 2, 0.5);
        let initial = topology(&mesh);

        let mut refined = Vec::new();
        for _ in 0..3 {
            mesh.uniformly_refine(1).unwrap();
            refined.push(topology(&mesh));

            let active: Vec<ElemId> = mesh.active_elems().map(|elem| elem.id).collect();
            mesh.flag_elems_for_coarsening(active).unwrap();
            assert!(mesh.refine_and_coarsen_elements().unwrap());

            assert_eq!(mesh.nodes.len(), 9);
            assert_eq!(topology(&mesh), initial);
        }

        assert_eq!(refined[0].1.len(), 25);
        assert_eq!(refined[0], refined[1]);
        assert_eq!(refined[1], refined[2]);
    }

    #[test]
    fn batch_refine_and_coarsen() {
        let mut mesh = Mesh::square_grid(2, 2, 1.0);
        mesh.uniformly_refine(1).unwrap();
        assert_eq!(mesh.n_active_elem(), 16);
        assert!(mesh.active_elems().all(|e| e.refinement_flag() == RefinementFlag::DoNothing));

        let children = mesh.elem(ElemId(3)).child_ids().unwrap().to_vec();
        mesh.flag_elems_for_coarsening(children).unwrap();
        assert!(mesh.refine_and_coarsen_elements().unwrap());

        assert_eq!(mesh.n_active_elem(), 13);
        assert_eq!(mesh.n_elem(), 4 + 12);
        assert!(!mesh.elem(ElemId(3)).has_children());
        // the center and the two boundary midpoints of Elem 3 are gone; midpoints shared with refined neighbors remain
        assert_eq!(mesh.nodes.len(), 25 - 3);

        assert!(!mesh.refine_and_coarsen_elements().unwrap());
    }

    #[test]
    fn level_one_rule() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.flag_elems_for_refinement(vec![ElemId(0)]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        // refining the child next to the coarse Elem forces the coarse Elem to refine
        let east_child = mesh.elem(ElemId(0)).child_ids().unwrap()[1];
        mesh.flag_elems_for_refinement(vec![east_child]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        assert!(mesh.elem(ElemId(1)).has_children());
        assert!(mesh
            .active_elems()
            .all(|e| e.neighbors.iter().flatten().all(|n| {
                let n = mesh.elem(*n);
                !n.active() || (n.level() as i16 - e.level() as i16).abs() <= 1
            })));
    }

    #[test]
    fn coarsening_blocked_by_finer_neighbor() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.uniformly_refine(1).unwrap();

        // refine the child of Elem 1 which touches Elem 0
        let west_child = mesh.elem(ElemId(1)).child_ids().unwrap()[0];
        mesh.flag_elems_for_refinement(vec![west_child]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        // coarsening Elem 0 would leave a level-0 Elem beside level-2 Elems
        let children = mesh.elem(ElemId(0)).child_ids().unwrap().to_vec();
        mesh.flag_elems_for_coarsening(children).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();
        assert!(mesh.elem(ElemId(0)).has_children());
        assert!(!mesh.elem(ElemId(0)).active());

        // without the rule, it is allowed
        mesh.settings.level_one_rule = false;
        let children = mesh.elem(ElemId(0)).child_ids().unwrap().to_vec();
        mesh.flag_elems_for_coarsening(children).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();
        assert!(mesh.elem(ElemId(0)).active());
    }

    #[test]
    fn partial_sibling_coarsening_is_ignored() {
        let mut mesh = Mesh::square_grid(1, 1, 1.0);
        mesh.uniformly_refine(1).unwrap();
        let children = mesh.elem(ElemId(0)).child_ids().unwrap().to_vec();

        mesh.flag_elems_for_coarsening(children[0..3].to_vec()).unwrap();
        assert_eq!(mesh.elem(ElemId(0)).refinement_flag(), RefinementFlag::Inactive);
        assert!(!mesh.refine_and_coarsen_elements().unwrap());
        assert_eq!(mesh.n_active_elem(), 4);
        assert!(mesh.active_elems().all(|e| e.refinement_flag() == RefinementFlag::DoNothing));
    }

    #[test]
    fn max_h_level() {
        let mut mesh = Mesh::with_settings(RefinementSettings {
            level_one_rule: true,
            max_h_level: 1,
        });
        let nodes: Vec<NodeId> = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]
            .iter()
            .map(|(x, y)| mesh.add_node(Point::new(*x, *y, 0.0)))
            .collect();
        mesh.add_elem(ElemType::Tri3, &nodes, 0);
        mesh.prepare_for_use();

        mesh.uniformly_refine(3).unwrap();
        assert_eq!(mesh.n_active_elem(), 4);
        assert!(mesh.active_elems().all(|e| e.level() == 1));
    }

    #[test]
    fn p_refinement() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.flag_elems_for_p_refinement(vec![ElemId(1)], RefinementFlag::Refine).unwrap();
        mesh.flag_elems_for_refinement(vec![ElemId(1)]).unwrap();
        assert!(mesh.refine_and_coarsen_elements().unwrap());

        // the children of Elem 1 inherit and apply its p-refinement
        for child_id in mesh.elem(ElemId(1)).child_ids().unwrap() {
            assert_eq!(mesh.elem(*child_id).p_level, 1);
            assert_eq!(mesh.elem(*child_id).p_refinement_flag(), RefinementFlag::DoNothing);
        }
        assert_eq!(mesh.elem(ElemId(0)).p_level, 0);
        assert_eq!(mesh.max_p_level(), 1);

        mesh.flag_elems_for_p_refinement(vec![ElemId(0)], RefinementFlag::Coarsen).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();
        assert_eq!(mesh.elem(ElemId(0)).p_level, 0);
    }

    #[test]
    fn p_refinement_over_max() {
        let mut mesh = Mesh::square_grid(1, 1, 1.0);
        mesh.elem_mut(ElemId(0)).p_level = MAX_P_LEVEL;
        assert_eq!(
            mesh.flag_elems_for_p_refinement(vec![ElemId(0)], RefinementFlag::Refine),
            Err(MeshError::ExceededMaxPLevel(ElemId(0)))
        );
    }

    #[test]
    fn flagging_errors() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        assert_eq!(
            mesh.flag_elems_for_refinement(vec![ElemId(5)]),
            Err(MeshError::ElemDoesntExist(ElemId(5)))
        );
        assert_eq!(
            mesh.flag_elems_for_refinement(vec![ElemId(0), ElemId(0)]),
            Err(MeshError::DoubleRefinement(ElemId(0)))
        );
        assert_eq!(
            mesh.flag_elems_for_p_refinement(vec![ElemId(0)], RefinementFlag::JustRefined),
            Err(MeshError::InvalidRequest {
                elem_id: ElemId(0),
                flag: RefinementFlag::JustRefined
            })
        );

        mesh.uniformly_refine(1).unwrap();
        assert_eq!(
            mesh.flag_elems_for_refinement(vec![ElemId(0)]),
            Err(MeshError::ElemNotActive(ElemId(0)))
        );
        assert!(mesh.descendant_elems(ElemId(42), true).is_err());
    }

    #[test]
    fn flag_with_filter() {
        let mut mesh = Mesh::square_grid(3, 1, 1.0);
        mesh.flag_with_filter(|elem| {
            if elem.id.0 % 2 == 0 {
                Some(RefinementFlag::Refine)
            } else {
                None
            }
        })
        .unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        assert!(mesh.elem(ElemId(0)).has_children());
        assert!(!mesh.elem(ElemId(1)).has_children());
        assert!(mesh.elem(ElemId(2)).has_children());
    }

    #[test]
    fn hierarchy_queries() {
        let mut mesh = Mesh::square_grid(1, 1, 1.0);
        mesh.uniformly_refine(2).unwrap();

        let descendants = mesh.descendant_elems(ElemId(0), false).unwrap();
        assert_eq!(descendants.len(), 4 + 16);

        let leaf = *descendants.last().unwrap();
        let ancestors = mesh.ancestor_elems(leaf, true).unwrap();
        assert_eq!(ancestors.len(), 3);
        assert_eq!(*ancestors.last().unwrap(), ElemId(0));
        assert!(mesh.is_ancestor(ElemId(0)));
    }

    #[test]
    #[should_panic]
    fn refine_unflagged_elem() {
        let (mut mesh, root) = single(ElemType::Quad4);
        mesh.refine(root).unwrap();
    }

    #[test]
    #[should_panic]
    fn coarsen_unmarked_parent() {
        let (mut mesh, root) = single(ElemType::Quad4);
        refine_one(&mut mesh, root);
        mesh.coarsen(root);
    }

    #[test]
    #[should_panic]
    fn contract_inactive_parent() {
        let (mut mesh, root) = single(ElemType::Quad4);
        refine_one(&mut mesh, root);
        mesh.contract(root);
    }

    #[test]
    #[should_panic]
    fn degenerate_elem() {
        let mut mesh = Mesh::new();
        let a = mesh.add_node(Point::new(0.0, 0.0, 0.0));
        let b = mesh.add_node(Point::new(1.0, 0.0, 0.0));
        let c = mesh.add_node(Point::new(2.0, 0.0, 0.0));
        mesh.add_elem(ElemType::Tri3, &[a, b, c], 0);
    }

    #[cfg(feature = "json_export")]
    #[test]
    fn refined_mesh_to_file() {
        let mut mesh = Mesh::square_grid(2, 2, 0.5);
        mesh.uniformly_refine(1).unwrap();

        let path = std::env::temp_dir().join("amr_mesh_refined_mesh.json");
        mesh.export_to_json(path.to_string_lossy()).unwrap();

        let parsed = json::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["Elems"].len(), 20);
        assert_eq!(parsed["Nodes"].len(), 25);
    }
}
