/// Bins: the nodes of the spatial index
mod bin;

use crate::mesh::{
    elem::ElemId,
    node::NodeId,
    shape::ElemShape,
    space::{BoundingBox, Point, V3D},
    Mesh, TOLERANCE,
};
use bin::{build_bins, compute_loose_bounds, Bin};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::io::Write;

/// Which entities of a [`Mesh`] populate a [`Tree`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildType {
    /// Bins are split by Node position; each leaf holds the active Elems touching its Nodes
    Nodes,
    /// All active Elems
    Elements,
    /// Active Elems with at least one side on the boundary of the domain
    ElementsOnBoundary,
    /// Sides of active Elems on the boundary of the domain or on the interface between two subdomains
    SurfaceElements,
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Nodes => "NODES",
            Self::Elements => "ELEMENTS",
            Self::ElementsOnBoundary => "ELEMENTS_ON_BOUNDARY",
            Self::SurfaceElements => "SURFACE_ELEMENTS",
        };
        write!(f, "{}", name)
    }
}

/// Parameters controlling how a [`Tree`] is split into bins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSettings {
    /// Bins holding more than this many entities are split
    pub target_bin_size: usize,
    /// Bins on this level are never split
    pub max_level: u8,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            target_bin_size: 16,
            max_level: 12,
        }
    }
}

/// An indexed entity: a whole Elem or one side of an Elem
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Entity {
    Elem(ElemId),
    Side(ElemId, usize),
}

impl Entity {
    fn owner(&self) -> ElemId {
        match self {
            Self::Elem(id) | Self::Side(id, _) => *id,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Elem(id) => write!(f, "elem {}", id),
            Self::Side(id, side) => write!(f, "elem {} side {}", id, side),
        }
    }
}

#[derive(Debug, Clone)]
struct Occupant {
    entity: Entity,
    centroid: Point,
    bounds: BoundingBox,
    tol: f64,
}

/// Hierarchical spatial index over the active part of a [`Mesh`]
///
/// The Tree borrows the Mesh it was built from, so it cannot outlive a refinement step: after the Mesh changes, build a new Tree.
///
/// Bins are split into `2^dim` children (`dim` being the dimension of the Mesh) until they hold at most [`TreeSettings::target_bin_size`] entities.
/// Entities are assigned to the single bin containing their centroid; each bin also tracks a loose box around everything it holds, which is what queries prune against.
///
/// ```
/// use amr_mesh::mesh::{space::Point, Mesh};
/// use amr_mesh::tree::{BuildType, Tree};
///
/// let mesh = Mesh::square_grid(4, 4, 0.25);
/// let tree = Tree::new(&mesh, BuildType::Elements);
///
/// let elem_id = tree.find_element(&Point::new(0.6, 0.1, 0.0)).unwrap();
/// assert!(mesh.elem_bounding_box(elem_id).contains(&Point::new(0.6, 0.1, 0.0)));
/// ```
#[derive(Debug, Clone)]
pub struct Tree<'m> {
    mesh: &'m Mesh,
    build_type: BuildType,
    settings: TreeSettings,
    dim: usize,
    bins: Vec<Bin>,
    occupants: Vec<Occupant>,
    // partitioned Nodes (Node trees only)
    nodes: Vec<NodeId>,
}

impl<'m> Tree<'m> {
    /// Build a Tree with the default [`TreeSettings`]
    pub fn new(mesh: &'m Mesh, build_type: BuildType) -> Self {
        Self::build(mesh, build_type, TreeSettings::default())
    }

    /// Build a Tree over the current active Elems of `mesh`
    ///
    /// Panics if an indexed Elem or side has no length, area or volume
    pub fn build(mesh: &'m Mesh, build_type: BuildType, settings: TreeSettings) -> Self {
        let mesh_bounds = mesh.bounding_box();
        let root_bounds = mesh_bounds.padded(mesh_bounds.diagonal() * TOLERANCE);
        let dim = mesh.dim().max(1);

        let mut tree = Self {
            mesh,
            build_type,
            settings,
            dim,
            bins: Vec::new(),
            occupants: Vec::new(),
            nodes: Vec::new(),
        };

        match build_type {
            BuildType::Nodes => tree.build_from_nodes(root_bounds),
            _ => {
                let mut occupants = tree.prepare_occupants(tree.entities());
                build_bins(
                    &mut tree.bins,
                    &mut occupants,
                    0,
                    root_bounds,
                    0,
                    dim,
                    &settings,
                    &|occ: &Occupant| occ.centroid,
                );
                tree.occupants = occupants;
            }
        }

        let occupants = &tree.occupants;
        compute_loose_bounds(&mut tree.bins, |occ| occupants[occ].bounds);

        log::debug!(
            "built a {} tree with {} occupants in {} bins ({} leaves)",
            build_type,
            tree.occupants.len(),
            tree.bins.len(),
            tree.n_leaf()
        );
        tree
    }

    fn build_from_nodes(&mut self, root_bounds: BoundingBox) {
        let mesh = self.mesh;

        let mut elems_of_node: Vec<SmallVec<[ElemId; 8]>> = vec![SmallVec::new(); mesh.nodes.id_bound()];
        for elem in mesh.active_elems() {
            for node_id in elem.nodes.iter() {
                elems_of_node[node_id.0].push(elem.id);
            }
        }

        let mut nodes: Vec<NodeId> = mesh
            .nodes
            .iter()
            .map(|node| node.id)
            .filter(|id| !elems_of_node[id.0].is_empty())
            .collect();
        build_bins(
            &mut self.bins,
            &mut nodes,
            0,
            root_bounds,
            0,
            self.dim,
            &self.settings,
            &|node_id: &NodeId| *mesh.node(*node_id),
        );

        // each leaf holds the Elems touching its Nodes, in order of their ids
        let mut entities = Vec::new();
        for bin in self.bins.iter_mut() {
            let start = entities.len();
            if bin.is_leaf() {
                let leaf_elems: BTreeSet<ElemId> = nodes[bin.items.clone()]
                    .iter()
                    .flat_map(|node_id| elems_of_node[node_id.0].iter().copied())
                    .collect();
                entities.extend(leaf_elems.into_iter().map(Entity::Elem));
            }
            bin.occupants = start..entities.len();
        }

        self.occupants = self.prepare_occupants(entities);
        self.nodes = nodes;
    }

    /// The entities indexed by Elem-based trees, in order of their owners' ids
    fn entities(&self) -> Vec<Entity> {
        let mesh = self.mesh;
        match self.build_type {
            BuildType::Nodes | BuildType::Elements => {
                mesh.active_elems().map(|elem| Entity::Elem(elem.id)).collect()
            }
            BuildType::ElementsOnBoundary => mesh
                .active_elems()
                .filter(|elem| elem.is_on_boundary())
                .map(|elem| Entity::Elem(elem.id))
                .collect(),
            BuildType::SurfaceElements => mesh
                .active_elems()
                .flat_map(|elem| {
                    elem.neighbors
                        .iter()
                        .enumerate()
                        .filter(move |(_, neighbor)| match neighbor {
                            None => true,
                            Some(neighbor_id) => {
                                let neighbor = mesh.elem(*neighbor_id);
                                // interfaces are owned by the finer side, or by the lower id on equal levels
                                neighbor.subdomain_id != elem.subdomain_id
                                    && neighbor.active()
                                    && (neighbor.level() < elem.level()
                                        || (neighbor.level() == elem.level() && elem.id < neighbor.id))
                            }
                        })
                        .map(move |(side, _)| Entity::Side(elem.id, side))
                })
                .collect(),
        }
    }

    fn prepare_occupants(&self, entities: Vec<Entity>) -> Vec<Occupant> {
        entities
            .into_par_iter()
            .map(|entity| {
                let (shape, points) = self.geometry(entity);
                let owner_tol = self.mesh.elem_bounding_box(entity.owner()).diagonal() * TOLERANCE;

                if let Some(shape) = shape {
                    let measure = shape.measure(&points);
                    assert!(
                        measure > 0.0,
                        "{} has measure {}; cannot index degenerate entities!",
                        entity,
                        measure
                    );
                }

                let bounds = BoundingBox::from_points(points.iter()).padded(owner_tol);
                let centroid = match shape {
                    Some(shape) => shape.centroid(&points),
                    None => points[0],
                };

                Occupant {
                    entity,
                    centroid,
                    bounds,
                    tol: owner_tol,
                }
            })
            .collect()
    }

    /// Shape and node positions of an entity. Sides of 1D Elems are single points and have no shape.
    fn geometry(&self, entity: Entity) -> (Option<&'static dyn ElemShape>, SmallVec<[Point; 8]>) {
        let points = self.mesh.elem_points(entity.owner());
        let shape = self.mesh.elem(entity.owner()).elem_type.shape();

        match entity {
            Entity::Elem(_) => (Some(shape), points),
            Entity::Side(_, side) => (
                shape.side_type().map(|side_type| side_type.shape()),
                shape.side_nodes(side).iter().map(|n| points[*n]).collect(),
            ),
        }
    }

    fn occupant_contains(&self, occupant: &Occupant, p: &Point) -> bool {
        if !occupant.bounds.contains(p) {
            return false;
        }

        match self.geometry(occupant.entity) {
            (Some(shape), points) => shape.contains_point(&points, p, occupant.tol),
            (None, points) => (points[0] - *p).norm() <= occupant.tol,
        }
    }

    fn occupant_ray_hit(&self, occupant: &Occupant, origin: &Point, dir: &V3D) -> Option<f64> {
        match self.geometry(occupant.entity) {
            (Some(shape), points) => shape.ray_intersect(&points, origin, dir),
            (None, points) => {
                let t = (points[0] - *origin).dot(dir) / dir.norm_squared();
                if t >= 0.0 && (*origin + *dir * t - points[0]).norm() <= occupant.tol {
                    Some(t)
                } else {
                    None
                }
            }
        }
    }

    fn leaf_occupants(&self, bin_idx: usize) -> &[Occupant] {
        &self.occupants[self.bins[bin_idx].occupants.clone()]
    }

    // ----------------------------------------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------------------------------------

    /// Find an active Elem containing `point`
    ///
    /// The leaf whose region contains `point` is searched first, then every other leaf whose loose box contains it, in bin order.
    /// A point on the boundary between Elems always resolves to the same one of them.
    /// For a [`BuildType::SurfaceElements`] tree, the Elem owning the side containing `point` is returned.
    pub fn find_element(&self, point: &Point) -> Option<ElemId> {
        if self.bins.is_empty() || !self.bins[0].bounds.contains(point) {
            return None;
        }

        let mut leaf = 0;
        while !self.bins[leaf].is_leaf() {
            let bin = &self.bins[leaf];
            leaf = bin.children[bin.bounds.octant_of(point, self.dim)];
        }

        if let Some(occupant) = self
            .leaf_occupants(leaf)
            .iter()
            .find(|occ| self.occupant_contains(occ, point))
        {
            return Some(occupant.entity.owner());
        }

        let mut stack = vec![0];
        while let Some(bin_idx) = stack.pop() {
            let bin = &self.bins[bin_idx];
            if !bin.loose.contains(point) {
                continue;
            }

            if bin.is_leaf() {
                if bin_idx != leaf {
                    if let Some(occupant) = self
                        .leaf_occupants(bin_idx)
                        .iter()
                        .find(|occ| self.occupant_contains(occ, point))
                    {
                        return Some(occupant.entity.owner());
                    }
                }
            } else {
                stack.extend(bin.children.iter().rev());
            }
        }

        None
    }

    /// Locate many points at once (in parallel)
    pub fn find_elements(&self, points: &[Point]) -> Vec<Option<ElemId>> {
        points.par_iter().map(|p| self.find_element(p)).collect()
    }

    /// Does the ray `point + t * direction` (`t >= 0`) hit the Tree's bounding box
    pub fn hit_boundbox(&self, point: &Point, direction: &V3D) -> bool {
        self.bins
            .first()
            .map_or(false, |root| root.bounds.ray_hit(point, direction).is_some())
    }

    /// Find the active Elem first hit by the ray `point + t * direction` (`t >= 0`)
    ///
    /// Ties (several Elems hit at the same `t`) go to the lowest [`ElemId`]. Panics if `direction` is zero.
    pub fn hit_element(&self, point: &Point, direction: &V3D) -> Option<ElemId> {
        assert!(
            direction.norm_squared() > 0.0,
            "Ray direction must be non-zero; cannot trace ray from {}!",
            point
        );

        if !self.hit_boundbox(point, direction) {
            return None;
        }

        let mut nearest: Option<(f64, ElemId)> = None;
        let mut stack = vec![0];
        while let Some(bin_idx) = stack.pop() {
            let bin = &self.bins[bin_idx];
            let t_bin = match bin.loose.ray_hit(point, direction) {
                Some(t) => t,
                None => continue,
            };
            if matches!(nearest, Some((t_near, _)) if t_bin > t_near) {
                continue;
            }

            if bin.is_leaf() {
                for occupant in self.leaf_occupants(bin_idx) {
                    if let Some(t) = self.occupant_ray_hit(occupant, point, direction) {
                        let candidate = (t, occupant.entity.owner());
                        nearest = match nearest {
                            Some(current) if !is_nearer(candidate, current) => Some(current),
                            _ => Some(candidate),
                        };
                    }
                }
            } else {
                stack.extend(bin.children.iter().rev());
            }
        }

        nearest.map(|(_, elem_id)| elem_id)
    }

    // ----------------------------------------------------------------------------------------------------
    // Introspection
    // ----------------------------------------------------------------------------------------------------

    /// Number of leaves holding at least one entity
    pub fn n_active_bins(&self) -> usize {
        self.bins
            .iter()
            .filter(|bin| bin.is_leaf() && !bin.occupants.is_empty())
            .count()
    }

    /// Number of leaves (including empty ones)
    pub fn n_leaf(&self) -> usize {
        self.bins.iter().filter(|bin| bin.is_leaf()).count()
    }

    /// Number of indexed entities. In a Node tree, Elems touching several leaves are counted once per leaf.
    pub fn n_occupants(&self) -> usize {
        self.occupants.len()
    }

    /// Bounding box of the root bin
    pub fn bounding_box(&self) -> BoundingBox {
        self.bins.first().map_or(BoundingBox::empty(), |root| root.bounds)
    }

    pub fn build_type(&self) -> BuildType {
        self.build_type
    }

    /// Log (at info level) the Nodes held in each leaf; each Node is listed once
    pub fn print_nodes(&self) {
        for line in self.nodes_report().lines() {
            log::info!("{}", line);
        }
    }

    /// Log (at info level) the entities held in each leaf; each entity is listed once
    pub fn print_elements(&self) {
        for line in self.elements_report().lines() {
            log::info!("{}", line);
        }
    }

    pub fn print_nodes_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(self.nodes_report().as_bytes())
    }

    pub fn print_elements_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(self.elements_report().as_bytes())
    }

    fn nodes_report(&self) -> String {
        let mut seen = BTreeSet::new();
        self.leaf_report(|tree, bin_idx| {
            let bin = &tree.bins[bin_idx];
            let nodes: Vec<NodeId> = match tree.build_type {
                BuildType::Nodes => tree.nodes[bin.items.clone()].to_vec(),
                _ => tree
                    .leaf_occupants(bin_idx)
                    .iter()
                    .flat_map(|occ| tree.entity_nodes(occ.entity))
                    .collect(),
            };

            nodes
                .into_iter()
                .filter(|node_id| seen.insert(*node_id))
                .map(|node_id| {
                    let p = tree.mesh.node(node_id);
                    format!("node {} ({}, {}, {})", node_id, p.x, p.y, p.z)
                })
                .collect()
        })
    }

    fn elements_report(&self) -> String {
        let mut seen = BTreeSet::new();
        self.leaf_report(|tree, bin_idx| {
            tree.leaf_occupants(bin_idx)
                .iter()
                .filter(|occ| seen.insert(occ.entity))
                .map(|occ| occ.entity.to_string())
                .collect()
        })
    }

    fn leaf_report<F>(&self, mut leaf_lines: F) -> String
    where
        F: FnMut(&Self, usize) -> Vec<String>,
    {
        let mut report = String::new();
        for (bin_idx, bin) in self.bins.iter().enumerate() {
            if !bin.is_leaf() {
                continue;
            }
            let lines = leaf_lines(self, bin_idx);
            if lines.is_empty() {
                continue;
            }

            // writing to a String cannot fail
            let _ = writeln!(report, "bin {} (level {}):", bin_idx, bin.level);
            for line in lines {
                let _ = writeln!(report, "    {}", line);
            }
        }
        report
    }

    fn entity_nodes(&self, entity: Entity) -> SmallVec<[NodeId; 8]> {
        let elem = self.mesh.elem(entity.owner());
        match entity {
            Entity::Elem(_) => elem.nodes.clone(),
            Entity::Side(_, side) => elem
                .elem_type
                .shape()
                .side_nodes(side)
                .iter()
                .map(|n| elem.nodes[*n])
                .collect(),
        }
    }
}

fn is_nearer((t_a, id_a): (f64, ElemId), (t_b, id_b): (f64, ElemId)) -> bool {
    t_a < t_b || (t_a == t_b && id_a < id_b)
}
